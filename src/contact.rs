//! Mutual contacts and their private channel.
//!
//! A contact is a peer whose agreement key was exchanged out of band. The
//! contact channel carries private posts and group invites; group traffic
//! itself runs on separate per-group channels.

use crate::crypto::{CryptoError, PublicIdentity};
use crate::group::GroupInvite;
use crate::ids::{Address, PostId};
use crate::private_channel::{
    apply_private_channel_update, sync_private_channel_with_contact, CommandExecutor,
    PrivateChannelCommand, PrivateChannelSyncData,
};
use crate::social::Post;
use crate::storage::FeedWriter;
use crate::timeline::Chapter;

#[derive(Clone, Debug)]
pub struct MutualContact {
    pub identity: PublicIdentity,
    pub private_channel: PrivateChannelSyncData,
    /// Posts the contact shared privately with us.
    pub posts: Vec<Post>,
}

impl MutualContact {
    pub fn new(identity: PublicIdentity) -> Self {
        MutualContact {
            identity,
            private_channel: PrivateChannelSyncData::empty(),
            posts: Vec::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.identity.address
    }

    pub fn share_post(&mut self, post: Post) {
        self.private_channel.add_post(post);
    }

    pub fn remove_post(&mut self, id: PostId) {
        self.private_channel.remove_post(id);
    }

    pub fn send_invite(&mut self, invite: GroupInvite) {
        self.private_channel
            .push_command(PrivateChannelCommand::GroupInvite { invite });
    }

    /// Newest invite queued to this contact and not uploaded yet.
    pub fn pending_invite(&self) -> Option<&GroupInvite> {
        self.private_channel
            .unsynced_commands
            .iter()
            .find_map(|command| match command {
                PrivateChannelCommand::GroupInvite { invite } => Some(invite),
                _ => None,
            })
    }

    /// Sync the contact channel. Returns the group invites received.
    pub async fn sync(&mut self, writer: &FeedWriter<'_>) -> Result<Vec<GroupInvite>, CryptoError> {
        let update = sync_private_channel_with_contact(&self.private_channel, &self.identity, writer).await?;
        let mut inbox = ContactInbox {
            contact: self.identity.address,
            posts: &mut self.posts,
            invites: Vec::new(),
        };
        self.private_channel = apply_private_channel_update(update, &mut inbox);
        Ok(inbox.invites)
    }
}

/// Applies what a contact sent us.
struct ContactInbox<'a> {
    contact: Address,
    posts: &'a mut Vec<Post>,
    invites: Vec<GroupInvite>,
}

impl CommandExecutor for ContactInbox<'_> {
    fn execute_local_command(&mut self, chapter: &Chapter<PrivateChannelCommand>) {
        log::debug!("Delivered {:?} to {:?}", chapter.id, self.contact);
    }

    fn execute_remote_command(&mut self, chapter: &Chapter<PrivateChannelCommand>) {
        match &chapter.content {
            PrivateChannelCommand::Post { post, .. } => {
                self.posts.retain(|p| p.id != post.id);
                self.posts.insert(0, post.clone());
            }
            PrivateChannelCommand::Remove { id } => {
                self.posts.retain(|p| &p.id != id);
            }
            PrivateChannelCommand::GroupInvite { invite } => {
                if invite.inviter.address == self.contact {
                    self.invites.push(invite.clone());
                } else {
                    log::warn!(
                        "Dropping invite from {:?} naming {:?} as inviter",
                        self.contact,
                        invite.inviter.address
                    );
                }
            }
            PrivateChannelCommand::Introduce { peer } => {
                log::debug!("Ignoring introduction of {:?} on contact channel", peer.address);
            }
        }
    }
}
