//! One actor's view of one group.

use std::cmp::Ordering;

use super::{GroupError, GroupInvite, Result};
use crate::crypto::{PublicIdentity, SharedSecret};
use crate::ids::{Address, PostId, Topic};
use crate::private_channel::{
    apply_private_channel_update, sync_private_channel, CommandBuffer, PrivateChannel,
    PrivateChannelCommand, PrivateChannelSyncData,
};
use crate::social::Post;
use crate::storage::FeedWriter;

/// A group member and the channel to it.
#[derive(Clone, Debug)]
pub struct GroupPeer {
    pub identity: PublicIdentity,
    pub channel: PrivateChannelSyncData,
}

impl GroupPeer {
    pub fn address(&self) -> Address {
        self.identity.address
    }
}

/// A post and the member who shared it. Only the origin may replace or
/// remove it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupPost {
    pub post: Post,
    pub origin: Address,
    /// Origin's group clock when the post was shared.
    pub sequence: u64,
}

#[derive(Clone, Debug)]
pub struct GroupContext {
    pub topic: Topic,
    pub shared_secret: SharedSecret,
    /// The local actor.
    pub profile: PublicIdentity,
    /// In invite/discovery order.
    peers: Vec<GroupPeer>,
    posts: Vec<GroupPost>,
    /// Highest post sequence shared or seen in this group.
    clock: u64,
}

impl GroupContext {
    pub fn create(topic: Topic, shared_secret: SharedSecret, profile: PublicIdentity) -> Self {
        GroupContext {
            topic,
            shared_secret,
            profile,
            peers: Vec::new(),
            posts: Vec::new(),
            clock: 0,
        }
    }

    /// Join from an invite received from `from`.
    ///
    /// Peers are the inviter's peers at invite time, then the inviter.
    pub fn from_invite(from: &PublicIdentity, invite: GroupInvite, profile: PublicIdentity) -> Result<Self> {
        if invite.inviter != *from {
            return Err(GroupError::InviterMismatch {
                from: from.address,
                inviter: invite.inviter.address,
            });
        }
        let mut context = GroupContext::create(invite.topic, invite.shared_secret, profile);
        for peer in invite.peers.into_iter().chain(std::iter::once(invite.inviter)) {
            context.add_peer(peer);
        }
        log::info!(
            "Joined group {:?} via {:?} with {} peers",
            context.topic,
            from.address,
            context.peers.len()
        );
        Ok(context)
    }

    pub fn peers(&self) -> &[GroupPeer] {
        &self.peers
    }

    pub fn peer_addresses(&self) -> Vec<Address> {
        self.peers.iter().map(GroupPeer::address).collect()
    }

    pub fn has_peer(&self, address: &Address) -> bool {
        self.peers.iter().any(|p| &p.address() == address)
    }

    pub fn posts(&self) -> &[GroupPost] {
        &self.posts
    }

    /// Add `target` to the group and build the invite to send it.
    ///
    /// The invite lists the peers known before `target`. Every existing
    /// peer is told about `target`, and `target` gets our posts.
    pub fn invite(&mut self, target: &PublicIdentity) -> Result<GroupInvite> {
        if target.address == self.profile.address {
            return Err(GroupError::SelfInvite);
        }
        if self.has_peer(&target.address) {
            return Err(GroupError::AlreadyPeer(target.address));
        }
        if !target.is_consistent() {
            return Err(GroupError::InvalidContact(target.address));
        }

        let invite = GroupInvite {
            topic: self.topic,
            shared_secret: self.shared_secret.clone(),
            inviter: self.profile.clone(),
            peers: self.peers.iter().map(|p| p.identity.clone()).collect(),
        };
        for peer in &mut self.peers {
            peer.channel.push_command(PrivateChannelCommand::Introduce {
                peer: target.clone(),
            });
        }
        self.add_peer(target.clone());
        Ok(invite)
    }

    /// Append a peer with our own posts queued to it.
    fn add_peer(&mut self, identity: PublicIdentity) -> bool {
        if identity.address == self.profile.address || self.has_peer(&identity.address) {
            return false;
        }
        if !identity.is_consistent() {
            log::warn!("Group {:?}: ignoring inconsistent identity {:?}", self.topic, identity.address);
            return false;
        }

        let mut channel = PrivateChannelSyncData::empty();
        for own in self.posts.iter().filter(|p| p.origin == self.profile.address) {
            channel.add_sequenced_post(own.post.clone(), own.sequence);
        }
        log::info!("Group {:?}: added peer {:?}", self.topic, identity.address);
        self.peers.push(GroupPeer { identity, channel });
        true
    }

    // ── Posts ──────────────────────────────────────────────────────────

    /// Share a post with every peer. It is stamped with the next tick of
    /// the group clock.
    pub fn share_post(&mut self, post: Post) {
        self.clock += 1;
        let sequence = self.clock;
        for peer in &mut self.peers {
            peer.channel.add_sequenced_post(post.clone(), sequence);
        }
        let origin = self.profile.address;
        self.upsert_post(GroupPost { post, origin, sequence });
    }

    /// Remove one of our posts and tell the peers.
    ///
    /// A post we know to be someone else's is refused. An unknown id is
    /// still broadcast; receivers check ownership themselves.
    pub fn remove_post(&mut self, id: &PostId) -> Result<()> {
        if let Some(origin) = self.origin_of(id) {
            if origin != self.profile.address {
                return Err(GroupError::NotPostAuthor(id.clone()));
            }
        }
        self.posts.retain(|p| &p.post.id != id);
        for peer in &mut self.peers {
            peer.channel.remove_post(id.clone());
        }
        Ok(())
    }

    /// Newest first by creation time, then by sequence. Posts shared
    /// concurrently with equal times list by origin address, so every
    /// member sees the same order.
    pub fn list_posts(&self) -> Vec<Post> {
        let mut posts: Vec<&GroupPost> = self.posts.iter().collect();
        posts.sort_by(|a, b| {
            match (b.post.created_at, b.sequence).cmp(&(a.post.created_at, a.sequence)) {
                Ordering::Equal => (a.origin, &a.post.id).cmp(&(b.origin, &b.post.id)),
                other => other,
            }
        });
        posts.into_iter().map(|p| p.post.clone()).collect()
    }

    fn origin_of(&self, id: &PostId) -> Option<Address> {
        self.posts.iter().find(|p| &p.post.id == id).map(|p| p.origin)
    }

    fn upsert_post(&mut self, post: GroupPost) {
        match self.posts.iter_mut().find(|p| p.post.id == post.post.id) {
            Some(existing) => *existing = post,
            None => self.posts.push(post),
        }
    }

    // ── Commands ───────────────────────────────────────────────────────

    /// A command of ours reached a peer's channel. Its effect on the post
    /// set and peer list was applied when it was queued, so delivery only
    /// gets logged.
    pub fn apply_local_command(&mut self, command: &PrivateChannelCommand) {
        log::debug!("Group {:?}: delivered {:?}", self.topic, command);
    }

    pub fn apply_remote_command(&mut self, from: &Address, command: &PrivateChannelCommand) {
        match command {
            PrivateChannelCommand::Post { post, sequence } => match self.origin_of(&post.id) {
                Some(origin) if &origin != from => {
                    log::warn!(
                        "Group {:?}: {:?} tried to overwrite post {} of {:?}",
                        self.topic,
                        from,
                        post.id,
                        origin
                    );
                }
                _ => {
                    self.clock = self.clock.max(*sequence);
                    self.upsert_post(GroupPost {
                        post: post.clone(),
                        origin: *from,
                        sequence: *sequence,
                    });
                }
            },
            PrivateChannelCommand::Remove { id } => match self.origin_of(id) {
                Some(origin) if &origin == from => {
                    self.posts.retain(|p| &p.post.id != id);
                }
                Some(origin) => {
                    log::warn!(
                        "Group {:?}: {:?} tried to remove post {} of {:?}",
                        self.topic,
                        from,
                        id,
                        origin
                    );
                }
                None => log::debug!("Group {:?}: removal of unknown post {}", self.topic, id),
            },
            PrivateChannelCommand::Introduce { peer } => self.handle_introduction(from, peer),
            PrivateChannelCommand::GroupInvite { invite } => {
                log::warn!(
                    "Group {:?}: ignoring invite to {:?} on a group channel",
                    self.topic,
                    invite.topic
                );
            }
        }
    }

    /// `from` told us about `peer`. A new peer is told about everyone we
    /// know, and everyone but `from` is told about it.
    fn handle_introduction(&mut self, from: &Address, peer: &PublicIdentity) {
        let known: Vec<PublicIdentity> = self.peers.iter().map(|p| p.identity.clone()).collect();
        if !self.add_peer(peer.clone()) {
            return;
        }

        let (new_peer, others) = match self.peers.split_last_mut() {
            Some(split) => split,
            None => return,
        };
        for other in others.iter_mut().filter(|p| &p.address() != from) {
            other.channel.push_command(PrivateChannelCommand::Introduce { peer: peer.clone() });
        }
        for identity in known {
            new_peer
                .channel
                .push_command(PrivateChannelCommand::Introduce { peer: identity });
        }
    }

    // ── Sync ───────────────────────────────────────────────────────────

    /// Sync the channel with every peer, including peers discovered during
    /// this round. Returns the number of peer commands applied.
    pub async fn sync(&mut self, writer: &FeedWriter<'_>) -> usize {
        let mut applied = 0;
        let mut i = 0;

        while i < self.peers.len() {
            let identity = self.peers[i].identity.clone();
            i += 1;

            let channel = match PrivateChannel::for_group_member(
                writer.crypto(),
                &identity,
                &self.topic,
                &self.shared_secret,
            ) {
                Ok(channel) => channel,
                Err(e) => {
                    log::warn!("Group {:?}: no channel with {:?}: {}", self.topic, identity.address, e);
                    continue;
                }
            };

            let update = sync_private_channel(&self.peers[i - 1].channel, &channel, &identity, writer).await;
            let mut buffer = CommandBuffer::default();
            self.peers[i - 1].channel = apply_private_channel_update(update, &mut buffer);

            for chapter in &buffer.local {
                self.apply_local_command(&chapter.content);
            }
            for chapter in &buffer.remote {
                self.apply_remote_command(&chapter.author, &chapter.content);
                applied += 1;
            }
        }

        log::info!(
            "Group {:?}: synced with {} peers, applied {} commands",
            self.topic,
            self.peers.len(),
            applied
        );
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Identity, ProtocolCrypto};

    fn identity(seed: u8) -> PublicIdentity {
        Identity::from_seed([seed; 32]).public_identity().clone()
    }

    fn group(seed: u8) -> GroupContext {
        GroupContext::create(
            Topic::from_label("group"),
            SharedSecret::from_bytes([9; 32]),
            identity(seed),
        )
    }

    fn post(id: &str, created_at: i64) -> Post {
        Post::new(PostId::new(id), id, created_at)
    }

    fn introductions(peer: &GroupPeer) -> Vec<Address> {
        peer.channel
            .unsynced_commands
            .iter()
            .filter_map(|c| match c {
                PrivateChannelCommand::Introduce { peer } => Some(peer.address),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_invite_lists_previous_peers() {
        let mut alice = group(1);
        let first = alice.invite(&identity(2)).unwrap();
        assert!(first.peers.is_empty());
        assert_eq!(first.inviter, identity(1));

        let second = alice.invite(&identity(3)).unwrap();
        assert_eq!(second.peers, vec![identity(2)]);
        assert_eq!(alice.peer_addresses(), vec![identity(2).address, identity(3).address]);

        // Bob hears about Carol
        assert_eq!(introductions(&alice.peers()[0]), vec![identity(3).address]);
    }

    #[test]
    fn test_invite_errors() {
        let mut alice = group(1);
        assert!(matches!(alice.invite(&identity(1)), Err(GroupError::SelfInvite)));
        alice.invite(&identity(2)).unwrap();
        assert!(matches!(alice.invite(&identity(2)), Err(GroupError::AlreadyPeer(_))));
    }

    #[test]
    fn test_join_from_invite() {
        let mut alice = group(1);
        alice.invite(&identity(2)).unwrap();
        let invite = alice.invite(&identity(3)).unwrap();

        let carol = GroupContext::from_invite(&identity(1), invite.clone(), identity(3)).unwrap();
        assert_eq!(carol.peer_addresses(), vec![identity(2).address, identity(1).address]);
        assert_eq!(carol.shared_secret, alice.shared_secret);

        let err = GroupContext::from_invite(&identity(2), invite, identity(3)).unwrap_err();
        assert!(matches!(err, GroupError::InviterMismatch { .. }));
    }

    #[test]
    fn test_introduction_fans_out() {
        let mut bob = group(2);
        bob.add_peer(identity(1));
        bob.add_peer(identity(4));

        bob.apply_remote_command(&identity(1).address, &PrivateChannelCommand::Introduce { peer: identity(3) });
        assert_eq!(
            bob.peer_addresses(),
            vec![identity(1).address, identity(4).address, identity(3).address]
        );
        // Not back to the introducer
        assert!(introductions(&bob.peers()[0]).is_empty());
        assert_eq!(introductions(&bob.peers()[1]), vec![identity(3).address]);
        // The newcomer learns about everyone else
        let mut told = introductions(&bob.peers()[2]);
        told.sort();
        let mut expected = vec![identity(1).address, identity(4).address];
        expected.sort();
        assert_eq!(told, expected);

        // Known peers and ourselves are not added again
        bob.apply_remote_command(&identity(1).address, &PrivateChannelCommand::Introduce { peer: identity(3) });
        bob.apply_remote_command(&identity(1).address, &PrivateChannelCommand::Introduce { peer: identity(2) });
        assert_eq!(bob.peers().len(), 3);
    }

    #[test]
    fn test_new_peer_gets_own_posts_only() {
        let mut alice = group(1);
        alice.share_post(post("mine", 1));
        alice.apply_remote_command(&identity(5).address, &PrivateChannelCommand::Post { post: post("theirs", 2), sequence: 4 });

        alice.invite(&identity(2)).unwrap();
        assert_eq!(
            alice.peers()[0].channel.unsynced_commands,
            vec![PrivateChannelCommand::Post { post: post("mine", 1), sequence: 1 }]
        );
    }

    #[test]
    fn test_remove_checks_origin() {
        let mut alice = group(1);
        let bob = identity(2).address;
        alice.invite(&identity(2)).unwrap();
        alice.apply_remote_command(&bob, &PrivateChannelCommand::Post { post: post("b", 1), sequence: 1 });

        assert!(matches!(
            alice.remove_post(&PostId::new("b")),
            Err(GroupError::NotPostAuthor(_))
        ));
        assert_eq!(alice.list_posts().len(), 1);

        // A peer cannot remove or overwrite another member's post either
        alice.share_post(post("a", 1));
        alice.apply_remote_command(&bob, &PrivateChannelCommand::Remove { id: PostId::new("a") });
        alice.apply_remote_command(&bob, &PrivateChannelCommand::Post {
            post: Post::new(PostId::new("a"), "forged", 1),
            sequence: 9,
        });
        assert_eq!(alice.list_posts()[0].text, "a");

        // The origin can
        alice.apply_remote_command(&bob, &PrivateChannelCommand::Remove { id: PostId::new("b") });
        assert_eq!(alice.list_posts(), vec![post("a", 1)]);
    }

    #[test]
    fn test_list_posts_order() {
        let mut alice = group(1);
        alice.share_post(post("b", 1));
        alice.share_post(post("c", 2));
        alice.share_post(post("a", 1));
        let ids: Vec<String> = alice.list_posts().into_iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    fn texts(group: &GroupContext) -> Vec<String> {
        group.list_posts().into_iter().map(|p| p.text).collect()
    }

    #[test]
    fn test_concurrent_posts_order_by_origin() {
        let mut a = group(1);
        let mut b = group(2);
        a.share_post(Post::new(PostId::random(), "from 1", 1));
        b.share_post(Post::new(PostId::random(), "from 2", 1));
        let from_a = a.posts()[0].clone();
        let from_b = b.posts()[0].clone();
        assert_eq!((from_a.sequence, from_b.sequence), (1, 1));

        a.apply_remote_command(
            &from_b.origin,
            &PrivateChannelCommand::Post { post: from_b.post.clone(), sequence: from_b.sequence },
        );
        b.apply_remote_command(
            &from_a.origin,
            &PrivateChannelCommand::Post { post: from_a.post.clone(), sequence: from_a.sequence },
        );

        let expected = if identity(1).address < identity(2).address {
            vec!["from 1", "from 2"]
        } else {
            vec!["from 2", "from 1"]
        };
        assert_eq!(texts(&a), expected);
        assert_eq!(texts(&b), expected);
    }

    #[test]
    fn test_seen_posts_advance_clock() {
        let mut alice = group(1);
        alice.apply_remote_command(
            &identity(2).address,
            &PrivateChannelCommand::Post { post: post("seen", 1), sequence: 7 },
        );
        alice.share_post(post("reply", 1));
        assert_eq!(alice.posts()[1].sequence, 8);
        assert_eq!(texts(&alice), vec!["reply", "seen"]);

        // A stale sequence does not move the clock back
        alice.apply_remote_command(
            &identity(3).address,
            &PrivateChannelCommand::Post { post: post("late", 1), sequence: 2 },
        );
        alice.share_post(post("next", 1));
        assert_eq!(alice.posts()[3].sequence, 9);
    }

    #[test]
    fn test_delivered_commands_leave_state_unchanged() {
        let mut alice = group(1);
        alice.invite(&identity(2)).unwrap();
        alice.share_post(post("a", 1));
        let before = (alice.posts().to_vec(), alice.peer_addresses());

        let queued = alice.peers()[0].channel.unsynced_commands.clone();
        for command in &queued {
            alice.apply_local_command(command);
        }
        alice.apply_local_command(&PrivateChannelCommand::Remove { id: PostId::new("a") });
        assert_eq!((alice.posts().to_vec(), alice.peer_addresses()), before);
    }
}
