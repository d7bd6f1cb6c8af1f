//! A local actor: identity, contacts, groups and the public post log.
//!
//! All state is owned by the actor and only changed through `&mut self`, so
//! one actor never runs two sync rounds at once. Actors share nothing but the
//! storage handle.

use std::collections::HashMap;
use std::sync::Arc;

use super::{GroupContext, GroupError, GroupInvite, Result};
use crate::config::SyncConfig;
use crate::contact::MutualContact;
use crate::crypto::{Identity, ProtocolCrypto, PublicIdentity, SharedSecret};
use crate::ids::{Address, PostId, Topic};
use crate::social::{
    fetch_post_command_log, post_command_log_topic, sync_post_command_log_with_remote, LogError,
    Post, PostCommandLog, SyncError,
};
use crate::storage::{FeedAddress, FeedThrottle, FeedWriter, ProtocolStorage};

pub struct Actor {
    identity: Identity,
    storage: Arc<dyn ProtocolStorage>,
    throttle: FeedThrottle,
    config: SyncConfig,
    /// Device id stamped on public log commands.
    source: String,
    contacts: Vec<MutualContact>,
    /// In creation/join order.
    groups: Vec<GroupContext>,
    /// Invites received over contact channels, by sender.
    pending_invites: HashMap<Address, GroupInvite>,
    public_log: PostCommandLog,
}

impl Actor {
    pub fn new(identity: Identity, storage: Arc<dyn ProtocolStorage>, config: SyncConfig) -> Self {
        Actor {
            identity,
            storage,
            throttle: FeedThrottle::new(),
            config,
            source: uuid::Uuid::new_v4().to_string(),
            contacts: Vec::new(),
            groups: Vec::new(),
            pending_invites: HashMap::new(),
            public_log: PostCommandLog::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn public_identity(&self) -> &PublicIdentity {
        self.identity.public_identity()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    // ── Contacts ───────────────────────────────────────────────────────

    /// Register a peer whose identity was exchanged out of band.
    pub fn add_contact(&mut self, identity: PublicIdentity) -> Result<()> {
        if !identity.is_consistent() || identity.address == self.address() {
            return Err(GroupError::InvalidContact(identity.address));
        }
        if self.contact(&identity.address).is_none() {
            log::info!("{:?}: added contact {:?}", self.address(), identity.address);
            self.contacts.push(MutualContact::new(identity));
        }
        Ok(())
    }

    pub fn contact(&self, address: &Address) -> Option<&MutualContact> {
        self.contacts.iter().find(|c| &c.address() == address)
    }

    pub fn contacts(&self) -> &[MutualContact] {
        &self.contacts
    }

    fn contact_mut(&mut self, address: &Address) -> Result<&mut MutualContact> {
        self.contacts
            .iter_mut()
            .find(|c| &c.address() == address)
            .ok_or(GroupError::NotAMutualContact(*address))
    }

    pub fn share_private_post(&mut self, to: &Address, post: Post) -> Result<()> {
        self.contact_mut(to)?.share_post(post);
        Ok(())
    }

    pub fn remove_private_post(&mut self, to: &Address, id: PostId) -> Result<()> {
        self.contact_mut(to)?.remove_post(id);
        Ok(())
    }

    // ── Groups ─────────────────────────────────────────────────────────

    pub fn create_group(&mut self, topic: Topic, shared_secret: SharedSecret) -> Result<()> {
        if self.group(&topic).is_some() {
            return Err(GroupError::GroupExists(topic));
        }
        let profile = self.public_identity().clone();
        self.groups.push(GroupContext::create(topic, shared_secret, profile));
        log::info!("{:?}: created group {:?}", self.address(), topic);
        Ok(())
    }

    pub fn group(&self, topic: &Topic) -> Option<&GroupContext> {
        self.groups.iter().find(|g| &g.topic == topic)
    }

    pub fn groups(&self) -> &[GroupContext] {
        &self.groups
    }

    fn group_mut(&mut self, topic: &Topic) -> Result<&mut GroupContext> {
        self.groups
            .iter_mut()
            .find(|g| &g.topic == topic)
            .ok_or(GroupError::UnknownGroup(*topic))
    }

    /// Invite a mutual contact into a group. The invite goes out on the
    /// contact channel at the next contact sync.
    pub fn invite(&mut self, topic: &Topic, target: &Address) -> Result<()> {
        let target = self
            .contact(target)
            .ok_or(GroupError::NotAMutualContact(*target))?
            .identity
            .clone();
        let invite = self.group_mut(topic)?.invite(&target)?;
        self.contact_mut(&target.address)?.send_invite(invite);
        log::info!("{:?}: invited {:?} to {:?}", self.address(), target.address, topic);
        Ok(())
    }

    /// Invite queued to `to` that has not been uploaded yet, for handing
    /// over out of band.
    pub fn pending_invite_for(&self, to: &Address) -> Option<GroupInvite> {
        self.contact(to)?.pending_invite().cloned()
    }

    /// Invite received from `from` over the contact channel.
    pub fn pending_invite_from(&self, from: &Address) -> Option<&GroupInvite> {
        self.pending_invites.get(from)
    }

    /// Join the group `invite` describes. `from` must be a mutual contact
    /// and the inviter named in the invite.
    pub fn receive_private_invite(&mut self, from: &Address, invite: GroupInvite) -> Result<()> {
        let inviter = self
            .contact(from)
            .ok_or(GroupError::NotAMutualContact(*from))?
            .identity
            .clone();
        if self.group(&invite.topic).is_some() {
            return Err(GroupError::GroupExists(invite.topic));
        }

        let context = GroupContext::from_invite(&inviter, invite, self.public_identity().clone())?;
        if self
            .pending_invites
            .get(from)
            .is_some_and(|pending| pending.topic == context.topic)
        {
            self.pending_invites.remove(from);
        }
        self.groups.push(context);
        Ok(())
    }

    /// Join using the invite received from `from` during a contact sync.
    pub fn accept_invite(&mut self, from: &Address) -> Result<()> {
        let invite = self
            .pending_invites
            .remove(from)
            .ok_or(GroupError::NoPendingInvite(*from))?;
        self.receive_private_invite(from, invite)
    }

    pub fn share_post(&mut self, topic: &Topic, post: Post) -> Result<()> {
        self.group_mut(topic)?.share_post(post);
        Ok(())
    }

    pub fn share_post_text(&mut self, topic: &Topic, text: &str, created_at: i64) -> Result<PostId> {
        let post = Post::new(PostId::random(), text, created_at);
        let id = post.id.clone();
        self.share_post(topic, post)?;
        Ok(id)
    }

    pub fn remove_post(&mut self, topic: &Topic, id: &PostId) -> Result<()> {
        self.group_mut(topic)?.remove_post(id)
    }

    pub fn list_posts(&self, topic: &Topic) -> Result<Vec<Post>> {
        self.group(topic)
            .map(GroupContext::list_posts)
            .ok_or(GroupError::UnknownGroup(*topic))
    }

    // ── Sync ───────────────────────────────────────────────────────────

    /// Sync every contact channel. Returns the number of invites received.
    ///
    /// Invites to groups already joined are dropped.
    pub async fn sync_contacts(&mut self) -> usize {
        let writer = FeedWriter::new(self.storage.as_ref(), &self.identity, &self.throttle, &self.config);
        let mut received = 0;

        for contact in &mut self.contacts {
            match contact.sync(&writer).await {
                Ok(invites) => {
                    for invite in invites {
                        received += 1;
                        self.pending_invites.insert(contact.address(), invite);
                    }
                }
                Err(e) => log::warn!("Contact {:?}: sync failed: {}", contact.address(), e),
            }
        }

        let groups = &self.groups;
        self.pending_invites
            .retain(|_, invite| !groups.iter().any(|g| g.topic == invite.topic));
        received
    }

    /// Sync one group with all its peers. Returns the peer commands applied.
    pub async fn sync_group(&mut self, topic: &Topic) -> Result<usize> {
        let writer = FeedWriter::new(self.storage.as_ref(), &self.identity, &self.throttle, &self.config);
        let group = self
            .groups
            .iter_mut()
            .find(|g| &g.topic == topic)
            .ok_or(GroupError::UnknownGroup(*topic))?;
        Ok(group.sync(&writer).await)
    }

    pub async fn sync_groups(&mut self) -> usize {
        let writer = FeedWriter::new(self.storage.as_ref(), &self.identity, &self.throttle, &self.config);
        let mut applied = 0;
        for group in &mut self.groups {
            applied += group.sync(&writer).await;
        }
        applied
    }

    /// Contact channels first, so invites go out, then every group.
    pub async fn sync(&mut self) -> usize {
        self.sync_contacts().await + self.sync_groups().await
    }

    // ── Public log ─────────────────────────────────────────────────────

    pub fn public_log(&self) -> &PostCommandLog {
        &self.public_log
    }

    pub fn public_posts(&self, count: Option<usize>) -> Vec<Post> {
        self.public_log.latest_posts(count)
    }

    pub fn share_public_post(&mut self, post: Post) {
        self.public_log = self.public_log.share_new_post(post, &self.source);
    }

    pub fn update_public_post(&mut self, post: Post) -> std::result::Result<(), LogError> {
        self.public_log = self.public_log.update_post(post, &self.source)?;
        Ok(())
    }

    pub fn remove_public_post(&mut self, post: &Post) -> std::result::Result<(), LogError> {
        self.public_log = self.public_log.remove_post(post, &self.source)?;
        Ok(())
    }

    /// Sync the public log with its feed.
    ///
    /// After a partial upload the log keeps what was stored, so the next
    /// call resumes from there.
    pub async fn sync_public_log(&mut self) -> std::result::Result<(), SyncError> {
        let writer = FeedWriter::new(self.storage.as_ref(), &self.identity, &self.throttle, &self.config);
        match sync_post_command_log_with_remote(&self.public_log, &writer, &post_command_log_topic()).await {
            Ok(log) => {
                self.public_log = log;
                Ok(())
            }
            Err(SyncError::PartialUpload { log, source }) => {
                self.public_log = (*log).clone();
                Err(SyncError::PartialUpload { log, source })
            }
            Err(e) => Err(e),
        }
    }

    /// Latest public posts of any actor, read straight from storage.
    pub async fn fetch_public_posts(&self, author: &Address, count: Option<usize>) -> Vec<Post> {
        let feed = FeedAddress::new(*author, post_command_log_topic());
        fetch_post_command_log(self.storage.as_ref(), &feed, &self.config)
            .await
            .latest_posts(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn actor(seed: u8, storage: &Arc<MemoryStorage>) -> Actor {
        Actor::new(Identity::from_seed([seed; 32]), storage.clone(), SyncConfig::default())
    }

    fn post(id: &str) -> Post {
        Post::new(PostId::new(id), id, 1)
    }

    fn befriend(a: &mut Actor, b: &mut Actor) {
        a.add_contact(b.public_identity().clone()).unwrap();
        b.add_contact(a.public_identity().clone()).unwrap();
    }

    #[test]
    fn test_contact_validation() {
        let storage = Arc::new(MemoryStorage::new());
        let mut alice = actor(1, &storage);
        let bob = actor(2, &storage);

        let own = alice.public_identity().clone();
        assert!(matches!(alice.add_contact(own), Err(GroupError::InvalidContact(_))));

        let mut forged = bob.public_identity().clone();
        forged.address = Address::from_bytes([0; 20]);
        assert!(matches!(alice.add_contact(forged), Err(GroupError::InvalidContact(_))));

        alice.add_contact(bob.public_identity().clone()).unwrap();
        alice.add_contact(bob.public_identity().clone()).unwrap();
        assert_eq!(alice.contacts().len(), 1);
    }

    #[test]
    fn test_group_preconditions() {
        let storage = Arc::new(MemoryStorage::new());
        let mut alice = actor(1, &storage);
        let bob = actor(2, &storage);
        let topic = Topic::from_label("g");

        assert!(matches!(
            alice.invite(&topic, &bob.address()),
            Err(GroupError::NotAMutualContact(_))
        ));
        alice.add_contact(bob.public_identity().clone()).unwrap();
        assert!(matches!(
            alice.invite(&topic, &bob.address()),
            Err(GroupError::UnknownGroup(_))
        ));

        alice.create_group(topic, SharedSecret::random()).unwrap();
        assert!(matches!(
            alice.create_group(topic, SharedSecret::random()),
            Err(GroupError::GroupExists(_))
        ));
        assert!(matches!(
            alice.accept_invite(&bob.address()),
            Err(GroupError::NoPendingInvite(_))
        ));
    }

    #[test]
    fn test_invite_from_non_contact_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let mut alice = actor(1, &storage);
        let mut bob = actor(2, &storage);
        let topic = Topic::from_label("g");
        alice.add_contact(bob.public_identity().clone()).unwrap();
        alice.create_group(topic, SharedSecret::random()).unwrap();
        alice.invite(&topic, &bob.address()).unwrap();

        let invite = alice.pending_invite_for(&bob.address()).unwrap();
        assert!(matches!(
            bob.receive_private_invite(&alice.address(), invite),
            Err(GroupError::NotAMutualContact(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_log_visible_to_others() {
        let storage = Arc::new(MemoryStorage::new());
        let mut alice = actor(1, &storage);
        let bob = actor(2, &storage);

        alice.share_public_post(post("p1"));
        alice.share_public_post(post("p2"));
        alice.sync_public_log().await.unwrap();
        assert!(alice.public_log().unsynced_commands().is_empty());

        let edited = Post::new(PostId::new("p1"), "edited", 1);
        alice.update_public_post(edited.clone()).unwrap();
        alice.remove_public_post(&post("p2")).unwrap();
        alice.sync_public_log().await.unwrap();

        assert_eq!(alice.public_posts(None), vec![edited.clone()]);
        assert_eq!(bob.fetch_public_posts(&alice.address(), None).await, vec![edited]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_log_resumes_after_partial_upload() {
        let storage = Arc::new(MemoryStorage::new());
        let mut alice = actor(1, &storage);

        alice.share_public_post(post("p1"));
        alice.share_public_post(post("p2"));
        storage.fail_feed_updates_after(1).unwrap();
        assert!(matches!(
            alice.sync_public_log().await,
            Err(SyncError::PartialUpload { .. })
        ));
        assert_eq!(alice.public_log().unsynced_commands().len(), 1);

        storage.clear_failures().unwrap();
        alice.sync_public_log().await.unwrap();
        assert!(alice.public_log().unsynced_commands().is_empty());
        assert_eq!(alice.fetch_public_posts(&alice.address(), None).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_private_posts_between_contacts() {
        let storage = Arc::new(MemoryStorage::new());
        let mut alice = actor(1, &storage);
        let mut bob = actor(2, &storage);
        befriend(&mut alice, &mut bob);

        alice.share_private_post(&bob.address(), post("secret")).unwrap();
        alice.sync_contacts().await;
        bob.sync_contacts().await;
        let received = &bob.contact(&alice.address()).unwrap().posts;
        assert_eq!(received, &vec![post("secret")]);

        alice.remove_private_post(&bob.address(), PostId::new("secret")).unwrap();
        alice.sync_contacts().await;
        bob.sync_contacts().await;
        assert!(bob.contact(&alice.address()).unwrap().posts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_through_contact_sync() {
        let storage = Arc::new(MemoryStorage::new());
        let mut alice = actor(1, &storage);
        let mut bob = actor(2, &storage);
        befriend(&mut alice, &mut bob);
        let topic = Topic::from_label("g");

        alice.create_group(topic, SharedSecret::random()).unwrap();
        alice.invite(&topic, &bob.address()).unwrap();
        alice.sync().await;
        assert!(alice.pending_invite_for(&bob.address()).is_none());

        assert_eq!(bob.sync_contacts().await, 1);
        assert!(bob.pending_invite_from(&alice.address()).is_some());
        bob.accept_invite(&alice.address()).unwrap();
        assert_eq!(bob.group(&topic).unwrap().peer_addresses(), vec![alice.address()]);
        assert!(bob.pending_invite_from(&alice.address()).is_none());
    }
}
