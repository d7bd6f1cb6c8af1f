//! Pairwise encrypted command exchange.
//!
//! Two actors that know each other's agreement key derive the same channel
//! key and topic without talking. Each side appends its commands as chapters
//! to its own feed on that topic and reads the other side's feed, so a sync
//! round is: upload pending commands, fetch the peer's new chapters, apply
//! both batches oldest first through a [`CommandExecutor`].

use serde::{Deserialize, Serialize};

use crate::crypto::{
    calculate_private_topic, derive_channel_key, CryptoError, ProtocolCrypto, PublicIdentity,
    SharedSecret, NONCE_LEN,
};
use crate::group::GroupInvite;
use crate::ids::{ChapterReference, PostId, Topic};
use crate::social::Post;
use crate::storage::FeedWriter;
use crate::timeline::{
    fetch_timeline, get_newest_chapter_id, make_partial_chapter, upload_timeline, Chapter,
    Timeline,
};

const GROUP_CHANNEL_INFO: &[u8] = b"feedsync group channel";

/// Command carried over a private channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrivateChannelCommand {
    Post {
        post: Post,
        /// Sharer's group clock at share time. Zero on contact channels.
        #[serde(default)]
        sequence: u64,
    },
    Remove { id: PostId },
    GroupInvite { invite: GroupInvite },
    /// Announces a group member the receiver may not know yet.
    Introduce { peer: PublicIdentity },
}

/// Local state of one private channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateChannelSyncData {
    /// Commands not uploaded yet, newest first.
    pub unsynced_commands: Vec<PrivateChannelCommand>,
    pub last_synced_chapter_id: Option<ChapterReference>,
    pub peer_last_seen_chapter_id: Option<ChapterReference>,
}

impl PrivateChannelSyncData {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push_command(&mut self, command: PrivateChannelCommand) {
        self.unsynced_commands.insert(0, command);
    }

    pub fn add_post(&mut self, post: Post) {
        self.add_sequenced_post(post, 0);
    }

    pub fn add_sequenced_post(&mut self, post: Post, sequence: u64) {
        self.push_command(PrivateChannelCommand::Post { post, sequence });
    }

    pub fn remove_post(&mut self, id: PostId) {
        self.push_command(PrivateChannelCommand::Remove { id });
    }
}

/// Key and topic of a channel between the local actor and one peer.
#[derive(Debug)]
pub struct PrivateChannel {
    pub topic: Topic,
    pub key: SharedSecret,
}

impl PrivateChannel {
    /// Channel between two mutual contacts: the agreed secret is the key.
    pub fn with_contact(crypto: &dyn ProtocolCrypto, peer: &PublicIdentity) -> Result<Self, CryptoError> {
        let key = crypto.derive_shared_key(&peer.agreement_key)?;
        Ok(PrivateChannel {
            topic: calculate_private_topic(key.as_bytes()),
            key,
        })
    }

    /// Channel between two members of a group, separate from their contact
    /// channel and from their channels in other groups.
    pub fn for_group_member(
        crypto: &dyn ProtocolCrypto,
        peer: &PublicIdentity,
        group_topic: &Topic,
        group_secret: &SharedSecret,
    ) -> Result<Self, CryptoError> {
        let agreed = crypto.derive_shared_key(&peer.agreement_key)?;
        let mut info = GROUP_CHANNEL_INFO.to_vec();
        info.extend_from_slice(group_topic.as_bytes());
        let key = SharedSecret::from_bytes(derive_channel_key(
            agreed.as_bytes(),
            Some(group_secret.as_bytes()),
            &info,
        )?);
        Ok(PrivateChannel {
            topic: calculate_private_topic(key.as_bytes()),
            key,
        })
    }
}

/// Outcome of one sync round, not yet applied.
#[derive(Clone, Debug)]
pub struct PrivateChannelUpdate {
    pub topic: Topic,
    /// Channel state the round started from.
    pub private_channel: PrivateChannelSyncData,
    /// Local commands uploaded in this round, newest first.
    pub synced_local_timeline: Timeline<PrivateChannelCommand>,
    /// Peer chapters fetched in this round, newest first.
    pub peer_timeline: Timeline<PrivateChannelCommand>,
}

/// Effects of synced commands on the host's state.
pub trait CommandExecutor {
    fn execute_local_command(&mut self, chapter: &Chapter<PrivateChannelCommand>);

    fn execute_remote_command(&mut self, chapter: &Chapter<PrivateChannelCommand>);
}

/// Executor that records chapters for the caller to replay.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    pub local: Vec<Chapter<PrivateChannelCommand>>,
    pub remote: Vec<Chapter<PrivateChannelCommand>>,
}

impl CommandExecutor for CommandBuffer {
    fn execute_local_command(&mut self, chapter: &Chapter<PrivateChannelCommand>) {
        self.local.push(chapter.clone());
    }

    fn execute_remote_command(&mut self, chapter: &Chapter<PrivateChannelCommand>) {
        self.remote.push(chapter.clone());
    }
}

/// Run one sync round over `channel`.
///
/// Never fails: an upload error leaves every command pending and yields an
/// empty synced set, a fetch error yields an empty peer timeline.
pub async fn sync_private_channel(
    data: &PrivateChannelSyncData,
    channel: &PrivateChannel,
    peer: &PublicIdentity,
    writer: &FeedWriter<'_>,
) -> PrivateChannelUpdate {
    let crypto = writer.crypto();
    let author = writer.owner();

    let chapters = data
        .unsynced_commands
        .iter()
        .rev()
        .map(|command| make_partial_chapter(author, command.clone()))
        .collect();
    let encrypt = |plaintext: &[u8]| crypto.encrypt(plaintext, &channel.key, &crypto.random(NONCE_LEN));
    let synced_local_timeline = match upload_timeline(
        chapters,
        writer,
        &channel.topic,
        encrypt,
        data.last_synced_chapter_id,
    )
    .await
    {
        Ok(timeline) => timeline,
        Err(e) => {
            log::warn!("Channel {:?}: upload failed, keeping commands pending: {}", channel.topic, e);
            Vec::new()
        }
    };

    let decrypt = |ciphertext: &[u8]| crypto.decrypt(ciphertext, &channel.key);
    let peer_timeline = match fetch_timeline(
        writer.storage(),
        peer,
        &channel.topic,
        decrypt,
        data.peer_last_seen_chapter_id,
        writer.config(),
    )
    .await
    {
        Ok(timeline) => timeline,
        Err(e) => {
            log::warn!("Channel {:?}: peer fetch failed: {}", channel.topic, e);
            Vec::new()
        }
    };

    log::debug!(
        "Channel {:?}: uploaded {}, fetched {}",
        channel.topic,
        synced_local_timeline.len(),
        peer_timeline.len()
    );
    PrivateChannelUpdate {
        topic: channel.topic,
        private_channel: data.clone(),
        synced_local_timeline,
        peer_timeline,
    }
}

/// [`sync_private_channel`] on the contact channel with `contact`.
pub async fn sync_private_channel_with_contact(
    data: &PrivateChannelSyncData,
    contact: &PublicIdentity,
    writer: &FeedWriter<'_>,
) -> Result<PrivateChannelUpdate, CryptoError> {
    let channel = PrivateChannel::with_contact(writer.crypto(), contact)?;
    Ok(sync_private_channel(data, &channel, contact, writer).await)
}

/// Apply a sync round and return the channel state after it.
///
/// Local chapters run first, then peer chapters, each batch oldest first.
/// Pending commands are cleared only when the round uploaded them.
pub fn apply_private_channel_update(
    update: PrivateChannelUpdate,
    executor: &mut dyn CommandExecutor,
) -> PrivateChannelSyncData {
    for chapter in update.synced_local_timeline.iter().rev() {
        executor.execute_local_command(chapter);
    }
    for chapter in update.peer_timeline.iter().rev() {
        executor.execute_remote_command(chapter);
    }

    let previous = update.private_channel;
    let unsynced_commands = if update.synced_local_timeline.is_empty() {
        previous.unsynced_commands
    } else {
        Vec::new()
    };
    PrivateChannelSyncData {
        unsynced_commands,
        last_synced_chapter_id: get_newest_chapter_id(&update.synced_local_timeline)
            .or(previous.last_synced_chapter_id),
        peer_last_seen_chapter_id: get_newest_chapter_id(&update.peer_timeline)
            .or(previous.peer_last_seen_chapter_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::crypto::Identity;
    use crate::storage::{FeedThrottle, MemoryStorage};

    struct Peer {
        identity: Identity,
        throttle: FeedThrottle,
        config: SyncConfig,
        data: PrivateChannelSyncData,
    }

    impl Peer {
        fn new(seed: u8) -> Self {
            Peer {
                identity: Identity::from_seed([seed; 32]),
                throttle: FeedThrottle::new(),
                config: SyncConfig::default(),
                data: PrivateChannelSyncData::empty(),
            }
        }

        fn public(&self) -> PublicIdentity {
            self.identity.public_identity().clone()
        }

        async fn sync_with(&mut self, storage: &MemoryStorage, peer: &PublicIdentity) -> CommandBuffer {
            let writer = FeedWriter::new(storage, &self.identity, &self.throttle, &self.config);
            let update = sync_private_channel_with_contact(&self.data, peer, &writer)
                .await
                .unwrap();
            let mut buffer = CommandBuffer::default();
            self.data = apply_private_channel_update(update, &mut buffer);
            buffer
        }
    }

    fn post(id: &str) -> Post {
        Post::new(PostId::new(id), id, 1)
    }

    fn posts(chapters: &[Chapter<PrivateChannelCommand>]) -> Vec<String> {
        chapters
            .iter()
            .filter_map(|c| match &c.content {
                PrivateChannelCommand::Post { post, .. } => Some(post.id.0.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_both_sides_derive_same_channel() {
        let alice = Identity::from_seed([1; 32]);
        let bob = Identity::from_seed([2; 32]);

        let ab = PrivateChannel::with_contact(&alice, bob.public_identity()).unwrap();
        let ba = PrivateChannel::with_contact(&bob, alice.public_identity()).unwrap();
        assert_eq!(ab.topic, ba.topic);
        assert_eq!(ab.key, ba.key);
    }

    #[test]
    fn test_group_channels_are_separate() {
        let alice = Identity::from_seed([1; 32]);
        let bob = Identity::from_seed([2; 32]);
        let secret = SharedSecret::from_bytes([3; 32]);
        let g1 = Topic::from_label("g1");
        let g2 = Topic::from_label("g2");

        let contact = PrivateChannel::with_contact(&alice, bob.public_identity()).unwrap();
        let ab = PrivateChannel::for_group_member(&alice, bob.public_identity(), &g1, &secret).unwrap();
        let ba = PrivateChannel::for_group_member(&bob, alice.public_identity(), &g1, &secret).unwrap();
        let other = PrivateChannel::for_group_member(&alice, bob.public_identity(), &g2, &secret).unwrap();

        assert_eq!(ab.topic, ba.topic);
        assert_eq!(ab.key, ba.key);
        assert_ne!(ab.topic, contact.topic);
        assert_ne!(ab.topic, other.topic);
    }

    #[test]
    fn test_push_command_prepends() {
        let mut data = PrivateChannelSyncData::empty();
        data.add_post(post("a"));
        data.remove_post(PostId::new("a"));
        assert_eq!(
            data.unsynced_commands,
            vec![
                PrivateChannelCommand::Remove { id: PostId::new("a") },
                PrivateChannelCommand::Post { post: post("a"), sequence: 0 },
            ]
        );
    }

    #[test]
    fn test_command_json_is_tagged() {
        let json = serde_json::to_string(&PrivateChannelCommand::Remove { id: PostId::new("x") }).unwrap();
        assert_eq!(json, r#"{"type":"remove","id":"x"}"#);
    }

    #[test]
    fn test_post_command_sequence_defaults_to_zero() {
        let mut data = PrivateChannelSyncData::empty();
        data.add_post(post("a"));
        let json = serde_json::to_string(&data.unsynced_commands[0]).unwrap();
        let without_sequence = json.replace(r#","sequence":0"#, "");
        assert_ne!(json, without_sequence);

        let decoded: PrivateChannelCommand = serde_json::from_str(&without_sequence).unwrap();
        assert_eq!(decoded, PrivateChannelCommand::Post { post: post("a"), sequence: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_in_order() {
        let storage = MemoryStorage::new();
        let mut alice = Peer::new(1);
        let mut bob = Peer::new(2);

        alice.data.add_post(post("a1"));
        alice.data.add_post(post("a2"));
        let sent = alice.sync_with(&storage, &bob.public()).await;
        assert_eq!(posts(&sent.local), vec!["a1", "a2"]);
        assert!(alice.data.unsynced_commands.is_empty());
        assert!(alice.data.last_synced_chapter_id.is_some());

        bob.data.add_post(post("b1"));
        let received = bob.sync_with(&storage, &alice.public()).await;
        assert_eq!(posts(&received.remote), vec!["a1", "a2"]);
        assert_eq!(posts(&received.local), vec!["b1"]);
        assert!(received.remote.iter().all(|c| c.author == alice.identity.address()));

        alice.data.add_post(post("a3"));
        let back = alice.sync_with(&storage, &bob.public()).await;
        assert_eq!(posts(&back.local), vec!["a3"]);
        assert_eq!(posts(&back.remote), vec!["b1"]);

        // Only new chapters on the next round
        let received = bob.sync_with(&storage, &alice.public()).await;
        assert_eq!(posts(&received.remote), vec!["a3"]);
        assert!(received.local.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_upload_keeps_commands_pending() {
        let storage = MemoryStorage::new();
        let mut alice = Peer::new(1);
        let bob = Peer::new(2);

        alice.data.add_post(post("a1"));
        storage.set_unreachable(true);
        let buffer = alice.sync_with(&storage, &bob.public()).await;
        assert!(buffer.local.is_empty());
        assert_eq!(alice.data.unsynced_commands.len(), 1);
        assert_eq!(alice.data.last_synced_chapter_id, None);

        storage.set_unreachable(false);
        let buffer = alice.sync_with(&storage, &bob.public()).await;
        assert_eq!(posts(&buffer.local), vec!["a1"]);
        assert!(alice.data.unsynced_commands.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outsider_cannot_read_channel() {
        let storage = MemoryStorage::new();
        let mut alice = Peer::new(1);
        let bob = Peer::new(2);
        let mut eve = Peer::new(3);

        alice.data.add_post(post("a1"));
        alice.sync_with(&storage, &bob.public()).await;

        // Eve reads Alice's feed on her own channel topic with Alice: nothing there
        let buffer = eve.sync_with(&storage, &alice.public()).await;
        assert!(buffer.remote.is_empty());
    }
}
