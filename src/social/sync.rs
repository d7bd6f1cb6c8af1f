//! Syncing a post command log with its feed.
//!
//! Each stored command carries its own epoch and the epoch of the command
//! stored before it, so the full history is read by walking
//! `previous_epoch` back from the feed head.

use std::cmp::Ordering;

use thiserror::Error;

use super::command_log::{PostCommand, PostCommandLog};
use crate::config::SyncConfig;
use crate::ids::Topic;
use crate::serialization::{self, SerializationError};
use crate::storage::{epoch_compare, FeedAddress, FeedWriter, ProtocolStorage, StorageError};

#[derive(Error, Debug)]
pub enum SyncError {
    /// Some commands were stored before the failure. `log` holds them with
    /// their epochs; the rest are still unsynced.
    #[error("upload stopped after a storage error: {source}")]
    PartialUpload {
        log: Box<PostCommandLog>,
        source: StorageError,
    },
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Topic of an actor's public post log.
pub fn post_command_log_topic() -> Topic {
    Topic::from_label("post command log")
}

/// Read a feed's full command history.
///
/// Never fails: an unreachable feed yields an empty log and an error part
/// way down the chain yields the commands read so far.
pub async fn fetch_post_command_log(
    storage: &dyn ProtocolStorage,
    feed: &FeedAddress,
    config: &SyncConfig,
) -> PostCommandLog {
    let head = match storage.download_feed(feed).await {
        Ok(Some(head)) => head,
        Ok(None) => return PostCommandLog::new(),
        Err(e) => {
            log::warn!("Feed {:?}: fetch failed, treating remote as empty: {}", feed.topic, e);
            return PostCommandLog::new();
        }
    };

    let mut commands: Vec<PostCommand> = Vec::new();
    let mut next = Some(head);

    while let Some(bytes) = next.take() {
        let command = match serialization::deserialize_bytes::<PostCommand>(&bytes) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("Feed {:?}: malformed command, stopping walk: {}", feed.topic, e);
                break;
            }
        };
        let Some(epoch) = command.epoch else {
            log::warn!("Feed {:?}: stored command without epoch, stopping walk", feed.topic);
            break;
        };
        let previous = command.previous_epoch;
        commands.push(command);

        let Some(previous) = previous else { break };
        // Versions only move forward, so a link that does not go back in
        // time is corrupt and would otherwise loop.
        if previous >= epoch {
            log::warn!(
                "Feed {:?}: previous epoch {:?} is not older than {:?}",
                feed.topic,
                previous,
                epoch
            );
            break;
        }
        if commands.len() >= config.max_command_chain_length {
            log::warn!("Feed {:?}: chain longer than {} commands", feed.topic, commands.len());
            break;
        }

        match storage.download_previous_version(feed, &previous).await {
            Ok(bytes) => next = Some(bytes),
            Err(e) => {
                log::warn!("Feed {:?}: history fetch failed at {:?}: {}", feed.topic, previous, e);
            }
        }
    }

    log::debug!("Feed {:?}: fetched {} commands", feed.topic, commands.len());
    PostCommandLog::from_commands(commands)
}

/// Store every unsynced command, oldest first, chaining `previous_epoch`.
///
/// Unsynced commands are first renumbered above the synced history. Each
/// command gets the epoch its feed version is stored under. The writer
/// enforces the minimum spacing between updates.
pub async fn upload_unsynced_post_commands(
    log: &PostCommandLog,
    writer: &FeedWriter<'_>,
    topic: &Topic,
) -> Result<PostCommandLog> {
    let log = &log.rebased();
    let unsynced = log.unsynced_commands();
    let synced = log.synced_commands();
    if unsynced.is_empty() {
        return Ok(log.clone());
    }

    let mut previous_epoch = log.latest_epoch();
    let mut uploaded: Vec<PostCommand> = Vec::with_capacity(unsynced.len());

    for (done, original) in unsynced.iter().rev().enumerate() {
        let mut command = original.clone();
        command.previous_epoch = previous_epoch;

        let result = writer
            .update_with(topic, |epoch| {
                command.epoch = Some(*epoch);
                serialization::serialize(&command).map(String::into_bytes)
            })
            .await;

        match result {
            Ok(epoch) => {
                log::debug!("Uploaded command {} at {:?}", command.timestamp, epoch);
                command.epoch = Some(epoch);
                previous_epoch = Some(epoch);
                uploaded.push(command);
            }
            Err(StorageError::Serialization(e)) => return Err(SyncError::Serialization(e)),
            Err(source) => {
                let remaining = &unsynced[..unsynced.len() - done];
                log::warn!(
                    "Upload stopped after {} of {} commands: {}",
                    done,
                    unsynced.len(),
                    source
                );
                let partial = assemble(remaining, uploaded, synced);
                return Err(SyncError::PartialUpload {
                    log: Box::new(partial),
                    source,
                });
            }
        }
    }

    Ok(assemble(&[], uploaded, synced))
}

/// Unsynced (newest first), then freshly uploaded (newest first), then the
/// previously synced run.
fn assemble(unsynced: &[PostCommand], mut uploaded: Vec<PostCommand>, synced: &[PostCommand]) -> PostCommandLog {
    uploaded.reverse();
    let mut commands = Vec::with_capacity(unsynced.len() + uploaded.len() + synced.len());
    commands.extend_from_slice(unsynced);
    commands.extend(uploaded);
    commands.extend_from_slice(synced);
    PostCommandLog::from_sorted(commands)
}

/// Bring a local log and its feed into agreement.
///
/// Fetches the stored history; if it ends at the epoch the local log already
/// knows and nothing local is pending, the log is returned unchanged.
/// Otherwise both are merged and pending commands are uploaded.
pub async fn sync_post_command_log_with_remote(
    log: &PostCommandLog,
    writer: &FeedWriter<'_>,
    topic: &Topic,
) -> Result<PostCommandLog> {
    let feed = writer.feed(topic);
    let remote = fetch_post_command_log(writer.storage(), &feed, writer.config()).await;

    let local_latest = log.latest_epoch();
    let remote_latest = remote.latest_epoch();
    if epoch_compare(local_latest.as_ref(), remote_latest.as_ref()) == Ordering::Equal
        && log.unsynced_commands().is_empty()
    {
        log::debug!("Feed {:?}: already in sync at {:?}", feed.topic, local_latest);
        return Ok(log.clone());
    }

    let merged = log.merge(&remote);
    let synced = upload_unsynced_post_commands(&merged, writer, topic).await?;
    log::info!(
        "Feed {:?}: synced {} commands ({} from remote)",
        feed.topic,
        synced.len(),
        remote.len()
    );
    Ok(synced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::ids::PostId;
    use crate::social::Post;
    use crate::storage::{Epoch, FeedThrottle, MemoryStorage};

    struct Device {
        identity: Identity,
        throttle: FeedThrottle,
        config: SyncConfig,
    }

    impl Device {
        fn new(seed: u8) -> Self {
            Device {
                identity: Identity::from_seed([seed; 32]),
                throttle: FeedThrottle::new(),
                config: SyncConfig::default(),
            }
        }

        fn writer<'a>(&'a self, storage: &'a MemoryStorage) -> FeedWriter<'a> {
            FeedWriter::new(storage, &self.identity, &self.throttle, &self.config)
        }
    }

    fn post(id: &str) -> Post {
        Post::new(PostId::new(id), id, 1_000)
    }

    fn share(log: PostCommandLog, ids: &[&str], source: &str) -> PostCommandLog {
        ids.iter().fold(log, |log, id| log.share_new_post(post(id), source))
    }

    fn ids(log: &PostCommandLog) -> Vec<String> {
        log.latest_posts(None).into_iter().map(|p| p.id.0).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_empty_logs_is_noop() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let topic = post_command_log_topic();

        let synced = sync_post_command_log_with_remote(&PostCommandLog::new(), &device.writer(&storage), &topic)
            .await
            .unwrap();
        assert!(synced.is_empty());
        assert_eq!(storage.feed_version_count(&device.writer(&storage).feed(&topic)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_local_log_uploads_everything() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let writer = device.writer(&storage);
        let topic = post_command_log_topic();

        let local = share(PostCommandLog::new(), &["p1", "p2", "p3"], "local");
        let synced = sync_post_command_log_with_remote(&local, &writer, &topic).await.unwrap();

        synced.check_invariants().unwrap();
        assert!(synced.unsynced_commands().is_empty());
        assert_eq!(ids(&synced), vec!["p3", "p2", "p1"]);

        // Chain: each command points at the one uploaded before it
        let commands = synced.commands();
        assert_eq!(commands[2].previous_epoch, None);
        assert_eq!(commands[1].previous_epoch, commands[2].epoch);
        assert_eq!(commands[0].previous_epoch, commands[1].epoch);

        let fetched = fetch_post_command_log(&storage, &writer.feed(&topic), &device.config).await;
        assert_eq!(fetched, synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploads_are_spaced_one_second_apart() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let writer = device.writer(&storage);

        let start = tokio::time::Instant::now();
        let local = share(PostCommandLog::new(), &["p1", "p2", "p3"], "local");
        sync_post_command_log_with_remote(&local, &writer, &post_command_log_topic())
            .await
            .unwrap();
        assert!(tokio::time::Instant::now() - start >= std::time::Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_is_unchanged() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let writer = device.writer(&storage);
        let topic = post_command_log_topic();

        let local = share(PostCommandLog::new(), &["p1", "p2"], "local");
        let synced = sync_post_command_log_with_remote(&local, &writer, &topic).await.unwrap();
        let versions = storage.feed_version_count(&writer.feed(&topic));

        let resynced = sync_post_command_log_with_remote(&synced, &writer, &topic).await.unwrap();
        assert_eq!(resynced, synced);
        assert_eq!(storage.feed_version_count(&writer.feed(&topic)), versions);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_empty_local_with_remote() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let writer = device.writer(&storage);
        let topic = post_command_log_topic();

        let remote = share(PostCommandLog::new(), &["p1", "p2"], "swarm");
        let stored = sync_post_command_log_with_remote(&remote, &writer, &topic).await.unwrap();

        let fresh = sync_post_command_log_with_remote(&PostCommandLog::new(), &writer, &topic)
            .await
            .unwrap();
        assert_eq!(fresh, stored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_devices_converge() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let writer = device.writer(&storage);
        let topic = post_command_log_topic();

        // Another device of the same identity already published two posts
        let other = share(PostCommandLog::new(), &["s1", "s2"], "swarm");
        sync_post_command_log_with_remote(&other, &writer, &topic).await.unwrap();

        let local = share(PostCommandLog::new(), &["l1"], "local");
        let remote = fetch_post_command_log(&storage, &writer.feed(&topic), &device.config).await;
        let merged = local.merge(&remote);
        assert_eq!(merged.merge(&local), merged);
        assert_eq!(merged.commands()[0].timestamp, 1);

        let synced = sync_post_command_log_with_remote(&local, &writer, &topic).await.unwrap();

        synced.check_invariants().unwrap();
        assert_eq!(ids(&synced), vec!["l1", "s2", "s1"]);
        assert_eq!(synced.commands()[0].timestamp, 3);
        assert_eq!(storage.feed_version_count(&writer.feed(&topic)), 3);

        let fetched = fetch_post_command_log(&storage, &writer.feed(&topic), &device.config).await;
        assert_eq!(fetched, synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_upload_keeps_valid_log() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let writer = device.writer(&storage);
        let topic = post_command_log_topic();

        storage.fail_feed_updates_after(2).unwrap();
        let local = share(PostCommandLog::new(), &["p1", "p2", "p3", "p4"], "local");
        let err = sync_post_command_log_with_remote(&local, &writer, &topic).await.unwrap_err();

        let partial = match err {
            SyncError::PartialUpload { log, source } => {
                assert!(matches!(source, StorageError::Unreachable));
                *log
            }
            other => panic!("unexpected error: {other:?}"),
        };
        partial.check_invariants().unwrap();
        assert_eq!(partial.unsynced_commands().len(), 2);
        assert_eq!(partial.synced_commands().len(), 2);
        assert_eq!(ids(&partial), vec!["p4", "p3", "p2", "p1"]);

        // Retry picks up where it stopped
        storage.clear_failures().unwrap();
        let synced = sync_post_command_log_with_remote(&partial, &writer, &topic).await.unwrap();
        synced.check_invariants().unwrap();
        assert!(synced.unsynced_commands().is_empty());
        assert_eq!(storage.feed_version_count(&writer.feed(&topic)), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_remote_degrades_to_empty() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let writer = device.writer(&storage);
        let topic = post_command_log_topic();

        let local = share(PostCommandLog::new(), &["p1"], "local");
        sync_post_command_log_with_remote(&local, &writer, &topic).await.unwrap();

        storage.set_unreachable(true);
        let fetched = fetch_post_command_log(&storage, &writer.feed(&topic), &device.config).await;
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_stops_on_epoch_cycle() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let feed = device.writer(&storage).feed(&post_command_log_topic());

        // Corrupt history: a command at epoch 10 claiming a predecessor at 20,
        // which in turn points back at 10.
        let log = share(PostCommandLog::new(), &["a", "b"], "local");
        let mut a = log.commands()[1].clone();
        let mut b = log.commands()[0].clone();
        a.epoch = Some(Epoch::new(20, 0));
        a.previous_epoch = Some(Epoch::new(30, 0));
        b.epoch = Some(Epoch::new(30, 0));
        b.previous_epoch = Some(Epoch::new(20, 0));
        for command in [&a, &b] {
            let bytes = serialization::serialize(command).unwrap().into_bytes();
            storage
                .put_feed_version_unchecked(feed, command.epoch.unwrap(), bytes)
                .unwrap();
        }

        let fetched = fetch_post_command_log(&storage, &feed, &SyncConfig::default()).await;
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_respects_chain_bound() {
        let storage = MemoryStorage::new();
        let device = Device::new(1);
        let feed = device.writer(&storage).feed(&post_command_log_topic());

        let log = share(PostCommandLog::new(), &["a", "b", "c", "d"], "local");
        let mut previous = None;
        for (i, command) in log.commands().iter().rev().enumerate() {
            let mut command = command.clone();
            command.epoch = Some(Epoch::new(100 + i as u64, 0));
            command.previous_epoch = previous;
            previous = command.epoch;
            let bytes = serialization::serialize(&command).unwrap().into_bytes();
            storage
                .put_feed_version_unchecked(feed, command.epoch.unwrap(), bytes)
                .unwrap();
        }

        let config = SyncConfig {
            max_command_chain_length: 2,
            ..SyncConfig::default()
        };
        let fetched = fetch_post_command_log(&storage, &feed, &config).await;
        assert_eq!(ids(&fetched), vec!["d", "c"]);
    }
}
