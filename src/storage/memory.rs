//! In-process storage backend.
//!
//! Behaves like the remote substrate: blobs are content-addressed, feed
//! updates must be signed by the feed owner and land on a strictly newer
//! epoch. Used by tests and by hosts that sync several actors in one
//! process. Failure injection lets tests exercise the degraded paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    feed_update_digest, Epoch, FeedAddress, FeedTemplate, ProtocolStorage, Result,
    SignedFeedUpdate, StorageError,
};
use crate::crypto::verify_digest;
use crate::ids::{Address, ChapterReference};

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<ChapterReference, Vec<u8>>,
    feeds: HashMap<FeedAddress, BTreeMap<Epoch, Vec<u8>>>,
    /// Feed updates still accepted before every further update fails.
    remaining_feed_updates: Option<usize>,
}

#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    unreachable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails with [`StorageError::Unreachable`] while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Accept `n` more feed updates, then fail the rest as unreachable.
    pub fn fail_feed_updates_after(&self, n: usize) -> Result<()> {
        self.lock()?.remaining_feed_updates = Some(n);
        Ok(())
    }

    /// Lift a limit set by [`fail_feed_updates_after`](Self::fail_feed_updates_after).
    pub fn clear_failures(&self) -> Result<()> {
        self.lock()?.remaining_feed_updates = None;
        self.set_unreachable(false);
        Ok(())
    }

    /// Store a feed version without signature or ordering checks.
    ///
    /// Simulates a corrupt or malicious storage node.
    pub fn put_feed_version_unchecked(&self, feed: FeedAddress, epoch: Epoch, data: Vec<u8>) -> Result<()> {
        self.lock()?.feeds.entry(feed).or_default().insert(epoch, data);
        Ok(())
    }

    pub fn feed_version_count(&self, feed: &FeedAddress) -> usize {
        self.lock()
            .map(|state| state.feeds.get(feed).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn blob_count(&self) -> usize {
        self.lock().map(|state| state.blobs.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Rejected("storage state poisoned".into()))
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StorageError::Unreachable);
        }
        Ok(())
    }
}

/// Next epoch after `latest`: current second, or a higher level within the
/// same second.
fn next_epoch(latest: Option<&Epoch>, now: u64) -> Epoch {
    match latest {
        None => Epoch::new(now, 0),
        Some(latest) if now > latest.time => Epoch::new(now, 0),
        Some(latest) if latest.level == u8::MAX => Epoch::new(latest.time + 1, 0),
        Some(latest) => Epoch::new(latest.time, latest.level + 1),
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[async_trait]
impl ProtocolStorage for MemoryStorage {
    async fn upload(&self, data: &[u8]) -> Result<ChapterReference> {
        self.check_reachable()?;
        let reference = ChapterReference::of(data);
        self.lock()?.blobs.insert(reference, data.to_vec());
        Ok(reference)
    }

    async fn download(&self, reference: &ChapterReference) -> Result<Vec<u8>> {
        self.check_reachable()?;
        self.lock()?
            .blobs
            .get(reference)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(reference.to_hex()))
    }

    async fn download_feed_template(&self, feed: &FeedAddress) -> Result<FeedTemplate> {
        self.check_reachable()?;
        let state = self.lock()?;
        let latest = state.feeds.get(feed).and_then(|versions| versions.keys().next_back());
        Ok(FeedTemplate {
            feed: *feed,
            epoch: next_epoch(latest, now_secs()),
        })
    }

    async fn update_with_feed_template(
        &self,
        template: &FeedTemplate,
        update: SignedFeedUpdate,
    ) -> Result<()> {
        self.check_reachable()?;
        let feed = &template.feed;

        if Address::from_pubkey(&update.signer) != feed.owner {
            return Err(StorageError::Rejected("signer does not own feed".into()));
        }
        let digest = feed_update_digest(feed, &template.epoch, &update.data);
        if !verify_digest(&update.signer, &digest, &update.signature) {
            return Err(StorageError::InvalidSignature);
        }

        let mut state = self.lock()?;
        if let Some(remaining) = state.remaining_feed_updates.as_mut() {
            if *remaining == 0 {
                return Err(StorageError::Unreachable);
            }
            *remaining -= 1;
        }

        let versions = state.feeds.entry(*feed).or_default();
        if let Some(latest) = versions.keys().next_back() {
            if template.epoch <= *latest {
                return Err(StorageError::Rejected(format!(
                    "stale template {:?}, feed is at {:?}",
                    template.epoch, latest
                )));
            }
        }
        versions.insert(template.epoch, update.data);
        Ok(())
    }

    async fn download_feed(&self, feed: &FeedAddress) -> Result<Option<Vec<u8>>> {
        self.check_reachable()?;
        Ok(self
            .lock()?
            .feeds
            .get(feed)
            .and_then(|versions| versions.values().next_back())
            .cloned())
    }

    async fn download_previous_version(&self, feed: &FeedAddress, epoch: &Epoch) -> Result<Vec<u8>> {
        self.check_reachable()?;
        self.lock()?
            .feeds
            .get(feed)
            .and_then(|versions| versions.get(epoch))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{:?} at {:?}", feed.topic, epoch)))
    }
}
