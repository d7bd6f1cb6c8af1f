//! Storage collaborator interface.
//!
//! The substrate is untrusted and content-addressed: blobs are stored and
//! fetched by hash, and each `(owner, topic)` pair names an append-only feed
//! whose versions are keyed by an [`Epoch`]. The protocol only depends on
//! [`ProtocolStorage`]; [`MemoryStorage`] is the in-process implementation.

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::crypto::hashing;
use crate::ids::{Address, ChapterReference, Topic};
use crate::serialization::SerializationError;

pub mod feed;
pub mod memory;

pub use feed::{FeedThrottle, FeedWriter};
pub use memory::MemoryStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage unreachable")]
    Unreachable,
    #[error("update rejected: {0}")]
    Rejected(String),
    #[error("invalid feed update signature")]
    InvalidSignature,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Epoch
// ---------------------------------------------------------------------------

/// Storage-assigned feed version `(time, level)`.
///
/// Total order: `time` first, then `level`. A command carrying an epoch has
/// been durably written to its feed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    pub time: u64,
    pub level: u8,
}

impl Epoch {
    pub fn new(time: u64, level: u8) -> Self {
        Epoch { time, level }
    }

    fn to_bytes(self) -> [u8; 9] {
        let mut out = [0u8; 9];
        out[..8].copy_from_slice(&self.time.to_be_bytes());
        out[8] = self.level;
        out
    }
}

impl Ord for Epoch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.level.cmp(&other.level))
    }
}

impl PartialOrd for Epoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({}/{})", self.time, self.level)
    }
}

/// Compare optional epochs where an absent epoch is the greatest value.
///
/// Unsynced commands have no epoch yet and are always newer than anything
/// already written to storage.
pub fn epoch_compare(a: Option<&Epoch>, b: Option<&Epoch>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

/// Feed location: owner address + topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct FeedAddress {
    pub owner: Address,
    pub topic: Topic,
}

impl FeedAddress {
    pub fn new(owner: Address, topic: Topic) -> Self {
        FeedAddress { owner, topic }
    }
}

/// Metadata required for the next update of a feed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FeedTemplate {
    pub feed: FeedAddress,
    /// Epoch the next update will be stored under.
    pub epoch: Epoch,
}

/// Feed payload plus the owner's signature over [`feed_update_digest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedFeedUpdate {
    pub data: Vec<u8>,
    pub signer: [u8; 32],
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

/// Digest signed by the feed owner for one update.
pub fn feed_update_digest(feed: &FeedAddress, epoch: &Epoch, data: &[u8]) -> [u8; 32] {
    hashing::digest(&[
        b"feedsync feed update",
        feed.owner.as_bytes(),
        feed.topic.as_bytes(),
        &epoch.to_bytes(),
        data,
    ])
}

// ---------------------------------------------------------------------------
// ProtocolStorage
// ---------------------------------------------------------------------------

/// Content-addressed blob store with epoch-versioned feeds.
#[async_trait]
pub trait ProtocolStorage: Send + Sync {
    /// Store a blob, returning its content hash.
    async fn upload(&self, data: &[u8]) -> Result<ChapterReference>;

    async fn download(&self, reference: &ChapterReference) -> Result<Vec<u8>>;

    async fn download_feed_template(&self, feed: &FeedAddress) -> Result<FeedTemplate>;

    /// Write the next version of a feed. Rejected unless signed by the owner
    /// and `template.epoch` is newer than every stored version.
    async fn update_with_feed_template(
        &self,
        template: &FeedTemplate,
        update: SignedFeedUpdate,
    ) -> Result<()>;

    /// Latest version, `None` if the feed was never written.
    async fn download_feed(&self, feed: &FeedAddress) -> Result<Option<Vec<u8>>>;

    /// Version stored at exactly `epoch`.
    async fn download_previous_version(&self, feed: &FeedAddress, epoch: &Epoch) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_order_time_then_level() {
        assert!(Epoch::new(1, 5) < Epoch::new(2, 0));
        assert!(Epoch::new(2, 0) < Epoch::new(2, 1));
        assert_eq!(Epoch::new(3, 3).cmp(&Epoch::new(3, 3)), Ordering::Equal);
    }

    #[test]
    fn test_epoch_compare_absent_is_greatest() {
        let e = Epoch::new(10, 0);
        assert_eq!(epoch_compare(None, None), Ordering::Equal);
        assert_eq!(epoch_compare(None, Some(&e)), Ordering::Greater);
        assert_eq!(epoch_compare(Some(&e), None), Ordering::Less);
        assert_eq!(epoch_compare(Some(&Epoch::new(9, 9)), Some(&e)), Ordering::Less);
    }

    #[test]
    fn test_feed_update_digest_binds_all_fields() {
        let feed = FeedAddress::new(Address::from_bytes([1; 20]), Topic::from_bytes([2; 32]));
        let other = FeedAddress::new(Address::from_bytes([1; 20]), Topic::from_bytes([3; 32]));
        let e = Epoch::new(1, 0);

        let base = feed_update_digest(&feed, &e, b"data");
        assert_ne!(base, feed_update_digest(&other, &e, b"data"));
        assert_ne!(base, feed_update_digest(&feed, &Epoch::new(1, 1), b"data"));
        assert_ne!(base, feed_update_digest(&feed, &e, b"datb"));
    }
}
