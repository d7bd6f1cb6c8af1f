//! Signed, paced feed writes.
//!
//! The substrate keys feed versions by epoch and assigns epochs from wall
//! time, so two updates of one feed less than
//! [`MIN_FEED_UPDATE_INTERVAL_MS`](crate::config::MIN_FEED_UPDATE_INTERVAL_MS)
//! apart can race for the same slot. [`FeedWriter`] waits out the interval
//! before every update of a feed it wrote before.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use super::{
    feed_update_digest, Epoch, FeedAddress, ProtocolStorage, Result, SignedFeedUpdate,
    StorageError,
};
use crate::config::SyncConfig;
use crate::crypto::ProtocolCrypto;
use crate::ids::{Address, Topic};
use crate::serialization::SerializationError;

/// Last update instant per feed, shared by every writer of one actor.
///
/// The lock is held across the wait and the update, so writes to feeds of
/// the same actor are serialized. Other actors own their own throttle.
#[derive(Debug, Default)]
pub struct FeedThrottle {
    last_update: Mutex<HashMap<FeedAddress, Instant>>,
}

impl FeedThrottle {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Storage handle bound to the identity that owns the feeds being written.
#[derive(Clone, Copy)]
pub struct FeedWriter<'a> {
    storage: &'a dyn ProtocolStorage,
    crypto: &'a dyn ProtocolCrypto,
    throttle: &'a FeedThrottle,
    config: &'a SyncConfig,
}

impl<'a> FeedWriter<'a> {
    pub fn new(
        storage: &'a dyn ProtocolStorage,
        crypto: &'a dyn ProtocolCrypto,
        throttle: &'a FeedThrottle,
        config: &'a SyncConfig,
    ) -> Self {
        FeedWriter {
            storage,
            crypto,
            throttle,
            config,
        }
    }

    pub fn storage(&self) -> &'a dyn ProtocolStorage {
        self.storage
    }

    pub fn crypto(&self) -> &'a dyn ProtocolCrypto {
        self.crypto
    }

    pub fn config(&self) -> &'a SyncConfig {
        self.config
    }

    pub fn owner(&self) -> Address {
        self.crypto.public_identity().address
    }

    pub fn feed(&self, topic: &Topic) -> FeedAddress {
        FeedAddress::new(self.owner(), *topic)
    }

    /// Write `data` as the next version of the owner's feed on `topic`.
    pub async fn update(&self, topic: &Topic, data: &[u8]) -> Result<Epoch> {
        self.update_with(topic, |_| Ok(data.to_vec())).await
    }

    /// Write the next version of a feed whose payload depends on the epoch
    /// it will be stored under.
    ///
    /// Waits until the minimum update interval has passed since the previous
    /// update of the same feed, downloads the feed template, builds the
    /// payload, signs it and hands it to storage.
    pub async fn update_with<F>(&self, topic: &Topic, build: F) -> Result<Epoch>
    where
        F: FnOnce(&Epoch) -> std::result::Result<Vec<u8>, SerializationError> + Send,
    {
        let feed = self.feed(topic);
        let mut last_update = self.throttle.last_update.lock().await;

        if let Some(previous) = last_update.get(&feed) {
            let ready_at = *previous + self.config.min_feed_update_interval();
            if Instant::now() < ready_at {
                log::debug!("Feed {:?}: waiting for update interval", feed.topic);
                sleep_until(ready_at).await;
            }
        }

        let result = self.write(&feed, build).await;
        last_update.insert(feed, Instant::now());
        result
    }

    async fn write<F>(&self, feed: &FeedAddress, build: F) -> Result<Epoch>
    where
        F: FnOnce(&Epoch) -> std::result::Result<Vec<u8>, SerializationError> + Send,
    {
        let template = self.storage.download_feed_template(feed).await?;
        let data = build(&template.epoch)?;

        let digest = feed_update_digest(feed, &template.epoch, &data);
        let signature = self
            .crypto
            .sign_digest(&digest)
            .map_err(|e| StorageError::Signing(e.to_string()))?;

        let update = SignedFeedUpdate {
            data,
            signer: self.crypto.public_identity().signing_key,
            signature,
        };
        self.storage.update_with_feed_template(&template, update).await?;

        log::debug!("Feed {:?}: wrote version {:?}", feed.topic, template.epoch);
        Ok(template.epoch)
    }
}
