/// Protocol constants and sync guardrails.
///
/// These bound chain walks and pace feed updates so a corrupt or malicious
/// storage node cannot make a sync round run forever.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version stamped on every post command and private channel command.
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum spacing between two updates of the same feed.
pub const MIN_FEED_UPDATE_INTERVAL_MS: u64 = 1_000;

/// Max commands followed along a `previous_epoch` chain in one fetch.
pub const MAX_COMMAND_CHAIN_LENGTH: usize = 100_000;

/// Max chapters followed backwards in one timeline fetch.
pub const MAX_CHAPTERS_PER_FETCH: usize = 10_000;

/// Max size of one encoded chapter envelope.
pub const MAX_CHAPTER_BYTES: usize = 256 * 1024; // 256 KB

/// Tunables for a sync session. Defaults come from the constants above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub min_feed_update_interval_ms: u64,
    pub max_command_chain_length: usize,
    pub max_chapters_per_fetch: usize,
    pub max_chapter_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            min_feed_update_interval_ms: MIN_FEED_UPDATE_INTERVAL_MS,
            max_command_chain_length: MAX_COMMAND_CHAIN_LENGTH,
            max_chapters_per_fetch: MAX_CHAPTERS_PER_FETCH,
            max_chapter_bytes: MAX_CHAPTER_BYTES,
        }
    }
}

impl SyncConfig {
    /// Parse a config from JSON. Missing fields fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn min_feed_update_interval(&self) -> Duration {
        Duration::from_millis(self.min_feed_update_interval_ms)
    }
}
