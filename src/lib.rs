//! # Feedsync
//!
//! **Eventually-consistent social data over content-addressed storage.**
//!
//! Every actor owns signed, append-only feeds on a shared storage substrate.
//! Feedsync keeps local state and those feeds in agreement:
//!
//! - **Public post logs**: a chain of Update/Remove commands per actor,
//!   merged with the remote copy and uploaded incrementally
//! - **Timelines**: hash-chained, encrypted and signed chapters
//! - **Private channels**: two timelines per pair of actors, keyed from
//!   their X25519 agreement
//! - **Groups**: membership by invite and introduction, posts carried over
//!   per-pair channels, ownership enforced by the receiver
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use feedsync::{Actor, Identity, MemoryStorage, Post, SyncConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(MemoryStorage::new());
//! let mut alice = Actor::new(Identity::generate(), storage.clone(), SyncConfig::default());
//!
//! alice.share_public_post(Post::with_text("hello"));
//! alice.sync_public_log().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`crypto`] | Identities, encryption, signing, key agreement, topic derivation |
//! | [`storage`] | Storage collaborator trait, epochs, throttled feed writer, in-memory backend |
//! | [`social`] | Post command log: ordering, merge, fetch, upload, sync |
//! | [`timeline`] | Encrypted, signed chapter chains |
//! | [`private_channel`] | Pairwise command channels over two timelines |
//! | [`contact`] | Mutual contacts: private posts and group invites |
//! | [`group`] | Group membership, posts and the local [`Actor`] |

// Crate-level lint configuration: stylistic lints only.
#![allow(clippy::too_many_arguments, clippy::type_complexity)]

// ── Public modules ──────────────────────────────────────────────────────────

/// Identifier types: addresses, topics, chapter references, post ids.
pub mod ids;

/// Protocol constants and the runtime [`SyncConfig`](config::SyncConfig).
pub mod config;

/// JSON, CBOR and bincode helpers with a shared error type.
pub mod serialization;

/// Cryptographic primitives and the [`ProtocolCrypto`](crypto::ProtocolCrypto)
/// collaborator.
pub mod crypto;

/// Storage contract, feed epochs and the in-memory backend.
pub mod storage;

/// Posts and the public post command log.
pub mod social;

/// Encrypted, hash-chained chapter timelines.
pub mod timeline;

/// Pairwise command channels.
pub mod private_channel;

/// Mutual contacts.
pub mod contact;

/// Group protocol and the local actor.
pub mod group;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use config::SyncConfig;

pub use crypto::{CryptoError, Identity, ProtocolCrypto, PublicIdentity, SharedSecret};

pub use ids::{Address, ChapterReference, PostId, Topic};

pub use storage::{Epoch, FeedAddress, FeedWriter, MemoryStorage, ProtocolStorage, StorageError};

pub use social::{LogError, Post, PostCommand, PostCommandLog, PostCommandType, SyncError};

pub use timeline::{Chapter, Timeline, TimelineError};

pub use private_channel::{PrivateChannel, PrivateChannelCommand, PrivateChannelSyncData};

pub use contact::MutualContact;

pub use group::{Actor, GroupContext, GroupError, GroupInvite};

// ── Library metadata ────────────────────────────────────────────────────────

/// Feedsync version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────
