/// Core identity types shared by every layer of the sync protocol.
///
/// - `Address`: 20-byte actor identity derived from the Ed25519 public key
/// - `Topic`: 32-byte feed topic (public log, private channel, group)
/// - `ChapterReference`: 32-byte content hash of a stored chapter
/// - `PostId`: application-level post identifier

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! fixed_bytes_id {
    ($name:ident, $len:expr, $short:expr) => {
        impl $name {
            /// Create from raw bytes.
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }

            /// Return the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Hex-encode for display/storage.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Decode from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != $len {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut id = [0u8; $len];
                id.copy_from_slice(&bytes);
                Ok($name(id))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0.cmp(&other.0)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}..)", stringify!($name), &self.to_hex()[..$short])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Actor address: BLAKE3(Ed25519 public key)[0..20].
///
/// Every feed is owned by an address; storage only accepts feed updates
/// signed by the key that hashes to the owner address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Derive an address from an Ed25519 public key.
    pub fn from_pubkey(pubkey: &[u8; 32]) -> Self {
        let hash = blake3::hash(pubkey);
        let mut id = [0u8; 20];
        id.copy_from_slice(&hash.as_bytes()[..20]);
        Address(id)
    }
}

fixed_bytes_id!(Address, 20, 8);

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Feed topic. Together with an owner address it names one feed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(pub [u8; 32]);

impl Topic {
    /// Well-known topic derived from a human-readable label,
    /// e.g. the public post log of an actor.
    pub fn from_label(label: &str) -> Self {
        Topic(blake3::derive_key("feedsync 2024 topic label", label.as_bytes()))
    }
}

fixed_bytes_id!(Topic, 32, 12);

// ---------------------------------------------------------------------------
// ChapterReference
// ---------------------------------------------------------------------------

/// Content hash of a blob in content-addressed storage: BLAKE3(blob).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterReference(pub [u8; 32]);

impl ChapterReference {
    /// Reference of the given stored bytes.
    pub fn of(data: &[u8]) -> Self {
        ChapterReference(*blake3::hash(data).as_bytes())
    }
}

fixed_bytes_id!(ChapterReference, 32, 12);

// ---------------------------------------------------------------------------
// PostId
// ---------------------------------------------------------------------------

/// Application-level post identifier. Opaque to the protocol, compared
/// by value only.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostId(pub String);

impl PostId {
    pub fn new(id: impl Into<String>) -> Self {
        PostId(id.into())
    }

    /// Fresh random identifier (UUID v4).
    pub fn random() -> Self {
        PostId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PostId({})", self.0)
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
