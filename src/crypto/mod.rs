//! Cryptographic primitives for feeds, chapters and private channels.
//!
//! - [`encryption`]: XChaCha20-Poly1305 with a per-message 24-byte nonce, HKDF-SHA256
//! - [`key_exchange`]: static X25519 key agreement
//! - [`signing`]: Ed25519 signatures (always over a BLAKE3 digest)
//! - [`hashing`]: topic derivation and signing digests
//! - [`identity`]: actor keys and the [`ProtocolCrypto`] collaborator trait

pub mod encryption;
pub mod hashing;
pub mod identity;
pub mod key_exchange;
pub mod signing;

pub use encryption::{decrypt_message, derive_channel_key, encrypt_message, encrypt_with_nonce, NONCE_LEN};
pub use hashing::{calculate_private_topic, digest};
pub use identity::{verify_digest, CryptoError, Identity, ProtocolCrypto, PublicIdentity, SharedSecret};
