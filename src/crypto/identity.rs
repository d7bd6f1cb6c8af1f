//! Actor identity and the crypto collaborator interface.
//!
//! An actor holds two static keys: Ed25519 for signing feed updates and
//! chapters, X25519 for pairwise key agreement. The sync engines never touch
//! raw key bytes; they go through [`ProtocolCrypto`].

use std::fmt;

use rand::RngCore;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::encryption::{self, EncryptionError};
use super::key_exchange::{self, KeyExchangeError};
use super::signing::{self, SigningError};
use crate::ids::Address;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("key exchange: {0}")]
    KeyExchange(#[from] KeyExchangeError),
    #[error("signing: {0}")]
    Signing(#[from] SigningError),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// 32-byte symmetric secret (pairwise channel key or group secret).
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SharedSecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fresh random secret, e.g. for a new group.
    pub fn random() -> Self {
        SharedSecret(encryption::generate_key())
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// PublicIdentity
// ---------------------------------------------------------------------------

/// What peers know about an actor: its address and both public keys.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub address: Address,
    pub signing_key: [u8; 32],
    pub agreement_key: [u8; 32],
}

impl PublicIdentity {
    pub fn new(signing_key: [u8; 32], agreement_key: [u8; 32]) -> Self {
        PublicIdentity {
            address: Address::from_pubkey(&signing_key),
            signing_key,
            agreement_key,
        }
    }

    /// Address matches the signing key it claims to be derived from.
    pub fn is_consistent(&self) -> bool {
        Address::from_pubkey(&self.signing_key) == self.address
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({:?})", self.address)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Local actor keys. Secret halves are wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    signing_secret: [u8; 32],
    agreement_secret: [u8; 32],
    #[zeroize(skip)]
    public: PublicIdentity,
}

impl Identity {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        let (signing_public, signing_secret) = signing::generate_keypair();
        let (agreement_public, agreement_secret) = key_exchange::generate_static_keypair();
        Identity {
            signing_secret,
            agreement_secret,
            public: PublicIdentity::new(signing_public, agreement_public),
        }
    }

    /// Deterministic identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let mut rng = ChaCha20Rng::from_seed(seed);
        let (signing_public, signing_secret) = signing::generate_keypair_from_rng(&mut rng);
        let (agreement_public, agreement_secret) =
            key_exchange::generate_static_keypair_from_rng(&mut rng);
        Identity {
            signing_secret,
            agreement_secret,
            public: PublicIdentity::new(signing_public, agreement_public),
        }
    }

    pub fn address(&self) -> Address {
        self.public.address
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:?})", self.public.address)
    }
}

// ---------------------------------------------------------------------------
// ProtocolCrypto
// ---------------------------------------------------------------------------

/// Crypto operations the sync engines depend on.
///
/// Implemented by [`Identity`]; hosts that keep keys in a secure enclave can
/// provide their own implementation.
pub trait ProtocolCrypto: Send + Sync {
    fn public_identity(&self) -> &PublicIdentity;

    /// Pairwise secret with the owner of `peer_agreement_key`.
    fn derive_shared_key(&self, peer_agreement_key: &[u8; 32]) -> Result<SharedSecret>;

    fn encrypt(&self, plaintext: &[u8], key: &SharedSecret, nonce: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8], key: &SharedSecret) -> Result<Vec<u8>>;

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; 64]>;

    fn random(&self, n: usize) -> Vec<u8>;
}

impl ProtocolCrypto for Identity {
    fn public_identity(&self) -> &PublicIdentity {
        &self.public
    }

    fn derive_shared_key(&self, peer_agreement_key: &[u8; 32]) -> Result<SharedSecret> {
        let secret = key_exchange::derive_shared_secret(&self.agreement_secret, peer_agreement_key)?;
        Ok(SharedSecret(secret))
    }

    fn encrypt(&self, plaintext: &[u8], key: &SharedSecret, nonce: &[u8]) -> Result<Vec<u8>> {
        Ok(encryption::encrypt_with_nonce(plaintext, key.as_bytes(), nonce)?)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &SharedSecret) -> Result<Vec<u8>> {
        Ok(encryption::decrypt_message(ciphertext, key.as_bytes())?)
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; 64]> {
        Ok(signing::sign_data(digest, &self.signing_secret)?)
    }

    fn random(&self, n: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; n];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes
    }
}

/// Verify a signature produced by [`ProtocolCrypto::sign_digest`].
pub fn verify_digest(signing_key: &[u8; 32], digest: &[u8; 32], signature: &[u8; 64]) -> bool {
    signing::verify_signature(digest, signature, signing_key).unwrap_or(false)
}
