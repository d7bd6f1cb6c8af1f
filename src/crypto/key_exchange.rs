use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Error, Debug)]
pub enum KeyExchangeError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Key agreement produced a low-order shared secret")]
    NonContributory,
}

pub type Result<T> = std::result::Result<T, KeyExchangeError>;

/// Generate a static X25519 keypair
///
/// # Returns
/// (public_key, secret_key) - Both as 32-byte arrays
pub fn generate_static_keypair() -> ([u8; 32], [u8; 32]) {
    generate_static_keypair_from_rng(&mut OsRng)
}

/// Generate a static X25519 keypair from a caller-supplied RNG
pub fn generate_static_keypair_from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(rng);
    let public = PublicKey::from(&secret);

    (public.to_bytes(), secret.to_bytes())
}

/// Derive shared secret using X25519
///
/// Both sides of a pair compute the same value:
/// `derive(a_priv, B_pub) == derive(b_priv, A_pub)`.
///
/// # Arguments
/// * `our_private_key` - Our 32-byte X25519 private key
/// * `their_public_key` - Their 32-byte X25519 public key
pub fn derive_shared_secret(our_private_key: &[u8], their_public_key: &[u8]) -> Result<[u8; 32]> {
    if our_private_key.len() != 32 || their_public_key.len() != 32 {
        return Err(KeyExchangeError::InvalidKeyLength);
    }

    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(our_private_key);
    let secret = StaticSecret::from(secret_bytes);

    let mut public_bytes = [0u8; 32];
    public_bytes.copy_from_slice(their_public_key);
    let public = PublicKey::from(public_bytes);

    let shared_secret = secret.diffie_hellman(&public);
    if !shared_secret.was_contributory() {
        return Err(KeyExchangeError::NonContributory);
    }

    Ok(shared_secret.to_bytes())
}

/// Derive public key from private key
pub fn derive_public_key(private_key: &[u8]) -> Result<[u8; 32]> {
    if private_key.len() != 32 {
        return Err(KeyExchangeError::InvalidKeyLength);
    }

    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(private_key);
    let secret = StaticSecret::from(secret_bytes);

    Ok(PublicKey::from(&secret).to_bytes())
}
