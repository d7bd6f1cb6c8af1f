use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid nonce length")]
    InvalidNonceLength,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Encrypt with a caller-supplied nonce using XChaCha20-Poly1305
///
/// # Arguments
/// * `plaintext` - The chapter or command bytes to encrypt
/// * `key` - 32-byte channel key
/// * `nonce` - 24-byte nonce, must never repeat for the same key
///
/// # Returns
/// Self-contained ciphertext: nonce (24 bytes) || ciphertext || tag
pub fn encrypt_with_nonce(plaintext: &[u8], key: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        return Err(EncryptionError::InvalidKeyLength);
    }
    if nonce.len() != NONCE_LEN {
        return Err(EncryptionError::InvalidNonceLength);
    }

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| EncryptionError::InvalidKeyLength)?;

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Encrypt a message with a fresh random nonce
pub fn encrypt_message(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    encrypt_with_nonce(plaintext, key, &nonce_bytes)
}

/// Decrypt a message using XChaCha20-Poly1305
///
/// # Arguments
/// * `encrypted_data` - Encrypted message with prepended nonce (24 bytes + ciphertext)
/// * `key` - 32-byte channel key
///
/// # Returns
/// Decrypted plaintext
pub fn decrypt_message(encrypted_data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        return Err(EncryptionError::InvalidKeyLength);
    }

    // Validate minimum length (nonce + tag)
    if encrypted_data.len() < NONCE_LEN + TAG_LEN {
        return Err(EncryptionError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = encrypted_data.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| EncryptionError::InvalidKeyLength)?;

    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Generate a random 32-byte key
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Derive a 32-byte channel key using HKDF-SHA256
///
/// # Arguments
/// * `input_key` - 32-byte X25519 shared secret
/// * `salt` - Optional salt (e.g. a group secret binding the key to one group)
/// * `info` - Context label
pub fn derive_channel_key(input_key: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; 32]> {
    if input_key.len() != 32 {
        return Err(EncryptionError::InvalidKeyLength);
    }

    let hkdf = Hkdf::<Sha256>::new(salt, input_key);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|_| EncryptionError::KeyDerivationFailed)?;

    Ok(key)
}
