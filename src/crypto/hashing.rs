use crate::ids::Topic;

const PRIVATE_TOPIC_CONTEXT: &str = "feedsync 2024 private channel topic";

/// One-way derivation of a channel topic from its shared secret.
///
/// Both parties of a channel compute the same topic independently; without
/// the secret the topic cannot be guessed or linked to the pair.
pub fn calculate_private_topic(shared_secret: &[u8; 32]) -> Topic {
    Topic(blake3::derive_key(PRIVATE_TOPIC_CONTEXT, shared_secret))
}

/// BLAKE3 digest over the concatenation of `parts`, each length-prefixed.
///
/// Used as the message that gets Ed25519-signed.
pub fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}
