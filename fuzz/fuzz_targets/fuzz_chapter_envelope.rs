#![no_main]
use libfuzzer_sys::fuzz_target;
use arbitrary::Arbitrary;

use feedsync::crypto::decrypt_message;
use feedsync::timeline::open_chapter;
use feedsync::{ChapterReference, CryptoError, Identity, PrivateChannelCommand, ProtocolCrypto, SyncConfig};

/// Fuzz chapter verification with arbitrary stored blobs.
///
/// Tests:
/// - Garbage under its own content hash is rejected, never panics
/// - Garbage under a mismatching reference is rejected
/// - Oversized blobs are rejected before decoding

#[derive(Arbitrary, Debug)]
struct ChapterInput {
    /// Blob bytes as stored
    blob: Vec<u8>,
    /// Reference to look the blob up under
    reference: [u8; 32],
    /// Channel key
    key: [u8; 32],
    /// Tight size bound instead of the default
    small_limit: bool,
}

fuzz_target!(|input: ChapterInput| {
    let author = Identity::from_seed([1; 32]);
    let mut config = SyncConfig::default();
    if input.small_limit {
        config.max_chapter_bytes = 64;
    }
    let key = input.key;
    let decrypt = move |ciphertext: &[u8]| -> Result<Vec<u8>, CryptoError> {
        Ok(decrypt_message(ciphertext, &key)?)
    };

    let own = ChapterReference::of(&input.blob);
    let opened = open_chapter::<PrivateChannelCommand, _>(
        &own,
        &input.blob,
        author.public_identity(),
        &decrypt,
        &config,
    );
    assert!(opened.is_err());

    let other = ChapterReference::from_bytes(input.reference);
    if other != own {
        let opened = open_chapter::<PrivateChannelCommand, _>(
            &other,
            &input.blob,
            author.public_identity(),
            &decrypt,
            &config,
        );
        assert!(opened.is_err());
    }
});
