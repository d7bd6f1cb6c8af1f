//! Timeline engine: append-only chapter chains over content-addressed storage.
//!
//! Every chapter is its own blob:
//!
//! ```text
//! ChapterEnvelope (bincode)
//!   ciphertext    = encrypt(CBOR(ChapterBody))
//!   author_pubkey = Ed25519 key of the author
//!   signature     = Ed25519 over BLAKE3("feedsync chapter" || ciphertext)
//! ```
//!
//! The body links to the previous chapter by reference and the author's feed
//! on the timeline topic holds the reference of the newest one. Readers walk
//! back from the feed head and stop at the newest chapter they already know,
//! so only new chapters are downloaded.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::config::{SyncConfig, PROTOCOL_VERSION};
use crate::crypto::{digest, verify_digest, CryptoError, PublicIdentity};
use crate::ids::{Address, ChapterReference, Topic};
use crate::serialization::{self, SerializationError};
use crate::storage::{FeedAddress, FeedWriter, ProtocolStorage, StorageError};

const CHAPTER_SIGNATURE_CONTEXT: &[u8] = b"feedsync chapter";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("chapter {0:?} has an invalid signature")]
    InvalidSignature(ChapterReference),

    #[error("chapter {0:?} was not written by the expected author")]
    AuthorMismatch(ChapterReference),

    #[error("chapter {0:?} does not match its content hash")]
    HashMismatch(ChapterReference),

    #[error("chapter {reference:?} is {size} bytes")]
    TooLarge {
        reference: ChapterReference,
        size: usize,
    },

    #[error("feed head is {0} bytes, expected a chapter reference")]
    MalformedHead(usize),

    #[error("timeline longer than {0} chapters")]
    ChainTooLong(usize),
}

pub type Result<T> = std::result::Result<T, TimelineError>;

// ---------------------------------------------------------------------------
// Chapters
// ---------------------------------------------------------------------------

/// A chapter that has not been uploaded yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialChapter<T> {
    pub author: Address,
    /// Wall-clock milliseconds.
    pub timestamp: i64,
    pub content: T,
}

pub fn make_partial_chapter<T>(author: Address, content: T) -> PartialChapter<T> {
    PartialChapter {
        author,
        timestamp: chrono::Utc::now().timestamp_millis(),
        content,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chapter<T> {
    pub id: ChapterReference,
    pub author: Address,
    pub timestamp: i64,
    pub content: T,
    pub previous_chapter: Option<ChapterReference>,
}

/// Chapters newest first.
pub type Timeline<T> = Vec<Chapter<T>>;

#[derive(Serialize, Deserialize)]
struct ChapterBody<T> {
    protocol_version: u32,
    author: Address,
    timestamp: i64,
    content: T,
    previous_chapter: Option<ChapterReference>,
}

#[derive(Serialize, Deserialize)]
struct ChapterEnvelope {
    ciphertext: Vec<u8>,
    author_pubkey: [u8; 32],
    #[serde(with = "BigArray")]
    signature: [u8; 64],
}

fn envelope_digest(ciphertext: &[u8]) -> [u8; 32] {
    digest(&[CHAPTER_SIGNATURE_CONTEXT, ciphertext])
}

/// Reference of the newest chapter, the new high-water mark after a sync.
pub fn get_newest_chapter_id<T>(timeline: &[Chapter<T>]) -> Option<ChapterReference> {
    timeline.first().map(|chapter| chapter.id)
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Upload `chapters` (oldest first) after `last_reference`, then point the
/// writer's feed on `topic` at the newest one.
///
/// Each chapter is encrypted with `encrypt` and signed by the writer's
/// identity. Returns the uploaded chapters newest first; an empty input
/// uploads nothing.
pub async fn upload_timeline<T, E>(
    chapters: Vec<PartialChapter<T>>,
    writer: &FeedWriter<'_>,
    topic: &Topic,
    encrypt: E,
    last_reference: Option<ChapterReference>,
) -> Result<Timeline<T>>
where
    T: Serialize,
    E: Fn(&[u8]) -> std::result::Result<Vec<u8>, CryptoError>,
{
    if chapters.is_empty() {
        return Ok(Vec::new());
    }

    let crypto = writer.crypto();
    let author_pubkey = crypto.public_identity().signing_key;
    let mut previous = last_reference;
    let mut uploaded = Vec::with_capacity(chapters.len());

    for chapter in chapters {
        let body = ChapterBody {
            protocol_version: PROTOCOL_VERSION,
            author: chapter.author,
            timestamp: chapter.timestamp,
            content: chapter.content,
            previous_chapter: previous,
        };
        let ciphertext = encrypt(&serialization::cbor_encode(&body)?)?;
        let signature = crypto.sign_digest(&envelope_digest(&ciphertext))?;
        let bytes = serialization::to_bytes(&ChapterEnvelope {
            ciphertext,
            author_pubkey,
            signature,
        })?;
        if bytes.len() > writer.config().max_chapter_bytes {
            return Err(TimelineError::TooLarge {
                reference: ChapterReference::of(&bytes),
                size: bytes.len(),
            });
        }

        let id = writer.storage().upload(&bytes).await?;
        log::debug!("Uploaded chapter {:?} on {:?}", id, topic);

        uploaded.push(Chapter {
            id,
            author: body.author,
            timestamp: body.timestamp,
            content: body.content,
            previous_chapter: body.previous_chapter,
        });
        previous = Some(id);
    }

    if let Some(head) = previous {
        writer.update(topic, head.as_bytes()).await?;
    }
    uploaded.reverse();
    Ok(uploaded)
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// Verify and decrypt one stored chapter.
///
/// Checks, in order: size bound, content hash, envelope author, signature,
/// then decrypts and checks the author recorded inside the body.
pub fn open_chapter<T, D>(
    reference: &ChapterReference,
    bytes: &[u8],
    author: &PublicIdentity,
    decrypt: &D,
    config: &SyncConfig,
) -> Result<Chapter<T>>
where
    T: DeserializeOwned,
    D: Fn(&[u8]) -> std::result::Result<Vec<u8>, CryptoError>,
{
    if bytes.len() > config.max_chapter_bytes {
        return Err(TimelineError::TooLarge {
            reference: *reference,
            size: bytes.len(),
        });
    }
    if ChapterReference::of(bytes) != *reference {
        return Err(TimelineError::HashMismatch(*reference));
    }

    let envelope: ChapterEnvelope = serialization::from_bytes(bytes)?;
    if envelope.author_pubkey != author.signing_key {
        return Err(TimelineError::AuthorMismatch(*reference));
    }
    if !verify_digest(
        &envelope.author_pubkey,
        &envelope_digest(&envelope.ciphertext),
        &envelope.signature,
    ) {
        return Err(TimelineError::InvalidSignature(*reference));
    }

    let body: ChapterBody<T> = serialization::cbor_decode(&decrypt(&envelope.ciphertext)?)?;
    if body.author != author.address {
        return Err(TimelineError::AuthorMismatch(*reference));
    }

    Ok(Chapter {
        id: *reference,
        author: body.author,
        timestamp: body.timestamp,
        content: body.content,
        previous_chapter: body.previous_chapter,
    })
}

/// Walk back from `head` until `since` (exclusive) or the first chapter.
pub async fn read_timeline<T, D>(
    storage: &dyn ProtocolStorage,
    head: ChapterReference,
    author: &PublicIdentity,
    decrypt: D,
    since: Option<ChapterReference>,
    config: &SyncConfig,
) -> Result<Timeline<T>>
where
    T: DeserializeOwned,
    D: Fn(&[u8]) -> std::result::Result<Vec<u8>, CryptoError>,
{
    let mut timeline = Vec::new();
    let mut next = Some(head);

    while let Some(reference) = next {
        if Some(reference) == since {
            break;
        }
        if timeline.len() >= config.max_chapters_per_fetch {
            return Err(TimelineError::ChainTooLong(config.max_chapters_per_fetch));
        }
        let bytes = storage.download(&reference).await?;
        let chapter: Chapter<T> = open_chapter(&reference, &bytes, author, &decrypt, config)?;
        next = chapter.previous_chapter;
        timeline.push(chapter);
    }

    log::debug!("Read {} chapters by {:?}", timeline.len(), author.address);
    Ok(timeline)
}

/// Chapters `author` published on `topic` after `since`.
pub async fn fetch_timeline<T, D>(
    storage: &dyn ProtocolStorage,
    author: &PublicIdentity,
    topic: &Topic,
    decrypt: D,
    since: Option<ChapterReference>,
    config: &SyncConfig,
) -> Result<Timeline<T>>
where
    T: DeserializeOwned,
    D: Fn(&[u8]) -> std::result::Result<Vec<u8>, CryptoError>,
{
    let feed = FeedAddress::new(author.address, *topic);
    let Some(head) = storage.download_feed(&feed).await? else {
        return Ok(Vec::new());
    };
    let head = <[u8; 32]>::try_from(head.as_slice())
        .map(ChapterReference::from_bytes)
        .map_err(|_| TimelineError::MalformedHead(head.len()))?;
    read_timeline(storage, head, author, decrypt, since, config).await
}
