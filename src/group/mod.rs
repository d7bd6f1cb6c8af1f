/// Group protocol: membership by invite and introduction, and group posts
/// exchanged over per-pair private channels.
///
/// A group is a `(topic, shared secret)` pair. Members never talk on a shared
/// feed; every pair of members runs its own channel keyed from their agreed
/// secret and the group secret. Membership spreads by introduction: whoever
/// learns of a new member tells the other members it knows, so the peer sets
/// of all members converge after a few sync rounds.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::ids::{Address, PostId, Topic};

pub mod actor;
pub mod context;
pub mod invite;

pub use actor::Actor;
pub use context::{GroupContext, GroupPeer, GroupPost};
pub use invite::GroupInvite;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum GroupError {
    #[error("{0:?} is not a mutual contact")]
    NotAMutualContact(Address),

    #[error("identity of {0:?} does not match its signing key")]
    InvalidContact(Address),

    #[error("group {0:?} already exists")]
    GroupExists(Topic),

    #[error("unknown group {0:?}")]
    UnknownGroup(Topic),

    #[error("{0:?} is already a peer")]
    AlreadyPeer(Address),

    #[error("cannot invite yourself")]
    SelfInvite,

    #[error("invite from {from:?} names {inviter:?} as inviter")]
    InviterMismatch { from: Address, inviter: Address },

    #[error("post {0} was shared by another peer")]
    NotPostAuthor(PostId),

    #[error("no pending invite from {0:?}")]
    NoPendingInvite(Address),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, GroupError>;
