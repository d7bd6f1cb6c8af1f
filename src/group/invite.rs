use serde::{Deserialize, Serialize};

use crate::crypto::{PublicIdentity, SharedSecret};
use crate::ids::Topic;

/// Everything needed to join a group, sent over the contact channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvite {
    pub topic: Topic,
    pub shared_secret: SharedSecret,
    pub inviter: PublicIdentity,
    /// Inviter's peers at the time of the invite, in their order.
    pub peers: Vec<PublicIdentity>,
}
