use crate::channel::{ChannelAddress, ChannelKind};
use thiserror::Error;

/// Rejection reasons for a proposed topology.
///
/// Validation is all-or-nothing: the first problem found rejects the whole
/// proposal and the previously active topology stays in force.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("duplicate instrument id `{0}`")]
    DuplicateId(String),

    #[error("channel {kind:?} at {address} claimed by both `{first}` and `{second}`")]
    ChannelCollision {
        kind: ChannelKind,
        address: ChannelAddress,
        first: String,
        second: String,
    },

    #[error("instrument `{id}`: `{role}` is not a channel role of a {kind} instrument")]
    UnknownChannelRole {
        id: String,
        kind: &'static str,
        role: String,
    },

    #[error("instrument `{id}`: channel role `{role}` expects {expected:?}, got {actual:?}")]
    ChannelKindMismatch {
        id: String,
        role: String,
        expected: ChannelKind,
        actual: ChannelKind,
    },

    #[error("instrument `{id}`: `{role}` is not a link role of a {kind} instrument")]
    UnknownLinkRole {
        id: String,
        kind: &'static str,
        role: String,
    },

    #[error("instrument `{id}`: invalid parameters: {reason}")]
    InvalidParameters { id: String, reason: String },

    #[error("instrument `{id}`: channel role `{role}`: {reason}")]
    BadChannelRecord {
        id: String,
        role: String,
        reason: String,
    },

    #[error("no instrument with id `{0}`")]
    UnknownInstrument(String),
}

/// A single failed backend access.
///
/// These never escape the channel bank; they are latched into fault records
/// while reads fall back to the last known value and writes are dropped
/// until the next tick retries them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    #[error("bus transaction failed: {0}")]
    Bus(String),

    #[error("backend timed out")]
    Timeout,

    #[error("no channel configured at {0}")]
    Unconfigured(ChannelAddress),
}
