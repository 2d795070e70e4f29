//! Error taxonomy for the connection engine.
//!
//! Transport and codec failures stay inside the connection task (they are logged and turned
//! into state changes). Commit and state errors are returned to the caller.

use thiserror::Error;

/// Failures of the byte link to a radio.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The port or socket could not be opened
    #[error("failed to open {target}: {reason}")]
    OpenFailed { target: String, reason: String },

    /// Opening did not finish in time
    #[error("timed out opening {0}")]
    OpenTimeout(String),

    /// The device went away (unplugged, socket reset, EOF)
    #[error("device unplugged or link closed: {0}")]
    Unplugged(String),

    /// A write to an open link failed
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The outbound queue is full
    #[error("outbound queue full")]
    Backpressure,
}

/// Failures while framing or decoding radio traffic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A frame header or payload could not be decoded. The stream continues after it.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// An outbound payload exceeds the maximum frame length
    #[error("payload of {len} bytes exceeds frame limit {max}")]
    TooLarge { len: usize, max: usize },

    /// Encoding an outbound message failed
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Outcome errors of a commit, per group or for the whole call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommitError {
    /// The target handle is not connected (or there is no primary)
    #[error("No active connection")]
    NoActiveConnection,

    /// The device did not acknowledge every write before the deadline
    #[error("timed out waiting for device acknowledgement")]
    Timeout,

    /// The link dropped while writes were in flight
    #[error("connection lost during commit")]
    ConnectionLost,

    /// The device refused a write
    #[error("device rejected write: {0}")]
    Rejected(String),

    /// The merged edit does not form a valid section record
    #[error("invalid edit: {0}")]
    InvalidEdit(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Invalid commands against the manager's state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown connection handle: {0}")]
    UnknownHandle(String),

    #[error("connection {0} is already active")]
    AlreadyConnected(String),

    #[error("unknown config section: {0}")]
    UnknownSection(String),

    #[error("unknown field {field} in section {section}")]
    UnknownField { section: String, field: String },

    #[error("connection {0} is not connected")]
    NotConnected(String),
}

/// Failures of a connect request before the session starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors from pass-through device commands (text, waypoints, owner).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("device did not acknowledge the packet")]
    Timeout,

    #[error("device rejected packet: {0}")]
    Rejected(String),

    #[error("connection lost before acknowledgement")]
    ConnectionLost,
}
