//! Engine error taxonomy.
//!
//! Validation and projection failures are reported to the peer as `ERROR`
//! envelopes and never terminate the session.  Protocol errors are logged
//! and the offending envelope discarded, except unpaired binary frames
//! which close the current transport (the session survives and awaits a
//! reattach).

use crate::transport::TransportError;

/// Inbound data did not match a declared type.
///
/// `path` is an RFC 6901 pointer to the offending field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (at {path})")]
pub struct ValidationFailure {
    pub path: String,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// The owner's state could not be turned into a JSON projection.
///
/// Fatal for the `sync()` call that hit it: the patch is abandoned and the
/// last snapshot left unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("state is not JSON-serializable: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("projection is not a JSON object")]
    NotAnObject,
    #[error("declared attribute `{0}` is missing from the projection")]
    MissingAttr(String),
}

/// Malformed or out-of-order wire traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] sync_protocol::CodecError),
    #[error("unknown event type `{0}`")]
    UnknownEvent(String),
    #[error("no unit registered under key `{0}`")]
    UnknownKey(String),
    #[error("task `{0}` is already running")]
    DuplicateTask(String),
    #[error("no binary field `{0}` is declared")]
    UnknownBinaryField(String),
    #[error("text frame received while awaiting the binary frame for `{0}`")]
    ExpectedBinary(String),
    #[error("binary frame without preceding metadata")]
    UnpairedBinary,
    #[error("binary payload is {got} bytes, metadata announced {expected}")]
    BinarySize { expected: u64, got: u64 },
}

/// Anything a handler or the sync pipeline can fail with.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A user handler failed; the message is safe to put on the wire.
    #[error("{0}")]
    Handler(String),
}

impl SyncError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Failures while registering a unit with a session.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error(transparent)]
    Key(#[from] sync_protocol::KeyError),
    #[error("a unit with key `{0}` is already registered")]
    DuplicateKey(String),
    #[error("attribute `{0}` is not present on the owner")]
    UnknownAttr(String),
    #[error("wire field name `{0}` is used twice")]
    DuplicateField(String),
    #[error("action/task name `{0}` is used twice")]
    DuplicateName(String),
    #[error("cancel hook refers to undeclared task `{0}`")]
    UnknownTask(String),
    #[error("no ambient session in scope")]
    NoAmbientSession,
    #[error("initial state cannot be projected: {0}")]
    Projection(#[from] ProjectionError),
}

/// Why a `Session::run` call returned.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no transport attached")]
    NotAttached,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
