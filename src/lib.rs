//! statesync: keep a server-side object graph and a remote client in
//! continuous state agreement over a reconnectable message channel.
//!
//! Facade over the workspace crates: the engine lives in `sync-session`,
//! the wire format in `sync-protocol`.  Host adapters (`sync-axum`) and
//! test tooling (`sync-test-utils`) are separate crates.

pub use sync_protocol as protocol;
pub use sync_session::{
    param, untyped, Args, BinMeta, Envelope, Frame, JsonValidator, Param, ProjectionError,
    ProtocolError, RegisterError, Session, SessionError, SyncError, SyncHandle, TaskCtx, TaskDone,
    TaskOutcome, Transport, TransportError, TypeDesc, UnitBuilder, ValidationFailure, Validator,
};
