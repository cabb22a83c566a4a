//! sync-session: the state synchronization engine.
//!
//! A [`Session`] owns a set of registered *sync units* (one per user
//! object), the current transport attachment, and the inbound event
//! dispatcher.  Clients observe each unit's state as a JSON document: the
//! server sends a full `SET` after every transport attach and RFC 6902
//! `PATCH` deltas afterwards.  Clients invoke server behavior through
//! short sequential *actions* and long-running, cancellable *tasks*.
//!
//! # Wiring
//! 1. Build a [`Session`].
//! 2. Declare an object with [`UnitBuilder`] and register it, obtaining a
//!    [`SyncHandle`] for state access and `sync()` calls.
//! 3. [`Session::attach`] a [`Transport`], then drive [`Session::run`]
//!    until the transport ends.  Reattach at will; units survive drops.

mod error;
mod registry;
mod session;
mod transport;
mod unit;
mod validator;

pub use error::{
    ProjectionError, ProtocolError, RegisterError, SessionError, SyncError, ValidationFailure,
};
pub use registry::{param, untyped, Args, Param, SyncHandle, TaskCtx, UnitBuilder};
pub use session::Session;
pub use sync_protocol::{BinMeta, Envelope, Frame, TaskDone, TaskOutcome};
pub use transport::{Transport, TransportError};
pub use validator::{JsonValidator, TypeDesc, Validator};
