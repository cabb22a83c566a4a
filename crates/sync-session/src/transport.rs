//! The transport port.
//!
//! A transport is a WebSocket-shaped duplex carrier of text and binary
//! frames.  The engine never touches sockets directly; host adapters (an
//! axum upgrade handler, an in-memory test pipe) implement this trait and
//! hand the object to [`crate::Session::attach`].

use async_trait::async_trait;

pub use sync_protocol::Frame;

/// Transport-level failure; ends the current attachment only.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

/// One attached duplex frame carrier.
///
/// `next_frame` resolves to `Ok(None)` on orderly close by the peer.
/// Implementations are driven from a single task; they do not need to be
/// `Sync`.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError>;
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;
    async fn close(&mut self);
}
