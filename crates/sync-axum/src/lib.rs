//! Axum WebSocket adapter for the sync engine.
//!
//! Bridges `axum::extract::ws::WebSocket` to the engine's transport port:
//! text frames carry envelopes, binary frames carry paired payloads,
//! pings are answered inline, close ends the attachment.
//!
//! ```ignore
//! async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
//!     ws.on_upgrade(|socket| async move {
//!         let session = Session::new();
//!         // ... register units ...
//!         sync_axum::serve(&session, socket).await;
//!     })
//! }
//! ```

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use sync_session::{Frame, Session, Transport, TransportError};
use tracing::debug;

/// One accepted WebSocket, adapted to the engine's transport port.
pub struct AxumWsTransport {
    socket: WebSocket,
}

impl AxumWsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

/// Map one WebSocket message to a transport frame.
///
/// `None` means the message is control traffic handled by the caller
/// (ping/pong) or a close.
fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.to_string())),
        Message::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

#[async_trait]
impl Transport for AxumWsTransport {
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.socket.recv().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.socket.send(Message::Pong(data)).await;
                }
                Some(Ok(message)) => {
                    if let Some(frame) = frame_from_message(message) {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

/// Attach the socket to the session and drive it until the socket ends.
pub async fn serve(session: &Session, socket: WebSocket) {
    session.attach(AxumWsTransport::new(socket));
    if let Err(e) = session.run().await {
        debug!(session = %session.id(), error = %e, "attachment ended with error");
    }
}
