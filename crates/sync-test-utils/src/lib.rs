//! In-memory transport pair for exercising sessions without sockets.
//!
//! [`pipe`] returns the server end (a [`PipeTransport`] to hand to
//! `Session::attach`) and the client end (a [`TestPeer`] that speaks
//! envelopes and binary frames like a browser client would).  Every
//! receive helper is timeout-guarded so a missing frame fails the test
//! instead of hanging it.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use sync_protocol::{decode, encode, Envelope, Frame};
use sync_session::{Transport, TransportError};
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Create a connected transport/peer pair.
pub fn pipe() -> (PipeTransport, TestPeer) {
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    (
        PipeTransport {
            rx: to_server_rx,
            tx: to_client_tx,
        },
        TestPeer {
            tx: to_server_tx,
            rx: to_client_rx,
        },
    )
}

/// Server end: implements the engine's transport port over channels.
pub struct PipeTransport {
    rx: mpsc::UnboundedReceiver<Frame>,
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl Transport for PipeTransport {
    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Client end: send and receive protocol traffic in tests.
pub struct TestPeer {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl TestPeer {
    /// Send an envelope as a text frame.
    pub fn send(&self, envelope: &Envelope) {
        let text = encode(envelope).expect("envelope should encode");
        self.tx
            .send(Frame::Text(text))
            .expect("server end should be alive");
    }

    /// Send an event with a JSON data payload.
    pub fn send_event(&self, event: &str, data: Value) {
        self.send(&Envelope::new(event, data));
    }

    /// Send a raw text frame (for malformed-input tests).
    pub fn send_text(&self, text: &str) {
        self.tx
            .send(Frame::Text(text.to_owned()))
            .expect("server end should be alive");
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        self.tx
            .send(Frame::Binary(bytes))
            .expect("server end should be alive");
    }

    /// Receive the next frame of any kind.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
    }

    /// Receive the next text frame and decode it; panics on a binary
    /// frame or closed pipe.
    pub async fn recv(&mut self) -> Envelope {
        match self.recv_frame().await {
            Some(Frame::Text(text)) => decode(&text).expect("frame should decode"),
            Some(Frame::Binary(_)) => panic!("expected text frame, got binary"),
            None => panic!("server closed the pipe"),
        }
    }

    /// Receive the next frame as binary; panics on text.
    pub async fn recv_binary(&mut self) -> Vec<u8> {
        match self.recv_frame().await {
            Some(Frame::Binary(bytes)) => bytes,
            Some(Frame::Text(text)) => panic!("expected binary frame, got text: {text}"),
            None => panic!("server closed the pipe"),
        }
    }

    /// Receive the next envelope and assert its event type.
    pub async fn expect(&mut self, event: &str) -> Envelope {
        let envelope = self.recv().await;
        assert_eq!(envelope.event, event, "unexpected event order");
        envelope
    }

    /// True when no frame arrives within a short grace period (a closed
    /// pipe counts as silence).  Used for empty-diff-silence assertions.
    pub async fn silent(&mut self, grace: Duration) -> bool {
        matches!(timeout(grace, self.rx.recv()).await, Err(_) | Ok(None))
    }

    /// Receive the next envelope if one arrives within `grace`; `None`
    /// on silence or pipe close.  Used to drain in-flight traffic.
    pub async fn next_within(&mut self, grace: Duration) -> Option<Envelope> {
        match timeout(grace, self.rx.recv()).await {
            Err(_) | Ok(None) => None,
            Ok(Some(Frame::Text(text))) => Some(decode(&text).expect("frame should decode")),
            Ok(Some(Frame::Binary(_))) => panic!("expected text frame, got binary"),
        }
    }

    /// Drop the client end, which the server observes as a peer close.
    pub fn close(self) {}
}
