//! The live connection to a client, seen from the gateway.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ServerMessage;
use crate::error::{Error, Result};

/// WebSocket-style close codes the gateway uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure, e.g. after an idle timeout.
    Normal = 1000,
    /// The server is going away.
    GoingAway = 1001,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Outbound half of a client connection.
///
/// Implementations may be slow or already disconnected; the gateway bounds
/// every call with a timeout and never lets a failed send fail a job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: ServerMessage) -> Result<()>;
    async fn close(&self, code: CloseCode, reason: &str) -> Result<()>;
}

/// What a [`ChannelTransport`] hands to its receiving end.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    Closed { code: CloseCode, reason: String },
}

/// A transport backed by a bounded channel.
///
/// The receiving end stands in for the client socket: a full channel behaves
/// like a stalled client and a dropped receiver like a disconnected one.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<TransportEvent>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: ServerMessage) -> Result<()> {
        self.tx
            .send(TransportEvent::Message(message))
            .await
            .map_err(|_| Error::Delivery("client disconnected".to_string()))
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.tx
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| Error::Delivery("client disconnected".to_string()))
    }
}
