//! Multi-client message transport.
//!
//! The orchestrator only sees the `TransportBinder` / `MessageTransport`
//! contract. The WebSocket server in `ws` is the production implementation.
//!
//! Delivery is a pure broadcast bus: every connected client receives every
//! message, and inbound messages from any client go to the one child.

pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bridge::ProtocolMessage;

pub use ws::{WsBinder, WsTransport};

/// Opaque identifier of one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// URL path clients connect on, e.g. `/message`.
    pub path: String,
    pub cors: bool,
    /// Frames queued per client before it is dropped as lagging.
    pub client_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            path: "/message".to_string(),
            cors: false,
            client_queue: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind transport on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    InvalidPath(#[from] crate::config::ConfigError),
    #[error("client {client}: {message}")]
    Client { client: ClientId, message: String },
    #[error("failed to close transport: {0}")]
    Close(String),
}

impl TransportError {
    pub fn client(client: ClientId, message: impl Into<String>) -> Self {
        Self::Client {
            client,
            message: message.into(),
        }
    }
}

/// Events reported by a running transport.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(ClientId),
    Disconnected(ClientId),
    Inbound(ClientId, ProtocolMessage),
    /// Scoped to one client; the transport keeps serving the others.
    Error(TransportError),
}

/// Per-client outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub outcomes: Vec<(ClientId, Result<(), TransportError>)>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = (&ClientId, &TransportError)> {
        self.outcomes
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id, e)))
    }

    pub fn recipients(&self) -> usize {
        self.outcomes.len()
    }
}

/// A bound, running transport.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Queue a message for every connected client. Never blocks on a slow client;
    /// a client whose queue is full is reported as failed and dropped.
    fn broadcast(&self, message: &ProtocolMessage) -> BroadcastReport;

    fn client_count(&self) -> usize;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Drop all sessions and release the listener. Safe to call twice.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Extension point for different transport implementations.
#[async_trait]
pub trait TransportBinder: Send + Sync {
    async fn bind(
        &self,
        config: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn MessageTransport>, TransportError>;
}
