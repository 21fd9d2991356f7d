//! linegate: relay a line-delimited JSON child process over WebSocket.

pub mod bridge;
pub mod config;
pub mod health;
pub mod orchestrator;
pub mod process;
pub mod state;
pub mod transport;

pub use bridge::{DecodeError, EncodeError, LineFramer, ProtocolMessage, RawRecord};
pub use config::{BridgeConfig, ConfigError};
pub use health::{HealthConfig, HealthError, HealthServer};
pub use orchestrator::{Bridge, BridgeError, BridgeExit, ShutdownCause, shutdown_signal};
pub use process::{ChildCommand, ChildExit, ProcessHandle, SpawnError, WriteError};
pub use state::{BridgePhase, BridgeState, HealthSnapshot};
pub use transport::{
    BroadcastReport, ClientId, MessageTransport, TransportBinder, TransportConfig, TransportError,
    TransportEvent, WsBinder, WsTransport,
};
