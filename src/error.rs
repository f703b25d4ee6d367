//! Error types shared across the gateway
//!
//! Per-connection failures never escalate past the socket that produced them;
//! these types exist so the failure can be logged or inspected by observers.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::config::ConfigError;
use crate::socket::ReadyState;

/// Errors surfaced by gateway registration and the transport server
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport server has shut down")]
    ServerShutDown,
}

/// Errors raised by a live socket handle
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket is not open (state: {0:?})")]
    NotOpen(ReadyState),

    #[error("Socket driver has stopped")]
    Disconnected,

    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Reasons a claimed upgrade request is refused before the handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Upgrade request must use GET, got {0}")]
    Method(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid value for header {0}")]
    InvalidHeader(&'static str),

    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for socket operations
pub type SocketResult<T> = Result<T, SocketError>;
