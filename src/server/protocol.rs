//! Liveness wire format and close codes
//!
//! In protocol-ping mode the peer application sends `{"kind":"ping"}` as a
//! text frame and the gateway answers `{"kind":"pong"}`. In transport-ping
//! mode native ping control frames carry [`TRANSPORT_PING_PAYLOAD`].

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Payload carried by transport-level ping frames
pub const TRANSPORT_PING_PAYLOAD: &[u8] = b"ping";

/// Ping sentinel as sent by peers
pub const PING_SENTINEL: &str = r#"{"kind":"ping"}"#;

/// Pong sentinel sent in reply to [`PING_SENTINEL`]
pub const PONG_SENTINEL: &str = r#"{"kind":"pong"}"#;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (used for idle timeouts and server shutdown)
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame carried no status code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Transport dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Liveness Messages
// ============================================================================

/// Application-level liveness sentinel
///
/// Only an object whose single field is `kind` counts as a sentinel; anything
/// else is an ordinary application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivenessMessage {
    pub kind: LivenessKind,
}

/// Kind of liveness sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessKind {
    Ping,
    Pong,
}

impl LivenessMessage {
    /// The sentinel a peer sends to prove it is alive
    pub fn ping() -> Self {
        Self {
            kind: LivenessKind::Ping,
        }
    }

    /// The sentinel the gateway replies with
    pub fn pong() -> Self {
        Self {
            kind: LivenessKind::Pong,
        }
    }

    /// Parse a text frame as a liveness sentinel, if it is one
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Whether a text frame is a ping sentinel
    pub fn is_ping(text: &str) -> bool {
        matches!(Self::parse(text), Some(msg) if msg.kind == LivenessKind::Ping)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Close Information
// ============================================================================

/// Status delivered to close observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close status code
    pub code: u16,
    /// Close reason, possibly empty
    pub reason: String,
}

impl CloseInfo {
    /// Create close information from a code and reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Closure without a close handshake
    pub fn abnormal() -> Self {
        Self::new(CLOSE_ABNORMAL, "")
    }

    /// Build from the close frame a peer sent
    pub fn from_frame(frame: Option<&CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self::new(u16::from(frame.code), frame.reason.to_string()),
            None => Self::new(CLOSE_NO_STATUS, ""),
        }
    }

    /// Whether the socket went away without a close handshake
    pub fn is_abnormal(&self) -> bool {
        self.code == CLOSE_ABNORMAL
    }

    /// Convert to an outgoing close frame
    pub fn to_frame(&self) -> CloseFrame<'static> {
        CloseFrame {
            code: CloseCode::from(self.code),
            reason: Cow::Owned(self.reason.clone()),
        }
    }
}
