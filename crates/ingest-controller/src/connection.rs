//! Peer connection lifecycle, as seen from the ingestion side.
//!
//! The signaling transport owns the real connection; this module only models
//! the state the ingestion service tracks and the events the transport
//! delivers over an `mpsc` channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Returns the state as a string (for logging).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether the connection has ended.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed
        )
    }
}

/// A producer connection and the stream bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub connection_id: String,
    pub state: ConnectionState,
    pub stream_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    #[must_use]
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            state: ConnectionState::Connecting,
            stream_id: None,
            connected_at: Utc::now(),
        }
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly hangup.
    Normal,
    /// Transport failure (ICE, DTLS, timeout).
    Failed,
}

impl CloseReason {
    /// State a connection ends in for this reason.
    #[must_use]
    pub const fn final_state(&self) -> ConnectionState {
        match self {
            CloseReason::Normal => ConnectionState::Disconnected,
            CloseReason::Failed => ConnectionState::Failed,
        }
    }
}

/// Events delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A producer finished signaling and is ready to stream.
    Established { connection_id: String },
    /// A producer went away. `stream_id` is set when the transport knows it.
    Closed {
        connection_id: String,
        stream_id: Option<String>,
        reason: CloseReason,
    },
}
