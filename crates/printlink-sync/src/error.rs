//! # Sync Error Types
//!
//! Error types for the session runtime.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Runtime Error Categories                          │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  Serialization          │ │
//! │  │  ConfigLoad/Save│  │  Timeout        │  │  Deserialization        │ │
//! │  │                 │  │  Watchdog       │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Registration   │  │     Store       │  │      Handler            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Rejected       │  │  Unavailable    │  │  HandlerFailed          │ │
//! │  │  IdentityClaimed│  │  StoreFailed    │  │  TickTimeout            │ │
//! │  │  Session        │  │  RecordNotFound │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use uuid::Uuid;

use crate::camera::CameraError;

/// Result type alias for runtime operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Runtime error type covering every failure the session layers report.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid client settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid control-plane URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load settings file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save settings file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to open the transport.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Transport closed unexpectedly.
    #[error("Disconnected from control-plane")]
    Disconnected,

    /// Connect or handshake did not finish in time.
    #[error("{stage} timed out after {after_ms} ms")]
    Timeout { stage: &'static str, after_ms: u64 },

    /// No inbound traffic within the watchdog window.
    #[error("Watchdog expired: no inbound traffic for {0} seconds")]
    WatchdogExpired(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// An outbound message was tagged with a connection version that is gone.
    #[error("Stale message: tagged v{tagged}, connection is at v{current}")]
    StaleVersion { tagged: u64, current: u64 },

    /// Outbound message attempted while not online.
    #[error("Connection is not online")]
    NotOnline,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed or unknown inbound message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Registration Errors
    // =========================================================================
    /// The control-plane refused the registration (close code 4000-4999).
    #[error("Registration rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    /// Another live record already owns this remote identity.
    #[error("Identity {identity} is already claimed by {owner}")]
    IdentityClaimed { identity: u64, owner: Uuid },

    /// Session model rule violated (e.g. identity rewrite).
    #[error("Session error: {0}")]
    Session(#[from] printlink_core::CoreError),

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Transient config store failure.
    #[error("Config store unavailable: {0}")]
    StoreUnavailable(String),

    /// Permanent config store failure.
    #[error("Config store failed: {0}")]
    StoreFailed(String),

    /// No record with this key.
    #[error("Printer {0} not found")]
    RecordNotFound(Uuid),

    // =========================================================================
    // Handler Errors
    // =========================================================================
    /// Embedding handler returned an error.
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Embedding handler exceeded the tick timeout.
    #[error("Handler exceeded tick timeout of {0} ms")]
    TickTimeout(u64),

    /// Camera request failed.
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Runtime is shutting down.
    #[error("Runtime is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<printlink_db::DbError> for SyncError {
    fn from(err: printlink_db::DbError) -> Self {
        if err.is_retryable() {
            SyncError::StoreUnavailable(err.to_string())
        } else {
            SyncError::StoreFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            SyncError::DeserializationFailed(err.to_string())
        } else {
            SyncError::SerializationFailed(err.to_string())
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl SyncError {
    /// Wraps an embedder failure.
    pub fn handler(message: impl Into<String>) -> Self {
        SyncError::HandlerFailed(message.into())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Transport faults (the connection loop always retries these)
    /// - Transient store failures
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout { .. }
                | SyncError::WatchdogExpired(_)
                | SyncError::WebSocketError(_)
                | SyncError::TlsError(_)
                | SyncError::StoreUnavailable(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true for malformed or unexpected wire data.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::DeserializationFailed(_)
        )
    }

    /// Returns true if the control-plane refused this printer.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncError::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::WatchdogExpired(30).is_retryable());
        assert!(SyncError::StoreUnavailable("locked".into()).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::Rejected {
            code: 4001,
            reason: "revoked".into()
        }
        .is_retryable());
        assert!(!SyncError::StoreFailed("corrupt".into()).is_retryable());
    }

    #[test]
    fn test_db_errors_keep_retry_class() {
        let transient: SyncError = printlink_db::DbError::PoolExhausted.into();
        assert!(transient.is_retryable());

        let permanent: SyncError = printlink_db::DbError::duplicate("identity", "7").into();
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_json_errors_are_protocol_errors() {
        let err: SyncError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::Timeout {
            stage: "handshake",
            after_ms: 10_000,
        };
        assert_eq!(err.to_string(), "handshake timed out after 10000 ms");
        assert!(SyncError::Rejected {
            code: 4003,
            reason: "bad token".into()
        }
        .is_rejection());
    }
}
