//! Error types for the mrl client runtime.
//!
//! Every variant describes a failure that degrades a single operation or a
//! single inbound message. None of them stops the router from serving the
//! messages that follow.

use crate::envelope::Envelope;
use crate::identity::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the mrl client runtime.
#[derive(Debug, Error)]
pub enum MrlError {
    // Addressing errors
    #[error("Addressing error: short name \"{name}\" used before the remote id is known")]
    Addressing { name: String },

    // Codec errors
    #[error("Decode error: {message}")]
    Decode {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Dispatch errors
    #[error("Callback for {key} failed: {message}")]
    Callback { key: String, message: String },

    // Correlation errors
    #[error("Blocking call {msg_id} to {target} timed out after {attempts} polls ({elapsed:?})")]
    CorrelationTimeout {
        msg_id: u64,
        target: String,
        attempts: u32,
        elapsed: Duration,
        /// The original outbound envelope, kept for diagnostics.
        envelope: Box<Envelope>,
    },

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Endpoint is not connected")]
    NotConnected,

    #[error("Invalid connection state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for mrl operations.
pub type Result<T> = std::result::Result<T, MrlError>;

impl From<serde_json::Error> for MrlError {
    fn from(err: serde_json::Error) -> Self {
        MrlError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<std::io::Error> for MrlError {
    fn from(err: std::io::Error) -> Self {
        MrlError::Transport {
            message: err.to_string(),
            cause: err.kind().to_string().into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MrlError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MrlError::Transport {
            message: err.to_string(),
            cause: Some(format!("{:?}", err)),
        }
    }
}

impl MrlError {
    /// Create a decode error from a parse failure.
    pub fn decode(message: impl Into<String>, source: Option<serde_json::Error>) -> Self {
        MrlError::Decode {
            message: message.into(),
            source,
        }
    }

    /// Create a transport error without an underlying cause.
    pub fn transport(message: impl Into<String>) -> Self {
        MrlError::Transport {
            message: message.into(),
            cause: None,
        }
    }

    /// Check if the caller may reasonably retry the whole operation.
    ///
    /// Blocking calls are never retried automatically; this only tells the
    /// caller whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MrlError::CorrelationTimeout { .. }
                | MrlError::Timeout { .. }
                | MrlError::Transport { .. }
                | MrlError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MrlError::Addressing {
            name: "logger".into(),
        };
        assert_eq!(
            err.to_string(),
            "Addressing error: short name \"logger\" used before the remote id is known"
        );
    }

    #[test]
    fn test_timeout_carries_envelope() {
        let envelope = Envelope::new(42, "python@R9", "runtime@E1", "exec");
        let err = MrlError::CorrelationTimeout {
            msg_id: 42,
            target: "python@R9.exec".into(),
            attempts: 20,
            elapsed: Duration::from_secs(20),
            envelope: Box::new(envelope),
        };
        assert!(err.to_string().contains("python@R9.exec"));
        match err {
            MrlError::CorrelationTimeout { envelope, .. } => assert_eq!(envelope.msg_id, 42),
            other => panic!("Expected CorrelationTimeout, got: {:?}", other),
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(MrlError::NotConnected.is_retryable());
        assert!(MrlError::transport("connection reset").is_retryable());
        assert!(!MrlError::Addressing { name: "x".into() }.is_retryable());
        assert!(!MrlError::decode("bad json", None).is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: MrlError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, MrlError::Json { source: Some(_), .. }));
    }
}
