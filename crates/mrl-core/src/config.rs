//! Centralized configuration for the mrl client runtime.
//!
//! Protocol constants and timing defaults live on unit structs, the runtime
//! knobs an embedder can change live on [`EndpointConfig`].

use crate::error::{MrlError, Result};
use std::time::Duration;

/// Wire protocol names and payloads shared with the remote runtime.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Transport heartbeat payload, discarded before JSON parsing.
    pub const HEARTBEAT: &'static str = "X";

    /// Name of the runtime service on either side of the connection.
    pub const RUNTIME_SERVICE: &'static str = "runtime";

    // Handshake
    pub const HELLO_METHOD: &'static str = "getHelloResponse";
    pub const HELLO_REPLY_METHOD: &'static str = "onHelloResponse";
    pub const HELLO_PLACEHOLDER: &'static str = "fill-uuid";

    // Registration broadcasts of the remote runtime
    pub const REGISTERED_TOPIC: &'static str = "registered";
    pub const RELEASED_TOPIC: &'static str = "released";
    pub const ON_REGISTERED: &'static str = "onRegistered";
    pub const ON_RELEASED: &'static str = "onReleased";

    // Remote subscription control
    pub const ADD_LISTENER: &'static str = "addListener";
    pub const REMOVE_LISTENER: &'static str = "removeListener";

    // Framework topics and notifications
    pub const PUBLISH_STATUS: &'static str = "publishStatus";
    pub const PUBLISH_STATE: &'static str = "publishState";
    pub const BROADCAST_STATE: &'static str = "broadcastState";
    pub const STATE_NOTIFICATION: &'static str = "onState";
    pub const METHOD_MAP_TOPIC: &'static str = "getMethodMap";
    pub const METHOD_MAP_NOTIFICATION: &'static str = "onMethodMap";
    pub const NO_WORKY: &'static str = "noWorky";

    // Provenance tags
    pub const SENDING_METHOD_SEND_TO: &'static str = "sendTo";
    pub const SENDING_METHOD_BLOCKING: &'static str = "sendToBlocking";

    /// Prefix of generated local endpoint ids.
    pub const LOCAL_ID_PREFIX: &'static str = "rust-client-";

    /// Default remote message endpoint of a WebGui.
    pub const DEFAULT_URL: &'static str = "ws://127.0.0.1:8888/api/messages";
}

/// Defaults for blocking (correlated) calls.
pub struct BlockingConfig;

impl BlockingConfig {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);
    pub const MAX_POLLS: u32 = 20;
}

/// Defaults for connection handling.
pub struct ConnectionConfig;

impl ConnectionConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
}

/// Runtime configuration of an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Explicit local id. Generated once at build time when `None`.
    pub local_id: Option<String>,
    /// WebSocket URL of the remote message endpoint.
    pub url: String,
    /// Delay between two correlation table polls of a blocking call.
    pub poll_interval: Duration,
    /// Number of polls before a blocking call times out.
    pub max_polls: u32,
    /// Age after which an unclaimed reply is swept from the correlation table.
    pub reply_ttl: Duration,
    /// How often the connection driver sweeps the correlation table.
    pub sweep_interval: Duration,
    /// Upper bound for establishing the transport connection.
    pub connect_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            local_id: None,
            url: ProtocolConfig::DEFAULT_URL.to_string(),
            poll_interval: BlockingConfig::POLL_INTERVAL,
            max_polls: BlockingConfig::MAX_POLLS,
            reply_ttl: BlockingConfig::POLL_INTERVAL * BlockingConfig::MAX_POLLS * 2,
            sweep_interval: ConnectionConfig::SWEEP_INTERVAL,
            connect_timeout: ConnectionConfig::CONNECT_TIMEOUT,
        }
    }
}

impl EndpointConfig {
    /// Create a new endpoint config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local endpoint id.
    pub fn with_local_id(mut self, id: impl Into<String>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    /// Set the remote URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the blocking-call poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the blocking-call retry budget.
    pub fn with_max_polls(mut self, polls: u32) -> Self {
        self.max_polls = polls;
        self
    }

    /// Set the age after which unclaimed replies are dropped.
    pub fn with_reply_ttl(mut self, ttl: Duration) -> Self {
        self.reply_ttl = ttl;
        self
    }

    /// Set the correlation sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Total time a blocking call waits before reporting a timeout.
    pub fn blocking_window(&self) -> Duration {
        self.poll_interval * self.max_polls
    }

    /// Check the config for values the endpoint cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_polls == 0 {
            return Err(MrlError::Config {
                message: "max_polls must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(MrlError::Config {
                message: "poll and sweep intervals must be non-zero".to_string(),
            });
        }
        if self.reply_ttl.is_zero() {
            return Err(MrlError::Config {
                message: "reply_ttl must be non-zero".to_string(),
            });
        }
        if let Some(id) = &self.local_id {
            if id.is_empty() || id.contains('@') {
                return Err(MrlError::Config {
                    message: format!("invalid local id \"{}\"", id),
                });
            }
        }

        let parsed = url::Url::parse(&self.url).map_err(|e| MrlError::Config {
            message: format!("invalid url {}: {}", self.url, e),
        })?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(MrlError::Config {
                message: format!("unsupported url scheme \"{}\" (expected ws or wss)", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EndpointConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.blocking_window(), Duration::from_secs(20));
        assert!(config.reply_ttl > config.blocking_window());
    }

    #[test]
    fn test_builder_setters() {
        let config = EndpointConfig::new()
            .with_local_id("E1")
            .with_url("wss://robot.local/api/messages")
            .with_poll_interval(Duration::from_millis(50))
            .with_max_polls(4);

        assert_eq!(config.local_id.as_deref(), Some("E1"));
        assert_eq!(config.blocking_window(), Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EndpointConfig::new().with_max_polls(0).validate().is_err());
        assert!(EndpointConfig::new()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(EndpointConfig::new()
            .with_url("http://127.0.0.1:8888/api/messages")
            .validate()
            .is_err());
        assert!(EndpointConfig::new().with_local_id("a@b").validate().is_err());
        assert!(EndpointConfig::new()
            .with_reply_ttl(Duration::ZERO)
            .validate()
            .is_err());
    }
}
