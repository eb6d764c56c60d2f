//! Endpoint identity and the hello handshake.
//!
//! On transport open the endpoint sends a hello carrying its id and platform.
//! The peer answers with its own hello; from then on the peer id qualifies
//! every short service name sent outbound.
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingHello -> Ready
//!       ^______________|______________|___________|   (close / failure)
//! ```

use crate::config::ProtocolConfig;
use crate::error::{MrlError, Result};
use crate::naming::{self, Resolved};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Connection lifecycle of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Ready,
}

impl ConnectionState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, AwaitingHello)
                | (AwaitingHello, Ready)
        )
    }

    /// The transport is open, whether or not the hello completed.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::AwaitingHello | ConnectionState::Ready)
    }
}

/// Platform descriptor exchanged in the hello.
///
/// Unknown fields sent by the peer are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub bitness: u32,
    #[serde(default)]
    pub mrl_version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Platform {
    /// Descriptor of the running process.
    pub fn local() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            lang: "rust".to_string(),
            bitness: usize::BITS,
            mrl_version: "unknown".to_string(),
            extra: Map::new(),
        }
    }
}

/// Hello payload, sent once per connection in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub platform: Platform,
}

/// Local and remote identity of an endpoint.
#[derive(Debug, Clone)]
pub struct Identity {
    local_id: String,
    remote_id: Option<String>,
    platform: Platform,
    remote_platform: Option<Platform>,
}

impl Identity {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: None,
            platform: Platform::local(),
            remote_platform: None,
        }
    }

    /// Generate a fresh local id.
    pub fn generate_id() -> String {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", ProtocolConfig::LOCAL_ID_PREFIX, &uuid[..8])
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn set_platform(&mut self, platform: Platform) {
        self.platform = platform;
    }

    pub fn remote_platform(&self) -> Option<&Platform> {
        self.remote_platform.as_ref()
    }

    /// Full name of this endpoint's runtime, used as sender of every message.
    pub fn runtime_name(&self) -> String {
        naming::full_name_of(ProtocolConfig::RUNTIME_SERVICE, &self.local_id)
    }

    /// Full name of the peer's runtime, once the hello completed.
    pub fn remote_runtime_name(&self) -> Option<String> {
        self.remote_id
            .as_deref()
            .map(|id| naming::full_name_of(ProtocolConfig::RUNTIME_SERVICE, id))
    }

    /// Resolve a possibly short name against the remote id.
    pub fn resolve(&self, name: &str) -> Resolved {
        naming::resolve(name, self.remote_id.as_deref())
    }

    /// The hello this endpoint sends after the transport opened.
    pub fn hello(&self) -> Hello {
        Hello {
            id: self.local_id.clone(),
            uuid: None,
            platform: self.platform.clone(),
        }
    }

    /// Apply the peer's hello.
    ///
    /// Stores the remote id and platform and adopts the peer's framework
    /// version. Returns the full name of the peer's runtime.
    pub fn accept_hello(&mut self, hello: Hello) -> Result<String> {
        if hello.id.is_empty() || naming::is_full_name(&hello.id) {
            return Err(MrlError::decode(
                format!("hello carries an invalid id \"{}\"", hello.id),
                None,
            ));
        }

        if !hello.platform.mrl_version.is_empty() {
            self.platform.mrl_version = hello.platform.mrl_version.clone();
        }
        self.remote_platform = Some(hello.platform);
        self.remote_id = Some(hello.id);

        Ok(self
            .remote_runtime_name()
            .unwrap_or_else(|| ProtocolConfig::RUNTIME_SERVICE.to_string()))
    }
}
