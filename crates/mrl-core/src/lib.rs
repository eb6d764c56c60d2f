//! mrl-core - client runtime for MyRobotLab remote services.
//!
//! A single [`Endpoint`] keeps one connection to a remote runtime that hosts
//! many named services. The crate negotiates identity with the peer, mirrors
//! the remote service registry, correlates blocking calls with their replies
//! and fans every inbound message out to local subscribers.
//!
//! # Example
//!
//! ```rust,ignore
//! use mrl_core::{callback, Args, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> mrl_core::Result<()> {
//!     let endpoint = Endpoint::builder().build()?;
//!     endpoint.connect().await?;
//!     endpoint.wait_ready(std::time::Duration::from_secs(5)).await?;
//!
//!     endpoint.subscribe("servo1", "publishServoEvent")?;
//!     endpoint.subscribe_by_name_method(
//!         "servo1",
//!         "publishServoEvent",
//!         callback(|envelope| {
//!             let event: serde_json::Value = envelope.arg(0)?;
//!             println!("servo event: {}", event);
//!             Ok(())
//!         }),
//!     );
//!
//!     endpoint.send_to("servo1", "moveTo", Args::new().arg(90))?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod correlation;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod naming;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod subscriptions;
pub mod transport;

// Re-export commonly used types
pub use config::{BlockingConfig, ConnectionConfig, EndpointConfig, ProtocolConfig};
pub use correlation::{CorrelationTable, PollPolicy};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use envelope::{Args, Envelope, Inbound, MsgIdGenerator, MsgType};
pub use error::{MrlError, Result};
pub use identity::{ConnectionState, Hello, Identity, Platform};
pub use naming::Resolved;
pub use proxy::{MethodDescriptor, MethodMap, ServiceProxy};
pub use registry::{Registration, ServiceRecord, ServiceRegistry};
pub use router::{DispatchKind, DispatchOutcome, Router};
pub use subscriptions::{callback, Callback, SubscriptionIndex};
pub use transport::{
    memory_pair, MemoryPeer, MemoryTransport, Transport, TransportEvent, WebSocketTransport,
};
