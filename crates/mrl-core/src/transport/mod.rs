//! Transport adapters.
//!
//! A transport moves raw text payloads over one duplex connection and knows
//! nothing about envelopes. The endpoint's connection driver owns exactly one
//! transport and pulls events from it in order.

mod memory;
mod websocket;

pub use memory::{memory_pair, MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

use crate::error::Result;
use async_trait::async_trait;

/// Events delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established.
    Open,
    /// One raw payload.
    Message(String),
    /// The connection closed, with an optional reason.
    Close(Option<String>),
    /// A non-fatal error; the connection may still be usable.
    Error(String),
}

/// Duplex, message-oriented connection.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Establish the connection. On success the next event is `Open`.
    async fn open(&mut self) -> Result<()>;

    /// Send one raw payload.
    async fn send(&mut self, payload: &str) -> Result<()>;

    /// Wait for the next event. `None` once the transport is finished.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;

    /// Short description for logs.
    fn describe(&self) -> String;
}
