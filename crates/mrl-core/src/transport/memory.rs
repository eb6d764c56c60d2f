//! In-process loopback transport.
//!
//! [`memory_pair`] returns a transport for the endpoint and a [`MemoryPeer`]
//! that plays the remote side: it sees every payload the endpoint sends and
//! can push payloads, heartbeats and a close back.

use super::{Transport, TransportEvent};
use crate::envelope::{self, Envelope, Inbound};
use crate::error::{MrlError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug)]
enum PeerFrame {
    Text(String),
    Close(Option<String>),
}

/// Endpoint side of an in-process connection.
#[derive(Debug)]
pub struct MemoryTransport {
    to_peer: mpsc::UnboundedSender<String>,
    from_peer: mpsc::UnboundedReceiver<PeerFrame>,
    open: bool,
    open_pending: bool,
    finished: bool,
}

/// Remote side of an in-process connection.
#[derive(Debug)]
pub struct MemoryPeer {
    to_endpoint: mpsc::UnboundedSender<PeerFrame>,
    from_endpoint: mpsc::UnboundedReceiver<String>,
}

/// Create a connected transport/peer pair.
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (to_peer, from_endpoint) = mpsc::unbounded_channel();
    let (to_endpoint, from_peer) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            to_peer,
            from_peer,
            open: false,
            open_pending: false,
            finished: false,
        },
        MemoryPeer {
            to_endpoint,
            from_endpoint,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<()> {
        if self.to_peer.is_closed() || self.finished {
            return Err(MrlError::transport("memory peer is gone"));
        }
        self.open = true;
        self.open_pending = true;
        Ok(())
    }

    async fn send(&mut self, payload: &str) -> Result<()> {
        if !self.open {
            return Err(MrlError::NotConnected);
        }
        self.to_peer
            .send(payload.to_string())
            .map_err(|_| MrlError::transport("memory peer is gone"))
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.finished {
            return None;
        }
        if std::mem::take(&mut self.open_pending) {
            return Some(TransportEvent::Open);
        }

        let event = match self.from_peer.recv().await {
            Some(PeerFrame::Text(text)) => return Some(TransportEvent::Message(text)),
            Some(PeerFrame::Close(reason)) => TransportEvent::Close(reason),
            None => TransportEvent::Close(Some("memory peer dropped".to_string())),
        };
        self.open = false;
        self.finished = true;
        Some(event)
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing memory transport");
        self.open = false;
        self.finished = true;
        self.from_peer.close();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryPeer {
    /// Push a raw payload to the endpoint.
    pub fn send_raw(&self, payload: impl Into<String>) -> Result<()> {
        self.to_endpoint
            .send(PeerFrame::Text(payload.into()))
            .map_err(|_| MrlError::transport("memory transport is gone"))
    }

    /// Push an envelope to the endpoint.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_raw(envelope::encode(envelope)?)
    }

    pub fn heartbeat(&self) -> Result<()> {
        self.send_raw(crate::config::ProtocolConfig::HEARTBEAT)
    }

    /// Close the connection from the remote side.
    pub fn close(&self, reason: Option<&str>) -> Result<()> {
        self.to_endpoint
            .send(PeerFrame::Close(reason.map(str::to_string)))
            .map_err(|_| MrlError::transport("memory transport is gone"))
    }

    /// Next raw payload sent by the endpoint.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.from_endpoint.recv().await
    }

    /// Next envelope sent by the endpoint. Undecodable payloads are skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let raw = self.recv_raw().await?;
            match envelope::decode(&raw) {
                Ok(Inbound::Message(envelope)) => return Some(envelope),
                Ok(Inbound::Heartbeat) => continue,
                Err(e) => debug!("Peer skipped payload: {}", e),
            }
        }
    }

    /// A payload already sent by the endpoint, without waiting.
    pub fn try_recv_raw(&mut self) -> Option<String> {
        self.from_endpoint.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_then_exchange() {
        let (mut transport, mut peer) = memory_pair();
        assert!(matches!(
            transport.send("early").await,
            Err(MrlError::NotConnected)
        ));

        transport.open().await.unwrap();
        assert_eq!(transport.next_event().await, Some(TransportEvent::Open));

        transport.send("{\"ping\":1}").await.unwrap();
        assert_eq!(peer.recv_raw().await.as_deref(), Some("{\"ping\":1}"));

        peer.heartbeat().unwrap();
        assert_eq!(
            transport.next_event().await,
            Some(TransportEvent::Message("X".to_string()))
        );
    }

    #[tokio::test]
    async fn test_peer_close_finishes_transport() {
        let (mut transport, peer) = memory_pair();
        transport.open().await.unwrap();
        transport.next_event().await;

        peer.close(Some("bye")).unwrap();
        assert_eq!(
            transport.next_event().await,
            Some(TransportEvent::Close(Some("bye".to_string())))
        );
        assert_eq!(transport.next_event().await, None);
        assert!(transport.send("late").await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_as_close() {
        let (mut transport, peer) = memory_pair();
        transport.open().await.unwrap();
        transport.next_event().await;
        drop(peer);

        assert!(matches!(
            transport.next_event().await,
            Some(TransportEvent::Close(Some(_)))
        ));
    }
}
