//! WebSocket transport (tokio-tungstenite).

use super::{Transport, TransportEvent};
use crate::error::{MrlError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Text-frame WebSocket connection to a remote message endpoint.
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
    stream: Option<WsStream>,
    opened: bool,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            stream: None,
            opened: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self) -> Result<()> {
        debug!("Connecting to {}", self.url);
        let connect = connect_async(self.url.as_str());
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| MrlError::Timeout {
                what: format!("websocket connection to {}", self.url),
                after: self.connect_timeout,
            })??;

        info!("Connected to {}", self.url);
        self.stream = Some(stream);
        self.opened = true;
        Ok(())
    }

    async fn send(&mut self, payload: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(MrlError::NotConnected)?;
        stream.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if std::mem::take(&mut self.opened) {
            return Some(TransportEvent::Open);
        }

        loop {
            let stream = self.stream.as_mut()?;
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(TransportEvent::Message(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(TransportEvent::Message(text)),
                    Err(e) => {
                        return Some(TransportEvent::Error(format!(
                            "binary frame is not UTF-8: {}",
                            e
                        )))
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    self.stream = None;
                    return Some(TransportEvent::Close(
                        frame.map(|f| format!("{} {}", f.code, f.reason)),
                    ));
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.stream = None;
                    return Some(TransportEvent::Close(Some(e.to_string())));
                }
                None => {
                    self.stream = None;
                    return Some(TransportEvent::Close(None));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.opened = false;
        if let Some(mut stream) = self.stream.take() {
            stream.close(None).await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("websocket {}", self.url)
    }
}
