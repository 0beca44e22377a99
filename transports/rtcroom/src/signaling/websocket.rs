//! WebSocket connector for the signaling transport
//!
//! Each open channel is a `tokio-tungstenite` stream split into a sender task
//! and a receiver task. Frames travel as JSON text messages.

use super::protocol::WireFrame;
use super::transport::{Channel, ChannelEvent, ConnectTarget, Connector};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens signaling channels over WebSocket
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }

    /// Sender task: serializes frames from the channel onto the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<WireFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize signaling frame: {}", e);
                    continue;
                }
            };

            if let Err(e) = write.send(Message::Text(text)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        let _ = write.close().await;
        debug!("Sender task terminated");
    }

    /// Receiver task: decodes frames and reports the close reason
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match WireFrame::from_json(&text) {
                    Ok(frame) => {
                        if tx.send(ChannelEvent::Frame(frame)).is_err() {
                            break "transport close".to_string();
                        }
                    }
                    Err(e) => warn!("Failed to decode signaling frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!("WebSocket connection closed");
                    break match frame {
                        Some(frame) => format!("transport close, code: {}", u16::from(frame.code)),
                        None => "transport close".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break format!("transport error: {}", e);
                }
                None => break "transport close".to_string(),
            }
        };

        let _ = tx.send(ChannelEvent::Closed(reason));
        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<Channel> {
        let url = target.to_url()?;
        info!("Connecting to signaling server: {}", target.url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, out_rx));
        tokio::spawn(Self::receiver_task(read, in_tx));

        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_refused() {
        let connector = WebSocketConnector::new();
        // Port 9 (discard) is not expected to accept WebSocket upgrades
        let result = connector
            .open(&ConnectTarget::new("ws://127.0.0.1:9"))
            .await;
        assert!(matches!(result, Err(Error::WebSocketError(_))));
    }

    #[tokio::test]
    async fn test_open_invalid_url() {
        let connector = WebSocketConnector::new();
        let result = connector.open(&ConnectTarget::new("::::")).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
