//! In-memory signaling server
//!
//! Every channel the room opens through [`MockConnector`] is handed to the
//! test as a [`ServerChannel`], which reads client frames and writes server
//! frames directly.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rtcroom::signaling::protocol::WireFrame;
use rtcroom::signaling::{Channel, ChannelEvent, ConnectTarget, Connector};
use rtcroom::{Error, Result};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{HarnessError, HarnessResult, TIMEOUT};

/// Connector handing server sides of channels to the test
pub struct MockConnector {
    channels: mpsc::UnboundedSender<ServerChannel>,
    refuse: AtomicBool,
    opened: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, MockServer) {
        let (channels, channels_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            channels,
            refuse: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        (connector, MockServer { channels: channels_rx })
    }

    /// Refuse (or accept again) new channels
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Channels successfully opened
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Open attempts including refused ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<Channel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::WebSocketError("connection refused".to_string()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.opened.fetch_add(1, Ordering::SeqCst);
        let _ = self.channels.send(ServerChannel {
            target: target.clone(),
            from_client,
            to_client,
            skipped: Vec::new(),
        });
        Ok(Channel { outbound, inbound })
    }
}

/// Accepts channels opened by the client
pub struct MockServer {
    channels: mpsc::UnboundedReceiver<ServerChannel>,
}

impl MockServer {
    pub async fn accept(&mut self) -> HarnessResult<ServerChannel> {
        tokio::time::timeout(TIMEOUT, self.channels.recv())
            .await
            .map_err(|_| HarnessError::Timeout("signaling channel".to_string()))?
            .ok_or_else(|| HarnessError::ChannelClosed("connector".to_string()))
    }
}

/// A frame received from the client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    /// `None` for notifications
    pub id: Option<u64>,
    pub event: String,
    pub args: Vec<Value>,
}

impl ClientRequest {
    /// First argument
    pub fn message(&self) -> &Value {
        self.args.first().unwrap_or(&Value::Null)
    }

    /// `options` of an `{options, sdp}` envelope
    pub fn options(&self) -> &Value {
        &self.message()["options"]
    }
}

/// Server side of one signaling channel
pub struct ServerChannel {
    pub target: ConnectTarget,
    from_client: mpsc::UnboundedReceiver<WireFrame>,
    to_client: mpsc::UnboundedSender<ChannelEvent>,
    skipped: Vec<ClientRequest>,
}

impl ServerChannel {
    /// Push an event to the client
    pub fn push(&self, event: &str, args: Vec<Value>) {
        let _ = self.to_client.send(ChannelEvent::Frame(WireFrame::Event {
            event: event.to_string(),
            args,
        }));
    }

    /// Acknowledge a request
    pub fn respond(&self, request: &ClientRequest, args: Vec<Value>) {
        let id = request.id.expect("notifications cannot be acknowledged");
        let _ = self
            .to_client
            .send(ChannelEvent::Frame(WireFrame::Response { id, args }));
    }

    /// Drop the channel from the server side
    pub fn close(&self, reason: &str) {
        let _ = self.to_client.send(ChannelEvent::Closed(reason.to_string()));
    }

    /// Next frame from the client
    pub async fn next_request(&mut self) -> HarnessResult<ClientRequest> {
        if !self.skipped.is_empty() {
            return Ok(self.skipped.remove(0));
        }
        self.receive().await
    }

    async fn receive(&mut self) -> HarnessResult<ClientRequest> {
        let frame = tokio::time::timeout(TIMEOUT, self.from_client.recv())
            .await
            .map_err(|_| HarnessError::Timeout("client frame".to_string()))?
            .ok_or_else(|| HarnessError::ChannelClosed("client".to_string()))?;
        Ok(match frame {
            WireFrame::Request { id, event, args } => ClientRequest {
                id: Some(id),
                event,
                args,
            },
            WireFrame::Event { event, args } => ClientRequest {
                id: None,
                event,
                args,
            },
            WireFrame::Response { id, .. } => panic!("client acknowledged server frame {}", id),
        })
    }

    /// First request matching `pred`; others are kept for later
    pub async fn expect_matching<F>(&mut self, what: &str, pred: F) -> ClientRequest
    where
        F: Fn(&ClientRequest) -> bool,
    {
        if let Some(index) = self.skipped.iter().position(&pred) {
            return self.skipped.remove(index);
        }
        loop {
            let request = self
                .receive()
                .await
                .unwrap_or_else(|e| panic!("waiting for {}: {}", what, e));
            if pred(&request) {
                return request;
            }
            self.skipped.push(request);
        }
    }

    /// First request for `event`
    pub async fn expect_request(&mut self, event: &str) -> ClientRequest {
        self.expect_matching(event, |r| r.event == event).await
    }

    /// First relayed `connectionMessage` of signaling type `kind`
    pub async fn expect_connection_message(&mut self, kind: &str) -> ClientRequest {
        self.expect_matching(kind, |r| {
            r.event == "connectionMessage" && r.options()["msg"]["type"] == kind
        })
        .await
    }

    /// Requests for `event` received so far without waiting
    pub fn received(&mut self, event: &str) -> Vec<ClientRequest> {
        while let Ok(frame) = self.from_client.try_recv() {
            let request = match frame {
                WireFrame::Request { id, event, args } => ClientRequest {
                    id: Some(id),
                    event,
                    args,
                },
                WireFrame::Event { event, args } => ClientRequest {
                    id: None,
                    event,
                    args,
                },
                WireFrame::Response { .. } => continue,
            };
            self.skipped.push(request);
        }
        let (matching, rest): (Vec<_>, Vec<_>) =
            self.skipped.drain(..).partition(|r| r.event == event);
        self.skipped = rest;
        matching
    }
}
