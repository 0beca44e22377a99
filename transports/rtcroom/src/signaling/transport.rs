//! Reliable signaling transport
//!
//! Keeps a duplex frame channel to the room controller alive across
//! transient network loss, correlates requests with acknowledgements and
//! reports lifecycle changes as [`TransportEvent`]s.

use super::backoff::ReconnectionPolicy;
use super::protocol::{Ack, WireFrame};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

/// Where and with which handshake parameters to open the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Base URL (`ws://` or `wss://`)
    pub url: String,
    /// Handshake query parameters
    pub query: BTreeMap<String, String>,
}

impl ConnectTarget {
    /// Create a target without query parameters
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: BTreeMap::new(),
        }
    }

    /// Full URL including the query string
    pub fn to_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid signaling URL {}: {}", self.url, e)))?;

        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

/// Inbound side of an open channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A frame arrived
    Frame(WireFrame),
    /// The channel closed; carries a human-readable reason
    Closed(String),
}

/// An open frame channel; dropping `outbound` closes it
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<WireFrame>,
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Opens physical channels to the room controller
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, target: &ConnectTarget) -> Result<Channel>;
}

/// Lifecycle and message events raised by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Channel is up
    Connect,
    /// First connection attempt failed; reconnection follows
    ConnectError(String),
    /// Channel went down
    Disconnect { reason: String, pending: usize },
    /// A reconnection attempt is starting (1-indexed)
    ReconnectAttempt(u32),
    /// A reconnection attempt opened a new channel
    Reconnect(u32),
    /// A reconnection attempt failed
    ReconnectError { attempt: u32, error: String },
    /// All reconnection attempts failed; no further retries
    ReconnectFailed,
    /// Server reported an error
    Error(String),
    /// Application event pushed by the server
    Message { event: String, args: Vec<Value> },
}

const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

type PendingAck = oneshot::Sender<Result<Ack>>;

struct TransportInner {
    connector: Arc<dyn Connector>,
    policy: ReconnectionPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    pending: Mutex<HashMap<u64, PendingAck>>,
    next_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<WireFrame>>>,
    client_id: Mutex<Option<String>>,
    /// `Some(client_initiated)` once teardown was requested
    shutdown: watch::Sender<Option<bool>>,
    started: AtomicBool,
}

enum PumpExit {
    Shutdown,
    Closed(String),
}

/// Reconnecting request/acknowledge channel
#[derive(Clone)]
pub struct ReliableTransport {
    inner: Arc<TransportInner>,
}

impl ReliableTransport {
    /// Create a transport and the receiver of its events
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectionPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(None);

        let transport = Self {
            inner: Arc::new(TransportInner {
                connector,
                policy,
                events,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                outbound: Mutex::new(None),
                client_id: Mutex::new(None),
                shutdown,
                started: AtomicBool::new(false),
            }),
        };

        (transport, events_rx)
    }

    /// Start connecting in the background
    ///
    /// Events are delivered on the receiver returned by [`ReliableTransport::new`].
    pub fn connect(&self, target: ConnectTarget) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "signaling transport already started".to_string(),
            ));
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(target).await });
        Ok(())
    }

    /// Send a request and wait for its acknowledgement
    pub async fn send(&self, event: &str, args: Vec<Value>) -> Result<Ack> {
        let ack = self.emit_request(event, args)?;
        ack.await.map_err(|_| {
            Error::Disconnected(format!("{} was dropped before acknowledgement", event))
        })?
    }

    /// Send a request; the returned receiver resolves with the acknowledgement
    pub fn emit_request(&self, event: &str, args: Vec<Value>) -> Result<oneshot::Receiver<Result<Ack>>> {
        let outbound = self.inner.outbound.lock();
        let sender = outbound.as_ref().ok_or_else(|| {
            Error::Disconnected("signaling channel is not connected".to_string())
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        let frame = WireFrame::Request {
            id,
            event: event.to_string(),
            args,
        };

        if sender.send(frame).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(Error::Disconnected(
                "signaling channel closed while sending".to_string(),
            ));
        }

        debug!("Sent request {} (id={})", event, id);
        Ok(rx)
    }

    /// Send an event that expects no acknowledgement
    pub fn notify(&self, event: &str, args: Vec<Value>) -> Result<()> {
        let outbound = self.inner.outbound.lock();
        let sender = outbound.as_ref().ok_or_else(|| {
            Error::Disconnected("signaling channel is not connected".to_string())
        })?;

        sender
            .send(WireFrame::Event {
                event: event.to_string(),
                args,
            })
            .map_err(|_| Error::Disconnected("signaling channel closed while sending".to_string()))
    }

    /// Tear the transport down and stop reconnecting
    ///
    /// With `client_initiated` a final `Disconnect` event is reported;
    /// otherwise teardown is silent. Pending requests fail with `Disconnected`.
    pub fn disconnect(&self, client_initiated: bool) {
        let requested = self.inner.shutdown.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(client_initiated);
                true
            } else {
                false
            }
        });

        if requested {
            debug!(
                "Signaling transport teardown requested (client_initiated={})",
                client_initiated
            );
        }
    }

    /// Number of requests still waiting for an acknowledgement
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Whether a channel is currently open
    pub fn is_live(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }

    /// Client id to present on reconnection attempts
    pub fn set_client_id(&self, client_id: Option<String>) {
        *self.inner.client_id.lock() = client_id;
    }
}

impl TransportInner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.borrow().is_some()
    }

    #[instrument(skip(self, target), fields(url = %target.url))]
    async fn run(self: Arc<Self>, target: ConnectTarget) {
        let mut shutdown = self.shutdown.subscribe();

        let mut next = if self.shutdown_requested() {
            None
        } else {
            let opened = tokio::select! {
                opened = self.connector.open(&target) => Some(opened),
                _ = wait_shutdown(&mut shutdown) => None,
            };

            match opened {
                Some(Ok(channel)) => Some(channel),
                Some(Err(e)) => {
                    warn!("Failed to open signaling channel: {}", e);
                    self.emit(TransportEvent::ConnectError(e.to_string()));
                    self.reconnect(&target, &mut shutdown).await
                }
                None => None,
            }
        };

        while let Some(channel) = next.take() {
            match self.pump(channel, &mut shutdown).await {
                PumpExit::Shutdown => break,
                PumpExit::Closed(reason) => {
                    let pending = self.pending.lock().len();
                    info!(
                        "Signaling channel closed: reason={}, pending={}",
                        reason, pending
                    );
                    self.emit(TransportEvent::Disconnect { reason, pending });
                    next = self.reconnect(&target, &mut shutdown).await;
                }
            }
        }

        self.finish();
    }

    async fn pump(
        &self,
        channel: Channel,
        shutdown: &mut watch::Receiver<Option<bool>>,
    ) -> PumpExit {
        let Channel {
            outbound,
            mut inbound,
        } = channel;

        *self.outbound.lock() = Some(outbound);
        self.emit(TransportEvent::Connect);

        let exit = loop {
            if self.shutdown_requested() {
                break PumpExit::Shutdown;
            }

            tokio::select! {
                _ = wait_shutdown(shutdown) => break PumpExit::Shutdown,
                event = inbound.recv() => match event {
                    Some(ChannelEvent::Frame(frame)) => self.dispatch(frame),
                    Some(ChannelEvent::Closed(reason)) => break PumpExit::Closed(reason),
                    None => break PumpExit::Closed("transport close".to_string()),
                },
            }
        };

        self.outbound.lock().take();
        exit
    }

    fn dispatch(&self, frame: WireFrame) {
        match frame {
            WireFrame::Response { id, args } => match self.pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(Ok(Ack(args)));
                }
                None => debug!("Acknowledgement for unknown request id {}", id),
            },
            WireFrame::Event { event, args } if event == super::protocol::events::ERROR => {
                let message = match args.into_iter().next() {
                    Some(Value::String(s)) => s,
                    Some(Value::Object(map)) => map
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| Value::Object(map).to_string()),
                    Some(other) => other.to_string(),
                    None => "unknown error".to_string(),
                };
                self.emit(TransportEvent::Error(message));
            }
            WireFrame::Event { event, args } => {
                self.emit(TransportEvent::Message { event, args });
            }
            WireFrame::Request { id, event, .. } => {
                warn!("Ignoring server request {} (id={})", event, id);
            }
        }
    }

    async fn reconnect(
        &self,
        target: &ConnectTarget,
        shutdown: &mut watch::Receiver<Option<bool>>,
    ) -> Option<Channel> {
        let mut attempt = 0;

        while self.policy.should_retry(attempt) {
            let delay = self.policy.calculate_backoff(attempt);
            attempt += 1;

            debug!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, self.policy.max_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_shutdown(shutdown) => return None,
            }

            self.emit(TransportEvent::ReconnectAttempt(attempt));

            let resume = self.resume_target(target);
            let opened = tokio::select! {
                opened = self.connector.open(&resume) => opened,
                _ = wait_shutdown(shutdown) => return None,
            };

            match opened {
                Ok(channel) => {
                    info!("Signaling channel re-established after {} attempt(s)", attempt);
                    self.emit(TransportEvent::Reconnect(attempt));
                    return Some(channel);
                }
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", attempt, e);
                    self.emit(TransportEvent::ReconnectError {
                        attempt,
                        error: e.to_string(),
                    });
                }
            }
        }

        warn!("Giving up on signaling after {} attempt(s)", attempt);
        self.emit(TransportEvent::ReconnectFailed);
        None
    }

    fn resume_target(&self, target: &ConnectTarget) -> ConnectTarget {
        let mut resume = target.clone();
        if let Some(client_id) = self.client_id.lock().clone() {
            resume.query.insert("clientId".to_string(), client_id);
        }
        resume
    }

    fn finish(&self) {
        self.outbound.lock().take();

        let pending: Vec<(u64, PendingAck)> = self.pending.lock().drain().collect();
        let count = pending.len();
        for (id, tx) in pending {
            debug!("Failing pending request {} on teardown", id);
            let _ = tx.send(Err(Error::Disconnected(
                "signaling channel closed".to_string(),
            )));
        }

        let client_initiated = matches!(*self.shutdown.borrow(), Some(true));
        if client_initiated {
            self.emit(TransportEvent::Disconnect {
                reason: CLIENT_DISCONNECT_REASON.to_string(),
                pending: count,
            });
        }

        debug!("Signaling transport stopped");
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<Option<bool>>) {
    let _ = shutdown.wait_for(|state| state.is_some()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    /// Connector that hands the server side of each channel to the test
    struct LoopbackConnector {
        servers: mpsc::UnboundedSender<(ConnectTarget, mpsc::UnboundedReceiver<WireFrame>, mpsc::UnboundedSender<ChannelEvent>)>,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn open(&self, target: &ConnectTarget) -> Result<Channel> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::WebSocketError("connection refused".to_string()));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let _ = self.servers.send((target.clone(), out_rx, in_tx));
            Ok(Channel {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event channel closed")
    }

    #[tokio::test]
    async fn test_request_acknowledged() {
        let (servers, mut server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(LoopbackConnector {
            servers,
            refuse: AtomicBool::new(false),
        });
        let (transport, mut events) = ReliableTransport::new(connector, ReconnectionPolicy::default());

        assert!(transport.send("publish", vec![]).await.is_err());

        transport.connect(ConnectTarget::new("ws://localhost:1")).unwrap();
        assert!(transport.connect(ConnectTarget::new("ws://localhost:1")).is_err());
        assert_eq!(next_event(&mut events).await, TransportEvent::Connect);

        let (_, mut from_client, to_client) = server_rx.recv().await.unwrap();

        let sender = transport.clone();
        let request = tokio::spawn(async move { sender.send("publish", vec![json!({"a": 1})]).await });

        let frame = from_client.recv().await.unwrap();
        let id = match frame {
            WireFrame::Request { id, event, .. } => {
                assert_eq!(event, "publish");
                id
            }
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(transport.pending_count(), 1);

        to_client
            .send(ChannelEvent::Frame(WireFrame::Response {
                id,
                args: vec![json!("stream-1")],
            }))
            .unwrap();

        let ack = request.await.unwrap().unwrap();
        assert_eq!(ack.string_at(0).as_deref(), Some("stream-1"));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_and_push_events() {
        let (servers, mut server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(LoopbackConnector {
            servers,
            refuse: AtomicBool::new(false),
        });
        let (transport, mut events) = ReliableTransport::new(connector, ReconnectionPolicy::default());
        transport.connect(ConnectTarget::new("ws://localhost:1")).unwrap();
        assert_eq!(next_event(&mut events).await, TransportEvent::Connect);

        let (_, _from_client, to_client) = server_rx.recv().await.unwrap();
        to_client
            .send(ChannelEvent::Frame(WireFrame::Event {
                event: "error".to_string(),
                args: vec![json!("token: expired")],
            }))
            .unwrap();
        to_client
            .send(ChannelEvent::Frame(WireFrame::Event {
                event: "onAddStream".to_string(),
                args: vec![json!({"id": 1})],
            }))
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Error("token: expired".to_string())
        );
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Message { ref event, .. } if event == "onAddStream"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_presents_client_id() {
        let (servers, mut server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(LoopbackConnector {
            servers,
            refuse: AtomicBool::new(false),
        });
        let (transport, mut events) = ReliableTransport::new(connector, ReconnectionPolicy::default());
        transport.connect(ConnectTarget::new("ws://localhost:1")).unwrap();
        assert_eq!(next_event(&mut events).await, TransportEvent::Connect);
        transport.set_client_id(Some("client-7".to_string()));

        let (first_target, _from_client, to_client) = server_rx.recv().await.unwrap();
        assert!(!first_target.query.contains_key("clientId"));

        to_client
            .send(ChannelEvent::Closed("ping timeout".to_string()))
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Disconnect {
                reason: "ping timeout".to_string(),
                pending: 0
            }
        );
        assert_eq!(next_event(&mut events).await, TransportEvent::ReconnectAttempt(1));
        assert_eq!(next_event(&mut events).await, TransportEvent::Reconnect(1));
        assert_eq!(next_event(&mut events).await, TransportEvent::Connect);

        let (second_target, _, _) = server_rx.recv().await.unwrap();
        assert_eq!(
            second_target.query.get("clientId").map(String::as_str),
            Some("client-7")
        );
    }

    #[tokio::test]
    async fn test_client_disconnect_fails_pending() {
        let (servers, mut server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(LoopbackConnector {
            servers,
            refuse: AtomicBool::new(false),
        });
        let (transport, mut events) = ReliableTransport::new(connector, ReconnectionPolicy::default());
        transport.connect(ConnectTarget::new("ws://localhost:1")).unwrap();
        assert_eq!(next_event(&mut events).await, TransportEvent::Connect);
        let (_, mut from_client, _to_client) = server_rx.recv().await.unwrap();

        let sender = transport.clone();
        let request = tokio::spawn(async move { sender.send("unpublish", vec![json!("1")]).await });
        from_client.recv().await.unwrap();

        transport.disconnect(true);

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Disconnect {
                reason: CLIENT_DISCONNECT_REASON.to_string(),
                pending: 1
            }
        );
        assert!(matches!(request.await.unwrap(), Err(Error::Disconnected(_))));
        assert!(!transport.is_live());
    }

    #[test]
    fn test_connect_target_url() {
        let mut target = ConnectTarget::new("wss://rooms.example.com:443");
        target.query.insert("tokenId".to_string(), "abc".to_string());
        target.query.insert("singlePC".to_string(), "true".to_string());
        let url = target.to_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.query(), Some("singlePC=true&tokenId=abc"));

        assert!(ConnectTarget::new("not a url").to_url().is_err());
    }
}
