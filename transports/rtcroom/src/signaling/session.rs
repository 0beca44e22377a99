//! Signaling session lifecycle
//!
//! Wraps a [`ReliableTransport`] and owns the three-state session lifecycle.
//! Raw transport events are fed through [`SignalingSession::handle_transport_event`]
//! by the owner's event loop, which keeps every state change inside a single
//! reaction.

use super::backoff::ReconnectionPolicy;
use super::protocol::{events, sdp_envelope, Ack, RoomDescription, ServerPush};
use super::transport::{ConnectTarget, Connector, ReliableTransport, TransportEvent};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Error prefix the server uses for credential problems
const TOKEN_ERROR_PREFIX: &str = "token: ";

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Application-level signaling event
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Handshake completed
    Connected(RoomDescription),
    /// Server refused the token; the session is terminally disconnected
    AuthenticationFailed(String),
    /// Channel lost; carries reason and pending-message count
    Reconnecting(String),
    /// Channel restored after a loss
    Reconnected,
    /// Session ended
    Disconnected(String),
    /// Non-fatal server error
    Error(String),
    /// Decoded server push
    Push(ServerPush),
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    client_id: Option<String>,
    client_initiated: bool,
    page_unloaded: bool,
}

/// Signaling session over a reliable transport
#[derive(Clone)]
pub struct SignalingSession {
    transport: ReliableTransport,
    inner: Arc<Mutex<SessionInner>>,
}

impl SignalingSession {
    /// Create a session and the receiver of its raw transport events
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectionPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport, events) = ReliableTransport::new(connector, policy);

        let session = Self {
            transport,
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                client_id: None,
                client_initiated: false,
                page_unloaded: false,
            })),
        };

        (session, events)
    }

    /// Open the signaling channel; the handshake arrives as [`SignalingEvent::Connected`]
    pub fn connect(&self, target: ConnectTarget) -> Result<()> {
        info!("Connecting signaling session to {}", target.url);
        self.transport.connect(target)
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Client id echoed by the server in the handshake
    pub fn client_id(&self) -> Option<String> {
        self.inner.lock().client_id.clone()
    }

    /// Outstanding unacknowledged requests
    pub fn pending_count(&self) -> usize {
        self.transport.pending_count()
    }

    /// Translate a transport event into a signaling event, updating state
    pub fn handle_transport_event(&self, event: TransportEvent) -> Option<SignalingEvent> {
        match event {
            TransportEvent::Message { event, args } => self.handle_message(&event, args),

            TransportEvent::Connect => {
                let mut inner = self.inner.lock();
                debug!(
                    "Transport connected, previousState: {}, id: {:?}",
                    inner.state, inner.client_id
                );
                if inner.state == SessionState::Reconnecting {
                    info!("Signaling reconnected, id: {:?}", inner.client_id);
                    inner.state = SessionState::Connected;
                    return Some(SignalingEvent::Reconnected);
                }
                None
            }

            TransportEvent::Error(message) => self.handle_error(message),

            TransportEvent::Disconnect { reason, pending } => {
                let mut inner = self.inner.lock();
                info!(
                    "Signaling disconnect, id: {:?}, reason: {}, pending: {}",
                    inner.client_id, reason, pending
                );

                if inner.client_initiated {
                    inner.state = SessionState::Disconnected;
                    if inner.page_unloaded {
                        return None;
                    }
                    return Some(SignalingEvent::Disconnected(reason));
                }

                if inner.state == SessionState::Disconnected {
                    debug!("Ignoring transport disconnect on a disconnected session");
                    return None;
                }

                inner.state = SessionState::Reconnecting;
                Some(SignalingEvent::Reconnecting(format!(
                    "reason: {}, pendingMessages: {}",
                    reason, pending
                )))
            }

            TransportEvent::ConnectError(error) => {
                warn!("Signaling connect error: {}", error);
                None
            }

            TransportEvent::ReconnectAttempt(attempt) => {
                debug!(
                    "Signaling reconnect attempt {}, id: {:?}",
                    attempt,
                    self.client_id()
                );
                None
            }

            TransportEvent::Reconnect(attempt) => {
                info!("Signaling channel re-established on attempt {}", attempt);
                None
            }

            TransportEvent::ReconnectError { attempt, error } => {
                info!("Signaling reconnect attempt {} failed: {}", attempt, error);
                None
            }

            TransportEvent::ReconnectFailed => {
                info!("Signaling reconnect failed, id: {:?}", self.client_id());
                self.inner.lock().state = SessionState::Disconnected;
                self.transport.disconnect(false);
                Some(SignalingEvent::Disconnected("reconnect failed".to_string()))
            }
        }
    }

    fn handle_message(&self, event: &str, args: Vec<Value>) -> Option<SignalingEvent> {
        if event == events::CONNECTED {
            let description = match args.into_iter().next() {
                Some(Value::Object(map)) => {
                    match serde_json::from_value::<RoomDescription>(Value::Object(map)) {
                        Ok(description) => description,
                        Err(e) => {
                            warn!("Invalid handshake payload: {}", e);
                            return Some(SignalingEvent::Error(format!(
                                "Invalid handshake payload: {}",
                                e
                            )));
                        }
                    }
                }
                _ => RoomDescription::default(),
            };

            let mut inner = self.inner.lock();
            info!(
                "Signaling handshake completed, previousState: {}, id: {:?}",
                inner.state, description.client_id
            );
            inner.state = SessionState::Connected;
            inner.client_id = description.client_id.clone();
            drop(inner);

            self.transport.set_client_id(description.client_id.clone());
            return Some(SignalingEvent::Connected(description));
        }

        match ServerPush::parse(event, args) {
            Ok(Some(push)) => {
                if let ServerPush::ConnectionFailed(failure) = &push {
                    warn!(
                        "Connection failed, id: {:?}, type: {}, streamId: {:?}",
                        self.client_id(),
                        failure.kind,
                        failure.stream_id
                    );
                }
                Some(SignalingEvent::Push(push))
            }
            Ok(None) => {
                debug!("Ignoring unknown server event: {}", event);
                None
            }
            Err(e) => {
                warn!("Failed to decode server event {}: {}", event, e);
                None
            }
        }
    }

    fn handle_error(&self, message: String) -> Option<SignalingEvent> {
        let mut inner = self.inner.lock();
        warn!(
            "Signaling error, id: {:?}, state: {}, error: {}",
            inner.client_id, inner.state, message
        );

        if let Some(reason) = message.strip_prefix(TOKEN_ERROR_PREFIX) {
            inner.state = SessionState::Disconnected;
            drop(inner);
            self.transport.disconnect(false);
            return Some(SignalingEvent::AuthenticationFailed(reason.to_string()));
        }

        match inner.state {
            SessionState::Reconnecting => {
                inner.state = SessionState::Disconnected;
                drop(inner);
                self.transport.disconnect(false);
                Some(SignalingEvent::Disconnected(message))
            }
            SessionState::Disconnected => {
                drop(inner);
                self.transport.disconnect(false);
                None
            }
            SessionState::Connected => Some(SignalingEvent::Error(message)),
        }
    }

    /// Send a message request and apply the message ack convention
    pub async fn send_message(&self, event: &str, msg: Value) -> Result<Ack> {
        self.ensure_usable(event)?;
        let ack = self.transport.send(event, vec![msg]).await?;
        ack.into_message_result()
    }

    /// Send a message without waiting for its acknowledgement
    pub fn relay_message(&self, event: &str, msg: Value) -> Result<()> {
        self.ensure_usable(event)?;
        // Acks of relayed messages carry nothing of interest
        let _ack = self.transport.emit_request(event, vec![msg])?;
        Ok(())
    }

    /// Send an `{options, sdp}` request and return the raw ack arguments
    pub async fn send_sdp<T: Serialize>(
        &self,
        event: &str,
        options: &T,
        sdp: Option<&str>,
    ) -> Result<Ack> {
        if self.state() == SessionState::Disconnected {
            warn!(
                "Trying to send {} over a disconnected session, id: {:?}",
                event,
                self.client_id()
            );
            return Err(Error::Disconnected(format!(
                "cannot send {} while disconnected",
                event
            )));
        }

        let args = sdp_envelope(options, sdp)?;
        self.transport.send(event, args).await
    }

    /// Send an `{options, sdp}` request without waiting for its acknowledgement
    pub fn relay_sdp<T: Serialize>(&self, event: &str, options: &T, sdp: Option<&str>) -> Result<()> {
        self.ensure_usable(event)?;
        let args = sdp_envelope(options, sdp)?;
        let _ack = self.transport.emit_request(event, args)?;
        Ok(())
    }

    fn ensure_usable(&self, event: &str) -> Result<()> {
        if self.state() == SessionState::Disconnected {
            debug!(
                "Trying to send a message over a disconnected session, id: {:?}, type: {}",
                self.client_id(),
                event
            );
            return Err(Error::Disconnected(format!(
                "cannot send {} while disconnected",
                event
            )));
        }
        Ok(())
    }

    /// End the session
    ///
    /// A client-initiated disconnect tells the server first and reports a
    /// final [`SignalingEvent::Disconnected`] unless the page is unloading.
    pub fn disconnect(&self, client_initiated: bool) {
        let mut inner = self.inner.lock();
        warn!(
            "Signaling disconnect, id: {:?}, clientInitiated: {}, state: {}",
            inner.client_id, client_initiated, inner.state
        );
        inner.state = SessionState::Disconnected;
        inner.client_initiated = client_initiated;
        drop(inner);

        if client_initiated {
            if let Err(e) = self.transport.notify(events::CLIENT_DISCONNECTION, vec![]) {
                debug!("Could not notify client disconnection: {}", e);
            }
        }
        self.transport.disconnect(client_initiated);
    }

    /// Page is going away: disconnect quietly
    pub fn on_before_unload(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Disconnected {
            return;
        }
        inner.page_unloaded = true;
        drop(inner);
        self.disconnect(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::transport::Channel;
    use async_trait::async_trait;
    use serde_json::json;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn open(&self, _target: &ConnectTarget) -> Result<Channel> {
            Err(Error::WebSocketError("refused".to_string()))
        }
    }

    fn session() -> SignalingSession {
        let (session, _events) =
            SignalingSession::new(Arc::new(RefusingConnector), ReconnectionPolicy::default());
        session
    }

    fn handshake(session: &SignalingSession) {
        let event = session.handle_transport_event(TransportEvent::Message {
            event: "connected".to_string(),
            args: vec![json!({"clientId": "c-1", "id": "room", "streams": []})],
        });
        assert!(matches!(event, Some(SignalingEvent::Connected(_))));
    }

    #[test]
    fn test_handshake_sets_connected() {
        let session = session();
        assert_eq!(session.state(), SessionState::Disconnected);

        assert_eq!(session.handle_transport_event(TransportEvent::Connect), None);
        assert_eq!(session.state(), SessionState::Disconnected);

        handshake(&session);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.client_id().as_deref(), Some("c-1"));
    }

    #[test]
    fn test_reconnecting_then_reconnected() {
        let session = session();
        handshake(&session);

        let event = session.handle_transport_event(TransportEvent::Disconnect {
            reason: "ping timeout".to_string(),
            pending: 2,
        });
        assert_eq!(
            event,
            Some(SignalingEvent::Reconnecting(
                "reason: ping timeout, pendingMessages: 2".to_string()
            ))
        );
        assert_eq!(session.state(), SessionState::Reconnecting);

        assert_eq!(
            session.handle_transport_event(TransportEvent::Connect),
            Some(SignalingEvent::Reconnected)
        );
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_reconnect_failed_is_terminal() {
        let session = session();
        handshake(&session);
        session.handle_transport_event(TransportEvent::Disconnect {
            reason: "transport close".to_string(),
            pending: 0,
        });

        assert_eq!(
            session.handle_transport_event(TransportEvent::ReconnectFailed),
            Some(SignalingEvent::Disconnected("reconnect failed".to_string()))
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_token_error_short_circuits() {
        let session = session();
        handshake(&session);

        assert_eq!(
            session.handle_transport_event(TransportEvent::Error("token: expired".to_string())),
            Some(SignalingEvent::AuthenticationFailed("expired".to_string()))
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_error_by_state() {
        let session = session();
        handshake(&session);
        assert_eq!(
            session.handle_transport_event(TransportEvent::Error("boom".to_string())),
            Some(SignalingEvent::Error("boom".to_string()))
        );

        session.handle_transport_event(TransportEvent::Disconnect {
            reason: "transport close".to_string(),
            pending: 0,
        });
        assert_eq!(
            session.handle_transport_event(TransportEvent::Error("boom".to_string())),
            Some(SignalingEvent::Disconnected("boom".to_string()))
        );

        // swallowed once disconnected
        assert_eq!(
            session.handle_transport_event(TransportEvent::Error("late".to_string())),
            None
        );
    }

    #[test]
    fn test_client_disconnect_reports_once() {
        let session = session();
        handshake(&session);
        session.disconnect(true);
        assert_eq!(session.state(), SessionState::Disconnected);

        assert_eq!(
            session.handle_transport_event(TransportEvent::Disconnect {
                reason: "io client disconnect".to_string(),
                pending: 0,
            }),
            Some(SignalingEvent::Disconnected("io client disconnect".to_string()))
        );
    }

    #[test]
    fn test_unload_suppresses_disconnect_event() {
        let session = session();
        handshake(&session);
        session.on_before_unload();

        assert_eq!(
            session.handle_transport_event(TransportEvent::Disconnect {
                reason: "io client disconnect".to_string(),
                pending: 0,
            }),
            None
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_push_decoding() {
        let session = session();
        handshake(&session);

        let event = session.handle_transport_event(TransportEvent::Message {
            event: "onRemoveStream".to_string(),
            args: vec![json!({"id": 77})],
        });
        assert_eq!(
            event,
            Some(SignalingEvent::Push(ServerPush::RemoveStream {
                id: "77".to_string()
            }))
        );

        let unknown = session.handle_transport_event(TransportEvent::Message {
            event: "something_else".to_string(),
            args: vec![],
        });
        assert_eq!(unknown, None);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let session = session();
        let result = session.send_message("sendDataStream", json!({})).await;
        assert!(matches!(result, Err(Error::Disconnected(_))));

        let result = session.send_sdp("publish", &json!({}), None).await;
        assert!(matches!(result, Err(Error::Disconnected(_))));
    }
}
