//! One negotiated transport session
//!
//! A [`Connection`] wraps a [`MediaStack`] and carries 0..N attached streams.
//! Every stack operation runs as a [`NegotiationFsm`] transition. Offers,
//! answers and other negotiation steps go through one ordered queue; ICE
//! candidates and media attach/detach go through a second queue that never
//! waits for a negotiation in flight. Stack events are translated into
//! [`ConnectionEvent`]s for the room.

use super::fsm::{NegotiationFsm, Transition};
use super::quality::QualityLevel;
use super::stack::{
    EncodingParameters, IceConnectionState, MediaStack, StackEvent, StackFactory, StackSpec,
};
use crate::media::MediaHandle;
use crate::signaling::protocol::SignalingMessage;
use crate::Result;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Message carried by a `failed` signaling message from the media server
pub const SERVER_ICE_FAILURE: &str = "Ice Connection failure detected in server";

/// Configuration keys the media server applies through `updatestream`
const UPDATESTREAM_KEYS: &[&str] = &[
    "maxVideoBW",
    "minVideoBW",
    "slideShowMode",
    "slideShowBelowLayer",
    "muteStream",
    "qualityLayer",
    "video",
    "priorityLevel",
];

/// Where a connection's signaling goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRoute {
    /// Through the media server
    MediaServer {
        connection_id: String,
        erizo_id: Option<String>,
    },
    /// Directly to one peer, relayed by the controller
    PeerToPeer {
        stream_id: String,
        peer_socket: String,
    },
}

impl ConnectionRoute {
    pub fn is_p2p(&self) -> bool {
        matches!(self, ConnectionRoute::PeerToPeer { .. })
    }
}

/// Parameters a connection is built with
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub stack: StackSpec,
    pub route: ConnectionRoute,
    pub disable_ice_restart: bool,
}

/// A stream attached to a connection
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedStream {
    pub id: String,
    pub label: String,
    /// Present for local streams whose media this connection sends
    pub local_media: Option<MediaHandle>,
    pub encodings: Vec<EncodingParameters>,
}

/// Event raised by a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub session_id: u64,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEventKind {
    /// Remote media with this label arrived
    StreamAdded { label: String },
    /// Remote media with this label went away
    StreamRemoved { label: String },
    /// ICE state change that was not absorbed by an ICE restart
    IceStateChanged {
        state: IceConnectionState,
        was_able_to_connect: bool,
    },
    /// Terminal failure, raised at most once
    ConnectionFailed { message: String },
    /// Signaling to deliver to the remote side; `stream_id` is set for
    /// stream-level messages
    Outbound {
        msg: SignalingMessage,
        stream_id: Option<String>,
    },
}

#[derive(Debug)]
enum Command {
    AttachMedia {
        media: MediaHandle,
        encodings: Vec<EncodingParameters>,
    },
    DetachMedia(MediaHandle),
    Signaling(SignalingMessage),
    CreateOffer {
        is_subscribe: bool,
    },
    UpdateSpec {
        config: Value,
        stream_id: Option<String>,
    },
    RestartIce,
}

impl Command {
    /// Whether the command runs in the negotiation queue
    fn is_negotiation(&self) -> bool {
        !matches!(
            self,
            Command::AttachMedia { .. }
                | Command::DetachMedia(_)
                | Command::Signaling(SignalingMessage::Candidate { .. })
        )
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    quality: QualityLevel,
    was_able_to_connect: bool,
    streams: HashMap<String, AttachedStream>,
    failure_reported: bool,
    closed: bool,
}

/// One negotiated transport session
pub struct Connection {
    session_id: u64,
    route: ConnectionRoute,
    disable_ice_restart: bool,
    p2p: bool,
    fsm: NegotiationFsm,
    stack: Arc<dyn MediaStack>,
    state: Mutex<ConnectionState>,
    negotiations: mpsc::UnboundedSender<Command>,
    operations: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .field("route", &self.route)
            .field("fsm_state", &self.fsm.state())
            .finish()
    }
}

impl Connection {
    /// Build the stack and start the connection's workers
    pub async fn new(
        session_id: u64,
        mut spec: ConnectionSpec,
        factory: &dyn StackFactory,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<Self>> {
        spec.stack.session_id = session_id;
        let (stack_tx, stack_rx) = mpsc::unbounded_channel();
        let stack = factory.build(&spec.stack, stack_tx).await?;
        let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();
        let (operation_tx, operation_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            session_id,
            p2p: spec.stack.p2p || spec.route.is_p2p(),
            route: spec.route,
            disable_ice_restart: spec.disable_ice_restart,
            fsm: NegotiationFsm::new(session_id),
            stack,
            state: Mutex::new(ConnectionState::default()),
            negotiations: negotiation_tx,
            operations: operation_tx,
            events,
        });

        tokio::spawn(command_worker(Arc::downgrade(&connection), negotiation_rx));
        tokio::spawn(command_worker(Arc::downgrade(&connection), operation_rx));
        tokio::spawn(stack_event_pump(Arc::downgrade(&connection), stack_rx));

        info!(
            "Connection created, sessionId: {}, route: {:?}",
            session_id, connection.route
        );
        Ok(connection)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn route(&self) -> &ConnectionRoute {
        &self.route
    }

    pub fn is_p2p(&self) -> bool {
        self.p2p
    }

    /// Server-assigned connection id (media-server connections)
    pub fn connection_id(&self) -> Option<&str> {
        match &self.route {
            ConnectionRoute::MediaServer { connection_id, .. } => Some(connection_id),
            ConnectionRoute::PeerToPeer { .. } => None,
        }
    }

    pub fn erizo_id(&self) -> Option<&str> {
        match &self.route {
            ConnectionRoute::MediaServer { erizo_id, .. } => erizo_id.as_deref(),
            ConnectionRoute::PeerToPeer { .. } => None,
        }
    }

    /// Negotiation state machine, for inspection
    pub fn fsm(&self) -> &NegotiationFsm {
        &self.fsm
    }

    pub fn was_able_to_connect(&self) -> bool {
        self.state.lock().was_able_to_connect
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.state.lock().streams.contains_key(stream_id)
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.state.lock().streams.keys().cloned().collect()
    }

    /// Register a stream; local media starts being sent
    pub fn add_stream(&self, stream: AttachedStream) {
        let mut state = self.state.lock();
        if state.closed {
            debug!(
                "Ignoring stream {} on closed connection {}",
                stream.id, self.session_id
            );
            return;
        }
        debug!(
            "Adding stream, sessionId: {}, streamId: {}, local: {}",
            self.session_id,
            stream.id,
            stream.local_media.is_some()
        );
        if let Some(media) = &stream.local_media {
            self.enqueue(Command::AttachMedia {
                media: media.clone(),
                encodings: stream.encodings.clone(),
            });
        }
        state.streams.insert(stream.id.clone(), stream);
    }

    /// Unregister a stream
    ///
    /// Local media is detached. Removing the last remote stream reports
    /// its label as removed. Returns `false` when the stream was not attached.
    pub fn remove_stream(&self, stream_id: &str) -> bool {
        let (removed, now_empty) = {
            let mut state = self.state.lock();
            let removed = state.streams.remove(stream_id);
            (removed, state.streams.is_empty())
        };

        let Some(stream) = removed else {
            debug!(
                "Cannot remove stream not in connection, sessionId: {}, streamId: {}",
                self.session_id, stream_id
            );
            return false;
        };

        debug!(
            "Removing stream, sessionId: {}, streamId: {}",
            self.session_id, stream_id
        );
        match stream.local_media {
            Some(media) => self.enqueue(Command::DetachMedia(media)),
            None if now_empty => self.emit(ConnectionEventKind::StreamRemoved {
                label: stream.label,
            }),
            None => {}
        }
        true
    }

    /// Feed a signaling message received for this connection
    pub fn process_signaling_message(&self, msg: SignalingMessage) {
        if msg == SignalingMessage::Failed {
            self.on_connection_failed(SERVER_ICE_FAILURE);
            return;
        }
        self.enqueue(Command::Signaling(msg));
    }

    /// Start a local negotiation
    pub fn create_offer(&self, is_subscribe: bool) {
        self.enqueue(Command::CreateOffer { is_subscribe });
    }

    /// Apply a configuration change
    ///
    /// Peer-to-peer connections renegotiate bandwidth locally, media-server
    /// connections forward it as `updatestream` for `stream_id`.
    pub fn update_spec(&self, config: Value, stream_id: Option<String>) {
        self.enqueue(Command::UpdateSpec { config, stream_id });
    }

    pub fn set_quality_level(&self, level: QualityLevel) {
        let mut state = self.state.lock();
        if state.quality != level {
            debug!(
                "Quality level changed, sessionId: {}, level: {}",
                self.session_id, level
            );
        }
        state.quality = level;
    }

    pub fn quality_level(&self) -> QualityLevel {
        self.state.lock().quality
    }

    /// Raise the terminal failure event; later calls are ignored
    pub fn on_connection_failed(&self, message: &str) {
        {
            let mut state = self.state.lock();
            if state.failure_reported || state.closed {
                debug!(
                    "Connection failure already handled, sessionId: {}, message: {}",
                    self.session_id, message
                );
                return;
            }
            state.failure_reported = true;
        }
        warn!(
            "Connection failed, sessionId: {}, message: {}",
            self.session_id, message
        );
        self.emit(ConnectionEventKind::ConnectionFailed {
            message: message.to_string(),
        });
    }

    /// Close the connection and release the stack
    ///
    /// Accepted even while a negotiation is in flight; its result is
    /// discarded when it settles.
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.streams.clear();
        }

        if self.fsm.close() {
            info!("Closing connection, sessionId: {}", self.session_id);
            let stack = Arc::clone(&self.stack);
            let session_id = self.session_id;
            tokio::spawn(async move {
                if let Err(e) = stack.close().await {
                    warn!("Failed to close stack, sessionId: {}: {}", session_id, e);
                }
            });
        }
    }

    fn enqueue(&self, command: Command) {
        let queue = if command.is_negotiation() {
            &self.negotiations
        } else {
            &self.operations
        };
        if queue.send(command).is_err() {
            debug!("Command queue closed, sessionId: {}", self.session_id);
        }
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent {
            session_id: self.session_id,
            kind,
        });
    }

    fn send_outbound(&self, msg: SignalingMessage, stream_id: Option<String>) {
        self.emit(ConnectionEventKind::Outbound { msg, stream_id });
    }

    async fn execute(&self, command: Command) {
        let result = match command {
            Command::AttachMedia { media, encodings } => self.attach_media(media, encodings).await,
            Command::DetachMedia(media) => self
                .fsm
                .apply(
                    Transition::RemoveStream,
                    self.stack.detach_local_media(&media),
                )
                .await
                .map(|_| ()),
            Command::Signaling(msg) => self.handle_signaling(msg).await,
            Command::CreateOffer { is_subscribe } => self.negotiate_offer(is_subscribe).await,
            Command::UpdateSpec { config, stream_id } => {
                self.apply_update_spec(config, stream_id).await
            }
            Command::RestartIce => self.restart_ice().await,
        };

        if let Err(e) = result {
            warn!("Connection operation failed, sessionId: {}: {}", self.session_id, e);
        }
    }

    async fn attach_media(
        &self,
        media: MediaHandle,
        encodings: Vec<EncodingParameters>,
    ) -> Result<()> {
        let attached = self
            .fsm
            .apply(
                Transition::AddStream,
                self.stack.attach_local_media(&media, &encodings),
            )
            .await?;
        if attached.is_some() {
            self.enqueue(Command::CreateOffer {
                is_subscribe: false,
            });
        }
        Ok(())
    }

    async fn negotiate_offer(&self, is_subscribe: bool) -> Result<()> {
        if let Some(sdp) = self
            .fsm
            .apply(Transition::CreateOffer, self.stack.create_offer(is_subscribe))
            .await?
        {
            self.send_outbound(SignalingMessage::Offer { sdp }, None);
        }
        Ok(())
    }

    async fn restart_ice(&self) -> Result<()> {
        info!("Restarting ICE, sessionId: {}", self.session_id);
        if let Some(sdp) = self
            .fsm
            .apply(Transition::CreateOffer, self.stack.restart_ice())
            .await?
        {
            self.send_outbound(SignalingMessage::Offer { sdp }, None);
        }
        Ok(())
    }

    async fn handle_signaling(&self, msg: SignalingMessage) -> Result<()> {
        match msg {
            SignalingMessage::Offer { sdp } => {
                match self
                    .fsm
                    .apply(Transition::ProcessOffer, self.stack.process_offer(&sdp))
                    .await
                {
                    Ok(Some(answer)) => {
                        self.send_outbound(SignalingMessage::Answer { sdp: answer }, None);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => {
                        self.send_outbound(SignalingMessage::OfferError { sdp: None }, None);
                        Err(e)
                    }
                }
            }
            SignalingMessage::Answer { sdp } => self
                .fsm
                .apply(Transition::ProcessAnswer, self.stack.process_answer(&sdp))
                .await
                .map(|_| ()),
            SignalingMessage::Candidate { candidate } => {
                if candidate.is_end() {
                    debug!("Remote end of candidates, sessionId: {}", self.session_id);
                    return Ok(());
                }
                let candidate = candidate.without_attribute_prefix();
                self.fsm
                    .apply(
                        Transition::AddIceCandidate,
                        self.stack.add_ice_candidate(&candidate),
                    )
                    .await
                    .map(|_| ())
            }
            SignalingMessage::Error { previous_type } => {
                error!(
                    "Received error signaling message, sessionId: {}, state: {}, previousType: {:?}",
                    self.session_id,
                    self.fsm.state(),
                    previous_type
                );
                Ok(())
            }
            SignalingMessage::QualityLevel { level } => {
                match QualityLevel::from_index(level) {
                    Some(level) => self.set_quality_level(level),
                    None => warn!("Unknown quality level index {}", level),
                }
                Ok(())
            }
            SignalingMessage::Failed => {
                self.on_connection_failed(SERVER_ICE_FAILURE);
                Ok(())
            }
            other => {
                debug!(
                    "Ignoring signaling message, sessionId: {}, type: {}",
                    self.session_id,
                    other.kind()
                );
                Ok(())
            }
        }
    }

    async fn apply_update_spec(&self, config: Value, stream_id: Option<String>) -> Result<()> {
        if self.p2p && config.get("maxVideoBW").is_some() {
            self.fsm
                .apply(Transition::NegotiateMaxBw, self.stack.negotiate_max_bw(&config))
                .await?;
        }
        self.stack.update_spec(&config).await?;

        let forwarded = UPDATESTREAM_KEYS
            .iter()
            .any(|key| config.get(*key).is_some());
        if forwarded && !self.p2p {
            self.send_outbound(SignalingMessage::UpdateStream { config }, stream_id);
        }
        Ok(())
    }

    fn on_stack_event(self: &Arc<Self>, event: StackEvent) {
        match event {
            StackEvent::Signaling(msg) => {
                let msg = match msg {
                    SignalingMessage::Candidate { candidate } => SignalingMessage::Candidate {
                        candidate: candidate.with_attribute_prefix(),
                    },
                    other => other,
                };
                self.send_outbound(msg, None);
            }
            StackEvent::IceStateChanged(ice_state) => self.on_ice_state(ice_state),
            StackEvent::StreamAdded { label } => {
                self.emit(ConnectionEventKind::StreamAdded { label })
            }
            StackEvent::StreamRemoved { label } => {
                self.emit(ConnectionEventKind::StreamRemoved { label })
            }
        }
    }

    fn on_ice_state(&self, ice_state: IceConnectionState) {
        let was_able_to_connect = {
            let mut state = self.state.lock();
            if ice_state.is_connected() {
                state.was_able_to_connect = true;
            }
            state.was_able_to_connect
        };

        debug!(
            "ICE state changed, sessionId: {}, state: {}, wasAbleToConnect: {}",
            self.session_id, ice_state, was_able_to_connect
        );

        if ice_state == IceConnectionState::Failed
            && was_able_to_connect
            && !self.disable_ice_restart
            && !self.is_closed()
        {
            warn!(
                "ICE failed after connecting, restarting, sessionId: {}",
                self.session_id
            );
            self.enqueue(Command::RestartIce);
            return;
        }

        self.emit(ConnectionEventKind::IceStateChanged {
            state: ice_state,
            was_able_to_connect,
        });
    }
}

async fn command_worker(connection: Weak<Connection>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.execute(command).await;
    }
}

async fn stack_event_pump(
    connection: Weak<Connection>,
    mut events: mpsc::UnboundedReceiver<StackEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.on_stack_event(event);
    }
}
