//! Room orchestrator
//!
//! A [`Room`] joins a room through a [`SignalingSession`], owns every local
//! and remote [`Stream`] and drives their connections through a
//! [`ConnectionManager`]. Server pushes and connection events are handled on
//! a single event loop task; public operations run in the caller's task and
//! only touch shared state between awaits.
//!
//! ```text
//!   application ──publish/subscribe/...──▶ Room ──requests──▶ SignalingSession
//!        ▲                                  │  ▲                     │
//!        └──────────── RoomEvent ───────────┘  └──── pushes ─────────┘
//!                                           │
//!                                           ▼
//!                              ConnectionManager ──▶ Connection ──▶ MediaStack
//! ```

pub mod events;
pub mod quality;
pub mod stream;

pub use events::{FailureOrigin, RoomEvent, StreamInfo};
pub use quality::QualityAggregator;
pub use stream::{
    PublishOptions, SimulcastOptions, Stream, StreamOptions, StreamState, SubscribeOptions,
    UnsubscribeProgress,
};

use crate::config::{RoomConfig, Token};
use crate::peer::{
    AttachedStream, Connection, ConnectionEvent, ConnectionEventKind, ConnectionManager,
    ConnectionRoute, ConnectionSpec, DefaultStackFactory, IceConnectionState, QualityLevel,
    StackFactory, StackSpec,
};
use crate::signaling::protocol::{
    events as wire, ConnectionMessageRequest, IceServer, LightSubscribeRequest, P2pMessageRequest,
    PublishKind, PublishRequest, RoomDescription, ServerPush, SignalingMessage,
    StreamMessageRequest, SubscribeRequest,
};
use crate::signaling::{
    ConnectTarget, Connector, SignalingEvent, SignalingSession, TransportEvent, WebSocketConnector,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use stream::cap_bandwidth;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Reason carried by [`RoomEvent::RoomDisconnected`] after [`Room::disconnect`]
pub const EXPECTED_DISCONNECTION: &str = "expected-disconnection";

/// Reason carried by [`RoomEvent::RoomDisconnected`] after losing the room
pub const UNEXPECTED_DISCONNECTION: &str = "unexpected-disconnection";

/// Client kind announced with relayed signaling
pub const CLIENT_BROWSER: &str = "rtcroom";

/// Messages kept per unknown connection id until its connection registers
const ORPHAN_MESSAGE_LIMIT: usize = 64;

/// Receiver of room events
pub type RoomEvents = mpsc::UnboundedReceiver<RoomEvent>;

/// Room lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Settings negotiated in the handshake, with local overrides applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSettings {
    pub room_id: Option<String>,
    pub client_id: Option<String>,
    pub p2p: bool,
    pub single_pc: bool,
    pub ice_servers: Vec<IceServer>,
    /// kbps
    pub default_video_bw: Option<u32>,
    /// kbps
    pub max_video_bw: Option<u32>,
    pub stream_priority_strategy: Option<Value>,
    pub connection_target_bw: Option<u32>,
}

impl RoomSettings {
    fn negotiate(description: &RoomDescription, config: &RoomConfig) -> Self {
        let max_video_bw = match (description.max_video_bw, config.max_video_bw) {
            (Some(server), Some(local)) => Some(server.min(local)),
            (server, local) => server.or(local),
        };
        Self {
            room_id: description.id.clone(),
            client_id: description.client_id.clone(),
            p2p: config.p2p.unwrap_or(description.p2p),
            single_pc: config.single_pc.unwrap_or(description.single_pc),
            ice_servers: description.ice_servers.clone(),
            default_video_bw: description.default_video_bw.or(config.default_video_bw),
            max_video_bw,
            stream_priority_strategy: description.stream_priority_strategy.clone(),
            connection_target_bw: description.connection_target_bw,
        }
    }
}

struct RoomState {
    status: RoomStatus,
    settings: RoomSettings,
    local_streams: HashMap<String, Stream>,
    remote_streams: HashMap<String, Stream>,
    quality: QualityAggregator,
    /// Signaling for connection ids whose connection is still being built
    orphan_messages: HashMap<String, Vec<SignalingMessage>>,
}

struct RoomShared {
    config: RoomConfig,
    session: SignalingSession,
    manager: ConnectionManager,
    state: Mutex<RoomState>,
    events: mpsc::UnboundedSender<RoomEvent>,
    receivers: Mutex<
        Option<(
            mpsc::UnboundedReceiver<TransportEvent>,
            mpsc::UnboundedReceiver<ConnectionEvent>,
        )>,
    >,
}

/// What to do with a stream after it failed
enum FailureFollowUp {
    Unpublish,
    Unsubscribe,
    Nothing,
}

/// A room session
///
/// Cloning yields another handle to the same room.
#[derive(Clone)]
pub struct Room {
    shared: Arc<RoomShared>,
}

impl Room {
    /// Create a room over `connector`, building stacks with `factory`
    pub fn new(
        config: RoomConfig,
        connector: Arc<dyn Connector>,
        factory: Arc<dyn StackFactory>,
    ) -> (Self, RoomEvents) {
        let (session, transport_rx) =
            SignalingSession::new(connector, config.reconnection.clone());
        let (manager, connection_rx) = ConnectionManager::new(factory);
        let (events, events_rx) = mpsc::unbounded_channel();

        let room = Self {
            shared: Arc::new(RoomShared {
                config,
                session,
                manager,
                state: Mutex::new(RoomState {
                    status: RoomStatus::Disconnected,
                    settings: RoomSettings::default(),
                    local_streams: HashMap::new(),
                    remote_streams: HashMap::new(),
                    quality: QualityAggregator::new(),
                    orphan_messages: HashMap::new(),
                }),
                events,
                receivers: Mutex::new(Some((transport_rx, connection_rx))),
            }),
        };
        (room, events_rx)
    }

    /// Create a room signaling over WebSocket with the configured stack
    pub fn with_config(config: RoomConfig) -> (Self, RoomEvents) {
        let factory = Arc::new(DefaultStackFactory::new(config.stack));
        Self::new(config, Arc::new(WebSocketConnector::new()), factory)
    }

    pub fn status(&self) -> RoomStatus {
        self.shared.state.lock().status
    }

    pub fn settings(&self) -> RoomSettings {
        self.shared.state.lock().settings.clone()
    }

    /// Signaling session, for inspection
    pub fn session(&self) -> &SignalingSession {
        &self.shared.session
    }

    /// Connection registry, for inspection
    pub fn connections(&self) -> &ConnectionManager {
        &self.shared.manager
    }

    /// Join the room
    ///
    /// Returns once the signaling channel is being opened; the handshake
    /// is reported as [`RoomEvent::RoomConnected`].
    #[instrument(skip(self))]
    pub fn connect(&self) -> Result<()> {
        self.shared.config.validate()?;
        let token = Token::decode(&self.shared.config.token)?;

        if self.shared.receivers.lock().is_none() {
            return Err(Error::InvalidState(
                "a room can only be connected once".to_string(),
            ));
        }

        {
            let mut state = self.shared.state.lock();
            if state.status != RoomStatus::Disconnected {
                return Err(Error::InvalidState(format!(
                    "room is already {:?}",
                    state.status
                )));
            }
            state.status = RoomStatus::Connecting;
        }

        let mut target = ConnectTarget::new(token.signaling_url());
        target.query = token.query();
        target
            .query
            .extend(self.shared.config.query.clone().into_iter());

        info!("Connecting to room at {}", target.url);
        if let Err(e) = self.shared.session.connect(target) {
            self.shared.state.lock().status = RoomStatus::Disconnected;
            return Err(e);
        }

        let Some((transport_rx, connection_rx)) = self.shared.receivers.lock().take() else {
            return Err(Error::InvalidState(
                "a room can only be connected once".to_string(),
            ));
        };
        tokio::spawn(run_event_loop(
            Arc::downgrade(&self.shared),
            transport_rx,
            connection_rx,
        ));
        Ok(())
    }

    /// Leave the room, tearing down every stream and connection
    pub fn disconnect(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.status == RoomStatus::Disconnected {
                debug!("Room already disconnected");
                return;
            }
            state.status = RoomStatus::Disconnected;
        }
        info!("Disconnecting from room");
        self.emit(RoomEvent::RoomDisconnected {
            message: EXPECTED_DISCONNECTION.to_string(),
        });
        self.clear_all();
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish a local stream, returning the server-assigned id
    pub async fn publish(&self, mut stream: Stream, mut options: PublishOptions) -> Result<String> {
        self.ensure_connected("publish")?;
        if !stream.is_local() || stream.is_failed() || stream.has_id() {
            return Err(Error::InvalidStream(format!(
                "cannot publish stream {}: it must be local, not failed and not yet published",
                stream.id()
            )));
        }

        let settings = self.settings();
        options.max_video_bw = cap_bandwidth(
            options.max_video_bw.or(settings.default_video_bw),
            settings.max_video_bw,
        );
        options.min_video_bw = cap_bandwidth(
            Some(options.min_video_bw.unwrap_or(0)),
            settings.default_video_bw,
        );
        options.max_audio_bw = cap_bandwidth(
            options.max_audio_bw.or(self.shared.config.max_audio_bw),
            self.shared.config.max_audio_bw,
        );

        stream.set_simulcast(options.simulcast);
        if let Some(bw) = options.max_video_bw {
            stream.set_max_video_bw(bw);
        }
        stream.link.max_audio_bw = options.max_audio_bw;
        stream.link.max_video_bw = options.max_video_bw;
        stream.link.force_turn = options.force_turn;

        if stream.has_media() {
            if stream.is_external() {
                self.publish_external(stream, &options).await
            } else if stream.media().is_none() {
                Err(Error::InvalidStream(format!(
                    "stream {} has no local media, initialize it first",
                    stream.label()
                )))
            } else if settings.p2p {
                self.publish_simple(stream, &options, PublishKind::P2p).await
            } else {
                self.publish_erizo(stream, &options, &settings).await
            }
        } else if stream.has_data() {
            self.publish_simple(stream, &options, PublishKind::Data).await
        } else {
            Err(Error::InvalidStream(
                "stream has neither media nor data".to_string(),
            ))
        }
    }

    fn publish_request(stream: &Stream, options: &PublishOptions, state: PublishKind) -> PublishRequest {
        PublishRequest {
            state,
            data: stream.has_data(),
            audio: stream.has_audio(),
            video: stream.carries_video(),
            label: stream.label().to_string(),
            screen: stream.has_screen(),
            attributes: stream.attributes().clone(),
            metadata: options.metadata.clone(),
            create_offer: options.create_offer,
            mute_stream: options.mute_stream,
            encrypt_transport: options.encrypt_transport,
            handler_profile: options.handler_profile.clone(),
            min_video_bw: options.min_video_bw,
            max_video_bw: options.max_video_bw,
            scheme: options.scheme.clone(),
        }
    }

    async fn publish_external(&self, stream: Stream, options: &PublishOptions) -> Result<String> {
        let (kind, source) = match (stream.url(), stream.recording()) {
            (Some(url), _) => (PublishKind::Url, url.to_string()),
            (None, Some(recording)) => (PublishKind::Recording, recording.to_string()),
            (None, None) => {
                return Err(Error::InvalidStream("stream is not external".to_string()));
            }
        };
        let request = Self::publish_request(&stream, options, kind);
        let ack = self
            .shared
            .session
            .send_sdp(wire::PUBLISH, &request, Some(&source))
            .await?;
        self.register_published(stream, ack.string_at(0), || ack.error_text(1))
    }

    async fn publish_simple(
        &self,
        stream: Stream,
        options: &PublishOptions,
        kind: PublishKind,
    ) -> Result<String> {
        let request = Self::publish_request(&stream, options, kind);
        let ack = self
            .shared
            .session
            .send_sdp(wire::PUBLISH, &request, None)
            .await?;
        self.register_published(stream, ack.string_at(0), || ack.error_text(1))
    }

    fn register_published<F>(&self, mut stream: Stream, id: Option<String>, error: F) -> Result<String>
    where
        F: FnOnce() -> String,
    {
        let Some(id) = id else {
            let error = error();
            error!("Error publishing stream, label: {}, error: {}", stream.label(), error);
            return Err(Error::RequestRejected(error));
        };
        info!("Stream published, streamId: {}, label: {}", id, stream.label());
        stream.set_id(id.clone());
        self.shared
            .state
            .lock()
            .local_streams
            .insert(id.clone(), stream);
        Ok(id)
    }

    async fn publish_erizo(
        &self,
        mut stream: Stream,
        options: &PublishOptions,
        settings: &RoomSettings,
    ) -> Result<String> {
        let request = Self::publish_request(&stream, options, PublishKind::Erizo);
        let ack = self
            .shared
            .session
            .send_sdp(wire::PUBLISH, &request, None)
            .await?;

        let Some(id) = ack.string_at(0) else {
            let error = ack.error_text(3);
            error!("Error publishing stream, label: {}, error: {}", stream.label(), error);
            return Err(Error::RequestRejected(error));
        };
        let erizo_id = ack.string_at(1);
        let connection_id = ack.string_at(2).ok_or_else(|| {
            Error::SignalingError(format!("publish ack for stream {} has no connection id", id))
        })?;

        info!(
            "Stream published, streamId: {}, erizoId: {:?}, connectionId: {}",
            id, erizo_id, connection_id
        );
        stream.set_id(id.clone());

        let spec = self.erizo_connection_spec(&stream, &connection_id, erizo_id.clone(), false, settings);
        let connection = self
            .shared
            .manager
            .get_or_build(spec, erizo_id.as_deref(), settings.single_pc)
            .await?;

        let attached = AttachedStream {
            id: id.clone(),
            label: stream.label().to_string(),
            local_media: stream.media().cloned(),
            encodings: stream.encoding_parameters(),
        };
        stream.connection = Some(Arc::clone(&connection));

        {
            let mut state = self.shared.state.lock();
            state.local_streams.insert(id.clone(), stream);
            self.flush_orphans(&mut state, &connection);
        }
        connection.add_stream(attached);
        Ok(id)
    }

    fn erizo_connection_spec(
        &self,
        stream: &Stream,
        connection_id: &str,
        erizo_id: Option<String>,
        is_remote: bool,
        settings: &RoomSettings,
    ) -> ConnectionSpec {
        ConnectionSpec {
            stack: StackSpec {
                session_id: 0,
                connection_id: Some(connection_id.to_string()),
                is_remote,
                p2p: false,
                ice_servers: settings.ice_servers.clone(),
                force_turn: self.shared.config.force_turn || stream.link.force_turn,
                audio: stream.has_audio(),
                video: stream.carries_video(),
                data: stream.has_data(),
                max_audio_bw: stream.link.max_audio_bw,
                max_video_bw: stream.link.max_video_bw,
                label: Some(stream.label().to_string()),
            },
            route: ConnectionRoute::MediaServer {
                connection_id: connection_id.to_string(),
                erizo_id,
            },
            disable_ice_restart: self.shared.config.disable_ice_restart,
        }
    }

    fn p2p_connection_spec(
        &self,
        stream: &Stream,
        peer_socket: &str,
        is_remote: bool,
        settings: &RoomSettings,
    ) -> ConnectionSpec {
        ConnectionSpec {
            stack: StackSpec {
                session_id: 0,
                connection_id: None,
                is_remote,
                p2p: true,
                ice_servers: settings.ice_servers.clone(),
                force_turn: self.shared.config.force_turn || stream.link.force_turn,
                audio: stream.has_audio(),
                video: stream.carries_video(),
                data: false,
                max_audio_bw: stream.link.max_audio_bw,
                max_video_bw: stream.link.max_video_bw,
                label: Some(stream.label().to_string()),
            },
            route: ConnectionRoute::PeerToPeer {
                stream_id: stream.id().to_string(),
                peer_socket: peer_socket.to_string(),
            },
            disable_ice_restart: self.shared.config.disable_ice_restart,
        }
    }

    /// Stop publishing a local stream
    ///
    /// Local resources are released at once; the result reflects the
    /// server's acknowledgement.
    pub async fn unpublish(&self, stream_id: &str) -> Result<()> {
        let stream = self
            .shared
            .state
            .lock()
            .local_streams
            .remove(stream_id)
            .ok_or_else(|| {
                Error::StreamNotFound(format!(
                    "cannot unpublish {}: stream does not exist or is not local",
                    stream_id
                ))
            })?;

        info!("Unpublishing stream, streamId: {}", stream_id);
        let mut stream = stream;
        if stream.has_media() && !stream.is_external() {
            self.release_stream(&mut stream);
        }

        let ack = self
            .shared
            .session
            .send_message(wire::UNPUBLISH, json!(stream_id))
            .await?;
        if ack.is_null_at(0) {
            let error = ack.error_text(1);
            error!("Error unpublishing stream, streamId: {}, error: {}", stream_id, error);
            return Err(Error::RequestRejected(error));
        }
        info!("Stream unpublished, streamId: {}", stream_id);
        Ok(())
    }

    // ========================================================================
    // Subscribing
    // ========================================================================

    /// Subscribe to a remote stream
    ///
    /// Media subscriptions complete with [`RoomEvent::StreamSubscribed`] once
    /// the media arrives; data-only subscriptions complete on the ack.
    pub async fn subscribe(&self, stream_id: &str, mut options: SubscribeOptions) -> Result<()> {
        self.ensure_connected("subscribe")?;
        let settings = self.settings();

        let stream = {
            let mut state = self.shared.state.lock();
            let stream = state.remote_streams.get_mut(stream_id).ok_or_else(|| {
                warn!("Cannot subscribe to invalid stream, streamId: {}", stream_id);
                Error::StreamNotFound(format!("invalid or undefined stream {}", stream_id))
            })?;
            if stream.is_local() {
                warn!("Cannot subscribe to local stream, streamId: {}", stream_id);
                return Err(Error::InvalidStream("local copy of stream".to_string()));
            }
            if stream.is_failed() {
                warn!("Cannot subscribe to failed stream, streamId: {}", stream_id);
                return Err(Error::InvalidStream("failed stream".to_string()));
            }
            if stream.state != StreamState::Unsubscribed {
                warn!(
                    "Cannot subscribe to a subscribed stream, streamId: {}, state: {}",
                    stream_id, stream.state
                );
                return Err(Error::InvalidState("stream already subscribed".to_string()));
            }

            if !stream.has_media() && !(stream.has_data() && options.data) {
                warn!("There is nothing to subscribe to in stream, streamId: {}", stream_id);
                return Err(Error::InvalidStream("Nothing to subscribe to".to_string()));
            }

            options.max_video_bw = cap_bandwidth(
                options.max_video_bw.or(settings.default_video_bw),
                settings.max_video_bw,
            );
            stream.check_subscribe_options(&mut options);
            stream.link.max_audio_bw = options.max_audio_bw;
            stream.link.max_video_bw = options.max_video_bw;
            stream.link.force_turn = options.force_turn;
            stream.state = StreamState::Subscribing;
            stream.clone()
        };

        info!("Subscribing to stream, streamId: {}", stream_id);
        let result = if stream.has_media() {
            if settings.p2p {
                self.subscribe_p2p(&stream, &options)
            } else {
                self.subscribe_erizo(&stream, &options, &settings).await
            }
        } else {
            self.subscribe_data(&stream, &options).await
        };

        if result.is_err() {
            let mut state = self.shared.state.lock();
            if let Some(stream) = state.remote_streams.get_mut(stream_id) {
                if stream.state == StreamState::Subscribing {
                    stream.state = StreamState::Unsubscribed;
                }
            }
        }
        result
    }

    fn subscribe_p2p(&self, stream: &Stream, options: &SubscribeOptions) -> Result<()> {
        let request = LightSubscribeRequest {
            stream_id: stream.id().to_string(),
            data: None,
            metadata: options.metadata.clone(),
        };
        self.shared
            .session
            .relay_sdp(wire::SUBSCRIBE, &request, None)
    }

    async fn subscribe_data(&self, stream: &Stream, options: &SubscribeOptions) -> Result<()> {
        let request = LightSubscribeRequest {
            stream_id: stream.id().to_string(),
            data: Some(options.data),
            metadata: options.metadata.clone(),
        };
        let ack = self
            .shared
            .session
            .send_sdp(wire::SUBSCRIBE, &request, None)
            .await?;
        if ack.is_null_at(0) {
            let error = ack.error_text(1);
            error!("Error subscribing to stream, streamId: {}, error: {}", stream.id(), error);
            return Err(Error::RequestRejected(error));
        }

        debug!("Stream subscribed, streamId: {}", stream.id());
        let info = {
            let mut state = self.shared.state.lock();
            let Some(stream) = state.remote_streams.get_mut(stream.id()) else {
                return Err(Error::StreamNotFound(stream.id().to_string()));
            };
            stream.state = StreamState::Subscribed;
            stream.info()
        };
        self.emit(RoomEvent::StreamSubscribed { stream: info });
        Ok(())
    }

    async fn subscribe_erizo(
        &self,
        stream: &Stream,
        options: &SubscribeOptions,
        settings: &RoomSettings,
    ) -> Result<()> {
        let request = SubscribeRequest {
            stream_id: stream.id().to_string(),
            audio: options.audio && stream.has_audio(),
            video: stream.video_request(options),
            data: options.data && stream.has_data(),
            max_video_bw: options.max_video_bw,
            browser: CLIENT_BROWSER.to_string(),
            create_offer: options.create_offer,
            metadata: options.metadata.clone(),
            mute_stream: options.mute_stream,
            encrypt_transport: options.encrypt_transport,
            slide_show_mode: options.slide_show_mode,
            handler_profile: options.handler_profile.clone(),
        };
        let ack = self
            .shared
            .session
            .send_sdp(wire::SUBSCRIBE, &request, None)
            .await?;

        if ack.is_null_at(0) {
            let error = ack.error_text(3);
            error!("Error subscribing to stream, streamId: {}, error: {}", stream.id(), error);
            return Err(Error::RequestRejected(error));
        }
        let erizo_id = ack.string_at(1);
        let connection_id = ack.string_at(2).ok_or_else(|| {
            Error::SignalingError(format!(
                "subscribe ack for stream {} has no connection id",
                stream.id()
            ))
        })?;
        debug!(
            "Subscriber added, streamId: {}, erizoId: {:?}, connectionId: {}",
            stream.id(),
            erizo_id,
            connection_id
        );

        let mut spec = self.erizo_connection_spec(stream, &connection_id, erizo_id.clone(), true, settings);
        spec.stack.audio = request.audio;
        spec.stack.video = request.video.is_enabled();
        spec.stack.data = request.data;
        let connection = self
            .shared
            .manager
            .get_or_build(spec, erizo_id.as_deref(), settings.single_pc)
            .await?;

        let mut state = self.shared.state.lock();
        let attached = match state.remote_streams.get_mut(stream.id()) {
            Some(current)
                if matches!(
                    current.state,
                    StreamState::Subscribing | StreamState::Subscribed
                ) =>
            {
                if current.connection.is_none() {
                    current.connection = Some(Arc::clone(&connection));
                }
                true
            }
            _ => false,
        };
        if !attached {
            drop(state);
            warn!(
                "Stream went away while subscribing, streamId: {}",
                stream.id()
            );
            self.shared.manager.maybe_close(&connection, false);
            return Err(Error::StreamNotFound(stream.id().to_string()));
        }
        self.flush_orphans(&mut state, &connection);
        Ok(())
    }

    /// Unsubscribe from a remote stream
    ///
    /// [`RoomEvent::StreamUnsubscribed`] follows once both the server ack
    /// and the removal of the remote media (or a failure) were observed.
    pub async fn unsubscribe(&self, stream_id: &str) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            let stream = state.remote_streams.get_mut(stream_id).ok_or_else(|| {
                Error::StreamNotFound(format!(
                    "error unsubscribing, stream {} does not exist",
                    stream_id
                ))
            })?;
            if stream.is_local() {
                return Err(Error::InvalidStream(format!(
                    "error unsubscribing, stream {} is local",
                    stream_id
                )));
            }
            if !matches!(
                stream.state,
                StreamState::Subscribed | StreamState::Subscribing
            ) {
                warn!(
                    "Cannot unsubscribe to a stream that is not subscribed, streamId: {}, state: {}",
                    stream_id, stream.state
                );
                return Err(Error::InvalidState("stream not subscribed".to_string()));
            }
            stream.state = StreamState::Unsubscribing;
        }

        info!("Unsubscribing stream, streamId: {}", stream_id);
        let result = self
            .shared
            .session
            .send_message(wire::UNSUBSCRIBE, json!(stream_id))
            .await;

        let outcome = match result {
            Ok(ack) if !ack.is_null_at(0) => Ok(()),
            Ok(ack) => Err(Error::RequestRejected(ack.error_text(1))),
            Err(e) => Err(e),
        };

        let mut state = self.shared.state.lock();
        match outcome {
            Ok(()) => {
                if let Some(stream) = state.remote_streams.get_mut(stream_id) {
                    if stream.state == StreamState::Unsubscribing {
                        stream.unsubscribing.callback_received = true;
                        self.maybe_dispatch_unsubscribed(&mut state, stream_id);
                    }
                }
                Ok(())
            }
            Err(e) => {
                if let Some(stream) = state.remote_streams.get_mut(stream_id) {
                    if stream.state == StreamState::Unsubscribing {
                        stream.state = StreamState::Subscribed;
                    }
                }
                error!("Error calling unsubscribe, streamId: {}: {}", stream_id, e);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Stream operations
    // ========================================================================

    /// Send data over a published local stream
    pub fn send_data(&self, stream_id: &str, msg: Value) -> Result<()> {
        {
            let state = self.shared.state.lock();
            match state.local_streams.get(stream_id) {
                Some(stream) if stream.has_data() => {}
                _ => {
                    error!(
                        "Failed to send data, reason: stream has not been published, streamId: {}",
                        stream_id
                    );
                    return Err(Error::InvalidStream(format!(
                        "stream {} is not a published data stream",
                        stream_id
                    )));
                }
            }
        }
        self.shared
            .session
            .relay_message(wire::SEND_DATA_STREAM, json!({ "id": stream_id, "msg": msg }))
    }

    /// Replace the attributes of a published local stream
    pub fn set_attributes(&self, stream_id: &str, attributes: Map<String, Value>) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            let stream = state.local_streams.get_mut(stream_id).ok_or_else(|| {
                Error::StreamNotFound(format!("no published local stream {}", stream_id))
            })?;
            stream.set_attributes(attributes.clone());
        }
        self.shared.session.relay_message(
            wire::UPDATE_STREAM_ATTRIBUTES,
            json!({ "id": stream_id, "attrs": attributes }),
        )
    }

    /// Change bandwidth, layers or slide-show settings of a stream
    pub fn update_configuration(&self, stream_id: &str, mut config: Map<String, Value>) -> Result<()> {
        let settings = self.settings();
        let connections = {
            let mut state = self.shared.state.lock();
            let RoomState {
                local_streams,
                remote_streams,
                ..
            } = &mut *state;
            let stream = local_streams
                .get_mut(stream_id)
                .or_else(|| remote_streams.get_mut(stream_id))
                .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))?;

            stream.check_update_config(&mut config);
            if let Some(bw) = config.get("maxVideoBW").and_then(Value::as_u64) {
                let capped = cap_bandwidth(Some(bw as u32), settings.max_video_bw).unwrap_or(bw as u32);
                config.insert("maxVideoBW".to_string(), json!(capped));
                if stream.is_local() {
                    stream.set_max_video_bw(capped);
                }
            }
            stream.connections()
        };

        if connections.is_empty() {
            return Err(Error::InvalidState(
                "This stream has no peerConnection attached, ignoring".to_string(),
            ));
        }
        for connection in connections {
            connection.update_spec(Value::Object(config.clone()), Some(stream_id.to_string()));
        }
        Ok(())
    }

    /// Send a control action for a stream to the media server
    pub fn send_control_message(&self, stream_id: &str, action: Value) -> Result<()> {
        let request = StreamMessageRequest {
            stream_id: stream_id.to_string(),
            erizo_id: None,
            msg: json!({ "type": "control", "action": action }),
            browser: None,
        };
        self.shared
            .session
            .relay_sdp(wire::STREAM_MESSAGE, &request, None)
    }

    /// Start recording a stream, returning the recording id
    pub async fn start_recording(&self, stream_id: &str) -> Result<String> {
        let ack = self
            .shared
            .session
            .send_message(wire::START_RECORDER, json!({ "to": stream_id }))
            .await?;
        match ack.string_at(0) {
            Some(id) => {
                info!("Started recording, streamId: {}, recordingId: {}", stream_id, id);
                Ok(id)
            }
            None => Err(Error::RequestRejected(ack.error_text(1))),
        }
    }

    pub async fn stop_recording(&self, recording_id: &str) -> Result<()> {
        let ack = self
            .shared
            .session
            .send_message(wire::STOP_RECORDER, json!({ "id": recording_id }))
            .await?;
        if ack.is_null_at(0) {
            return Err(Error::RequestRejected(ack.error_text(1)));
        }
        Ok(())
    }

    /// Server-side statistics of a stream
    pub async fn stream_stats(&self, stream_id: &str) -> Result<Value> {
        let ack = self
            .shared
            .session
            .send_message(wire::GET_STREAM_STATS, json!(stream_id))
            .await?;
        Ok(ack.arg(0).cloned().unwrap_or(Value::Null))
    }

    pub async fn set_stream_priority_strategy(&self, strategy: Value) -> Result<()> {
        self.shared
            .session
            .send_message(wire::SET_STREAM_PRIORITY_STRATEGY, strategy)
            .await
            .map(|_| ())
    }

    /// kbps
    pub async fn set_connection_target_bandwidth(&self, bandwidth: u32) -> Result<()> {
        self.shared
            .session
            .send_message(wire::SET_CONNECTION_TARGET_BW, json!(bandwidth))
            .await
            .map(|_| ())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn remote_streams(&self) -> Vec<StreamInfo> {
        self.shared
            .state
            .lock()
            .remote_streams
            .values()
            .map(Stream::info)
            .collect()
    }

    pub fn local_streams(&self) -> Vec<StreamInfo> {
        self.shared
            .state
            .lock()
            .local_streams
            .values()
            .map(Stream::info)
            .collect()
    }

    /// Remote streams whose attribute `name` equals `value`
    pub fn streams_by_attribute(&self, name: &str, value: &Value) -> Vec<StreamInfo> {
        self.shared
            .state
            .lock()
            .remote_streams
            .values()
            .filter(|stream| stream.attributes().get(name) == Some(value))
            .map(Stream::info)
            .collect()
    }

    /// Subscription state of a remote stream
    pub fn stream_state(&self, stream_id: &str) -> Option<StreamState> {
        self.shared
            .state
            .lock()
            .remote_streams
            .get(stream_id)
            .map(Stream::state)
    }

    /// Unsubscription progress of a remote stream
    pub fn unsubscribe_progress(&self, stream_id: &str) -> Option<UnsubscribeProgress> {
        self.shared
            .state
            .lock()
            .remote_streams
            .get(stream_id)
            .map(Stream::unsubscribe_progress)
    }

    /// Whether a local or remote stream is marked failed
    pub fn is_stream_failed(&self, stream_id: &str) -> Option<bool> {
        let state = self.shared.state.lock();
        state
            .local_streams
            .get(stream_id)
            .or_else(|| state.remote_streams.get(stream_id))
            .map(Stream::is_failed)
    }

    /// Session id of the connection carrying a stream
    pub fn stream_connection(&self, stream_id: &str) -> Option<u64> {
        let state = self.shared.state.lock();
        state
            .local_streams
            .get(stream_id)
            .or_else(|| state.remote_streams.get(stream_id))
            .and_then(|stream| stream.connection.as_ref())
            .map(|connection| connection.session_id())
    }

    /// Last room-level quality reported
    pub fn quality_level(&self) -> Option<QualityLevel> {
        self.shared.state.lock().quality.current()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn emit(&self, event: RoomEvent) {
        debug!("Room event: {}", event.name());
        let _ = self.shared.events.send(event);
    }

    fn ensure_connected(&self, operation: &str) -> Result<()> {
        let status = self.status();
        if status != RoomStatus::Connected {
            return Err(Error::Disconnected(format!(
                "cannot {} while the room is {:?}",
                operation, status
            )));
        }
        Ok(())
    }

    fn relay_sdp<T: Serialize>(&self, event: &str, payload: &T) {
        if let Err(e) = self.shared.session.relay_sdp(event, payload, None) {
            debug!("Could not relay {}: {}", event, e);
        }
    }

    /// Detach a stream from its connections and close what became unused
    fn release_stream(&self, stream: &mut Stream) {
        let stream_id = stream.id().to_string();
        for (peer_socket, connection) in stream.peer_connections.drain() {
            debug!(
                "Closing peer connection, streamId: {}, peerSocket: {}",
                stream_id, peer_socket
            );
            self.shared.manager.maybe_close(&connection, true);
        }

        if let Some(connection) = stream.connection.take() {
            if !connection.is_p2p() {
                connection.remove_stream(&stream_id);
            }
            self.shared.manager.maybe_close(&connection, false);
        }
    }

    fn maybe_dispatch_unsubscribed(&self, state: &mut RoomState, stream_id: &str) {
        let Some(stream) = state.remote_streams.get_mut(stream_id) else {
            return;
        };
        let progress = stream.unsubscribing;
        let detached = stream.connection.is_none() && stream.peer_connections.is_empty();
        debug!(
            "Unsubscribing stream, streamId: {}, callbackReceived: {}, pcEventReceived: {}, failed: {}",
            stream_id, progress.callback_received, progress.pc_event_received, stream.failed
        );

        if progress.callback_received && (progress.pc_event_received || stream.failed || detached) {
            info!("Stream fully unsubscribed, streamId: {}", stream_id);
            self.release_stream(stream);
            stream.reset_subscription();
            let info = stream.info();
            self.emit(RoomEvent::StreamUnsubscribed { stream: info });
        } else {
            debug!("Not dispatching stream unsubscribed yet, streamId: {}", stream_id);
        }
    }

    /// Mark a stream failed and start its teardown; repeated calls do nothing
    fn on_stream_failed(
        &self,
        local: bool,
        stream_id: &str,
        message: Option<&str>,
        origin: FailureOrigin,
        was_able_to_connect: bool,
    ) {
        let mut state = self.shared.state.lock();
        if state.status == RoomStatus::Disconnected {
            return;
        }
        let single_pc = state.settings.single_pc;
        let streams = if local {
            &mut state.local_streams
        } else {
            &mut state.remote_streams
        };
        let Some(stream) = streams.get_mut(stream_id) else {
            return;
        };
        if stream.failed {
            debug!("Stream already failed, streamId: {}", stream_id);
            return;
        }
        stream.failed = true;

        let message = message.unwrap_or("Stream failed after connection").to_string();
        warn!(
            "Stream failed, streamId: {}, message: {}, origin: {}, wasAbleToConnect: {}",
            stream_id, message, origin, was_able_to_connect
        );
        let info = stream.info();
        let connection = stream.connection.clone();
        let follow_up = if stream.is_local() {
            FailureFollowUp::Unpublish
        } else if stream.unsubscribing.callback_received {
            FailureFollowUp::Nothing
        } else {
            FailureFollowUp::Unsubscribe
        };

        self.emit(RoomEvent::StreamFailed {
            stream: info,
            message,
            origin,
            was_able_to_connect,
        });

        if matches!(follow_up, FailureFollowUp::Nothing) {
            self.maybe_dispatch_unsubscribed(&mut state, stream_id);
        }
        drop(state);

        let stream_id = stream_id.to_string();
        match follow_up {
            FailureFollowUp::Unpublish => {
                let room = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = room.unpublish(&stream_id).await {
                        debug!("Unpublish after failure, streamId: {}: {}", stream_id, e);
                    }
                });
            }
            FailureFollowUp::Unsubscribe => {
                let room = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = room.unsubscribe(&stream_id).await {
                        debug!("Unsubscribe after failure, streamId: {}: {}", stream_id, e);
                    }
                });
            }
            FailureFollowUp::Nothing => {}
        }

        if let (Some(connection), true) = (connection, single_pc) {
            self.shared.manager.maybe_close(&connection, true);
        }
    }

    /// Feed signaling buffered for `connection`
    fn flush_orphans(&self, state: &mut RoomState, connection: &Arc<Connection>) {
        let Some(connection_id) = connection.connection_id() else {
            return;
        };
        if let Some(messages) = state.orphan_messages.remove(connection_id) {
            debug!(
                "Delivering {} early messages, connectionId: {}",
                messages.len(),
                connection_id
            );
            for msg in messages {
                connection.process_signaling_message(msg);
            }
        }
    }

    fn clear_all(&self) {
        self.shared.manager.close_all();

        let removed = {
            let mut state = self.shared.state.lock();
            let mut removed = Vec::new();
            for (_, mut stream) in state.remote_streams.drain() {
                stream.connection = None;
                stream.peer_connections.clear();
                if !stream.failed {
                    removed.push(stream.info());
                }
            }
            state.local_streams.clear();
            state.orphan_messages.clear();
            state.quality.reset();
            removed
        };

        for info in removed {
            self.emit(RoomEvent::StreamRemoved { stream: info });
        }
        self.shared.session.disconnect(true);
    }

    // ========================================================================
    // Signaling events
    // ========================================================================

    async fn on_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected(description) => self.on_connected(description),
            SignalingEvent::AuthenticationFailed(message) => {
                error!("Room authentication failed: {}", message);
                self.emit(RoomEvent::RoomError { message });
                self.on_room_lost();
            }
            SignalingEvent::Reconnecting(reason) => {
                self.emit(RoomEvent::RoomReconnecting {
                    message: format!("reconnecting - {}", reason),
                });
            }
            SignalingEvent::Reconnected => self.emit(RoomEvent::RoomReconnected),
            SignalingEvent::Disconnected(reason) => {
                info!("Signaling disconnected: {}", reason);
                self.on_room_lost();
            }
            SignalingEvent::Error(message) => self.emit(RoomEvent::RoomError { message }),
            SignalingEvent::Push(push) => self.on_push(push).await,
        }
    }

    fn on_room_lost(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.status == RoomStatus::Disconnected {
                return;
            }
            state.status = RoomStatus::Disconnected;
        }
        warn!("Room disconnected unexpectedly");
        self.emit(RoomEvent::RoomDisconnected {
            message: UNEXPECTED_DISCONNECTION.to_string(),
        });
        self.clear_all();
    }

    fn on_connected(&self, description: RoomDescription) {
        let streams = {
            let mut state = self.shared.state.lock();
            if state.status == RoomStatus::Disconnected {
                debug!("Ignoring handshake on a disconnected room");
                return;
            }
            state.status = RoomStatus::Connected;
            state.settings = RoomSettings::negotiate(&description, &self.shared.config);
            info!(
                "Connected to room, roomId: {:?}, clientId: {:?}, p2p: {}, singlePC: {}, streams: {}",
                state.settings.room_id,
                state.settings.client_id,
                state.settings.p2p,
                state.settings.single_pc,
                description.streams.len()
            );

            let mut streams = Vec::new();
            for descriptor in &description.streams {
                if state.remote_streams.contains_key(&descriptor.id) {
                    continue;
                }
                let local = state.local_streams.contains_key(&descriptor.id);
                let stream = Stream::remote(descriptor, local);
                streams.push(stream.info());
                state.remote_streams.insert(descriptor.id.clone(), stream);
            }
            streams
        };
        self.emit(RoomEvent::RoomConnected { streams });
    }

    async fn on_push(&self, push: ServerPush) {
        match push {
            ServerPush::AddStream(descriptor) => {
                let info = {
                    let mut state = self.shared.state.lock();
                    if state.remote_streams.contains_key(&descriptor.id) {
                        return;
                    }
                    let local = state.local_streams.contains_key(&descriptor.id);
                    let stream = Stream::remote(&descriptor, local);
                    let info = stream.info();
                    state.remote_streams.insert(descriptor.id.clone(), stream);
                    info
                };
                self.emit(RoomEvent::StreamAdded { stream: info });
            }

            ServerPush::RemoveStream { id } => self.on_remove_stream(&id),

            ServerPush::StreamMessageErizo(msg) => {
                debug!("Failed applying a stream message from erizo, msg: {}", msg);
            }

            ServerPush::ConnectionMessageErizo(message) => {
                if let SignalingMessage::QualityLevel { level } = message.evt {
                    self.on_quality_level(&message.connection_id, level);
                    return;
                }
                let mut state = self.shared.state.lock();
                match self.shared.manager.get_by_connection_id(&message.connection_id) {
                    Some(connection) => {
                        self.flush_orphans(&mut state, &connection);
                        connection.process_signaling_message(message.evt);
                    }
                    None => {
                        let queue = state
                            .orphan_messages
                            .entry(message.connection_id.clone())
                            .or_default();
                        if queue.len() < ORPHAN_MESSAGE_LIMIT {
                            debug!(
                                "Holding signaling for unknown connection, connectionId: {}",
                                message.connection_id
                            );
                            queue.push(message.evt);
                        } else {
                            warn!(
                                "Received signaling message to unknown connectionId, connectionId: {}",
                                message.connection_id
                            );
                        }
                    }
                }
            }

            ServerPush::StreamMessageP2p(message) => {
                self.on_p2p_message(message.stream_id, message.peer_socket, message.msg)
                    .await
            }

            ServerPush::PublishMe(request) => {
                self.create_local_p2p_connection(&request.stream_id, &request.peer_socket)
                    .await
            }

            ServerPush::UnpublishMe(request) => {
                let connection = {
                    let mut state = self.shared.state.lock();
                    state
                        .local_streams
                        .get_mut(&request.stream_id)
                        .and_then(|stream| stream.peer_connections.remove(&request.peer_socket))
                };
                if let Some(connection) = connection {
                    info!(
                        "Peer left, streamId: {}, peerSocket: {}",
                        request.stream_id, request.peer_socket
                    );
                    self.shared.manager.maybe_close(&connection, true);
                }
            }

            ServerPush::BandwidthAlert(alert) => {
                debug!(
                    "Bandwidth alert, streamId: {:?}, bwMessage: {:?}, bandwidth: {}",
                    alert.stream_id, alert.message, alert.bandwidth
                );
                let Some(stream_id) = alert.stream_id else {
                    return;
                };
                let info = {
                    let state = self.shared.state.lock();
                    state
                        .remote_streams
                        .get(&stream_id)
                        .filter(|stream| !stream.is_failed())
                        .map(Stream::info)
                };
                if let Some(info) = info {
                    self.emit(RoomEvent::BandwidthAlert {
                        stream: info,
                        bandwidth: alert.bandwidth,
                        message: alert.message,
                    });
                }
            }

            ServerPush::DataStream(data) => {
                let info = self
                    .shared
                    .state
                    .lock()
                    .remote_streams
                    .get(&data.id)
                    .map(Stream::info);
                match info {
                    Some(info) => self.emit(RoomEvent::StreamData {
                        stream: info,
                        msg: data.msg,
                    }),
                    None => debug!("Data for unknown stream {}", data.id),
                }
            }

            ServerPush::UpdateAttributeStream(update) => {
                let info = {
                    let mut state = self.shared.state.lock();
                    state.remote_streams.get_mut(&update.id).map(|stream| {
                        stream.update_attributes(&update.attrs);
                        stream.info()
                    })
                };
                if let Some(info) = info {
                    self.emit(RoomEvent::StreamAttributesUpdate {
                        stream: info,
                        attributes: update.attrs,
                    });
                }
            }

            ServerPush::AutomaticStreamsSubscription(payload) => {
                info!("Automatic streams subscription: {}", payload);
            }

            ServerPush::ConnectionFailed(failure) => {
                let Some(stream_id) = failure.stream_id else {
                    return;
                };
                let local = failure.kind == "publish";
                let message = format!("ICE Connection Failed on {}", failure.kind);
                self.on_stream_failed(local, &stream_id, Some(&message), FailureOrigin::IceServer, false);
            }
        }
    }

    fn on_remove_stream(&self, stream_id: &str) {
        let is_local = self
            .shared
            .state
            .lock()
            .local_streams
            .contains_key(stream_id);
        if is_local {
            self.on_stream_failed(
                true,
                stream_id,
                Some("Stream removed from server"),
                FailureOrigin::Server,
                false,
            );
            return;
        }

        let info = {
            let mut state = self.shared.state.lock();
            let Some(mut stream) = state.remote_streams.remove(stream_id) else {
                return;
            };
            self.release_stream(&mut stream);
            stream.info()
        };
        info!("Stream removed, streamId: {}", stream_id);
        self.emit(RoomEvent::StreamRemoved { stream: info });
    }

    fn on_quality_level(&self, connection_id: &str, level: u8) {
        let Some(level) = QualityLevel::from_index(level) else {
            warn!("Unknown quality level index {}", level);
            return;
        };
        if let Some(connection) = self.shared.manager.get_by_connection_id(connection_id) {
            connection.set_quality_level(level);
        }

        let changed = {
            let mut state = self.shared.state.lock();
            let levels: Vec<QualityLevel> = state
                .local_streams
                .values()
                .chain(state.remote_streams.values())
                .filter(|stream| !stream.is_failed())
                .filter_map(|stream| stream.connection.as_ref())
                .map(|connection| connection.quality_level())
                .collect();
            state.quality.update(levels)
        };
        if let Some(level) = changed {
            info!("Room quality level changed: {}", level);
            self.emit(RoomEvent::QualityLevel { level });
        }
    }

    async fn on_p2p_message(&self, stream_id: String, peer_socket: String, msg: SignalingMessage) {
        let local_connection = {
            let state = self.shared.state.lock();
            state
                .local_streams
                .get(&stream_id)
                .filter(|stream| !stream.is_failed())
                .map(|stream| stream.peer_connections.get(&peer_socket).cloned())
        };
        if let Some(connection) = local_connection {
            match connection {
                Some(connection) => connection.process_signaling_message(msg),
                None => warn!(
                    "Peer signaling without connection, streamId: {}, peerSocket: {}",
                    stream_id, peer_socket
                ),
            }
            return;
        }

        let (existing, stream) = {
            let state = self.shared.state.lock();
            match state.remote_streams.get(&stream_id) {
                Some(stream) => (stream.connection.clone(), stream.clone()),
                None => {
                    debug!("Peer signaling for unknown stream {}", stream_id);
                    return;
                }
            }
        };
        if let Some(connection) = existing {
            connection.process_signaling_message(msg);
            return;
        }

        let settings = self.settings();
        let spec = self.p2p_connection_spec(&stream, &peer_socket, true, &settings);
        let connection = match self.shared.manager.get_or_build(spec, None, false).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to create peer connection, streamId: {}: {}", stream_id, e);
                return;
            }
        };

        let connection = {
            let mut state = self.shared.state.lock();
            match state.remote_streams.get_mut(&stream_id) {
                Some(stream) => Arc::clone(stream.connection.get_or_insert(connection)),
                None => {
                    drop(state);
                    self.shared.manager.maybe_close(&connection, true);
                    return;
                }
            }
        };
        connection.process_signaling_message(msg);
    }

    async fn create_local_p2p_connection(&self, stream_id: &str, peer_socket: &str) {
        let stream = {
            let state = self.shared.state.lock();
            match state.local_streams.get(stream_id) {
                Some(stream) => stream.clone(),
                None => return,
            }
        };
        let settings = self.settings();
        let spec = self.p2p_connection_spec(&stream, peer_socket, false, &settings);
        let connection = match self.shared.manager.get_or_build(spec, None, false).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to create peer connection, streamId: {}: {}", stream_id, e);
                return;
            }
        };

        let registered = {
            let mut state = self.shared.state.lock();
            match state.local_streams.get_mut(stream_id) {
                Some(stream) => {
                    stream
                        .peer_connections
                        .insert(peer_socket.to_string(), Arc::clone(&connection));
                    true
                }
                None => false,
            }
        };
        if !registered {
            self.shared.manager.maybe_close(&connection, true);
            return;
        }

        info!("Peer joined, streamId: {}, peerSocket: {}", stream_id, peer_socket);
        connection.add_stream(AttachedStream {
            id: stream_id.to_string(),
            label: stream.label().to_string(),
            local_media: stream.media().cloned(),
            encodings: stream.encoding_parameters(),
        });
    }

    // ========================================================================
    // Connection events
    // ========================================================================

    fn on_connection_event(&self, event: ConnectionEvent) {
        let session_id = event.session_id;
        match event.kind {
            ConnectionEventKind::Outbound { msg, stream_id } => {
                self.route_outbound(session_id, msg, stream_id)
            }
            ConnectionEventKind::StreamAdded { label } => {
                self.on_remote_stream_added(session_id, &label)
            }
            ConnectionEventKind::StreamRemoved { label } => self.on_remote_stream_removed(&label),
            ConnectionEventKind::IceStateChanged {
                state,
                was_able_to_connect,
            } => {
                debug!(
                    "ICE state changed, sessionId: {}, state: {}",
                    session_id, state
                );
                if state == IceConnectionState::Failed {
                    self.on_ice_failed(session_id, was_able_to_connect);
                }
            }
            ConnectionEventKind::ConnectionFailed { message } => {
                self.emit(RoomEvent::ConnectionFailed {
                    session_id,
                    message,
                });
            }
        }
    }

    fn route_outbound(&self, session_id: u64, msg: SignalingMessage, stream_id: Option<String>) {
        let Some(connection) = self.shared.manager.get(session_id) else {
            debug!(
                "Dropping signaling of closed connection, sessionId: {}, type: {}",
                session_id,
                msg.kind()
            );
            return;
        };

        match connection.route() {
            ConnectionRoute::MediaServer {
                connection_id,
                erizo_id,
            } => {
                if let SignalingMessage::UpdateStream { .. } = &msg {
                    let Some(stream_id) =
                        stream_id.or_else(|| connection.stream_ids().into_iter().next())
                    else {
                        warn!("Dropping updatestream without stream, sessionId: {}", session_id);
                        return;
                    };
                    let msg = match serde_json::to_value(&msg) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Failed to encode updatestream: {}", e);
                            return;
                        }
                    };
                    self.relay_sdp(
                        wire::STREAM_MESSAGE,
                        &StreamMessageRequest {
                            stream_id,
                            erizo_id: erizo_id.clone(),
                            msg,
                            browser: Some(CLIENT_BROWSER.to_string()),
                        },
                    );
                } else {
                    self.relay_sdp(
                        wire::CONNECTION_MESSAGE,
                        &ConnectionMessageRequest {
                            connection_id: connection_id.clone(),
                            erizo_id: erizo_id.clone(),
                            msg,
                            browser: CLIENT_BROWSER.to_string(),
                        },
                    );
                }
            }
            ConnectionRoute::PeerToPeer {
                stream_id,
                peer_socket,
            } => {
                self.relay_sdp(
                    wire::STREAM_MESSAGE_P2P,
                    &P2pMessageRequest {
                        stream_id: stream_id.clone(),
                        peer_socket: peer_socket.clone(),
                        msg,
                    },
                );
            }
        }
    }

    fn on_remote_stream_added(&self, session_id: u64, label: &str) {
        let p2p = self.shared.state.lock().settings.p2p;
        let mut subscribed = Vec::new();
        {
            let mut state = self.shared.state.lock();
            for stream in state.remote_streams.values_mut() {
                if stream.is_local() || stream.label() != label || stream.state != StreamState::Subscribing {
                    continue;
                }
                let connection = match &stream.connection {
                    Some(connection) if connection.session_id() == session_id => {
                        Arc::clone(connection)
                    }
                    Some(_) => continue,
                    None => match self.shared.manager.get(session_id) {
                        Some(connection) => {
                            stream.connection = Some(Arc::clone(&connection));
                            connection
                        }
                        None => continue,
                    },
                };

                info!("Stream subscribed, streamId: {}", stream.id());
                if !p2p && !connection.is_p2p() {
                    connection.add_stream(AttachedStream {
                        id: stream.id().to_string(),
                        label: stream.label().to_string(),
                        local_media: None,
                        encodings: Vec::new(),
                    });
                }
                stream.state = StreamState::Subscribed;
                subscribed.push(stream.info());
            }
        }
        for info in subscribed {
            self.emit(RoomEvent::StreamSubscribed { stream: info });
        }
    }

    fn on_remote_stream_removed(&self, label: &str) {
        let mut state = self.shared.state.lock();
        let ids: Vec<String> = state
            .remote_streams
            .values()
            .filter(|stream| {
                !stream.is_local()
                    && stream.label() == label
                    && stream.state == StreamState::Unsubscribing
            })
            .map(|stream| stream.id().to_string())
            .collect();
        for id in ids {
            if let Some(stream) = state.remote_streams.get_mut(&id) {
                stream.unsubscribing.pc_event_received = true;
            }
            self.maybe_dispatch_unsubscribed(&mut state, &id);
        }
    }

    fn on_ice_failed(&self, session_id: u64, was_able_to_connect: bool) {
        let mut failed_local = Vec::new();
        let mut failed_remote = Vec::new();
        let mut dropped_peer = None;
        let single_pc;
        {
            let mut state = self.shared.state.lock();
            single_pc = state.settings.single_pc;
            for stream in state.local_streams.values_mut() {
                let peer = stream
                    .peer_connections
                    .iter()
                    .find(|(_, c)| c.session_id() == session_id)
                    .map(|(peer, _)| peer.clone());
                if let Some(peer) = peer {
                    dropped_peer = stream.peer_connections.remove(&peer);
                    continue;
                }
                if stream.connection.as_ref().map(|c| c.session_id()) == Some(session_id) {
                    failed_local.push(stream.id().to_string());
                }
            }
            for stream in state.remote_streams.values() {
                if stream.connection.as_ref().map(|c| c.session_id()) == Some(session_id) {
                    failed_remote.push(stream.id().to_string());
                }
            }
        }

        if let Some(connection) = dropped_peer {
            info!("Peer connection ICE failed, closing, sessionId: {}", session_id);
            self.shared.manager.maybe_close(&connection, true);
            return;
        }

        let connection = self.shared.manager.get(session_id);
        for id in &failed_local {
            self.on_stream_failed(true, id, Some("ICE Connection Failed"), FailureOrigin::IceClient, was_able_to_connect);
        }
        for id in &failed_remote {
            self.on_stream_failed(false, id, Some("ICE Connection Failed"), FailureOrigin::IceClient, was_able_to_connect);
        }

        if let (true, Some(connection)) = (single_pc, connection) {
            if let ConnectionRoute::MediaServer {
                connection_id,
                erizo_id,
            } = connection.route()
            {
                self.relay_sdp(
                    wire::CONNECTION_MESSAGE,
                    &ConnectionMessageRequest {
                        connection_id: connection_id.clone(),
                        erizo_id: erizo_id.clone(),
                        msg: SignalingMessage::Failed,
                        browser: CLIENT_BROWSER.to_string(),
                    },
                );
            }
        }
    }
}

async fn run_event_loop(
    room: Weak<RoomShared>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    debug!("Room event loop started");
    loop {
        tokio::select! {
            Some(event) = transport_events.recv() => {
                let Some(shared) = room.upgrade() else { break };
                let room = Room { shared };
                if let Some(signaling) = room.shared.session.handle_transport_event(event) {
                    room.on_signaling_event(signaling).await;
                }
            }
            Some(event) = connection_events.recv() => {
                let Some(shared) = room.upgrade() else { break };
                let room = Room { shared };
                room.on_connection_event(event);
            }
            else => break,
        }
    }
    debug!("Room event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::StreamDescriptor;

    #[test]
    fn test_settings_negotiation() {
        let description = RoomDescription {
            id: Some("room".to_string()),
            client_id: Some("c1".to_string()),
            p2p: false,
            single_pc: true,
            default_video_bw: Some(300),
            max_video_bw: Some(1000),
            ..Default::default()
        };
        let config = RoomConfig {
            single_pc: Some(false),
            max_video_bw: Some(800),
            ..Default::default()
        };

        let settings = RoomSettings::negotiate(&description, &config);
        assert!(!settings.single_pc);
        assert!(!settings.p2p);
        assert_eq!(settings.max_video_bw, Some(800));
        assert_eq!(settings.default_video_bw, Some(300));
        assert_eq!(settings.client_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_server_settings_win_without_overrides() {
        let description = RoomDescription {
            p2p: true,
            single_pc: true,
            max_video_bw: Some(500),
            ..Default::default()
        };
        let settings = RoomSettings::negotiate(&description, &RoomConfig::default());
        assert!(settings.p2p);
        assert!(settings.single_pc);
        assert_eq!(settings.max_video_bw, Some(500));
        assert_eq!(settings.default_video_bw, None);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (room, _events) = Room::with_config(RoomConfig::default());
        assert_eq!(room.status(), RoomStatus::Disconnected);

        let stream = Stream::local(StreamOptions {
            data: true,
            ..Default::default()
        });
        assert!(matches!(
            room.publish(stream, PublishOptions::default()).await,
            Err(Error::Disconnected(_))
        ));
        assert!(matches!(
            room.subscribe("1", SubscribeOptions::default()).await,
            Err(Error::Disconnected(_))
        ));
        assert!(matches!(room.connect(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_streams_by_attribute() {
        let (room, _events) = Room::with_config(RoomConfig::default());
        {
            let mut state = room.shared.state.lock();
            for (id, team) in [("1", "red"), ("2", "blue"), ("3", "red")] {
                let mut attributes = Map::new();
                attributes.insert("team".to_string(), json!(team));
                let descriptor = StreamDescriptor {
                    id: id.to_string(),
                    attributes,
                    ..Default::default()
                };
                state
                    .remote_streams
                    .insert(id.to_string(), Stream::remote(&descriptor, false));
            }
        }

        let mut red: Vec<String> = room
            .streams_by_attribute("team", &json!("red"))
            .into_iter()
            .map(|s| s.id)
            .collect();
        red.sort();
        assert_eq!(red, vec!["1".to_string(), "3".to_string()]);
        assert_eq!(room.remote_streams().len(), 3);
    }
}
