//! Signaling wire protocol
//!
//! Frames exchanged with the room controller are JSON objects tagged by
//! `type`. Requests carry an id and are answered by a response with the
//! same id; events are unsolicited pushes in either direction.

use crate::{Error, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request and push event names
pub mod events {
    // Requests (client -> server)
    pub const PUBLISH: &str = "publish";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNPUBLISH: &str = "unpublish";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const STREAM_MESSAGE: &str = "streamMessage";
    pub const CONNECTION_MESSAGE: &str = "connectionMessage";
    pub const STREAM_MESSAGE_P2P: &str = "streamMessageP2P";
    pub const SEND_DATA_STREAM: &str = "sendDataStream";
    pub const UPDATE_STREAM_ATTRIBUTES: &str = "updateStreamAttributes";
    pub const START_RECORDER: &str = "startRecorder";
    pub const STOP_RECORDER: &str = "stopRecorder";
    pub const GET_STREAM_STATS: &str = "getStreamStats";
    pub const SET_STREAM_PRIORITY_STRATEGY: &str = "setStreamPriorityStrategy";
    pub const SET_CONNECTION_TARGET_BW: &str = "setConnectionTargetBandwidth";
    pub const CLIENT_DISCONNECTION: &str = "clientDisconnection";

    // Pushes (server -> client)
    pub const CONNECTED: &str = "connected";
    pub const ERROR: &str = "error";
    pub const ON_ADD_STREAM: &str = "onAddStream";
    pub const ON_REMOVE_STREAM: &str = "onRemoveStream";
    pub const STREAM_MESSAGE_ERIZO: &str = "stream_message_erizo";
    pub const STREAM_MESSAGE_P2P_PUSH: &str = "stream_message_p2p";
    pub const CONNECTION_MESSAGE_ERIZO: &str = "connection_message_erizo";
    pub const PUBLISH_ME: &str = "publish_me";
    pub const UNPUBLISH_ME: &str = "unpublish_me";
    pub const ON_BANDWIDTH_ALERT: &str = "onBandwidthAlert";
    pub const ON_DATA_STREAM: &str = "onDataStream";
    pub const ON_UPDATE_ATTRIBUTE_STREAM: &str = "onUpdateAttributeStream";
    pub const ON_AUTOMATIC_STREAMS_SUBSCRIPTION: &str = "onAutomaticStreamsSubscription";
    pub const CONNECTION_FAILED: &str = "connection_failed";
}

/// A single frame on the signaling channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    /// Request expecting a response with the same id
    Request {
        id: u64,
        event: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Acknowledgement of a request
    Response {
        id: u64,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Unsolicited event
    Event {
        event: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl WireFrame {
    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }
}

/// Arguments of a request acknowledgement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ack(pub Vec<Value>);

impl Ack {
    /// Argument at `index`, `None` when absent
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// True when the argument is absent or `null`
    pub fn is_null_at(&self, index: usize) -> bool {
        matches!(self.arg(index), None | Some(Value::Null))
    }

    /// Argument rendered as an id (strings and numbers are accepted)
    pub fn string_at(&self, index: usize) -> Option<String> {
        match self.arg(index)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Human-readable error text for the argument at `index`
    pub fn error_text(&self, index: usize) -> String {
        match self.arg(index) {
            Some(Value::String(s)) => s.clone(),
            None | Some(Value::Null) => "unknown error".to_string(),
            Some(other) => other.to_string(),
        }
    }

    /// Apply the message ack convention
    ///
    /// A leading `"success"` unwraps the second argument, a leading `"error"`
    /// turns into a rejection, anything else is returned as is.
    pub fn into_message_result(self) -> Result<Ack> {
        match self.0.first().and_then(Value::as_str) {
            Some("success") => Ok(Ack(vec![self.0.get(1).cloned().unwrap_or(Value::Null)])),
            Some("error") => Err(Error::RequestRejected(self.error_text(1))),
            _ => Ok(self),
        }
    }
}

/// Wrap request options the way `publish`/`subscribe`/message relays expect
pub fn sdp_envelope<T: Serialize>(options: &T, sdp: Option<&str>) -> Result<Vec<Value>> {
    let mut envelope = Map::new();
    envelope.insert("options".to_string(), serde_json::to_value(options)?);
    envelope.insert(
        "sdp".to_string(),
        sdp.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null),
    );
    Ok(vec![Value::Object(envelope)])
}

// ============================================================================
// Deserialization helpers
// ============================================================================

/// Accept an id sent either as a string or as a number
pub fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Optional variant of [`string_or_number`]
pub fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Interpret flags that may arrive as booleans, constraint objects or strings
fn truthy<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(de::Error::custom(format!("expected url string, got {}", other))),
            })
            .collect(),
        other => Err(de::Error::custom(format!("expected url list, got {}", other))),
    }
}

/// Signaling messages are sometimes relayed as JSON text instead of objects
fn message_object<'de, D>(deserializer: D) -> std::result::Result<SignalingMessage, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => serde_json::from_str(&text).map_err(de::Error::custom),
        other => serde_json::from_value(other).map_err(de::Error::custom),
    }
}

fn candidate_object<'de, D>(deserializer: D) -> std::result::Result<IceCandidate, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => serde_json::from_str(&text).map_err(de::Error::custom),
        other => serde_json::from_value(other).map_err(de::Error::custom),
    }
}

fn attributes_or_null<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

// ============================================================================
// Room description and stream descriptors
// ============================================================================

/// ICE server entry handed out by the room controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(alias = "url", default, deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Handshake response delivered with the `connected` push
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDescription {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub client_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub streams: Vec<StreamDescriptor>,
    #[serde(default)]
    pub p2p: bool,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default, rename = "singlePC")]
    pub single_pc: bool,
    #[serde(default, rename = "defaultVideoBW")]
    pub default_video_bw: Option<u32>,
    #[serde(default, rename = "maxVideoBW")]
    pub max_video_bw: Option<u32>,
    #[serde(default)]
    pub stream_priority_strategy: Option<Value>,
    #[serde(default)]
    pub connection_target_bw: Option<u32>,
}

/// A stream as announced by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "truthy")]
    pub audio: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub video: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub data: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub screen: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "attributes_or_null")]
    pub attributes: Map<String, Value>,
}

// ============================================================================
// Requests
// ============================================================================

/// How a published stream reaches the room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishKind {
    /// Through the media server
    Erizo,
    /// Directly to each subscriber
    P2p,
    /// Data only, relayed by the controller
    Data,
    /// Pulled by the media server from a URL
    Url,
    /// Replayed from a recording
    Recording,
}

/// Mute flags sent with publish/subscribe requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteState {
    pub audio: bool,
    pub video: bool,
}

fn encrypt_default() -> bool {
    true
}

/// Options of a `publish` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub state: PublishKind,
    pub data: bool,
    pub audio: bool,
    pub video: bool,
    pub label: String,
    pub screen: bool,
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub create_offer: bool,
    pub mute_stream: MuteState,
    #[serde(default = "encrypt_default")]
    pub encrypt_transport: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_profile: Option<Value>,
    #[serde(default, rename = "minVideoBW", skip_serializing_if = "Option::is_none")]
    pub min_video_bw: Option<u32>,
    #[serde(default, rename = "maxVideoBW", skip_serializing_if = "Option::is_none")]
    pub max_video_bw: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

/// Video constraints of a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
}

/// Requested video: a flag or explicit constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VideoRequest {
    Enabled(bool),
    Constraints(VideoConstraints),
}

impl VideoRequest {
    /// Whether any video is requested
    pub fn is_enabled(&self) -> bool {
        match self {
            VideoRequest::Enabled(enabled) => *enabled,
            VideoRequest::Constraints(_) => true,
        }
    }
}

/// Options of a media `subscribe` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub stream_id: String,
    pub audio: bool,
    pub video: VideoRequest,
    pub data: bool,
    #[serde(default, rename = "maxVideoBW", skip_serializing_if = "Option::is_none")]
    pub max_video_bw: Option<u32>,
    pub browser: String,
    #[serde(default)]
    pub create_offer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub mute_stream: MuteState,
    #[serde(default = "encrypt_default")]
    pub encrypt_transport: bool,
    #[serde(default)]
    pub slide_show_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_profile: Option<Value>,
}

/// Options of a data-only or peer-to-peer `subscribe` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightSubscribeRequest {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Relay of a connection-level signaling message to the media server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMessageRequest {
    pub connection_id: String,
    pub erizo_id: Option<String>,
    pub msg: SignalingMessage,
    pub browser: String,
}

/// Relay of a stream-level message (`updatestream`, control)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessageRequest {
    pub stream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub erizo_id: Option<String>,
    pub msg: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

/// Relay of a peer-to-peer signaling message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pMessageRequest {
    pub stream_id: String,
    pub peer_socket: String,
    pub msg: SignalingMessage,
}

// ============================================================================
// Per-connection signaling messages
// ============================================================================

/// ICE candidate as carried in signaling messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: i32,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: String,
    pub candidate: String,
}

impl IceCandidate {
    /// Marker sent once local gathering completes
    pub fn end_of_candidates() -> Self {
        Self {
            sdp_m_line_index: -1,
            sdp_mid: "end".to_string(),
            candidate: "end".to_string(),
        }
    }

    /// True for the end-of-candidates marker
    pub fn is_end(&self) -> bool {
        self.candidate == "end"
    }

    /// Candidate line with the SDP attribute prefix, as the media server expects it
    pub fn with_attribute_prefix(mut self) -> Self {
        if !self.is_end() && !self.candidate.starts_with("a=") {
            self.candidate = format!("a={}", self.candidate);
        }
        self
    }

    /// Candidate line without the SDP attribute prefix
    pub fn without_attribute_prefix(mut self) -> Self {
        if let Some(stripped) = self.candidate.strip_prefix("a=") {
            self.candidate = stripped.to_string();
        }
        self
    }
}

/// Signaling message exchanged for one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
    #[serde(rename = "candidate")]
    Candidate {
        #[serde(deserialize_with = "candidate_object")]
        candidate: IceCandidate,
    },
    #[serde(rename = "offer-error")]
    OfferError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<String>,
    },
    #[serde(rename = "updatestream")]
    UpdateStream { config: Value },
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "error")]
    Error {
        #[serde(default, rename = "previousType", skip_serializing_if = "Option::is_none")]
        previous_type: Option<String>,
    },
    #[serde(rename = "quality_level")]
    QualityLevel { level: u8 },
    #[serde(other)]
    Unknown,
}

impl SignalingMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::OfferError { .. } => "offer-error",
            SignalingMessage::UpdateStream { .. } => "updatestream",
            SignalingMessage::Failed => "failed",
            SignalingMessage::Error { .. } => "error",
            SignalingMessage::QualityLevel { .. } => "quality_level",
            SignalingMessage::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Server pushes
// ============================================================================

/// `connection_message_erizo` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub connection_id: String,
    #[serde(deserialize_with = "message_object")]
    pub evt: SignalingMessage,
}

/// `stream_message_p2p` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pStreamMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub stream_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub peer_socket: String,
    #[serde(deserialize_with = "message_object")]
    pub msg: SignalingMessage,
}

/// `publish_me` / `unpublish_me` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRequest {
    #[serde(deserialize_with = "string_or_number")]
    pub stream_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub peer_socket: String,
}

/// `onBandwidthAlert` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BandwidthAlert {
    #[serde(rename = "streamID", default, deserialize_with = "opt_string_or_number")]
    pub stream_id: Option<String>,
    #[serde(default)]
    pub bandwidth: f64,
    #[serde(default)]
    pub message: Option<String>,
}

/// `onDataStream` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DataMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub msg: Value,
}

/// `onUpdateAttributeStream` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttributeUpdate {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "attributes_or_null")]
    pub attrs: Map<String, Value>,
}

/// `connection_failed` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionFailure {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub stream_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct StreamRef {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
}

/// Decoded server push event
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPush {
    AddStream(StreamDescriptor),
    RemoveStream { id: String },
    StreamMessageErizo(Value),
    StreamMessageP2p(P2pStreamMessage),
    ConnectionMessageErizo(ConnectionMessage),
    PublishMe(PeerRequest),
    UnpublishMe(PeerRequest),
    BandwidthAlert(BandwidthAlert),
    DataStream(DataMessage),
    UpdateAttributeStream(AttributeUpdate),
    AutomaticStreamsSubscription(Value),
    ConnectionFailed(ConnectionFailure),
}

impl ServerPush {
    /// Decode a push event; unknown event names yield `Ok(None)`
    pub fn parse(event: &str, args: Vec<Value>) -> Result<Option<Self>> {
        let first = args.into_iter().next().unwrap_or(Value::Null);

        let decode = |what: &str, e: serde_json::Error| {
            Error::SerializationError(format!("Invalid {} payload: {}", what, e))
        };

        let push = match event {
            events::ON_ADD_STREAM => ServerPush::AddStream(
                serde_json::from_value(first).map_err(|e| decode(event, e))?,
            ),
            events::ON_REMOVE_STREAM => {
                let stream: StreamRef =
                    serde_json::from_value(first).map_err(|e| decode(event, e))?;
                ServerPush::RemoveStream { id: stream.id }
            }
            events::STREAM_MESSAGE_ERIZO => ServerPush::StreamMessageErizo(first),
            events::STREAM_MESSAGE_P2P_PUSH => ServerPush::StreamMessageP2p(
                serde_json::from_value(first).map_err(|e| decode(event, e))?,
            ),
            events::CONNECTION_MESSAGE_ERIZO => ServerPush::ConnectionMessageErizo(
                serde_json::from_value(first).map_err(|e| decode(event, e))?,
            ),
            events::PUBLISH_ME => {
                ServerPush::PublishMe(serde_json::from_value(first).map_err(|e| decode(event, e))?)
            }
            events::UNPUBLISH_ME => ServerPush::UnpublishMe(
                serde_json::from_value(first).map_err(|e| decode(event, e))?,
            ),
            events::ON_BANDWIDTH_ALERT => ServerPush::BandwidthAlert(
                serde_json::from_value(first).map_err(|e| decode(event, e))?,
            ),
            events::ON_DATA_STREAM => {
                ServerPush::DataStream(serde_json::from_value(first).map_err(|e| decode(event, e))?)
            }
            events::ON_UPDATE_ATTRIBUTE_STREAM => ServerPush::UpdateAttributeStream(
                serde_json::from_value(first).map_err(|e| decode(event, e))?,
            ),
            events::ON_AUTOMATIC_STREAMS_SUBSCRIPTION => {
                ServerPush::AutomaticStreamsSubscription(first)
            }
            events::CONNECTION_FAILED => ServerPush::ConnectionFailed(
                serde_json::from_value(first).map_err(|e| decode(event, e))?,
            ),
            _ => return Ok(None),
        };

        Ok(Some(push))
    }
}
