//! Events raised by a room

use crate::peer::QualityLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a stream failure was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureOrigin {
    /// Local ICE agent
    IceClient,
    /// Media server ICE agent
    IceServer,
    /// Server-side removal
    Server,
    Unknown,
}

impl FailureOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureOrigin::IceClient => "ice-client",
            FailureOrigin::IceServer => "ice-server",
            FailureOrigin::Server => "server",
            FailureOrigin::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a stream carried by events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub id: String,
    pub label: String,
    pub local: bool,
    pub audio: bool,
    pub video: bool,
    pub data: bool,
    pub screen: bool,
    pub attributes: Map<String, Value>,
}

/// Room event delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Handshake completed; streams already present in the room
    RoomConnected { streams: Vec<StreamInfo> },
    /// Room left, `"expected-disconnection"` or `"unexpected-disconnection"`
    RoomDisconnected { message: String },
    RoomReconnecting { message: String },
    RoomReconnected,
    RoomError { message: String },
    /// Worst quality across live streams changed
    QualityLevel { level: QualityLevel },
    StreamAdded { stream: StreamInfo },
    StreamRemoved { stream: StreamInfo },
    StreamSubscribed { stream: StreamInfo },
    StreamUnsubscribed { stream: StreamInfo },
    StreamFailed {
        stream: StreamInfo,
        message: String,
        origin: FailureOrigin,
        was_able_to_connect: bool,
    },
    StreamData { stream: StreamInfo, msg: Value },
    StreamAttributesUpdate {
        stream: StreamInfo,
        attributes: Map<String, Value>,
    },
    BandwidthAlert {
        stream: StreamInfo,
        bandwidth: f64,
        message: Option<String>,
    },
    /// A connection raised its terminal failure
    ConnectionFailed { session_id: u64, message: String },
}

impl RoomEvent {
    /// Event name as applications know it
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::RoomConnected { .. } => "room-connected",
            RoomEvent::RoomDisconnected { .. } => "room-disconnected",
            RoomEvent::RoomReconnecting { .. } => "room-reconnecting",
            RoomEvent::RoomReconnected => "room-reconnected",
            RoomEvent::RoomError { .. } => "room-error",
            RoomEvent::QualityLevel { .. } => "quality-level",
            RoomEvent::StreamAdded { .. } => "stream-added",
            RoomEvent::StreamRemoved { .. } => "stream-removed",
            RoomEvent::StreamSubscribed { .. } => "stream-subscribed",
            RoomEvent::StreamUnsubscribed { .. } => "stream-unsubscribed",
            RoomEvent::StreamFailed { .. } => "stream-failed",
            RoomEvent::StreamData { .. } => "stream-data",
            RoomEvent::StreamAttributesUpdate { .. } => "stream-attributes-update",
            RoomEvent::BandwidthAlert { .. } => "bandwidth-alert",
            RoomEvent::ConnectionFailed { .. } => "connection-failed",
        }
    }
}
