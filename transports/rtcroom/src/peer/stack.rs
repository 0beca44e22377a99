//! Media stack capability interface
//!
//! A [`MediaStack`] is the platform transport behind one connection: it owns
//! the peer connection, produces and applies session descriptions and reports
//! ICE and track events. Connections only ever talk to this trait; the
//! concrete stack is picked by [`StackKind`] through a [`StackFactory`].

use crate::media::MediaHandle;
use crate::signaling::protocol::{IceCandidate, IceServer, SignalingMessage};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// ICE connection state reported by a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        }
    }

    /// Connectivity was established
    pub fn is_connected(&self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

impl std::fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event raised by a stack
#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
    /// Signaling the stack produced on its own (local candidates, renegotiation)
    Signaling(SignalingMessage),
    /// ICE connection state changed
    IceStateChanged(IceConnectionState),
    /// Remote media with this label arrived
    StreamAdded { label: String },
    /// Remote media with this label went away
    StreamRemoved { label: String },
}

/// Per-layer send parameters for simulcast video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingParameters {
    pub rid: String,
    pub scale_resolution_down_by: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u64>,
}

/// Parameters a stack is built with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackSpec {
    /// Manager-assigned session id of the owning connection
    pub session_id: u64,
    /// Server-assigned connection id (media-server mode)
    pub connection_id: Option<String>,
    /// The connection receives media (subscribe side)
    pub is_remote: bool,
    /// Direct peer link instead of a media server
    pub p2p: bool,
    pub ice_servers: Vec<IceServer>,
    /// Only gather relay candidates
    pub force_turn: bool,
    pub audio: bool,
    pub video: bool,
    pub data: bool,
    /// kbps
    pub max_audio_bw: Option<u32>,
    /// kbps
    pub max_video_bw: Option<u32>,
    /// Label of the stream the connection was built for
    pub label: Option<String>,
}

/// Which stack implementation to build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackKind {
    /// Media-less stack exchanging synthetic descriptions
    #[default]
    Fake,
    /// webrtc-rs peer connection
    Native,
}

/// Capability set of a platform media stack
#[async_trait]
pub trait MediaStack: Send + Sync {
    fn kind(&self) -> StackKind;

    /// Create and apply a local offer, returning its SDP
    async fn create_offer(&self, is_subscribe: bool) -> Result<String>;

    /// Apply a remote offer, returning the local answer SDP
    async fn process_offer(&self, sdp: &str) -> Result<String>;

    /// Apply a remote answer
    async fn process_answer(&self, sdp: &str) -> Result<()>;

    /// Apply new bandwidth limits to the negotiated session
    async fn negotiate_max_bw(&self, config: &Value) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Start sending local media
    async fn attach_local_media(
        &self,
        media: &MediaHandle,
        encodings: &[EncodingParameters],
    ) -> Result<()>;

    /// Stop sending local media
    async fn detach_local_media(&self, media: &MediaHandle) -> Result<()>;

    /// Restart ICE, returning the offer that carries new credentials
    async fn restart_ice(&self) -> Result<String>;

    /// Forward a configuration change to the stack
    async fn update_spec(&self, config: &Value) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds stacks for new connections
#[async_trait]
pub trait StackFactory: Send + Sync {
    async fn build(
        &self,
        spec: &StackSpec,
        events: mpsc::UnboundedSender<StackEvent>,
    ) -> Result<Arc<dyn MediaStack>>;
}

/// Factory selecting the stack by [`StackKind`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStackFactory {
    kind: StackKind,
}

impl DefaultStackFactory {
    pub fn new(kind: StackKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl StackFactory for DefaultStackFactory {
    async fn build(
        &self,
        spec: &StackSpec,
        events: mpsc::UnboundedSender<StackEvent>,
    ) -> Result<Arc<dyn MediaStack>> {
        match self.kind {
            StackKind::Fake => Ok(Arc::new(super::fake::FakeStack::new(spec, events))),
            #[cfg(feature = "native-stack")]
            StackKind::Native => Ok(Arc::new(
                super::native::NativeStack::new(spec, events).await?,
            )),
            #[cfg(not(feature = "native-stack"))]
            StackKind::Native => {
                let _ = (spec, events);
                Err(crate::Error::InvalidConfig(
                    "native stack requires the native-stack feature".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_state_connected() {
        assert!(IceConnectionState::Connected.is_connected());
        assert!(IceConnectionState::Completed.is_connected());
        assert!(!IceConnectionState::Checking.is_connected());
        assert_eq!(IceConnectionState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_stack_kind_serde() {
        assert_eq!(StackKind::default(), StackKind::Fake);
        let kind: StackKind = serde_json::from_str("\"native\"").unwrap();
        assert_eq!(kind, StackKind::Native);
    }

    #[tokio::test]
    async fn test_default_factory_builds_fake() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let stack = DefaultStackFactory::new(StackKind::Fake)
            .build(&StackSpec::default(), tx)
            .await
            .unwrap();
        assert_eq!(stack.kind(), StackKind::Fake);
    }
}
