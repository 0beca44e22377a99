//! Stream model
//!
//! A [`Stream`] is either local (published by this client) or remote
//! (announced by the server). The room owns every stream; connections only
//! know stream ids and labels.

use super::events::StreamInfo;
use crate::media::{MediaConstraints, MediaHandle, MediaSource, VideoSize};
use crate::peer::{Connection, EncodingParameters};
use crate::signaling::protocol::{MuteState, StreamDescriptor, VideoConstraints, VideoRequest};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Id reported by local streams before the server assigns one
pub const LOCAL_STREAM_ID: &str = "local";

const DEFAULT_SIMULCAST_SPATIAL_LAYERS: u32 = 3;
const SCALE_RESOLUTION_DOWN_BASE: f64 = 2.0;
const SCALE_RESOLUTION_DOWN_BASE_SCREENSHARE: f64 = 1.0;

/// Subscription state of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamState::Unsubscribed => "unsubscribed",
            StreamState::Subscribing => "subscribing",
            StreamState::Subscribed => "subscribed",
            StreamState::Unsubscribing => "unsubscribing",
        };
        f.write_str(name)
    }
}

/// The two completion signals of an unsubscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnsubscribeProgress {
    /// Server acknowledged the unsubscribe request
    pub callback_received: bool,
    /// The connection reported the remote media gone
    pub pc_event_received: bool,
}

/// Options of a local stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamOptions {
    pub audio: bool,
    pub video: bool,
    pub data: bool,
    pub screen: bool,
    /// Defaults to a random label
    pub label: Option<String>,
    pub attributes: Map<String, Value>,
    /// Media pulled by the media server from this URL
    pub url: Option<String>,
    /// Media replayed from this recording
    pub recording: Option<String>,
    pub video_size: Option<VideoSize>,
    pub video_frame_rate: Option<u32>,
}

/// Simulcast layout of a published video
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulcastOptions {
    /// Defaults to 3
    pub num_spatial_layers: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Options of [`crate::Room::publish`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublishOptions {
    /// kbps
    #[serde(rename = "maxVideoBW")]
    pub max_video_bw: Option<u32>,
    /// kbps
    #[serde(rename = "minVideoBW")]
    pub min_video_bw: Option<u32>,
    /// kbps
    #[serde(rename = "maxAudioBW")]
    pub max_audio_bw: Option<u32>,
    pub simulcast: Option<SimulcastOptions>,
    pub metadata: Option<Value>,
    pub create_offer: bool,
    pub mute_stream: MuteState,
    #[serde(default = "default_true")]
    pub encrypt_transport: bool,
    pub handler_profile: Option<Value>,
    pub scheme: Option<String>,
    pub force_turn: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            max_video_bw: None,
            min_video_bw: None,
            max_audio_bw: None,
            simulcast: None,
            metadata: None,
            create_offer: false,
            mute_stream: MuteState::default(),
            encrypt_transport: true,
            handler_profile: None,
            scheme: None,
            force_turn: false,
        }
    }
}

/// Options of [`crate::Room::subscribe`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscribeOptions {
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default = "default_true")]
    pub video: bool,
    /// Explicit video constraints; implies `video`
    pub video_constraints: Option<VideoConstraints>,
    #[serde(default = "default_true")]
    pub data: bool,
    /// kbps
    #[serde(rename = "maxVideoBW")]
    pub max_video_bw: Option<u32>,
    /// kbps
    #[serde(rename = "maxAudioBW")]
    pub max_audio_bw: Option<u32>,
    pub metadata: Option<Value>,
    pub create_offer: bool,
    pub mute_stream: MuteState,
    #[serde(default = "default_true")]
    pub encrypt_transport: bool,
    pub slide_show_mode: bool,
    pub handler_profile: Option<Value>,
    pub force_turn: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            video_constraints: None,
            data: true,
            max_video_bw: None,
            max_audio_bw: None,
            metadata: None,
            create_offer: false,
            mute_stream: MuteState::default(),
            encrypt_transport: true,
            slide_show_mode: false,
            handler_profile: None,
            force_turn: false,
        }
    }
}

/// Per-link limits remembered for connections built later
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LinkLimits {
    pub max_audio_bw: Option<u32>,
    pub max_video_bw: Option<u32>,
    pub force_turn: bool,
}

/// Cap `value` to `limit` when both are known
pub fn cap_bandwidth(value: Option<u32>, limit: Option<u32>) -> Option<u32> {
    match (value, limit) {
        (Some(value), Some(limit)) if value > limit => Some(limit),
        (value, _) => value,
    }
}

/// Encoder bitrate for a connection bandwidth, in bits per second
///
/// Leaves 10% for the transport and subtracts 50 packets of 40 bytes of
/// per-second header overhead.
pub fn adapter_max_video_bw(kbps: u32) -> u64 {
    let translated = f64::from(kbps) * 1000.0 * 0.90 - 50.0 * 40.0 * 8.0;
    translated.max(0.0) as u64
}

/// A local or remote stream
#[derive(Debug, Clone)]
pub struct Stream {
    id: Option<String>,
    label: String,
    local: bool,
    audio: bool,
    video: bool,
    data: bool,
    screen: bool,
    url: Option<String>,
    recording: Option<String>,
    video_size: Option<VideoSize>,
    video_frame_rate: Option<u32>,
    attributes: Map<String, Value>,
    media: Option<MediaHandle>,
    pub(crate) state: StreamState,
    pub(crate) failed: bool,
    pub(crate) unsubscribing: UnsubscribeProgress,
    pub(crate) connection: Option<Arc<Connection>>,
    /// Peer-to-peer publishing: one connection per subscriber socket
    pub(crate) peer_connections: HashMap<String, Arc<Connection>>,
    pub(crate) link: LinkLimits,
    max_video_bw_bits: Option<u64>,
    simulcast: Option<SimulcastOptions>,
}

impl Stream {
    /// Create a local stream; call [`Stream::init`] before publishing media
    pub fn local(options: StreamOptions) -> Self {
        Self {
            id: None,
            label: options
                .label
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            local: true,
            audio: options.audio,
            video: options.video,
            data: options.data,
            screen: options.screen,
            url: options.url,
            recording: options.recording,
            video_size: options.video_size,
            video_frame_rate: options.video_frame_rate,
            attributes: options.attributes,
            media: None,
            state: StreamState::Unsubscribed,
            failed: false,
            unsubscribing: UnsubscribeProgress::default(),
            connection: None,
            peer_connections: HashMap::new(),
            link: LinkLimits::default(),
            max_video_bw_bits: None,
            simulcast: None,
        }
    }

    /// Create a stream announced by the server
    pub fn remote(descriptor: &StreamDescriptor, local: bool) -> Self {
        Self {
            id: Some(descriptor.id.clone()),
            label: descriptor
                .label
                .clone()
                .unwrap_or_else(|| descriptor.id.clone()),
            local,
            audio: descriptor.audio,
            video: descriptor.video,
            data: descriptor.data,
            screen: descriptor.screen,
            url: None,
            recording: None,
            video_size: None,
            video_frame_rate: None,
            attributes: descriptor.attributes.clone(),
            media: None,
            state: StreamState::Unsubscribed,
            failed: false,
            unsubscribing: UnsubscribeProgress::default(),
            connection: None,
            peer_connections: HashMap::new(),
            link: LinkLimits::default(),
            max_video_bw_bits: None,
            simulcast: None,
        }
    }

    /// Server id, or `"local"` while unassigned
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(LOCAL_STREAM_ID)
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    pub(crate) fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn has_audio(&self) -> bool {
        self.audio
    }

    pub fn has_video(&self) -> bool {
        self.video
    }

    pub fn has_data(&self) -> bool {
        self.data
    }

    pub fn has_screen(&self) -> bool {
        self.screen
    }

    /// Camera or screen video
    pub fn carries_video(&self) -> bool {
        self.video || self.screen
    }

    pub fn has_media(&self) -> bool {
        self.audio || self.video || self.screen
    }

    /// Media comes from a URL or a recording rather than local capture
    pub fn is_external(&self) -> bool {
        self.url.is_some() || self.recording.is_some()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn recording(&self) -> Option<&str> {
        self.recording.as_deref()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn unsubscribe_progress(&self) -> UnsubscribeProgress {
        self.unsubscribing
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub(crate) fn set_attributes(&mut self, attributes: Map<String, Value>) {
        self.attributes = attributes;
    }

    /// Merge attributes pushed by the server
    pub(crate) fn update_attributes(&mut self, attributes: &Map<String, Value>) {
        for (key, value) in attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    pub fn media(&self) -> Option<&MediaHandle> {
        self.media.as_ref()
    }

    /// Connections currently carrying this stream
    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.connection
            .iter()
            .chain(self.peer_connections.values())
            .cloned()
            .collect()
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id().to_string(),
            label: self.label.clone(),
            local: self.local,
            audio: self.audio,
            video: self.video,
            data: self.data,
            screen: self.screen,
            attributes: self.attributes.clone(),
        }
    }

    /// Acquire local media
    ///
    /// Data-only and external streams need no capture and succeed at once.
    pub async fn init(&mut self, source: &dyn MediaSource) -> Result<()> {
        if !self.local {
            return Err(Error::InvalidStream(format!(
                "cannot initialize remote stream {}",
                self.id()
            )));
        }
        if !self.has_media() || self.is_external() {
            return Ok(());
        }

        let constraints = MediaConstraints {
            audio: self.audio,
            video: self.video,
            screen: self.screen,
            video_size: self.video_size,
            video_frame_rate: self.video_frame_rate,
        };
        let media = source.acquire(&constraints).await?;
        info!(
            "Local media acquired, label: {}, tracks: {}",
            self.label,
            media.tracks.len()
        );
        self.media = Some(media);
        Ok(())
    }

    /// Set the sending bandwidth limit of a local stream, in kbps
    pub(crate) fn set_max_video_bw(&mut self, kbps: u32) {
        if !self.local {
            return;
        }
        let translated = adapter_max_video_bw(kbps);
        info!(
            "Setting maxVideoBW, streamId: {}, maxVideoBW: {}, translated: {}",
            self.id(),
            kbps,
            translated
        );
        self.max_video_bw_bits = Some(translated);
    }

    pub(crate) fn set_simulcast(&mut self, simulcast: Option<SimulcastOptions>) {
        self.simulcast = simulcast;
    }

    /// Per-layer video send parameters
    ///
    /// Without simulcast a single layer carries the bandwidth limit. With
    /// simulcast, layer `l` of `n` is scaled down by `base^(n-1-l)` and
    /// the top layer carries the limit.
    pub fn encoding_parameters(&self) -> Vec<EncodingParameters> {
        if !self.local || !self.carries_video() {
            return Vec::new();
        }

        let layers = match self.simulcast {
            Some(simulcast) => simulcast
                .num_spatial_layers
                .unwrap_or(DEFAULT_SIMULCAST_SPATIAL_LAYERS)
                .max(1),
            None => 1,
        };
        let base = if self.screen {
            SCALE_RESOLUTION_DOWN_BASE_SCREENSHARE
        } else {
            SCALE_RESOLUTION_DOWN_BASE
        };

        (0..layers)
            .map(|layer| EncodingParameters {
                rid: layer.to_string(),
                scale_resolution_down_by: base.powi((layers - 1 - layer) as i32),
                max_bitrate: if layer == layers - 1 {
                    self.max_video_bw_bits
                } else {
                    None
                },
            })
            .collect()
    }

    /// Drop media kinds a subscription cannot get from this stream
    pub fn check_subscribe_options(&self, options: &mut SubscribeOptions) {
        if self.local {
            return;
        }
        let wants_video = options.video || options.video_constraints.is_some();
        if wants_video && !self.carries_video() {
            warn!(
                "Trying to subscribe to video when there is no video, streamId: {}",
                self.id()
            );
            options.video = false;
            options.video_constraints = None;
        }
        if options.audio && !self.audio {
            warn!(
                "Trying to subscribe to audio when there is no audio, streamId: {}",
                self.id()
            );
            options.audio = false;
        }
        if options.slide_show_mode && !self.carries_video() {
            warn!(
                "Cannot enable slideShowMode without video, streamId: {}",
                self.id()
            );
            options.slide_show_mode = false;
        }
    }

    /// Remove fields that cannot change on an established stream
    pub fn check_update_config(&self, config: &mut Map<String, Value>) {
        let audio = config.remove("audio");
        let screen = config.remove("screen");
        if audio.is_some() || screen.is_some() {
            warn!(
                "Cannot update type of subscription, streamId: {}",
                self.id()
            );
        }
        if !self.local && !self.carries_video() && config.get("slideShowMode") == Some(&Value::Bool(true)) {
            warn!(
                "Cannot enable slideShowMode without video, streamId: {}",
                self.id()
            );
            config.insert("slideShowMode".to_string(), Value::Bool(false));
        }
    }

    /// Video part of a subscribe request
    pub fn video_request(&self, options: &SubscribeOptions) -> VideoRequest {
        if !self.carries_video() {
            return VideoRequest::Enabled(false);
        }
        match &options.video_constraints {
            Some(constraints) => VideoRequest::Constraints(constraints.clone()),
            None => VideoRequest::Enabled(options.video),
        }
    }

    /// Clear per-subscription state after teardown
    pub(crate) fn reset_subscription(&mut self) {
        self.state = StreamState::Unsubscribed;
        self.unsubscribing = UnsubscribeProgress::default();
        self.connection = None;
        self.failed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticMediaSource;

    fn remote(audio: bool, video: bool) -> Stream {
        Stream::remote(
            &StreamDescriptor {
                id: "42".to_string(),
                audio,
                video,
                label: Some("lbl".to_string()),
                ..Default::default()
            },
            false,
        )
    }

    #[test]
    fn test_local_id_placeholder() {
        let mut stream = Stream::local(StreamOptions {
            audio: true,
            ..Default::default()
        });
        assert_eq!(stream.id(), LOCAL_STREAM_ID);
        assert!(!stream.has_id());
        stream.set_id("100".to_string());
        assert_eq!(stream.id(), "100");
        assert_eq!(stream.info().id, "100");
    }

    #[test]
    fn test_remote_label_defaults_to_id() {
        let stream = Stream::remote(
            &StreamDescriptor {
                id: "7".to_string(),
                ..Default::default()
            },
            false,
        );
        assert_eq!(stream.label(), "7");
        assert!(!stream.has_media());
    }

    #[test]
    fn test_bandwidth_translation() {
        assert_eq!(adapter_max_video_bw(300), 254_000);
        assert_eq!(adapter_max_video_bw(10), 0);
        assert_eq!(cap_bandwidth(Some(3000), Some(1000)), Some(1000));
        assert_eq!(cap_bandwidth(Some(300), Some(1000)), Some(300));
        assert_eq!(cap_bandwidth(None, Some(1000)), None);
    }

    #[test]
    fn test_single_layer_encoding() {
        let mut stream = Stream::local(StreamOptions {
            video: true,
            ..Default::default()
        });
        stream.set_max_video_bw(300);
        let encodings = stream.encoding_parameters();
        assert_eq!(encodings.len(), 1);
        assert_eq!(encodings[0].scale_resolution_down_by, 1.0);
        assert_eq!(encodings[0].max_bitrate, Some(254_000));
    }

    #[test]
    fn test_simulcast_encoding() {
        let mut stream = Stream::local(StreamOptions {
            video: true,
            ..Default::default()
        });
        stream.set_simulcast(Some(SimulcastOptions::default()));
        stream.set_max_video_bw(1000);

        let encodings = stream.encoding_parameters();
        let scales: Vec<f64> = encodings.iter().map(|e| e.scale_resolution_down_by).collect();
        assert_eq!(scales, vec![4.0, 2.0, 1.0]);
        let rids: Vec<&str> = encodings.iter().map(|e| e.rid.as_str()).collect();
        assert_eq!(rids, vec!["0", "1", "2"]);
        assert!(encodings[0].max_bitrate.is_none());
        assert_eq!(encodings[2].max_bitrate, Some(884_000));
    }

    #[test]
    fn test_screen_simulcast_keeps_resolution() {
        let mut stream = Stream::local(StreamOptions {
            screen: true,
            ..Default::default()
        });
        stream.set_simulcast(Some(SimulcastOptions {
            num_spatial_layers: Some(2),
        }));
        assert!(stream
            .encoding_parameters()
            .iter()
            .all(|e| e.scale_resolution_down_by == 1.0));
    }

    #[test]
    fn test_subscribe_downgrades_missing_kinds() {
        let stream = remote(true, false);
        let mut options = SubscribeOptions {
            slide_show_mode: true,
            ..Default::default()
        };
        stream.check_subscribe_options(&mut options);
        assert!(options.audio);
        assert!(!options.video);
        assert!(!options.slide_show_mode);
        assert_eq!(stream.video_request(&options), VideoRequest::Enabled(false));
    }

    #[test]
    fn test_update_config_drops_kind_changes() {
        let stream = remote(true, true);
        let mut config = serde_json::json!({"audio": true, "screen": true, "maxVideoBW": 200})
            .as_object()
            .cloned()
            .unwrap();
        stream.check_update_config(&mut config);
        assert!(!config.contains_key("audio"));
        assert!(!config.contains_key("screen"));
        assert_eq!(config["maxVideoBW"], 200);
    }

    #[tokio::test]
    async fn test_init_acquires_media() {
        let mut stream = Stream::local(StreamOptions {
            audio: true,
            video: true,
            ..Default::default()
        });
        stream.init(&SyntheticMediaSource).await.unwrap();
        let media = stream.media().unwrap();
        assert!(media.has_audio() && media.has_video());

        let mut data_only = Stream::local(StreamOptions {
            data: true,
            ..Default::default()
        });
        data_only.init(&SyntheticMediaSource).await.unwrap();
        assert!(data_only.media().is_none());

        let mut remote = remote(true, true);
        assert!(matches!(
            remote.init(&SyntheticMediaSource).await,
            Err(Error::InvalidStream(_))
        ));
    }
}
