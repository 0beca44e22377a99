//! webrtc-rs backed media stack

use super::stack::{
    EncodingParameters, IceConnectionState, MediaStack, StackEvent, StackKind, StackSpec,
};
use crate::media::{MediaHandle, TrackKind};
use crate::signaling::protocol::{IceCandidate, SignalingMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Stack driving a webrtc-rs peer connection
pub struct NativeStack {
    session_id: u64,
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<StackEvent>,
    /// Senders per attached media handle id
    senders: RwLock<HashMap<String, Vec<Arc<RTCRtpSender>>>>,
    /// Remote candidates received before any remote description
    remote_candidates: tokio::sync::Mutex<Vec<RTCIceCandidateInit>>,
}

/// Live remote tracks per remote stream label
#[derive(Debug, Default)]
struct RemoteStreams {
    tracks: Mutex<HashMap<String, usize>>,
}

impl RemoteStreams {
    /// Returns `true` for the first track of `label`
    fn track_started(&self, label: &str) -> bool {
        let mut tracks = self.tracks.lock();
        let count = tracks.entry(label.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns `true` when the last track of `label` ended
    fn track_ended(&self, label: &str) -> bool {
        let mut tracks = self.tracks.lock();
        match tracks.get_mut(label) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                tracks.remove(label);
                true
            }
            None => false,
        }
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

impl NativeStack {
    /// Build the peer connection and wire its callbacks to `events`
    pub async fn new(spec: &StackSpec, events: mpsc::UnboundedSender<StackEvent>) -> Result<Self> {
        info!("Creating native stack, sessionId: {}", spec.session_id);

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = spec
            .ice_servers
            .iter()
            .map(|server| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                }
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_transport_policy: if spec.force_turn {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        let ice_events = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |s: RTCIceConnectionState| {
                let ice_events = ice_events.clone();
                Box::pin(async move {
                    if let Some(state) = map_ice_state(s) {
                        let _ = ice_events.send(StackEvent::IceStateChanged(state));
                    }
                })
            },
        ));

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let candidate_events = candidate_events.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    None => IceCandidate::end_of_candidates(),
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => IceCandidate {
                            sdp_m_line_index: init.sdp_mline_index.map(i32::from).unwrap_or(0),
                            sdp_mid: init.sdp_mid.unwrap_or_default(),
                            candidate: init.candidate,
                        }
                        .with_attribute_prefix(),
                        Err(e) => {
                            warn!("Failed to serialize local candidate: {}", e);
                            return;
                        }
                    },
                };
                let _ = candidate_events.send(StackEvent::Signaling(SignalingMessage::Candidate {
                    candidate,
                }));
            })
        }));

        let track_events = events.clone();
        let remote_streams = Arc::new(RemoteStreams::default());
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_events = track_events.clone();
            let remote_streams = Arc::clone(&remote_streams);
            Box::pin(async move {
                let label = track.stream_id();
                debug!(
                    "Remote track arrived, stream: {}, track: {}",
                    label,
                    track.id()
                );
                if remote_streams.track_started(&label) {
                    let _ = track_events.send(StackEvent::StreamAdded {
                        label: label.clone(),
                    });
                }

                // Reading fails once the track ends or its transceiver stops
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    debug!("Remote track ended, stream: {}, track: {}", label, track.id());
                    if remote_streams.track_ended(&label) {
                        let _ = track_events.send(StackEvent::StreamRemoved { label });
                    }
                });
            })
        }));

        Ok(Self {
            session_id: spec.session_id,
            peer_connection,
            events,
            senders: RwLock::new(HashMap::new()),
            remote_candidates: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Set the remote description and apply the candidates buffered before it
    async fn set_remote(&self, description: RTCSessionDescription) -> Result<()> {
        let mut buffered = self.remote_candidates.lock().await;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set remote description: {}", e)))?;

        for init in buffered.drain(..) {
            if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
                warn!(
                    "Failed to add buffered ICE candidate, sessionId: {}: {}",
                    self.session_id, e
                );
            }
        }
        Ok(())
    }

    async fn local_sdp(&self) -> Result<String> {
        let local_desc = self.peer_connection.local_description().await.ok_or_else(|| {
            Error::WebRtcError("No local description after negotiation".to_string())
        })?;
        Ok(local_desc.sdp)
    }

    async fn offer(&self, options: Option<RTCOfferOptions>) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set local description: {}", e)))?;

        self.local_sdp().await
    }
}

#[async_trait]
impl MediaStack for NativeStack {
    fn kind(&self) -> StackKind {
        StackKind::Native
    }

    async fn create_offer(&self, is_subscribe: bool) -> Result<String> {
        debug!(
            "Creating offer, sessionId: {}, isSubscribe: {}",
            self.session_id, is_subscribe
        );
        self.offer(None).await
    }

    async fn process_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::WebRtcError(format!("Failed to parse offer: {}", e)))?;

        self.set_remote(offer).await?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set local description: {}", e)))?;

        self.local_sdp().await
    }

    async fn process_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::WebRtcError(format!("Failed to parse answer: {}", e)))?;

        self.set_remote(answer).await
    }

    async fn negotiate_max_bw(&self, config: &Value) -> Result<()> {
        debug!(
            "Renegotiating bandwidth, sessionId: {}, config: {}",
            self.session_id, config
        );
        let sdp = self.offer(None).await?;
        let _ = self
            .events
            .send(StackEvent::Signaling(SignalingMessage::Offer { sdp }));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: u16::try_from(candidate.sdp_m_line_index).ok(),
            username_fragment: None,
        };

        let mut buffered = self.remote_candidates.lock().await;
        if self.peer_connection.remote_description().await.is_none() {
            debug!(
                "Buffering ICE candidate until remote description, sessionId: {}",
                self.session_id
            );
            buffered.push(init);
            return Ok(());
        }
        drop(buffered);

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceFailure(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn attach_local_media(
        &self,
        media: &MediaHandle,
        encodings: &[EncodingParameters],
    ) -> Result<()> {
        info!(
            "Attaching media {} ({} tracks, {} encodings), sessionId: {}",
            media.id,
            media.tracks.len(),
            encodings.len(),
            self.session_id
        );

        let mut added = Vec::with_capacity(media.tracks.len());
        for track in &media.tracks {
            let capability = match track.kind {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
            };

            let local = Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id.clone(),
                media.id.clone(),
            ));

            let sender = self
                .peer_connection
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to add track: {}", e)))?;
            added.push(sender);
        }

        self.senders.write().await.insert(media.id.clone(), added);
        Ok(())
    }

    async fn detach_local_media(&self, media: &MediaHandle) -> Result<()> {
        let senders = self.senders.write().await.remove(&media.id);
        for sender in senders.unwrap_or_default() {
            self.peer_connection
                .remove_track(&sender)
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to remove track: {}", e)))?;
        }
        Ok(())
    }

    async fn restart_ice(&self) -> Result<String> {
        warn!("Restarting ICE, sessionId: {}", self.session_id);
        self.offer(Some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        }))
        .await
    }

    async fn update_spec(&self, config: &Value) -> Result<()> {
        debug!(
            "Configuration changed, sessionId: {}, config: {}",
            self.session_id, config
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing native stack, sessionId: {}", self.session_id);
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}
