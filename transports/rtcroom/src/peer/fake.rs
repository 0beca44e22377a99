//! Media-less stack
//!
//! Negotiates synthetic session descriptions without moving any media. Used
//! for data-only sessions and wherever a real peer connection is not wanted.
//! Applying a remote description immediately reports ICE as connected.

use super::stack::{
    EncodingParameters, IceConnectionState, MediaStack, StackEvent, StackKind, StackSpec,
};
use crate::media::MediaHandle;
use crate::signaling::protocol::{IceCandidate, SignalingMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default)]
struct FakeState {
    version: u64,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    attached: HashSet<String>,
    candidates: usize,
    connected: bool,
    closed: bool,
}

/// Stack exchanging synthetic descriptions
pub struct FakeStack {
    spec: StackSpec,
    events: mpsc::UnboundedSender<StackEvent>,
    state: Mutex<FakeState>,
}

impl FakeStack {
    pub fn new(spec: &StackSpec, events: mpsc::UnboundedSender<StackEvent>) -> Self {
        debug!("Starting fake stack, sessionId: {}", spec.session_id);
        Self {
            spec: spec.clone(),
            events,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Number of remote candidates applied so far
    pub fn candidates_applied(&self) -> usize {
        self.state.lock().candidates
    }

    fn emit(&self, event: StackEvent) {
        let _ = self.events.send(event);
    }

    fn check_open(&self, state: &FakeState) -> Result<()> {
        if state.closed {
            return Err(Error::InvalidState(format!(
                "stack for session {} is closed",
                self.spec.session_id
            )));
        }
        Ok(())
    }

    fn describe(&self, version: u64) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.spec.session_id, version
        );
        if self.spec.audio {
            sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        }
        if self.spec.video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        if self.spec.data || (!self.spec.audio && !self.spec.video) {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        }
        sdp
    }

    fn next_description(&self) -> Result<String> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        state.version += 1;
        let sdp = self.describe(state.version);
        state.local_sdp = Some(sdp.clone());
        Ok(sdp)
    }

    fn remote_applied(&self, sdp: &str) -> Result<()> {
        if !sdp.starts_with("v=0") {
            return Err(Error::WebRtcError(
                "remote description is not a session description".to_string(),
            ));
        }

        let first_connect = {
            let mut state = self.state.lock();
            self.check_open(&state)?;
            state.remote_sdp = Some(sdp.to_string());
            !std::mem::replace(&mut state.connected, true)
        };

        if first_connect {
            self.emit(StackEvent::IceStateChanged(IceConnectionState::Checking));
            self.emit(StackEvent::IceStateChanged(IceConnectionState::Connected));
            if self.spec.is_remote {
                if let Some(label) = &self.spec.label {
                    self.emit(StackEvent::StreamAdded {
                        label: label.clone(),
                    });
                }
            }
        } else if self.spec.is_remote && !sdp.contains("m=") {
            // A renegotiation without media sections drops the remote stream
            if let Some(label) = &self.spec.label {
                self.emit(StackEvent::StreamRemoved {
                    label: label.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStack for FakeStack {
    fn kind(&self) -> StackKind {
        StackKind::Fake
    }

    async fn create_offer(&self, is_subscribe: bool) -> Result<String> {
        debug!(
            "Fake stack creating offer, sessionId: {}, isSubscribe: {}",
            self.spec.session_id, is_subscribe
        );
        let sdp = self.next_description()?;
        self.emit(StackEvent::Signaling(SignalingMessage::Candidate {
            candidate: IceCandidate::end_of_candidates(),
        }));
        Ok(sdp)
    }

    async fn process_offer(&self, sdp: &str) -> Result<String> {
        self.remote_applied(sdp)?;
        self.next_description()
    }

    async fn process_answer(&self, sdp: &str) -> Result<()> {
        self.remote_applied(sdp)
    }

    async fn negotiate_max_bw(&self, config: &Value) -> Result<()> {
        let state = self.state.lock();
        self.check_open(&state)?;
        debug!(
            "Fake stack bandwidth renegotiation, sessionId: {}, config: {}",
            self.spec.session_id, config
        );
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if !candidate.is_end() {
            state.candidates += 1;
        }
        Ok(())
    }

    async fn attach_local_media(
        &self,
        media: &MediaHandle,
        encodings: &[EncodingParameters],
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        debug!(
            "Fake stack attaching media {} with {} encodings",
            media.id,
            encodings.len()
        );
        state.attached.insert(media.id.clone());
        Ok(())
    }

    async fn detach_local_media(&self, media: &MediaHandle) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        state.attached.remove(&media.id);
        Ok(())
    }

    async fn restart_ice(&self) -> Result<String> {
        debug!("Fake stack restarting ICE, sessionId: {}", self.spec.session_id);
        self.next_description()
    }

    async fn update_spec(&self, config: &Value) -> Result<()> {
        let state = self.state.lock();
        self.check_open(&state)?;
        debug!(
            "Fake stack spec update, sessionId: {}, config: {}",
            self.spec.session_id, config
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.attached.clear();
            drop(state);
            self.emit(StackEvent::IceStateChanged(IceConnectionState::Closed));
        }
        Ok(())
    }
}
