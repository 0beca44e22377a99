//! Local media handles and acquisition
//!
//! Capturing camera, microphone or screen is platform specific. The room only
//! needs an opaque [`MediaHandle`] describing the tracks it may send, obtained
//! from a [`MediaSource`].

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single local track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// Acquired local media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHandle {
    /// Stream identifier (also the label announced to the server)
    pub id: String,
    /// Tracks carried by this stream
    pub tracks: Vec<MediaTrack>,
}

impl MediaHandle {
    /// Create a handle with a random id and one track per requested kind
    pub fn new(audio: bool, video: bool) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if audio {
            tracks.push(MediaTrack {
                id: format!("{}-audio", id),
                kind: TrackKind::Audio,
            });
        }
        if video {
            tracks.push(MediaTrack {
                id: format!("{}-video", id),
                kind: TrackKind::Video,
            });
        }
        Self { id, tracks }
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}

/// Video capture size constraints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSize {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

/// What to capture
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    /// Capture the screen instead of a camera
    pub screen: bool,
    pub video_size: Option<VideoSize>,
    pub video_frame_rate: Option<u32>,
}

/// Acquires local media
///
/// Implementations return [`crate::Error::MediaAccessDenied`] when the user
/// or platform refuses access.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle>;
}

/// Source that synthesizes handles without capturing anything
///
/// # Example
///
/// ```
/// use rtcroom::media::{MediaConstraints, MediaSource, SyntheticMediaSource};
///
/// # tokio_test::block_on(async {
/// let constraints = MediaConstraints {
///     audio: true,
///     ..Default::default()
/// };
/// let handle = SyntheticMediaSource.acquire(&constraints).await.unwrap();
/// assert!(handle.has_audio());
/// # });
/// ```
#[derive(Debug, Default, Clone)]
pub struct SyntheticMediaSource;

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle> {
        Ok(MediaHandle::new(constraints.audio, constraints.video || constraints.screen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_handle_tracks() {
        let handle = MediaHandle::new(true, false);
        assert!(handle.has_audio());
        assert!(!handle.has_video());
        assert_eq!(handle.tracks.len(), 1);
        assert!(handle.tracks[0].id.starts_with(&handle.id));
    }

    #[tokio::test]
    async fn test_synthetic_source() {
        let source = SyntheticMediaSource;
        let handle = source
            .acquire(&MediaConstraints {
                screen: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(handle.has_video());
        assert!(!handle.has_audio());
    }
}
