//! Client session and connection lifecycle for multi-party real-time rooms
//!
//! This crate implements the client side of a media-server room: joining
//! with a token, publishing local streams, subscribing to remote ones and
//! keeping every peer connection negotiated until the room is left.
//!
//! # Features
//!
//! - **Reliable signaling**: request/acknowledge channel with bounded
//!   exponential reconnection
//! - **Session lifecycle**: three-state signaling session with fatal
//!   authentication errors and client-initiated shutdown
//! - **Negotiation state machine**: one in-flight offer/answer step per
//!   connection, with a bounded transition history
//! - **Connection bundling**: optional single connection per media server
//!   for all publications and another for all subscriptions
//! - **Peer-to-peer rooms**: one connection per subscriber when the room
//!   has no media server
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Application                                           │
//! │  ↓ publish / subscribe / unsubscribe / unpublish       │
//! │  Room (streams, settings, quality)                     │
//! │  ├─ SignalingSession                                   │
//! │  │   └─ ReliableTransport (JSON frames over WebSocket) │
//! │  └─ ConnectionManager (bundles by media server)        │
//! │      └─ Connection                                     │
//! │          ├─ NegotiationFsm (serialized steps)          │
//! │          └─ MediaStack (fake or webrtc-rs)             │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rtcroom::{PublishOptions, Room, RoomConfig, RoomEvent, Stream, StreamOptions};
//!
//! let (room, mut events) = Room::with_config(RoomConfig::with_token(token));
//! room.connect()?;
//!
//! while let Some(event) = events.recv().await {
//!     if let RoomEvent::RoomConnected { .. } = event {
//!         let mut stream = Stream::local(StreamOptions { audio: true, video: true, ..Default::default() });
//!         stream.init(&rtcroom::SyntheticMediaSource).await?;
//!         let id = room.publish(stream, PublishOptions::default()).await?;
//!     }
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;

pub use config::{RoomConfig, Token};
pub use error::{Error, Result};
pub use media::{MediaHandle, MediaSource, SyntheticMediaSource};
pub use peer::{ConnectionManager, QualityLevel, StackKind};
pub use room::{
    FailureOrigin, PublishOptions, Room, RoomEvent, RoomEvents, RoomSettings, RoomStatus,
    SimulcastOptions, Stream, StreamInfo, StreamOptions, StreamState, SubscribeOptions,
};
pub use signaling::{ReconnectionPolicy, SignalingSession};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
