//! Signaling channel to the room controller
//!
//! This module implements the client side of the room signaling protocol:
//! - JSON frames over WebSocket (`websocket`)
//! - Reconnecting request/acknowledge transport (`transport`)
//! - Three-state session lifecycle on top of it (`session`)

pub mod backoff;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod websocket;

pub use backoff::ReconnectionPolicy;
pub use protocol::{Ack, RoomDescription, ServerPush, SignalingMessage};
pub use session::{SessionState, SignalingEvent, SignalingSession};
pub use transport::{Channel, ChannelEvent, ConnectTarget, Connector, ReliableTransport, TransportEvent};
pub use websocket::WebSocketConnector;
