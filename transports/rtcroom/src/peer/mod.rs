//! Peer connections
//!
//! - Media stack capability interface and implementations (`stack`, `fake`, `native`)
//! - Per-connection negotiation state machine (`fsm`)
//! - Connections and their registry (`connection`, `manager`)

pub mod connection;
pub mod fake;
pub mod fsm;
pub mod manager;
#[cfg(feature = "native-stack")]
pub mod native;
pub mod quality;
pub mod stack;

pub use connection::{
    AttachedStream, Connection, ConnectionEvent, ConnectionEventKind, ConnectionRoute,
    ConnectionSpec,
};
pub use fsm::{FsmState, HistoryEntry, NegotiationFsm, Transition, HISTORY_SIZE_LIMIT};
pub use manager::{BundleKey, ConnectionManager};
pub use quality::QualityLevel;
pub use stack::{
    DefaultStackFactory, EncodingParameters, IceConnectionState, MediaStack, StackEvent,
    StackFactory, StackKind, StackSpec,
};
