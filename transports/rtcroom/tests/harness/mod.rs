//! Room integration test harness
//!
//! Provides infrastructure for driving a [`Room`] end to end without a
//! network:
//! - In-memory signaling server reachable through a [`MockConnector`]
//! - Stack factory that records every built stack and lets tests inject
//!   stack events
//! - Event helpers with timeouts
//!
//! Basic usage pattern:
//!
//! 1. `let mut t = TestRoom::join(handshake).await;`
//! 2. Drive operations on `t.room` and answer requests on `t.server`
//! 3. Assert on `t.events` with [`TestRoom::wait_for`]

#![allow(dead_code)]

pub mod mock_server;
pub mod recording_stack;

use std::sync::Arc;
use std::time::Duration;

use rtcroom::config::Token;
use rtcroom::{
    PublishOptions, Room, RoomConfig, RoomEvent, RoomEvents, Stream, StreamOptions,
    SubscribeOptions, SyntheticMediaSource,
};
use serde_json::{json, Value};

pub use mock_server::{ClientRequest, MockConnector, MockServer, ServerChannel};
pub use recording_stack::RecordingStackFactory;

/// Upper bound for any single wait in a test
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,rtcroom=debug")
        .with_test_writer()
        .try_init();
}

/// Token accepted by the mock server
pub fn token() -> String {
    Token {
        token_id: "tok-1".to_string(),
        host: "rooms.test:8080".to_string(),
        secure: false,
        signature: "c2lnbmF0dXJl".to_string(),
    }
    .encode()
    .unwrap()
}

/// Default configuration for test rooms
pub fn config() -> RoomConfig {
    RoomConfig::with_token(token())
}

/// Minimal handshake payload
pub fn handshake() -> Value {
    json!({
        "clientId": "client-1",
        "id": "room-1",
        "streams": [],
        "p2p": false,
        "singlePC": false,
        "defaultVideoBW": 300,
        "maxVideoBW": 1000,
        "iceServers": [{"urls": "stun:stun.test:3478"}],
    })
}

/// Local stream with acquired synthetic media
pub async fn local_stream(label: &str, audio: bool, video: bool, data: bool) -> Stream {
    let mut stream = Stream::local(StreamOptions {
        audio,
        video,
        data,
        label: Some(label.to_string()),
        ..Default::default()
    });
    stream.init(&SyntheticMediaSource).await.unwrap();
    stream
}

/// A connected room with its server side
pub struct TestRoom {
    pub room: Room,
    pub events: RoomEvents,
    pub server: ServerChannel,
    pub listener: MockServer,
    pub connector: Arc<MockConnector>,
    pub stacks: Arc<RecordingStackFactory>,
}

impl TestRoom {
    /// Join with the default configuration
    pub async fn join(description: Value) -> Self {
        Self::join_with(config(), description).await
    }

    /// Join and wait until the room reports connected
    pub async fn join_with(config: RoomConfig, description: Value) -> Self {
        init_logging();
        let (connector, mut listener) = MockConnector::new();
        let stacks = Arc::new(RecordingStackFactory::new());
        let (room, mut events) = Room::new(config, connector.clone(), stacks.clone());

        room.connect().unwrap();
        let server = listener.accept().await.unwrap();
        server.push("connected", vec![description]);

        let event = wait_for(&mut events, |e| matches!(e, RoomEvent::RoomConnected { .. }))
            .await
            .unwrap();
        assert_eq!(event.name(), "room-connected");

        Self {
            room,
            events,
            server,
            listener,
            connector,
            stacks,
        }
    }

    /// Wait for the first event matching `pred`, skipping others
    pub async fn wait_for<F>(&mut self, pred: F) -> RoomEvent
    where
        F: Fn(&RoomEvent) -> bool,
    {
        wait_for(&mut self.events, pred).await.unwrap()
    }

    /// Events already delivered, without waiting
    pub fn drain_events(&mut self) -> Vec<RoomEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    /// Publish through a media server and acknowledge it
    pub async fn publish(&mut self, stream: Stream, id: &str, erizo_id: &str, connection_id: &str) -> String {
        self.publish_with(stream, PublishOptions::default(), id, erizo_id, connection_id)
            .await
    }

    pub async fn publish_with(
        &mut self,
        stream: Stream,
        options: PublishOptions,
        id: &str,
        erizo_id: &str,
        connection_id: &str,
    ) -> String {
        let room = self.room.clone();
        let task = tokio::spawn(async move { room.publish(stream, options).await });

        let request = self.server.expect_request("publish").await;
        self.server.respond(
            &request,
            vec![json!(id), json!(erizo_id), json!(connection_id), Value::Null],
        );
        tokio::time::timeout(TIMEOUT, task)
            .await
            .expect("publish timed out")
            .unwrap()
            .unwrap()
    }

    /// Subscribe through a media server, acknowledge it and return the request
    pub async fn subscribe(
        &mut self,
        stream_id: &str,
        options: SubscribeOptions,
        erizo_id: &str,
        connection_id: &str,
    ) -> ClientRequest {
        let room = self.room.clone();
        let id = stream_id.to_string();
        let task = tokio::spawn(async move { room.subscribe(&id, options).await });

        let request = self.server.expect_request("subscribe").await;
        self.server.respond(
            &request,
            vec![json!(true), json!(erizo_id), json!(connection_id), Value::Null],
        );
        tokio::time::timeout(TIMEOUT, task)
            .await
            .expect("subscribe timed out")
            .unwrap()
            .unwrap();
        request
    }

    /// Push a signaling message for `connection_id`
    pub fn push_connection_message(&self, connection_id: &str, evt: Value) {
        self.server.push(
            "connection_message_erizo",
            vec![json!({"connectionId": connection_id, "evt": evt})],
        );
    }

    /// Answer the next offer the client sends for `connection_id`
    pub async fn answer_offer(&mut self, connection_id: &str) {
        let offer = self.server.expect_connection_message("offer").await;
        assert_eq!(offer.options()["connectionId"], json!(connection_id));
        self.push_connection_message(connection_id, json!({"type": "answer", "sdp": "v=0\r\n"}));
    }

    /// Offer remote media on `connection_id` and wait for the client's answer
    pub async fn offer_media(&mut self, connection_id: &str, sdp: &str) {
        self.push_connection_message(connection_id, json!({"type": "offer", "sdp": sdp}));
        let answer = self.server.expect_connection_message("answer").await;
        assert_eq!(answer.options()["connectionId"], json!(connection_id));
    }
}

/// Wait for the first event matching `pred`, skipping others
pub async fn wait_for<F>(events: &mut RoomEvents, pred: F) -> HarnessResult<RoomEvent>
where
    F: Fn(&RoomEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| HarnessError::Timeout("room event".to_string()))?
            .ok_or_else(|| HarnessError::ChannelClosed("room events".to_string()))?;
        if pred(&event) {
            return Ok(event);
        }
    }
}

/// Poll `cond` until it holds
pub async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let spawned tasks run until they are idle
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
