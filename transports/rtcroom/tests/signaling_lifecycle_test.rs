//! Room signaling lifecycle: handshake, reconnection and shutdown

mod harness;

use harness::{config, handshake, wait_for, MockConnector, RecordingStackFactory, TestRoom};
use rtcroom::room::{EXPECTED_DISCONNECTION, UNEXPECTED_DISCONNECTION};
use rtcroom::signaling::SessionState;
use rtcroom::{ReconnectionPolicy, Room, RoomEvent, RoomStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_handshake_registers_streams_and_settings() {
    let mut description = handshake();
    description["streams"] = json!([
        {"id": 11, "audio": true, "video": true, "label": "cam"},
        {"id": "12", "data": true, "attributes": {"name": "chat"}},
    ]);
    description["maxVideoBW"] = json!(500);

    let (connector, mut listener) = MockConnector::new();
    let stacks = Arc::new(RecordingStackFactory::new());
    let mut cfg = config();
    cfg.query.insert("app".to_string(), "demo".to_string());
    let (room, mut events) = Room::new(cfg, connector, stacks);

    room.connect().unwrap();
    assert_eq!(room.status(), RoomStatus::Connecting);
    let server = listener.accept().await.unwrap();
    assert_eq!(server.target.url, "ws://rooms.test:8080");
    assert_eq!(server.target.query.get("tokenId").map(String::as_str), Some("tok-1"));
    assert_eq!(server.target.query.get("app").map(String::as_str), Some("demo"));

    server.push("connected", vec![description]);
    let event = wait_for(&mut events, |e| matches!(e, RoomEvent::RoomConnected { .. }))
        .await
        .unwrap();
    let RoomEvent::RoomConnected { streams } = event else {
        unreachable!()
    };
    assert_eq!(streams.len(), 2);

    assert_eq!(room.status(), RoomStatus::Connected);
    let settings = room.settings();
    assert_eq!(settings.client_id.as_deref(), Some("client-1"));
    assert_eq!(settings.max_video_bw, Some(500));
    assert_eq!(settings.ice_servers.len(), 1);
    assert_eq!(room.session().state(), SessionState::Connected);

    let chat = room.streams_by_attribute("name", &json!("chat"));
    assert_eq!(chat.len(), 1);
    assert_eq!(chat[0].id, "12");

    assert!(room.connect().is_err());
}

#[tokio::test]
async fn test_authentication_error_is_fatal() {
    let (connector, mut listener) = MockConnector::new();
    let (room, mut events) = Room::new(config(), connector.clone(), Arc::new(RecordingStackFactory::new()));
    room.connect().unwrap();

    let server = listener.accept().await.unwrap();
    server.push("error", vec![json!("token: Invalid token")]);

    let error = wait_for(&mut events, |e| matches!(e, RoomEvent::RoomError { .. }))
        .await
        .unwrap();
    assert_eq!(
        error,
        RoomEvent::RoomError {
            message: "Invalid token".to_string()
        }
    );
    let disconnected = wait_for(&mut events, |e| matches!(e, RoomEvent::RoomDisconnected { .. }))
        .await
        .unwrap();
    assert_eq!(
        disconnected,
        RoomEvent::RoomDisconnected {
            message: UNEXPECTED_DISCONNECTION.to_string()
        }
    );
    assert_eq!(room.status(), RoomStatus::Disconnected);

    harness::settle().await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnection_exhaustion_disconnects_room() {
    let mut cfg = config();
    cfg.reconnection = ReconnectionPolicy::deterministic(3, 1000, 4000);
    let mut t = TestRoom::join_with(cfg, handshake()).await;

    t.connector.refuse(true);
    let closed_at = tokio::time::Instant::now();
    t.server.close("transport close");

    let reconnecting = t
        .wait_for(|e| matches!(e, RoomEvent::RoomReconnecting { .. }))
        .await;
    let RoomEvent::RoomReconnecting { message } = reconnecting else {
        unreachable!()
    };
    assert!(message.starts_with("reconnecting - "));
    assert_eq!(t.room.status(), RoomStatus::Connected);

    let disconnected = t
        .wait_for(|e| matches!(e, RoomEvent::RoomDisconnected { .. }))
        .await;
    assert_eq!(
        disconnected,
        RoomEvent::RoomDisconnected {
            message: UNEXPECTED_DISCONNECTION.to_string()
        }
    );
    assert_eq!(t.room.status(), RoomStatus::Disconnected);
    // Waits of 1s, 2s and 4s precede the three attempts
    assert!(closed_at.elapsed() >= Duration::from_millis(7000));
    // One initial open plus three refused attempts
    assert_eq!(t.connector.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_reconnection_resumes_session() {
    let mut cfg = config();
    cfg.reconnection = ReconnectionPolicy::deterministic(3, 1000, 4000);
    let mut t = TestRoom::join_with(cfg, handshake()).await;

    t.server.close("ping timeout");
    t.wait_for(|e| matches!(e, RoomEvent::RoomReconnecting { .. }))
        .await;

    let resumed = t.listener.accept().await.unwrap();
    assert_eq!(
        resumed.target.query.get("clientId").map(String::as_str),
        Some("client-1")
    );
    t.wait_for(|e| matches!(e, RoomEvent::RoomReconnected)).await;
    assert_eq!(t.room.status(), RoomStatus::Connected);
}

#[tokio::test]
async fn test_client_disconnect_is_expected() {
    let mut t = TestRoom::join(handshake()).await;
    t.server.push("onAddStream", vec![json!({"id": 5, "audio": true})]);
    t.wait_for(|e| matches!(e, RoomEvent::StreamAdded { .. })).await;

    t.room.disconnect();
    let events = t.drain_events();
    assert_eq!(
        events[0],
        RoomEvent::RoomDisconnected {
            message: EXPECTED_DISCONNECTION.to_string()
        }
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, RoomEvent::StreamRemoved { stream } if stream.id == "5")));

    let goodbye = t.server.expect_request("clientDisconnection").await;
    assert!(goodbye.id.is_none());
    assert!(t.room.remote_streams().is_empty());

    t.room.disconnect();
    harness::settle().await;
    assert!(!t
        .drain_events()
        .iter()
        .any(|e| matches!(e, RoomEvent::RoomDisconnected { .. })));
}
