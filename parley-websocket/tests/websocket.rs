//! Tests for the WebSocket transport over in-memory duplex pairs.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use parley_session::{Peer, PeerEvent, PeerOptions, Transport, TransportEvent};
use parley_websocket::{WsConfig, WsTransport};
use parley_wire::{Message, close_code};

fn ping_config(interval_ms: u64, timeout_ms: u64) -> WsConfig {
    WsConfig {
        ping_interval: Some(Duration::from_millis(interval_ms)),
        ping_timeout: Duration::from_millis(timeout_ms),
    }
}

#[tokio::test]
async fn messages_round_trip_as_text_frames() {
    let (mut a, mut b) = WsTransport::pair(WsConfig::default(), WsConfig::default()).await;

    let request = Message::request(7, "echo", Some(json!({"v": 1})));
    a.send(&request).await.unwrap();

    match b.recv().await {
        TransportEvent::Message(msg) => assert_eq!(msg, request),
        other => panic!("unexpected event: {other:?}"),
    }

    let notification = Message::notification("bye", None);
    b.send(&notification).await.unwrap();
    match a.recv().await {
        TransportEvent::Message(msg) => assert_eq!(msg, notification),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn liveness_probe_yields_pong() {
    let (mut a, mut b) = WsTransport::pair(ping_config(20, 500), WsConfig::default()).await;

    // b answers probes inside recv; it only returns on close.
    tokio::spawn(async move {
        let _ = b.recv().await;
    });

    match a.recv().await {
        TransportEvent::Pong => {}
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn missing_pong_drops_the_connection() {
    // b never reads, so no pong ever comes back.
    let (mut a, _b) = WsTransport::pair(ping_config(20, 40), WsConfig::default()).await;

    match a.recv().await {
        TransportEvent::Closed { code, reason } => {
            assert_eq!(code, close_code::ABNORMAL);
            assert_eq!(reason, "ping timeout");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(a.is_closed());
}

#[tokio::test]
async fn soft_close_announces_reconnect() {
    let (mut a, mut b) = WsTransport::pair(WsConfig::default(), WsConfig::default()).await;

    a.soft_close().await;
    assert!(a.is_closed());

    match b.recv().await {
        TransportEvent::Closed { code, reason } => {
            assert_eq!(code, close_code::SOFT_DISCONNECT);
            assert_eq!(reason, "reconnecting");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn hard_close_carries_code_and_reason() {
    let (mut a, mut b) = WsTransport::pair(WsConfig::default(), WsConfig::default()).await;

    a.close(close_code::NORMAL, "Normal close by server").await;

    match b.recv().await {
        TransportEvent::Closed { code, reason } => {
            assert_eq!(code, close_code::NORMAL);
            assert_eq!(reason, "Normal close by server");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Sending on a closed transport fails.
    assert!(a.send(&Message::notification("late", None)).await.is_err());
}

#[tokio::test]
async fn binary_and_malformed_frames_are_skipped() {
    let (mut a, mut b) = WsTransport::pair(WsConfig::default(), WsConfig::default()).await;

    a.stream_mut()
        .send(WsMessage::Binary(vec![1, 2, 3].into()))
        .await
        .unwrap();
    a.stream_mut()
        .send(WsMessage::Text("not json".into()))
        .await
        .unwrap();
    a.send(&Message::notification("after", None)).await.unwrap();

    match b.recv().await {
        TransportEvent::Message(Message::Notification(n)) => assert_eq!(n.method, "after"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn inbound_ping_is_answered_in_place() {
    let (mut a, mut b) = WsTransport::pair(WsConfig::default(), WsConfig::default()).await;

    a.stream_mut()
        .send(WsMessage::Text("ping".into()))
        .await
        .unwrap();

    // b's recv answers the probe without surfacing it.
    tokio::spawn(async move {
        let _ = b.recv().await;
    });

    loop {
        match a.stream_mut().next().await {
            Some(Ok(WsMessage::Text(text))) => {
                assert_eq!(text.as_str(), "pong");
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn peers_exchange_requests_over_websocket() {
    let (ta, tb) = WsTransport::pair(WsConfig::default(), WsConfig::default()).await;

    let (alice, _alice_events, alice_driver) = Peer::new("alice", ta, PeerOptions::default());
    let (_bob, mut bob_events, bob_driver) = Peer::new("bob", tb, PeerOptions::default());
    tokio::spawn(alice_driver.run());
    tokio::spawn(bob_driver.run());

    tokio::spawn(async move {
        while let Some(event) = bob_events.recv().await {
            if let PeerEvent::Request(request) = event {
                let data = request.data().cloned();
                request.accept(data);
            }
        }
    });

    let reply = alice
        .request("echo", Some(json!({"payload": [1, 2, 3]})))
        .await
        .unwrap();
    assert_eq!(reply, Some(json!({"payload": [1, 2, 3]})));

    alice.close().await;
    assert!(alice.closed());
}

#[tokio::test]
async fn transport_level_pong_reaches_the_peer() {
    let (ta, mut b) = WsTransport::pair(ping_config(20, 500), WsConfig::default()).await;

    let (_alice, mut events, driver) = Peer::new("alice", ta, PeerOptions::default());
    tokio::spawn(driver.run());

    // b answers probes inside recv.
    tokio::spawn(async move {
        let _ = b.recv().await;
    });

    match events.recv().await {
        Some(PeerEvent::Pong) => {}
        other => panic!("unexpected event: {other:?}"),
    }
}
