//! Integration tests: heartbeat delivery and the include-status opt-in.

use gateway::config::{GatewayConfig, StatusSection};
use gateway::{build_router, AppState};
use omni_core::stream::{MetricKind, SourceKind, StreamKey};
use omni_proto::{StreamSelector, SubMessage, WsMessage};
use omni_test_utils::WsTestClient;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn spawn_gateway(cfg: GatewayConfig) -> (AppState, SocketAddr, CancellationToken) {
    let cancel = CancellationToken::new();
    let state = AppState::new(cfg, cancel.clone()).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr, cancel)
}

fn stream_key() -> StreamKey {
    StreamKey::new("64b1", "site-3", None, MetricKind::Climate, SourceKind::ProcessApi)
}

fn sub(include_status: bool, need_snapshot: bool) -> WsMessage {
    WsMessage::Sub(SubMessage {
        streams: vec![StreamSelector {
            kind: "climate".to_owned(),
            site_id: "site-3".to_owned(),
            cage_id: None,
            metric: None,
        }],
        include_status,
        throttle_ms: 0,
        need_snapshot,
    })
}

async fn connect_and_subscribe(addr: SocketAddr, client_id: &str, msg: &WsMessage) -> WsTestClient {
    let mut client = WsTestClient::connect(&format!(
        "ws://{addr}/ws?tenantId=64b1&clientId={client_id}"
    ))
    .await
    .unwrap();
    client.recv_message().await.unwrap(); // connected ACK
    client.send_message(msg).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Ack(_) => {}
        other => panic!("expected ACK, got {other:?}"),
    }
    client
}

#[tokio::test]
async fn heartbeats_reach_only_sessions_that_opted_in() {
    let cfg = GatewayConfig {
        status: StatusSection {
            heartbeat_seconds: 1,
            ..StatusSection::default()
        },
        ..GatewayConfig::default()
    };
    let (state, addr, _cancel) = spawn_gateway(cfg).await;

    // A failing stream so the heartbeat carries a definite state.
    state.tracker.update_error(&stream_key(), "HTTP 503").await;

    let mut with_status = connect_and_subscribe(addr, "hb-a", &sub(true, false)).await;
    let mut without_status = connect_and_subscribe(addr, "hb-b", &sub(false, false)).await;

    let frame = tokio::time::timeout(Duration::from_secs(3), with_status.recv_message())
        .await
        .expect("heartbeat within deadline")
        .unwrap();
    match frame {
        WsMessage::Status(status) => {
            assert_eq!(status.stream.site_id, "site-3");
            assert_eq!(status.status.state, "failing");
            assert_eq!(status.status.last_error_msg.as_deref(), Some("HTTP 503"));
        }
        other => panic!("expected STATUS, got {other:?}"),
    }

    // The opted-out session stays silent across more than one interval.
    assert!(without_status
        .recv_message_timeout(Duration::from_millis(1_500))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn need_snapshot_delivers_immediate_status_for_known_streams() {
    // Heartbeats far apart: any STATUS frame observed here is the
    // snapshot, not the pusher.
    let cfg = GatewayConfig {
        status: StatusSection {
            heartbeat_seconds: 3_600,
            ..StatusSection::default()
        },
        ..GatewayConfig::default()
    };
    let (state, addr, _cancel) = spawn_gateway(cfg).await;
    state
        .tracker
        .update_success(&stream_key(), Duration::from_millis(25))
        .await;

    let mut client = connect_and_subscribe(addr, "hb-snap", &sub(true, true)).await;
    let frame = tokio::time::timeout(Duration::from_secs(2), client.recv_message())
        .await
        .expect("snapshot within deadline")
        .unwrap();
    match frame {
        WsMessage::Status(status) => {
            assert_eq!(status.stream.site_id, "site-3");
            assert_eq!(status.status.state, "ok");
            assert_eq!(status.status.last_latency_ms, Some(25));
            assert!(!status.status.in_flight);
        }
        other => panic!("expected STATUS snapshot, got {other:?}"),
    }

    // Without needSnapshot no immediate STATUS arrives.
    let mut plain = connect_and_subscribe(addr, "hb-plain", &sub(true, false)).await;
    assert!(plain
        .recv_message_timeout(Duration::from_millis(400))
        .await
        .unwrap()
        .is_none());
}
