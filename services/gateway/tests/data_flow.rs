//! Integration test: the happy path end to end — mock strategy through
//! requester, router, and hub to a subscribed WebSocket client.

use chrono::{Duration as ChronoDuration, Utc};
use gateway::config::GatewayConfig;
use gateway::{build_router, AppState};
use omni_core::collector::MetricsCollector;
use omni_core::request::{PollRequest, TimeWindow};
use omni_core::requester::{Requester, RequesterConfig};
use omni_core::stream::{MetricKind, SourceKind, StreamKey};
use omni_proto::{StreamSelector, SubMessage, WsMessage};
use omni_test_utils::{MockStrategy, WsTestClient};
use std::net::SocketAddr;
use std::sync::Arc;
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
    StreamKey::new("64b1", "site-7", None, MetricKind::Feeding, SourceKind::Cloud)
}

#[tokio::test]
async fn one_poll_reaches_a_subscribed_client_as_one_data_frame() {
    let (state, addr, cancel) = spawn_gateway(GatewayConfig::default()).await;

    // One requester with a 50ms mock strategy, wired into the shared
    // result channel the router drains.
    let strategy = MockStrategy::succeeding(br#"{"v":1}"#, Duration::from_millis(50));
    let requester = Requester::new(
        stream_key(),
        RequesterConfig::default(),
        strategy,
        Arc::clone(&state.tracker),
        Arc::new(MetricsCollector::new()),
        state.results_tx.clone(),
        cancel.child_token(),
    );
    requester.start().await;

    let mut client = WsTestClient::connect(&format!("ws://{addr}/ws?tenantId=64b1"))
        .await
        .unwrap();
    client.recv_message().await.unwrap(); // connected ACK
    client
        .send_message(&WsMessage::Sub(SubMessage {
            streams: vec![StreamSelector {
                kind: "feeding".to_owned(),
                site_id: "site-7".to_owned(),
                cage_id: None,
                metric: None,
            }],
            include_status: false,
            throttle_ms: 0,
            need_snapshot: false,
        }))
        .await
        .unwrap();
    client.recv_message().await.unwrap(); // subscribed ACK

    let window_to = Utc::now();
    let window = TimeWindow::new(window_to - ChronoDuration::seconds(60), window_to);
    requester
        .enqueue(PollRequest::new(stream_key(), window))
        .await;

    let frame = tokio::time::timeout(Duration::from_secs(2), client.recv_message())
        .await
        .expect("DATA within deadline")
        .unwrap();
    match frame {
        WsMessage::Data(data) => {
            assert_eq!(data.ts, window_to.timestamp_millis());
            assert_eq!(data.payload, serde_json::json!({"v": 1}));
            assert_eq!(data.stream.site_id, "site-7");
            assert_eq!(data.stream.tenant, "64b1");
            assert_eq!(data.stream.kind, "feeding");
            assert!(data.flags.is_none());
        }
        other => panic!("expected DATA, got {other:?}"),
    }

    // Exactly one frame: nothing else follows.
    assert!(client
        .recv_message_timeout(Duration::from_millis(300))
        .await
        .unwrap()
        .is_none());

    let kpis = state.tracker.get_kpis_snapshot(&stream_key()).await.unwrap();
    assert_eq!(kpis.consecutive_errors, 0);
    let latency = kpis.last_latency_ms.expect("latency recorded");
    assert!((40..500).contains(&latency), "latency {latency}ms");

    requester.stop().await;
}

#[tokio::test]
async fn data_frames_preserve_per_stream_order() {
    let (state, addr, cancel) = spawn_gateway(GatewayConfig::default()).await;
    let strategy = MockStrategy::succeeding(br#"{"n":1}"#, Duration::ZERO);
    let requester = Requester::new(
        stream_key(),
        RequesterConfig {
            coalescing_enabled: false,
            ..RequesterConfig::default()
        },
        strategy,
        Arc::clone(&state.tracker),
        Arc::new(MetricsCollector::new()),
        state.results_tx.clone(),
        cancel.child_token(),
    );
    requester.start().await;

    let mut client = WsTestClient::connect(&format!("ws://{addr}/ws?tenantId=64b1"))
        .await
        .unwrap();
    client.recv_message().await.unwrap();
    client
        .send_message(&WsMessage::Sub(SubMessage {
            streams: vec![StreamSelector {
                kind: "feeding".to_owned(),
                site_id: "site-7".to_owned(),
                cage_id: None,
                metric: None,
            }],
            include_status: false,
            throttle_ms: 0,
            need_snapshot: false,
        }))
        .await
        .unwrap();
    client.recv_message().await.unwrap();

    let base = Utc::now();
    for i in 0..3i64 {
        let window = TimeWindow::new(
            base + ChronoDuration::seconds(i * 60),
            base + ChronoDuration::seconds((i + 1) * 60),
        );
        requester
            .enqueue(PollRequest::new(stream_key(), window))
            .await;
    }

    // FIFO per session: timestamps arrive in enqueue order.
    let mut timestamps = Vec::new();
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.recv_message())
            .await
            .expect("frame within deadline")
            .unwrap();
        match frame {
            WsMessage::Data(data) => timestamps.push(data.ts),
            other => panic!("expected DATA, got {other:?}"),
        }
    }
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted);

    requester.stop().await;
}
