//! Integration tests: session protocol surface — tenant validation,
//! SUB/UNSUB/PING handling, and the error-code contract.

use gateway::config::GatewayConfig;
use gateway::{build_router, AppState};
use omni_proto::{error_codes, StreamSelector, SubMessage, WsMessage};
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

fn sub_message(site: &str, include_status: bool) -> WsMessage {
    WsMessage::Sub(SubMessage {
        streams: vec![StreamSelector {
            kind: "feeding".to_owned(),
            site_id: site.to_owned(),
            cage_id: None,
            metric: None,
        }],
        include_status,
        throttle_ms: 0,
        need_snapshot: false,
    })
}

async fn expect_connected_ack(client: &mut WsTestClient) {
    match client.recv_message().await.unwrap() {
        WsMessage::Ack(ack) => {
            assert_eq!(ack.message, "connected");
            let data = ack.data.unwrap();
            assert_eq!(data["protocol"], omni_proto::PROTOCOL_VERSION);
        }
        other => panic!("expected connected ACK, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_tenant_is_rejected_with_a_typed_error() {
    let (_state, addr, _cancel) = spawn_gateway(GatewayConfig::default()).await;
    let mut client = WsTestClient::connect(&format!("ws://{addr}/ws")).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Error(e) => assert_eq!(e.code, error_codes::MISSING_TENANT),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_tenant_is_rejected_with_invalid_tenant() {
    let (_state, addr, _cancel) = spawn_gateway(GatewayConfig::default()).await;
    let mut client = WsTestClient::connect(&format!("ws://{addr}/ws?tenantId=not-hex"))
        .await
        .unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Error(e) => assert_eq!(e.code, error_codes::INVALID_TENANT),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn sub_is_acked_and_registered() {
    let (state, addr, _cancel) = spawn_gateway(GatewayConfig::default()).await;
    let mut client =
        WsTestClient::connect(&format!("ws://{addr}/ws?tenantId=64b1&clientId=proto-sub"))
            .await
            .unwrap();
    expect_connected_ack(&mut client).await;

    client.send_message(&sub_message("site-1", false)).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Ack(ack) => {
            assert_eq!(ack.message, "subscribed");
            assert_eq!(ack.data.unwrap()["subscriptions"], 1);
        }
        other => panic!("expected ACK, got {other:?}"),
    }
    assert_eq!(state.router.subscription_count("proto-sub").await, 1);
}

#[tokio::test]
async fn invalid_sub_leaves_the_session_open_and_creates_nothing() {
    let (state, addr, _cancel) = spawn_gateway(GatewayConfig::default()).await;
    let mut client =
        WsTestClient::connect(&format!("ws://{addr}/ws?tenantId=64b1&clientId=proto-bad"))
            .await
            .unwrap();
    expect_connected_ack(&mut client).await;

    // Empty siteId: the whole SUB is rejected, no partial creation.
    client
        .send_text(r#"{"type":"SUB","streams":[{"kind":"feeding","siteId":"ok"},{"kind":"feeding","siteId":""}]}"#)
        .await
        .unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Error(e) => assert_eq!(e.code, error_codes::INVALID_SUB),
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert_eq!(state.router.subscription_count("proto-bad").await, 0);

    // The session is still usable.
    client.send_message(&sub_message("site-1", false)).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Ack(_) => {}
        other => panic!("expected ACK after recovery, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_and_malformed_frames_get_distinct_codes() {
    let (_state, addr, _cancel) = spawn_gateway(GatewayConfig::default()).await;
    let mut client = WsTestClient::connect(&format!("ws://{addr}/ws?tenantId=64b1"))
        .await
        .unwrap();
    expect_connected_ack(&mut client).await;

    client.send_text("{not json").await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Error(e) => assert_eq!(e.code, error_codes::INVALID_MESSAGE),
        other => panic!("expected ERROR, got {other:?}"),
    }

    client.send_text(r#"{"type":"SNAPSHOT"}"#).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Error(e) => assert_eq!(e.code, error_codes::UNKNOWN_TYPE),
        other => panic!("expected ERROR, got {other:?}"),
    }

    client.send_text(r#"{"streams":[]}"#).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Error(e) => assert_eq!(e.code, error_codes::INVALID_MESSAGE),
        other => panic!("expected ERROR, got {other:?}"),
    }

    client.send_binary(&[0xde, 0xad]).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Error(e) => assert_eq!(e.code, error_codes::INVALID_MESSAGE),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_gets_pong_and_unsub_gets_ack() {
    let (state, addr, _cancel) = spawn_gateway(GatewayConfig::default()).await;
    let mut client =
        WsTestClient::connect(&format!("ws://{addr}/ws?tenantId=64b1&clientId=proto-pp"))
            .await
            .unwrap();
    expect_connected_ack(&mut client).await;

    client.send_message(&WsMessage::Ping).await.unwrap();
    assert_eq!(client.recv_message().await.unwrap(), WsMessage::Pong);

    client.send_message(&sub_message("site-1", false)).await.unwrap();
    client.recv_message().await.unwrap(); // subscribed ACK

    client.send_message(&WsMessage::Unsub).await.unwrap();
    match client.recv_message().await.unwrap() {
        WsMessage::Ack(ack) => {
            assert_eq!(ack.message, "unsubscribed");
            assert_eq!(ack.data.unwrap()["removed"], 1);
        }
        other => panic!("expected ACK, got {other:?}"),
    }
    assert_eq!(state.router.subscription_count("proto-pp").await, 0);
}

#[tokio::test]
async fn duplicate_client_id_gets_a_fresh_identity() {
    let (state, addr, _cancel) = spawn_gateway(GatewayConfig::default()).await;
    let url = format!("ws://{addr}/ws?tenantId=64b1&clientId=dup");
    let mut first = WsTestClient::connect(&url).await.unwrap();
    expect_connected_ack(&mut first).await;

    let mut second = WsTestClient::connect(&url).await.unwrap();
    match second.recv_message().await.unwrap() {
        WsMessage::Ack(ack) => {
            let assigned = ack.data.unwrap()["clientId"].as_str().unwrap().to_owned();
            assert_ne!(assigned, "dup");
        }
        other => panic!("expected ACK, got {other:?}"),
    }
    // Both sessions are live.
    tokio::time::timeout(Duration::from_secs(2), async {
        while state.sessions.len() != 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("two live sessions");
}
