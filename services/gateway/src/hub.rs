//! WebSocket hub: connection lifecycle and the session protocol.
//!
//! `GET /ws?tenantId=<hex>&clientId=<opt>` upgrades to a session speaking
//! the omniapi-ws-v1 protocol.  Each session runs a reader (inbound
//! protocol dispatch, read deadline) and a writer (outbound buffer drain,
//! transport pings); either side failing tears the session down and
//! releases its subscriptions in the router.

use crate::session::{self, OutboundFrame, SessionHandle};
use crate::state::AppState;
use crate::metrics;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::{SplitStream, StreamExt};
use omni_core::index::{EventAttrs, SubscriptionFilter};
use omni_core::router::{DeliveryFn, DeliveryOutcome};
use omni_core::status::StatusSnapshot;
use omni_core::stream::MetricKind;
use omni_proto::{
    error_codes, AckMessage, StatusMessage, SubMessage, WarnMessage, WsMessage, ENVELOPE_VERSION,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The router delivery callback: resolve the session and hand over,
/// without blocking.
pub fn make_delivery(sessions: Arc<session::SessionRegistry>) -> DeliveryFn {
    Arc::new(move |ctx, routed| match sessions.get(&ctx.client_id) {
        Some(handle) => handle.offer(ctx, routed),
        None => DeliveryOutcome::Gone,
    })
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let ws = ws
        .max_message_size(state.config.websocket.max_message_size)
        .write_buffer_size(state.config.websocket.write_buffer);
    ws.on_upgrade(move |socket| handle_session(socket, state, params))
}

fn validate_tenant(params: &HashMap<String, String>) -> Result<String, (&'static str, String)> {
    let Some(tenant) = params.get("tenantId") else {
        return Err((
            error_codes::MISSING_TENANT,
            "tenantId query parameter is required".to_owned(),
        ));
    };
    let tenant = tenant.trim();
    let valid = !tenant.is_empty()
        && tenant.len() <= 64
        && tenant.chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err((
            error_codes::INVALID_TENANT,
            format!("tenantId must be a hex identifier, got '{tenant}'"),
        ));
    }
    Ok(tenant.to_owned())
}

async fn reject(socket: &mut WebSocket, code: &str, message: &str) {
    let msg = WsMessage::error(code, message);
    if let Ok(json) = serde_json::to_string(&msg) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn handle_session(mut socket: WebSocket, state: AppState, params: HashMap<String, String>) {
    let tenant = match validate_tenant(&params) {
        Ok(tenant) => tenant,
        Err((code, message)) => {
            reject(&mut socket, code, &message).await;
            return;
        }
    };

    let (out_tx, out_rx) = tokio::sync::mpsc::channel::<OutboundFrame>(
        state.config.websocket.outbound_buffer_size.max(1),
    );
    let mut client_id = params
        .get("clientId")
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let handle = loop {
        let candidate = SessionHandle::new(client_id.clone(), tenant.clone(), out_tx.clone());
        if state.sessions.insert(candidate.clone()) {
            break candidate;
        }
        warn!(client_id = %client_id, "clientId already connected; assigning a fresh id");
        client_id = Uuid::new_v4().to_string();
    };
    drop(out_tx);

    state.router.register_client(&client_id, &tenant).await;
    metrics::WS_SESSIONS_ACTIVE.inc();
    info!(client_id = %client_id, tenant = %tenant, "session connected");

    handle
        .send_control(WsMessage::Ack(AckMessage {
            message: "connected".to_owned(),
            data: Some(serde_json::json!({
                "protocol": PROTOCOL_VERSION,
                "clientId": client_id,
            })),
        }))
        .await;

    let (ws_tx, ws_rx) = socket.split();
    let session_cancel = state.cancel.child_token();
    let writer = tokio::spawn(session::run_writer(
        ws_tx,
        out_rx,
        handle.clone(),
        state.config.websocket.clone(),
        session_cancel.clone(),
    ));

    run_reader(ws_rx, &state, &handle, session_cancel.clone()).await;

    session_cancel.cancel();
    let _ = writer.await;
    state.sessions.remove(&client_id);
    state.router.unregister_client(&client_id).await;
    metrics::WS_SESSIONS_ACTIVE.dec();
    info!(client_id = %client_id, "session closed");
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

async fn run_reader(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    handle: &SessionHandle,
    cancel: tokio_util::sync::CancellationToken,
) {
    let read_deadline = Duration::from_secs(state.config.websocket.pong_wait);
    let mut subscription_ids: Vec<Uuid> = Vec::new();

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = tokio::time::timeout(read_deadline, stream.next()) => msg,
        };
        match msg {
            Err(_) => {
                info!(client_id = %handle.client_id, "read deadline exceeded; closing session");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                debug!(client_id = %handle.client_id, error = %e, "socket read error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if !dispatch_text(state, handle, &mut subscription_ids, text.as_str()).await {
                    break;
                }
            }
            Ok(Some(Ok(Message::Binary(_)))) => {
                let ok = handle
                    .send_control(WsMessage::error(
                        error_codes::INVALID_MESSAGE,
                        "binary frames are not supported",
                    ))
                    .await;
                if !ok {
                    break;
                }
            }
            Ok(Some(Ok(Message::Ping(data)))) => {
                if !handle.send_pong(data.to_vec()).await {
                    break;
                }
            }
            Ok(Some(Ok(Message::Pong(_)))) => {}
        }
    }
}

/// Handle one inbound text frame.  Returns false when the session should
/// tear down (outbound path gone).
async fn dispatch_text(
    state: &AppState,
    handle: &SessionHandle,
    subscription_ids: &mut Vec<Uuid>,
    text: &str,
) -> bool {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            return handle
                .send_control(WsMessage::error(
                    error_codes::INVALID_MESSAGE,
                    "frame is not valid JSON",
                ))
                .await;
        }
    };
    let Some(msg_type) = value.get("type").and_then(serde_json::Value::as_str) else {
        return handle
            .send_control(WsMessage::error(
                error_codes::INVALID_MESSAGE,
                "missing type field",
            ))
            .await;
    };
    match msg_type {
        "SUB" => match serde_json::from_value::<WsMessage>(value) {
            Ok(WsMessage::Sub(sub)) => handle_sub(state, handle, subscription_ids, sub).await,
            _ => {
                handle
                    .send_control(WsMessage::error(
                        error_codes::INVALID_SUB,
                        "malformed SUB payload",
                    ))
                    .await
            }
        },
        "UNSUB" => handle_unsub(state, handle, subscription_ids).await,
        "PING" => handle.send_control(WsMessage::Pong).await,
        other => {
            handle
                .send_control(WsMessage::error(
                    error_codes::UNKNOWN_TYPE,
                    format!("unsupported message type '{other}'"),
                ))
                .await
        }
    }
}

async fn handle_sub(
    state: &AppState,
    handle: &SessionHandle,
    subscription_ids: &mut Vec<Uuid>,
    sub: SubMessage,
) -> bool {
    if sub.streams.is_empty() {
        return handle
            .send_control(WsMessage::error(
                error_codes::INVALID_SUB,
                "streams must be non-empty",
            ))
            .await;
    }
    // Validate every entry before creating anything: an invalid SUB
    // creates zero subscriptions.
    for entry in &sub.streams {
        if entry.site_id.trim().is_empty() {
            return handle
                .send_control(WsMessage::error(
                    error_codes::INVALID_SUB,
                    "siteId must be non-empty",
                ))
                .await;
        }
        if entry.kind.trim().is_empty() {
            return handle
                .send_control(WsMessage::error(
                    error_codes::INVALID_SUB,
                    "kind must be non-empty",
                ))
                .await;
        }
    }

    let mut created: Vec<Uuid> = Vec::new();
    let mut filters: Vec<SubscriptionFilter> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    for entry in &sub.streams {
        let requested = entry.metric.as_deref().unwrap_or(&entry.kind);
        let (metric, known) = MetricKind::parse_lenient(requested);
        if !known {
            warnings.push(format!("unknown metric '{requested}' projected to 'other'"));
        }
        let filter = SubscriptionFilter {
            tenant: Some(handle.tenant.clone()),
            kind: Some(metric.as_str().to_owned()),
            site: Some(entry.site_id.clone()),
            cage: entry.cage_id.clone(),
            ..SubscriptionFilter::default()
        };
        match state
            .router
            .subscribe(
                &handle.client_id,
                filter.clone(),
                sub.include_status,
                sub.throttle_ms,
            )
            .await
        {
            Ok(id) => {
                created.push(id);
                filters.push(filter);
            }
            Err(e) => {
                warn!(client_id = %handle.client_id, error = %e, "subscribe failed");
                for id in &created {
                    state.router.unsubscribe(id).await;
                }
                return handle
                    .send_control(WsMessage::error(error_codes::SUB_FAILED, e.to_string()))
                    .await;
            }
        }
    }

    if sub.include_status {
        handle.set_include_status(true);
    }
    subscription_ids.extend(created.iter().copied());
    debug!(
        client_id = %handle.client_id,
        count = created.len(),
        "subscriptions created"
    );

    let acked = handle
        .send_control(WsMessage::Ack(AckMessage {
            message: "subscribed".to_owned(),
            data: Some(serde_json::json!({ "subscriptions": created.len() })),
        }))
        .await;
    if !acked {
        return false;
    }
    for message in warnings {
        if !handle.send_control(WsMessage::Warn(WarnMessage { message })).await {
            return false;
        }
    }
    // A snapshot is a burst of STATUS frames, so it honors the same
    // include-status opt-in as pushed heartbeats.
    if sub.need_snapshot && sub.include_status {
        return send_status_snapshot(state, handle, &filters).await;
    }
    true
}

/// One immediate STATUS frame per currently-tracked stream matching the
/// new subscriptions (the `needSnapshot` path).
async fn send_status_snapshot(
    state: &AppState,
    handle: &SessionHandle,
    filters: &[SubscriptionFilter],
) -> bool {
    let records = state.tracker.list_all().await;
    let now = Utc::now();
    let status_cfg = state.config.status_config();
    for (key, kpis) in records {
        let attrs = EventAttrs::from_key(&key);
        if !filters.iter().any(|f| f.matches(&attrs)) {
            continue;
        }
        let snapshot = StatusSnapshot::derive(&key, &kpis, now, &status_cfg);
        let msg = WsMessage::Status(StatusMessage {
            v: ENVELOPE_VERSION,
            ts: now.timestamp_millis(),
            stream: session::wire_stream(&key),
            status: snapshot.to_wire_body(),
        });
        if !handle.send_control(msg).await {
            return false;
        }
    }
    true
}

async fn handle_unsub(
    state: &AppState,
    handle: &SessionHandle,
    subscription_ids: &mut Vec<Uuid>,
) -> bool {
    let removed = state.router.unsubscribe_client(&handle.client_id).await;
    subscription_ids.clear();
    handle.set_include_status(false);
    handle
        .send_control(WsMessage::Ack(AckMessage {
            message: "unsubscribed".to_owned(),
            data: Some(serde_json::json!({ "removed": removed })),
        }))
        .await
}
