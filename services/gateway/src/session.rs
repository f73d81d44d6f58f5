//! Per-session state and the outbound path.
//!
//! Each WebSocket session owns a bounded outbound buffer drained by a
//! writer task.  The router's delivery callback enqueues without blocking;
//! on a full buffer the drop policy applies: DATA is dropped and counted,
//! STATUS is remembered per stream (keep-latest) and flushed by the writer
//! once capacity frees up.

use crate::config::WebsocketSection;
use crate::metrics;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use omni_core::event::CanonicalEvent;
use omni_core::router::{DeliveryContext, DeliveryOutcome, RoutedEvent};
use omni_core::stream::StreamKey;
use omni_proto::{DataFlags, DataMessage, StatusMessage, WireStream, WsMessage, ENVELOPE_VERSION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// One unit for the writer task.
#[derive(Debug)]
pub enum OutboundFrame {
    Message(WsMessage),
    /// Transport-level pong answering a client ping.
    Pong(Vec<u8>),
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Shared handle to one session's outbound path.
///
/// Cloned into the registry (for the router callback) and into the reader
/// (for protocol replies).  The underlying buffer is single-consumer: only
/// the writer task drains it.
#[derive(Clone)]
pub struct SessionHandle {
    pub client_id: String,
    pub tenant: String,
    outbound: mpsc::Sender<OutboundFrame>,
    include_status: Arc<AtomicBool>,
    pending_status: Arc<StdMutex<HashMap<StreamKey, WsMessage>>>,
    last_data_sent: Arc<StdMutex<HashMap<(Uuid, StreamKey), Instant>>>,
    pub data_dropped: Arc<AtomicU64>,
    pub status_superseded: Arc<AtomicU64>,
}

impl SessionHandle {
    pub fn new(
        client_id: impl Into<String>,
        tenant: impl Into<String>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        SessionHandle {
            client_id: client_id.into(),
            tenant: tenant.into(),
            outbound,
            include_status: Arc::new(AtomicBool::new(false)),
            pending_status: Arc::new(StdMutex::new(HashMap::new())),
            last_data_sent: Arc::new(StdMutex::new(HashMap::new())),
            data_dropped: Arc::new(AtomicU64::new(0)),
            status_superseded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_include_status(&self, value: bool) {
        self.include_status.store(value, Ordering::Relaxed);
    }

    pub fn include_status(&self) -> bool {
        self.include_status.load(Ordering::Relaxed)
    }

    /// Queue a protocol reply (ACK/ERROR/PONG/WARN).  Waits for buffer
    /// space; returns false once the session is gone.
    pub async fn send_control(&self, msg: WsMessage) -> bool {
        self.outbound.send(OutboundFrame::Message(msg)).await.is_ok()
    }

    pub async fn send_pong(&self, data: Vec<u8>) -> bool {
        self.outbound.send(OutboundFrame::Pong(data)).await.is_ok()
    }

    /// Non-blocking delivery from the router callback.
    pub fn offer(&self, ctx: &DeliveryContext, routed: &RoutedEvent) -> DeliveryOutcome {
        match routed {
            RoutedEvent::Data(event) => self.offer_data(ctx, event),
            RoutedEvent::Status(event) => self.offer_status(event),
        }
    }

    fn offer_data(&self, ctx: &DeliveryContext, event: &CanonicalEvent) -> DeliveryOutcome {
        let started = Instant::now();
        if ctx.throttle_ms > 0 {
            let throttle_key = (ctx.subscription_id, event.envelope.key.clone());
            let clocks = self
                .last_data_sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = clocks.get(&throttle_key) {
                if last.elapsed() < Duration::from_millis(ctx.throttle_ms) {
                    metrics::EVENTS_DROPPED.with_label_values(&["data"]).inc();
                    return DeliveryOutcome::Dropped;
                }
            }
        }

        let msg = data_frame(event);
        match self.outbound.try_send(OutboundFrame::Message(msg)) {
            Ok(()) => {
                if ctx.throttle_ms > 0 {
                    self.last_data_sent
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert((ctx.subscription_id, event.envelope.key.clone()), Instant::now());
                }
                metrics::EVENTS_ROUTED.with_label_values(&["data"]).inc();
                metrics::DELIVERY_LATENCY.observe(started.elapsed().as_secs_f64());
                DeliveryOutcome::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.data_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::EVENTS_DROPPED.with_label_values(&["data"]).inc();
                DeliveryOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Gone,
        }
    }

    fn offer_status(&self, event: &CanonicalEvent) -> DeliveryOutcome {
        if !self.include_status() {
            return DeliveryOutcome::Dropped;
        }
        let Some(msg) = status_frame(event) else {
            warn!(client_id = %self.client_id, "unparsable status payload");
            return DeliveryOutcome::Dropped;
        };
        let started = Instant::now();
        match self.outbound.try_send(OutboundFrame::Message(msg)) {
            Ok(()) => {
                metrics::EVENTS_ROUTED.with_label_values(&["status"]).inc();
                metrics::DELIVERY_LATENCY.observe(started.elapsed().as_secs_f64());
                DeliveryOutcome::Delivered
            }
            Err(mpsc::error::TrySendError::Full(OutboundFrame::Message(msg))) => {
                // Keep-latest: the newest status per stream supersedes any
                // older one still waiting for capacity.
                let superseded = self
                    .pending_status
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(event.envelope.key.clone(), msg)
                    .is_some();
                if superseded {
                    metrics::STATUS_KEEP_LATEST.inc();
                }
                self.status_superseded.fetch_add(1, Ordering::Relaxed);
                metrics::EVENTS_DROPPED.with_label_values(&["status"]).inc();
                DeliveryOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Full(_)) => DeliveryOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Gone,
        }
    }

    /// Drain the keep-latest buffer (called by the writer when capacity
    /// frees up).
    pub fn take_pending(&self) -> Vec<WsMessage> {
        let mut pending = self
            .pending_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pending.drain().map(|(_, msg)| msg).collect()
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Live sessions by client-id.  Read on every router fanout, so the lock
/// is a short std RwLock, never held across await points.
#[derive(Default)]
pub struct SessionRegistry {
    inner: StdRwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the handle; false if the client id is already connected.
    pub fn insert(&self, handle: SessionHandle) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&handle.client_id) {
            return false;
        }
        map.insert(handle.client_id.clone(), handle);
        true
    }

    pub fn remove(&self, client_id: &str) -> Option<SessionHandle> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<SessionHandle> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Wire conversion
// ---------------------------------------------------------------------------

pub fn wire_stream(key: &StreamKey) -> WireStream {
    WireStream {
        tenant: key.tenant.clone(),
        site_id: key.site.clone(),
        cage_id: key.cage.clone(),
        kind: key.metric.as_str().to_owned(),
        metric: key.metric.as_str().to_owned(),
    }
}

/// Convert a canonical DATA event to its wire frame.
pub fn data_frame(event: &CanonicalEvent) -> WsMessage {
    let payload = serde_json::from_slice(&event.payload).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&event.payload).into_owned())
    });
    let flags = if event.envelope.has_flag(omni_core::event::flags::LATE) {
        Some(DataFlags {
            partial: Some(true),
        })
    } else {
        None
    };
    WsMessage::Data(DataMessage {
        v: ENVELOPE_VERSION,
        ts: event.envelope.timestamp.timestamp_millis(),
        stream: wire_stream(&event.envelope.key),
        payload,
        flags,
    })
}

/// Convert a canonical STATUS event to its wire frame.  The payload is the
/// serialized status body the router produced.
pub fn status_frame(event: &CanonicalEvent) -> Option<WsMessage> {
    let status = serde_json::from_slice(&event.payload).ok()?;
    Some(WsMessage::Status(StatusMessage {
        v: ENVELOPE_VERSION,
        ts: event.envelope.timestamp.timestamp_millis(),
        stream: wire_stream(&event.envelope.key),
        status,
    }))
}

fn frame_type(msg: &WsMessage) -> &'static str {
    match msg {
        WsMessage::Sub(_) => "SUB",
        WsMessage::Unsub => "UNSUB",
        WsMessage::Ping => "PING",
        WsMessage::Pong => "PONG",
        WsMessage::Ack(_) => "ACK",
        WsMessage::Error(_) => "ERROR",
        WsMessage::Warn(_) => "WARN",
        WsMessage::Data(_) => "DATA",
        WsMessage::Status(_) => "STATUS",
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn send_text<S>(sink: &mut S, msg: &WsMessage, write_wait: Duration) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    match tokio::time::timeout(write_wait, sink.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => {
            metrics::WS_FRAMES_SENT
                .with_label_values(&[frame_type(msg)])
                .inc();
            Ok(())
        }
        Ok(Err(e)) => {
            debug!(error = %e, "socket write failed");
            Err(())
        }
        Err(_) => {
            debug!("socket write timed out");
            Err(())
        }
    }
}

async fn flush_pending<S>(sink: &mut S, handle: &SessionHandle, write_wait: Duration) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    for msg in handle.take_pending() {
        send_text(sink, &msg, write_wait).await?;
    }
    Ok(())
}

/// Drain the outbound buffer into the socket, preserving enqueue order.
///
/// Emits a transport ping when the buffer has been idle for a full ping
/// period, and flushes kept-latest STATUS frames whenever capacity frees
/// up.  Exits on write failure, channel close, or cancellation.
pub async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<OutboundFrame>,
    handle: SessionHandle,
    ws_cfg: WebsocketSection,
    cancel: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let write_wait = Duration::from_secs(ws_cfg.write_wait);
    let mut ping = tokio::time::interval(Duration::from_secs(ws_cfg.ping_period));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe = rx.recv() => {
                let Some(frame) = maybe else { break };
                let result = match frame {
                    OutboundFrame::Message(msg) => send_text(&mut sink, &msg, write_wait).await,
                    OutboundFrame::Pong(data) => {
                        match tokio::time::timeout(write_wait, sink.send(Message::Pong(data.into()))).await {
                            Ok(Ok(())) => Ok(()),
                            _ => Err(()),
                        }
                    }
                };
                if result.is_err() {
                    break;
                }
                if flush_pending(&mut sink, &handle, write_wait).await.is_err() {
                    break;
                }
                ping.reset();
            }
            _ = ping.tick() => {
                if flush_pending(&mut sink, &handle, write_wait).await.is_err() {
                    break;
                }
                match tokio::time::timeout(write_wait, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
    cancel.cancel();
    debug!(client_id = %handle.client_id, "writer exited");
}
