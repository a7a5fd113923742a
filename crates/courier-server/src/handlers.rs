//! Session handling for the chat hub.
//!
//! Each accepted WebSocket becomes one session: a reader loop (this
//! task) decoding frames and dispatching them to type-specific handlers,
//! and a writer task draining the bounded outbound queue and sending
//! keepalive pings. Shutdown order is fixed: unregister from the hub
//! first, then close the send path, then the transport - so no delivery
//! races the close.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use courier_core::bridge::{self, Bus, LocalBus};
use courier_core::{
    ConnectionHandle, Hub, HubHandle, MatchOutcome, MemoryDirectory, MemoryMessageStore,
    MemoryOfflineQueue, PresenceService, RedisBus, RendezvousMatcher,
};
use courier_protocol::envelope::kinds;
use courier_protocol::{codec, Envelope, MessagePayload};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{BusMode, Config};
use crate::metrics::{self, ConnectionMetricsGuard};

/// Shared server state.
pub struct AppState {
    pub hub: HubHandle,
    pub presence: Arc<PresenceService>,
    pub matcher: Arc<RendezvousMatcher>,
    pub config: Config,
}

/// Run the chat hub service.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let bus: Arc<dyn Bus> = match config.bus.mode {
        BusMode::Local => Arc::new(LocalBus::default()),
        BusMode::Redis => Arc::new(RedisBus::open(&config.bus.url, &config.bus.channel)?),
    };

    let (hub, member_events) = Hub::spawn();
    bridge::spawn_forwarder(Arc::clone(&bus), hub.clone());

    // Single-node collaborators; the account layer seeds the directory
    // out of band.
    let directory = Arc::new(MemoryDirectory::new());
    let messages = Arc::new(MemoryMessageStore::new());
    let offline = Arc::new(MemoryOfflineQueue::new());

    let presence = Arc::new(PresenceService::new(bus, directory, messages, offline));
    presence.spawn_worker(member_events);

    let matcher = Arc::new(RendezvousMatcher::new(Duration::from_millis(
        config.matcher.wait_timeout_ms,
    )));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState {
        hub,
        presence,
        matcher,
        config: config.clone(),
    });

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/random/join/:user_id", get(rendezvous_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Courier hub listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.websocket_path
    );

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    /// Already authenticated by the (external) request layer.
    #[serde(rename = "userID")]
    user_id: String,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state, query.user_id))
}

/// Pair two anonymous callers into an ephemeral session. Role asymmetry
/// decides who starts the handshake: the waiting side returns as "peer",
/// the arriving side as "initiator". Dropping the request (client hung
/// up) removes the waiter.
async fn rendezvous_handler(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    metrics::set_rendezvous_waiting(state.matcher.waiting_count());
    let outcome = state.matcher.join(&user_id).await;
    metrics::set_rendezvous_waiting(state.matcher.waiting_count());
    match outcome {
        MatchOutcome::Matched { partner, role } => Json(serde_json::json!({
            "matched": true,
            "partnerID": partner,
            "role": role.as_str(),
        })),
        MatchOutcome::TimedOut => Json(serde_json::json!({ "matched": false })),
    }
}

/// Drive one session to completion.
async fn handle_session(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (out_tx, out_rx) = mpsc::channel::<Envelope>(state.config.limits.outbound_queue);
    let connection = state.hub.register(&user_id, out_tx);
    debug!(user = %user_id, session = connection.session_id(), "websocket connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let keepalive = state.config.keepalive.clone();
    let mut writer = tokio::spawn(run_writer(
        ws_tx,
        out_rx,
        connection.close_notify(),
        keepalive.ping_interval(),
        keepalive.write_timeout(),
    ));

    let max_frame = state.config.limits.max_frame_size;
    let mut deadline = Instant::now() + keepalive.pong_timeout();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let frame = match incoming {
                    Some(Ok(Message::Text(frame))) => frame,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(frame) => frame,
                        Err(_) => {
                            warn!(user = %user_id, "non-utf8 binary frame");
                            metrics::record_error("decode");
                            break;
                        }
                    },
                    Some(Ok(Message::Pong(_))) => {
                        deadline = Instant::now() + keepalive.pong_timeout();
                        continue;
                    }
                    // Pings are answered at the protocol layer.
                    Some(Ok(Message::Ping(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(user = %user_id, error = %e, "websocket error");
                        break;
                    }
                };

                metrics::record_envelope(frame.len(), "inbound");
                match codec::decode(&frame, max_frame) {
                    Ok(envelope) => dispatch_envelope(&state, &connection, envelope).await,
                    Err(e) => {
                        // Oversized or undecodable frames are fatal for
                        // this connection only.
                        warn!(user = %user_id, error = %e, "fatal protocol error");
                        metrics::record_error("decode");
                        break;
                    }
                }
            }
            () = sleep_until(deadline) => {
                warn!(user = %user_id, "keepalive deadline expired");
                break;
            }
        }
    }

    // Unregister first so no further delivery races the close.
    state.hub.unregister(connection.session_id());
    connection.close();
    if timeout(keepalive.write_timeout(), &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(user = %user_id, "websocket disconnected");
}

/// Outbound loop: drain the queue, ping on the keepalive interval, stop
/// on eviction. Generic over the sink so the eviction/shutdown behavior
/// is testable without a live socket.
async fn run_writer<S>(
    mut ws_tx: S,
    mut out_rx: mpsc::Receiver<Envelope>,
    close: Arc<tokio::sync::Notify>,
    ping_every: Duration,
    write_timeout: Duration,
) where
    S: futures_util::Sink<Message> + Unpin,
{
    let mut ping_tick = interval(ping_every);
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ping_tick.tick().await;

    loop {
        tokio::select! {
            maybe_env = out_rx.recv() => {
                let Some(envelope) = maybe_env else { break };
                let frame = match codec::encode(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable envelope");
                        continue;
                    }
                };
                metrics::record_envelope(frame.len(), "outbound");
                match timeout(write_timeout, ws_tx.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = ping_tick.tick() => {
                match timeout(write_timeout, ws_tx.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            () = close.notified() => break,
        }
    }
    let _ = ws_tx.close().await;
}

/// Hand a decoded envelope to its type-specific handler. Unknown types
/// are logged and ignored, never fatal.
async fn dispatch_envelope(state: &Arc<AppState>, connection: &ConnectionHandle, env: Envelope) {
    match env.kind.as_str() {
        // Membership side effects (presence broadcast, offline flush)
        // fire exactly once, from the hub's register/unregister events;
        // the frames themselves carry nothing further.
        kinds::JOIN | kinds::DISCONNECT => {
            debug!(
                user = %connection.user_id(),
                kind = %env.kind,
                "membership handled at the session boundary"
            );
        }
        kinds::MESSAGE => match env.decode_payload::<MessagePayload>() {
            Ok(mut message) => {
                // The session's authenticated identity wins over whatever
                // the client claimed.
                message.from_user_id = connection.user_id().to_string();
                if let Err(e) = state.presence.send_message(message).await {
                    warn!(user = %connection.user_id(), error = %e, "message send failed");
                    metrics::record_error("send");
                }
            }
            Err(e) => {
                warn!(user = %connection.user_id(), error = %e, "malformed message payload");
            }
        },
        kinds::TYPING => {
            if let Err(e) = state.presence.relay_typing(&env.payload).await {
                warn!(user = %connection.user_id(), error = %e, "malformed typing payload");
            }
        }
        other => {
            debug!(kind = %other, "ignoring unknown envelope type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MemberEvent;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    /// Records frames instead of writing to a socket.
    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Message>>>,
        closed: Arc<AtomicBool>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<Message> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl futures_util::Sink<Message> for RecordingSink {
        type Error = Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Infallible> {
            self.frames.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            self.closed.store(true, Ordering::Relaxed);
            Poll::Ready(Ok(()))
        }
    }

    fn envelope(n: u32) -> Envelope {
        Envelope::targeted(kinds::MESSAGE_RESPONSE, &n, "alice").unwrap()
    }

    async fn wait_for_frames(sink: &RecordingSink, count: usize) -> Vec<Message> {
        for _ in 0..200 {
            let frames = sink.frames();
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("sink never saw {count} frames, got {:?}", sink.frames());
    }

    #[tokio::test]
    async fn test_writer_drains_queue_in_enqueue_order() {
        let sink = RecordingSink::default();
        let (out_tx, out_rx) = mpsc::channel(8);
        let close = Arc::new(tokio::sync::Notify::new());
        let writer = tokio::spawn(run_writer(
            sink.clone(),
            out_rx,
            Arc::clone(&close),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));

        out_tx.send(envelope(1)).await.unwrap();
        out_tx.send(envelope(2)).await.unwrap();

        let frames = wait_for_frames(&sink, 2).await;
        for (frame, expected) in frames.iter().zip([1u32, 2]) {
            let Message::Text(text) = frame else {
                panic!("expected text frame, got {frame:?}");
            };
            let env = codec::decode(text, usize::MAX).unwrap();
            assert_eq!(env.decode_payload::<u32>().unwrap(), expected);
            assert_eq!(env.target_user_id, "alice");
        }

        // Close signal ends the loop and closes the transport after it.
        close.notify_one();
        timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should stop on close signal")
            .unwrap();
        assert!(sink.closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_hub_eviction_closes_the_outbound_loop() {
        let (hub, mut events) = Hub::spawn();
        let (out_tx, out_rx) = mpsc::channel(1);
        let connection = hub.register("slow", out_tx);
        let Some(MemberEvent::Joined { .. }) =
            timeout(Duration::from_secs(1), events.recv()).await.ok().flatten()
        else {
            panic!("expected join event");
        };

        // Overflow the capacity-1 queue before the writer runs; the hub
        // drops the excess and evicts, storing the close permit.
        for n in 0..3 {
            hub.send_to_user("slow", envelope(n));
        }
        let left = timeout(Duration::from_secs(1), events.recv()).await.ok().flatten();
        assert!(matches!(left, Some(MemberEvent::Left { .. })));

        // The evicted session's outbound loop must shut down on its own.
        let sink = RecordingSink::default();
        let writer = tokio::spawn(run_writer(
            sink.clone(),
            out_rx,
            connection.close_notify(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        timeout(Duration::from_secs(1), writer)
            .await
            .expect("eviction should stop the writer")
            .unwrap();
        assert!(sink.closed.load(Ordering::Relaxed));
        // At most the one queued envelope went out; nothing after the
        // close.
        assert!(sink.frames().len() <= 1);
    }

    #[tokio::test]
    async fn test_writer_pings_on_the_keepalive_interval() {
        let sink = RecordingSink::default();
        // Keep the sender alive so the queue stays open but empty.
        let (_out_tx, out_rx) = mpsc::channel::<Envelope>(8);
        let close = Arc::new(tokio::sync::Notify::new());
        let writer = tokio::spawn(run_writer(
            sink.clone(),
            out_rx,
            Arc::clone(&close),
            Duration::from_millis(10),
            Duration::from_secs(1),
        ));

        let frames = wait_for_frames(&sink, 1).await;
        assert!(
            matches!(frames[0], Message::Ping(_)),
            "expected a keepalive ping, got {:?}",
            frames[0]
        );

        close.notify_one();
        timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should stop on close signal")
            .unwrap();
    }
}
