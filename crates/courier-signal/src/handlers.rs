//! Session handling for the signaling service.
//!
//! Each participant connects to `/ws/:room_id?userId=...`. The write
//! half of the socket becomes the peer's link in the room registry; the
//! read half stays with this task, relaying each inbound message until
//! the peer disconnects.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use courier_core::{MemoryRoomStore, RoomStore};
use courier_protocol::signal::{kinds, SignalMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::rooms::{LinkError, PeerLink, RoomRegistry};

/// Shared server state.
pub struct AppState {
    pub registry: RoomRegistry<WsPeerLink>,
    pub store: Arc<dyn RoomStore>,
    pub config: Config,
}

/// The write half of a participant's WebSocket.
pub struct WsPeerLink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl PeerLink for WsPeerLink {
    async fn send_signal(&mut self, message: &SignalMessage) -> Result<(), LinkError> {
        let frame = serde_json::to_string(message).map_err(|e| LinkError(e.to_string()))?;
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| LinkError(e.to_string()))
    }
}

/// Run the signaling service.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store: Arc<dyn RoomStore> = Arc::new(MemoryRoomStore::new(config.room_ttl()));
    let registry = RoomRegistry::new(Arc::clone(&store));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState {
        registry,
        store,
        config,
    });

    let app = Router::new()
        .route("/ws/:room_id", get(ws_handler))
        .route("/rooms/:room_id/participants", get(participants_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Courier signaling listening on {}", addr);

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

/// Room participants as tracked by the external store.
async fn participants_handler(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let participants = state
        .store
        .list_room_participants(&room_id)
        .await
        .unwrap_or_default();
    Json(serde_json::json!({
        "roomId": room_id,
        "count": participants.len(),
        "participants": participants,
    }))
}

#[derive(Debug, Deserialize)]
struct SignalQuery {
    /// Already authenticated by the (external) request layer.
    #[serde(rename = "userId")]
    user_id: String,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(query): Query<SignalQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signaling(socket, state, room_id, query.user_id))
}

/// Drive one signaling session to completion.
async fn handle_signaling(
    socket: WebSocket,
    state: Arc<AppState>,
    room_id: String,
    user_id: String,
) {
    if user_id.is_empty() {
        warn!(room = %room_id, "rejecting session without user id");
        return;
    }
    let _metrics_guard = ConnectionMetricsGuard::new();
    info!(user = %user_id, room = %room_id, "joining signaling room");

    let (ws_tx, mut ws_rx) = socket.split();
    let peer = state
        .registry
        .join(&room_id, &user_id, WsPeerLink { sink: ws_tx })
        .await;
    metrics::set_active_rooms(state.registry.room_count());

    // Greet the joiner with the ICE servers it needs for NAT traversal.
    match serde_json::value::to_raw_value(&state.config.ice_servers) {
        Ok(ice) => {
            let greeting = SignalMessage::control(kinds::ROOM_JOINED, &user_id, &room_id)
                .with_metadata(ice);
            peer.send(&greeting).await;
        }
        Err(e) => warn!(error = %e, "could not encode ICE server list"),
    }

    while let Some(incoming) = ws_rx.next().await {
        match incoming {
            Ok(Message::Text(frame)) => {
                if frame.len() > state.config.max_frame_size {
                    warn!(user = %user_id, size = frame.len(), "oversized signal frame");
                    metrics::record_error("oversize");
                    break;
                }
                match serde_json::from_str::<SignalMessage>(&frame) {
                    Ok(message) => {
                        metrics::record_relay(&message.kind);
                        state.registry.relay(&room_id, &user_id, message).await;
                    }
                    Err(e) => {
                        warn!(user = %user_id, error = %e, "undecodable signal frame");
                        metrics::record_error("decode");
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Ping/pong are handled at the protocol layer.
            Ok(_) => {}
        }
    }

    state.registry.leave(&room_id, &user_id).await;
    metrics::set_active_rooms(state.registry.room_count());
    info!(user = %user_id, room = %room_id, "left signaling room");
}
