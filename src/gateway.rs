//! WebSocket upgrade gateway.
//!
//! Both WebSocket paths live on the same listener as the REST routes:
//!
//! - `/ws/<docName>?token=…[&jwt=…]`      → CRDT channel, one per document
//! - `/control/<roomId>?token=…[&jwt=…]`  → JSON control channel, one per room
//!
//! The room token is checked in constant time, and — when the identity gate
//! is enabled — the `jwt` parameter must verify, all before the upgrade
//! completes. A socket that fails either check never reaches an engine.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::control::RoomPolicy;
use crate::registry::{constant_time_eq, Room};
use crate::rest::AppState;

/// CRDT frames can carry whole-document state.
pub const MAX_DOC_FRAME_BYTES: usize = 10 * 1024 * 1024;
/// Control messages are small JSON.
pub const MAX_CONTROL_FRAME_BYTES: usize = 1024 * 1024;

async fn authenticate(
    app: &AppState,
    room_id: &str,
    params: &HashMap<String, String>,
) -> Result<Room, StatusCode> {
    let Some(room) = app.registry.get(room_id).await else {
        debug!(room = %room_id, "upgrade rejected: unknown room");
        return Err(StatusCode::NOT_FOUND);
    };

    let token_ok = params
        .get("token")
        .map(|token| constant_time_eq(token.as_bytes(), room.token.as_bytes()))
        .unwrap_or(false);
    if !token_ok {
        debug!(room = %room_id, "upgrade rejected: bad room token");
        return Err(StatusCode::FORBIDDEN);
    }

    if let Some(verifier) = &app.verifier {
        let identity_ok = params
            .get("jwt")
            .map(|jwt| verifier.verify(jwt).is_some())
            .unwrap_or(false);
        if !identity_ok {
            debug!(room = %room_id, "upgrade rejected: identity check failed");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    Ok(room)
}

/// `GET /ws/{*docName}` — the document name is everything after `/ws/`; the
/// room id is the part before the first `:`.
pub async fn ws_doc(
    State(app): State<AppState>,
    Path(doc_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let room_id = doc_name.split(':').next().unwrap_or_default();
    match authenticate(&app, room_id, &params).await {
        Ok(_) => ws
            .max_message_size(MAX_DOC_FRAME_BYTES)
            .on_upgrade(move |socket| run_doc_connection(app, socket, doc_name)),
        Err(status) => status.into_response(),
    }
}

/// `GET /control/{roomId}`.
pub async fn ws_control(
    State(app): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    match authenticate(&app, &room_id, &params).await {
        Ok(room) => {
            let policy = RoomPolicy::from_room(&room);
            ws.max_message_size(MAX_CONTROL_FRAME_BYTES)
                .on_upgrade(move |socket| run_control_connection(app, socket, room_id, policy))
        }
        Err(status) => status.into_response(),
    }
}

async fn run_doc_connection(app: AppState, socket: WebSocket, doc_name: String) {
    let engine = app.docs.clone();
    let (doc, conn_id, rx) = engine.connect(&doc_name).await;

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(forward_outbound(rx, sink));

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Binary(data) => engine.handle_frame(&doc, conn_id, &data).await,
            Message::Close(_) => break,
            // This channel is binary; text and ping/pong are not ours to handle.
            _ => {}
        }
    }

    engine.disconnect(&doc, conn_id).await;
    writer.abort();
}

async fn run_control_connection(
    app: AppState,
    socket: WebSocket,
    room_id: String,
    policy: RoomPolicy,
) {
    let hub = app.control.clone();
    let (room, conn_id, rx) = hub.join(&room_id, policy).await;

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(forward_outbound(rx, sink));

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => hub.handle_message(&room, conn_id, text.as_str()).await,
            Message::Close(_) => break,
            // Binary frames have no meaning on the control channel.
            _ => {}
        }
    }

    hub.leave(&room_id, &room, conn_id).await;
    writer.abort();
}

/// Drain an engine's outbound queue into the socket. A failed write means
/// the peer is gone; a queued close frame ends the connection deliberately.
async fn forward_outbound(
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
}
