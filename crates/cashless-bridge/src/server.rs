//! Event-channel server
//!
//! Clients connect over a persistent WebSocket and receive every session
//! event; requests arrive as JSON frames and each produces exactly one
//! result frame on the same connection. Card events are fanned out to all
//! connections; request results go only to the requester.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::events::{InboundRequest, OutboundEvent};
use crate::session::SharedSession;

pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub session: SharedSession,
    pub events: broadcast::Sender<OutboundEvent>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Persistent event channel
        .route("/ws", get(ws_upgrade))
        // Liveness probe
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    debug!("event channel client connected");
    run_connection(socket, state).await;
    debug!("event channel client disconnected");
}

/// One client connection. Generic over the message transport so the
/// protocol can be driven by scripted frames in tests.
async fn run_connection<S>(socket: S, state: Arc<AppState>)
where
    S: Stream<Item = Result<Message, axum::Error>> + Sink<Message> + Send + 'static,
    <S as Sink<Message>>::Error: Send,
{
    let (mut sink, mut stream) = socket.split();

    // Every outbound frame funnels through one channel so the socket has a
    // single writer.
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundEvent>(32);

    // A late joiner immediately learns about the card already inserted.
    if let Some((card_id, activated)) = state.session.insertion_snapshot() {
        let _ = out_tx
            .send(OutboundEvent::card_inserted(card_id, activated))
            .await;
    }

    let mut events = state.events.subscribe();
    let forward_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if forward_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event channel client lagging, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable event");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(_) => break,
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Ping/pong and binary frames are not part of the protocol.
            _ => continue,
        };

        let request: InboundRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "ignoring malformed request frame");
                continue;
            }
        };

        // Requests run concurrently; a slow backend call never blocks the
        // read loop or the card-event fan-out.
        let bridge = state.bridge.clone();
        let reply_tx = out_tx.clone();
        tokio::spawn(async move {
            let result = bridge.dispatch(request).await;
            let _ = reply_tx.send(result).await;
        });
    }

    forwarder.abort();
    writer.abort();
}
