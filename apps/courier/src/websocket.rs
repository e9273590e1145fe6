use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::handlers::{health_check, metrics_handler, Caller};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::state::Courier;
use crate::transport::SocketHub;

/// Everything the HTTP and WebSocket routes share.
#[derive(Clone)]
pub struct AppState {
    pub courier: Courier,
    pub hub: Arc<SocketHub>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, mut rx) = state.hub.register();
    let (mut sender, mut receiver) = socket.split();
    counter!("courier_connections_opened_total").increment(1);

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(connection_id = %writer_id, "failed to encode frame: {}", e),
            }
        }
        debug!(connection_id = %writer_id, "writer task ended");
    });

    let caller = Caller::new(connection_id.clone());
    info!(connection_id = %connection_id, "websocket connected");

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                warn!(connection_id = %connection_id, "websocket error: {}", e);
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection_id = %connection_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Request {
                event,
                payload,
                ack_id,
            }) => {
                // Handlers may await acks that only this loop can deliver.
                let state = state.clone();
                let caller = caller.clone();
                tokio::spawn(async move {
                    handle_request(&state, &caller, event, payload, ack_id).await;
                });
            }
            Ok(ClientFrame::Ack {
                ack_id,
                error,
                result,
            }) => state.hub.resolve_ack(&connection_id, ack_id, error, result),
            Err(e) => {
                warn!(connection_id = %connection_id, "invalid frame: {}", e);
                let _ = state.hub.send_frame(
                    &connection_id,
                    ServerFrame::Error {
                        message: format!("Invalid message format: {}", e),
                    },
                );
            }
        }
    }

    state.hub.unregister(&connection_id);
    state.courier.on_disconnect(&caller).await;
    writer.abort();
    counter!("courier_connections_closed_total").increment(1);
    info!(connection_id = %connection_id, "websocket disconnected");
}

async fn handle_request(
    state: &AppState,
    caller: &Caller,
    event: String,
    payload: serde_json::Value,
    ack_id: Option<u64>,
) {
    debug!(connection_id = %caller.connection_id, event = %event, "request");
    let reply = state.courier.dispatch(caller, &event, payload).await;
    match ack_id {
        Some(ack_id) => {
            if let Err(e) = state.hub.reply(&caller.connection_id, ack_id, reply.result) {
                debug!(connection_id = %caller.connection_id, event = %event, "reply not sent: {}", e);
            }
        }
        None => {
            if let Err(e) = reply.result {
                debug!(connection_id = %caller.connection_id, event = %event, "unacknowledged request failed: {}", e);
            }
        }
    }
    if let Some(follow_up) = reply.follow_up {
        follow_up.await;
    }
}
