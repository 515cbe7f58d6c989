//! WebSocket server handler using Axum.

use crate::dispatch::{dispatch, leave_current};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{Session, SessionRegistry};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use engine::GameRegistry;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state.
pub struct GatewayState {
    pub sessions: SessionRegistry,
    pub games: GameRegistry,
}

impl GatewayState {
    pub fn new() -> Self {
        Self {
            sessions: SessionRegistry::new(),
            games: GameRegistry::new(),
        }
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<GatewayState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let sessions = state.sessions.session_count();
    let games = state.games.game_count();
    format!(r#"{{"status":"ok","sessions":{},"games":{}}}"#, sessions, games)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outgoing channel; the session holds the sender, this task forwards.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session = Arc::new(Session::new(tx));
    let session_id = state.sessions.register(session.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.sessions.session_count() as f64);
    info!("session {} connected", session_id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Ping interval for keepalive.
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => handle_message(&state, &session, msg).await,
                    Some(Err(error)) => {
                        warn!("WebSocket error for {}: {:?}", session_id, error);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if session.tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    // Disconnect counts as leaving the game.
    leave_current(&state, &session).await;
    state.sessions.unregister(&session_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.sessions.session_count() as f64);
    info!("session {} disconnected", session_id);
}

/// Handle a single WebSocket message. Malformed payloads are answered with a
/// targeted error; nothing here can take the connection down.
async fn handle_message(state: &Arc<GatewayState>, session: &Arc<Session>, msg: Message) {
    match msg {
        Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(event) => dispatch(state, session, event).await,
            Err(_) => {
                let _ = session.send(&ServerMessage::Error {
                    message: "malformed event payload".to_string(),
                });
            }
        },
        Message::Binary(data) => match serde_json::from_slice::<ClientMessage>(&data) {
            Ok(event) => dispatch(state, session, event).await,
            Err(_) => {
                let _ = session.send(&ServerMessage::Error {
                    message: "malformed event payload".to_string(),
                });
            }
        },
        Message::Ping(data) => {
            let _ = session.tx.send(Message::Pong(data));
        }
        Message::Pong(_) | Message::Close(_) => {}
    }
}
