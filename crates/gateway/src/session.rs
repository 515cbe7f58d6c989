//! Session state and room registry.
//!
//! One `Session` per WebSocket connection, carrying the connection's
//! outbound channel and its game membership bag. The registry keeps a
//! lock-free map of sessions plus a room index keyed `game:<CODE>` for
//! broadcast fan-out.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use common::{now_ms, GameCode, PlayerId};
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique session identifier.
pub type SessionId = Uuid;

/// Broadcast room key for a game code.
pub fn room_key(code: &str) -> String {
    format!("game:{code}")
}

/// Per-connection game membership, populated on join/create and cleared on
/// leave or disconnect.
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    pub player_id: Option<PlayerId>,
    pub game_code: Option<GameCode>,
    pub display_name: Option<String>,
    pub is_gamemaster: bool,
}

/// State for a single connected client.
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Channel to send messages to the session's WebSocket.
    pub tx: mpsc::UnboundedSender<Message>,
    /// Timestamp when the session connected.
    pub connected_at: i64,
    data: Mutex<SessionData>,
}

impl Session {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            connected_at: now_ms(),
            data: Mutex::new(SessionData::default()),
        }
    }

    /// Send a message to this session.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.tx
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    /// Snapshot of the session's game membership.
    pub fn data(&self) -> SessionData {
        self.data.lock().expect("session data lock poisoned").clone()
    }

    /// Record game membership after a successful join.
    pub fn set_game(
        &self,
        player_id: PlayerId,
        game_code: GameCode,
        display_name: String,
        is_gamemaster: bool,
    ) {
        let mut data = self.data.lock().expect("session data lock poisoned");
        *data = SessionData {
            player_id: Some(player_id),
            game_code: Some(game_code),
            display_name: Some(display_name),
            is_gamemaster,
        };
    }

    /// Clear game membership, returning what was set.
    pub fn take_game(&self) -> SessionData {
        let mut data = self.data.lock().expect("session data lock poisoned");
        std::mem::take(&mut data)
    }
}

/// Lock-free registry of connected sessions and their rooms.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Room key → member session ids.
    rooms: DashMap<String, DashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    pub fn register(&self, session: Arc<Session>) -> SessionId {
        let id = session.id;
        self.sessions.insert(id, session);
        id
    }

    pub fn unregister(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
        for room in self.rooms.iter() {
            room.value().remove(session_id);
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn join_room(&self, room: &str, session_id: SessionId) {
        self.rooms.entry(room.to_string()).or_default().insert(session_id);
    }

    pub fn leave_room(&self, room: &str, session_id: &SessionId) {
        if let Some(members) = self.rooms.get(room) {
            members.remove(session_id);
        }
    }

    /// All live sessions currently in a room.
    pub fn room_sessions(&self, room: &str) -> Vec<Arc<Session>> {
        let Some(members) = self.rooms.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| self.sessions.get(&*id).map(|s| s.clone()))
            .collect()
    }

    /// Broadcast one message to every session in a room, serializing once.
    pub fn broadcast_room(&self, room: &str, msg: &ServerMessage) {
        let recipients = self.room_sessions(room);
        if recipients.is_empty() {
            return;
        }
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(error) => {
                tracing::warn!("failed to serialize broadcast message: {error}");
                return;
            }
        };
        for session in recipients {
            let _ = session.tx.send(Message::Text(json.clone().into()));
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
