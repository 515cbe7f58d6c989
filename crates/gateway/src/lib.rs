//! Event gateway for the market-making game server.
//!
//! This service:
//! - Accepts WebSocket connections from players and gamemasters
//! - Keeps a per-connection session bag (player, game, role)
//! - Routes inbound events to game-instance methods via the registry
//! - Fans engine events out to each game's room, with every recipient
//!   receiving a snapshot projected for their role
//!
//! ## Architecture
//!
//! ```text
//! WebSocket clients
//!         ↓ inbound events
//! dispatch (session + GM authorization)
//!         ↓
//! engine::GameRegistry → GameHandle
//!         ↓ GameEvent channel
//! event pump → SessionRegistry rooms → per-recipient STATE projection
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod pump;
pub mod session;
pub mod ws_server;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{room_key, Session, SessionData, SessionId, SessionRegistry};
pub use ws_server::{create_router, GatewayState};
