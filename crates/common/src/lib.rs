//! Shared domain model for the market-making game server.
//!
//! Every crate in the workspace speaks these types: the engine mutates them,
//! the gateway serializes them onto the wire. Wire field names are camelCase
//! to match the client protocol.

pub mod ids;
pub mod time;
pub mod types;

pub use ids::{new_id, GameCode, MarketId, OrderId, PlayerId, TradeId};
pub use time::now_ms;
pub use types::{
    Announcement, GameStatus, Market, MarketMakerQuote, Order, Player, Position, Round, Side,
    SpreadSubmission, Stage, Trade, TradeDirection, GAME_CODE_ALPHABET, GAME_CODE_LEN,
    INITIAL_CASH, MAX_ANNOUNCEMENTS,
};
