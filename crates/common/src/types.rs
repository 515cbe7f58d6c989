//! Core domain types: markets, orders, trades, players, rounds.

use crate::ids::{MarketId, OrderId, PlayerId, TradeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Starting cash endowment for every player.
pub const INITIAL_CASH: f64 = 10_000.0;

/// Announcement ring capacity; oldest entries are evicted beyond this.
pub const MAX_ANNOUNCEMENTS: usize = 50;

/// Game-code alphabet: uppercase letters and digits without the look-alikes
/// `I`, `O`, `0`, `1`.
pub const GAME_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of an issued game code.
pub const GAME_CODE_LEN: usize = 6;

// ============================================================================
// Markets
// ============================================================================

/// A tradeable market. A market carrying `underlying_weights` is a
/// derivative: its true value is the weighted sum of its underlyings'
/// true values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: MarketId,
    pub name: String,
    pub description: String,
    /// Signed weight per underlying market id, present only on derivatives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub underlying_weights: Option<HashMap<MarketId, f64>>,
    /// Optional settlement condition text shown to players.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Market {
    pub fn is_derivative(&self) -> bool {
        self.underlying_weights.is_some()
    }
}

// ============================================================================
// Orders and trades
// ============================================================================

/// Which side of the book an order rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

/// Direction of a forced trade against the market maker's quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Buy,
    Sell,
}

/// A resting limit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub market_id: MarketId,
    pub player_id: PlayerId,
    pub side: Side,
    pub price: f64,
    pub quantity: u32,
    pub remaining_quantity: u32,
    pub created_at: i64,
    /// Monotonic insertion sequence; breaks price ties by time priority.
    pub sequence: u64,
}

/// An executed fill. Forced-trading fills carry empty order-id fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: TradeId,
    pub market_id: MarketId,
    pub buyer_id: PlayerId,
    pub seller_id: PlayerId,
    pub bid_order_id: OrderId,
    pub ask_order_id: OrderId,
    pub price: f64,
    pub quantity: u32,
    pub executed_at: i64,
}

// ============================================================================
// Players and positions
// ============================================================================

/// Signed inventory in one market. `avg_cost` is meaningful only while the
/// quantity is non-zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub quantity: i64,
    pub avg_cost: f64,
}

impl Position {
    /// Apply a fill and recompute the average cost as the quantity-weighted
    /// mean of the prior cost and this fill's price.
    pub fn apply_costed_fill(&mut self, delta: i64, price: f64) {
        let prior = self.quantity;
        let next = prior + delta;
        if next == 0 {
            self.quantity = 0;
            self.avg_cost = 0.0;
            return;
        }
        if prior == 0 {
            self.avg_cost = price;
        } else {
            let prior_abs = prior.unsigned_abs() as f64;
            let delta_abs = delta.unsigned_abs() as f64;
            self.avg_cost = (self.avg_cost * prior_abs + price * delta_abs) / (prior_abs + delta_abs);
        }
        self.quantity = next;
    }

    /// Apply a fill without touching the average cost. Used for the market
    /// maker's side of a trade.
    pub fn apply_fill(&mut self, delta: i64) {
        self.quantity += delta;
        if self.quantity == 0 {
            self.avg_cost = 0.0;
        }
    }
}

/// One participant in a game. The gamemaster flag lasts for the game's
/// lifetime; the market-maker flag is valid for the current round only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub display_name: String,
    pub cash: f64,
    pub positions: HashMap<MarketId, Position>,
    pub round_pnl: f64,
    pub total_pnl: f64,
    pub is_market_maker: bool,
    pub is_gamemaster: bool,
}

impl Player {
    pub fn new(id: PlayerId, display_name: String, is_gamemaster: bool) -> Self {
        Self {
            id,
            display_name,
            cash: INITIAL_CASH,
            positions: HashMap::new(),
            round_pnl: 0.0,
            total_pnl: 0.0,
            is_market_maker: false,
            is_gamemaster,
        }
    }

    /// Signed position in the given market (0 if never traded).
    pub fn position_in(&self, market_id: &str) -> i64 {
        self.positions.get(market_id).map(|p| p.quantity).unwrap_or(0)
    }
}

// ============================================================================
// Rounds
// ============================================================================

/// The five round stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    SpreadQuoting,
    MarketMakerQuote,
    ForcedTrading,
    OpenTrading,
    RoundEnd,
}

/// Overall game status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Lobby,
    Playing,
    Paused,
    Stopped,
}

/// One accepted spread submission during stage 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadSubmission {
    pub player_id: PlayerId,
    pub width: f64,
    pub submitted_at: i64,
}

/// The market maker's two-sided quote recorded at the end of stage 2.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketMakerQuote {
    pub bid: f64,
    pub ask: f64,
}

/// Per-round state. One round exists per market while the game is playing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub index: u32,
    pub stage: Stage,
    pub market_id: MarketId,
    pub best_spread: Option<f64>,
    pub best_spread_player_id: Option<PlayerId>,
    pub submissions: Vec<SpreadSubmission>,
    pub quote: Option<MarketMakerQuote>,
    /// Absolute wall-clock deadline of the active stage timer, if any.
    pub stage_ends_at: Option<i64>,
    /// Rolling stage-1 deadline reset by each accepted submission.
    pub no_tighter_until: Option<i64>,
}

impl Round {
    pub fn new(index: u32, market_id: MarketId) -> Self {
        Self {
            index,
            stage: Stage::SpreadQuoting,
            market_id,
            best_spread: None,
            best_spread_player_id: None,
            submissions: Vec::new(),
            quote: None,
            stage_ends_at: None,
            no_tighter_until: None,
        }
    }
}

// ============================================================================
// Announcements
// ============================================================================

/// A gamemaster broadcast shown to the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub text: String,
    pub at: i64,
}

// ============================================================================
// Tests
// ============================================================================
