//! WebSocket protocol message types.
//!
//! Defines the JSON message format for client-server communication. Every
//! message carries a `type` tag holding the event name; payload fields are
//! camelCase. Acknowledgements are realized as direct reply events on the
//! same socket (`game:joined` on success, `game:error` otherwise).

use common::{
    Announcement, MarketId, PlayerId, Round, Side, SpreadSubmission, Stage, TradeDirection,
};
use engine::{BookSnapshot, GameSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join an existing game by code.
    #[serde(rename = "game:join")]
    JoinGame {
        game_code: String,
        display_name: String,
        #[serde(default)]
        is_gamemaster: bool,
        gamemaster_secret: Option<String>,
    },
    /// Leave the current game.
    #[serde(rename = "game:leave")]
    LeaveGame,
    /// Stage-1 spread submission.
    #[serde(rename = "game:spread:submit")]
    SubmitSpread { spread_width: f64 },
    /// Stage-2 market maker quote.
    #[serde(rename = "game:mm:quote")]
    SubmitQuote { bid: f64, ask: f64 },
    /// Stage-3 forced trade against the quote.
    #[serde(rename = "game:forced:trade")]
    ForcedTrade {
        direction: TradeDirection,
        quantity: u32,
    },
    /// Stage-4 limit order.
    #[serde(rename = "game:order:submit")]
    SubmitOrder {
        side: Side,
        price: f64,
        quantity: u32,
    },
    /// Not part of the supported surface; always answered with an error.
    #[serde(rename = "game:order:cancel")]
    CancelOrder { order_id: String },

    /// Create a game and join it as gamemaster.
    #[serde(rename = "gm:create")]
    GmCreate {
        gamemaster_secret: String,
        spread_timer_seconds: Option<i64>,
        open_trading_timer_seconds: Option<i64>,
        no_tighter_window_seconds: Option<i64>,
    },
    #[serde(rename = "gm:start")]
    GmStart,
    #[serde(rename = "gm:pause")]
    GmPause,
    #[serde(rename = "gm:resume")]
    GmResume,
    #[serde(rename = "gm:stop")]
    GmStop,
    #[serde(rename = "gm:next_stage")]
    GmNextStage,
    #[serde(rename = "gm:prev_stage")]
    GmPrevStage,
    #[serde(rename = "gm:add_market")]
    GmAddMarket { name: String, description: String },
    #[serde(rename = "gm:add_derivative")]
    GmAddDerivative {
        name: String,
        description: String,
        underlying_weights: HashMap<MarketId, f64>,
        condition: Option<String>,
    },
    #[serde(rename = "gm:broadcast")]
    GmBroadcast { text: String },
    /// Replace the stage timer; seconds clamped to [1, 3600].
    #[serde(rename = "gm:set_timer")]
    GmSetTimer { seconds: i64 },
    #[serde(rename = "gm:set_visibility")]
    GmSetVisibility { show_individual_positions: bool },
    #[serde(rename = "gm:set_true_value")]
    GmSetTrueValue { market_id: MarketId, value: f64 },
    #[serde(rename = "gm:set_exposure_limit")]
    GmSetExposureLimit { max_exposure: i64 },
    #[serde(rename = "gm:finalize_pnl")]
    GmFinalizePnl,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Join acknowledgement with the viewer's tailored state.
    #[serde(rename = "game:joined")]
    Joined {
        game_code: String,
        player_id: PlayerId,
        is_gamemaster: bool,
        state: GameSnapshot,
    },
    /// Full state snapshot, projected per recipient.
    #[serde(rename = "game:state")]
    State { state: GameSnapshot },
    #[serde(rename = "game:stage_changed")]
    StageChanged {
        stage: Stage,
        round: Option<Round>,
    },
    #[serde(rename = "game:spread_update")]
    SpreadUpdate {
        best_spread: Option<f64>,
        best_spread_player_id: Option<PlayerId>,
        submissions: Vec<SpreadSubmission>,
    },
    #[serde(rename = "game:order_book")]
    OrderBook { order_book: BookSnapshot },
    #[serde(rename = "game:trade")]
    Trade { trade: common::Trade },
    #[serde(rename = "game:announcement")]
    Announcement { id: String, text: String, at: i64 },
    #[serde(rename = "game:timer")]
    Timer {
        stage: Stage,
        ends_at: i64,
        seconds_remaining: i64,
    },
    #[serde(rename = "game:player_left")]
    PlayerLeft {
        player_id: PlayerId,
        display_name: Option<String>,
    },
    #[serde(rename = "game:error")]
    Error { message: String },
    #[serde(rename = "game:ended")]
    Ended {
        state: GameSnapshot,
        message: String,
    },
}

impl From<Announcement> for ServerMessage {
    fn from(announcement: Announcement) -> Self {
        ServerMessage::Announcement {
            id: announcement.id,
            text: announcement.text,
            at: announcement.at,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
