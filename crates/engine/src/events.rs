//! Engine → gateway event stream.
//!
//! Each game owns one unbounded channel; every state change is pushed onto it
//! in emission order, and a single gateway consumer fans the events out to the
//! game's room. One ordered stream per game is what guarantees the delivery
//! ordering the protocol promises (ORDER_BOOK before TRADE before STATE,
//! STAGE_CHANGED before the first TIMER tick).

use crate::book::BookSnapshot;
use common::{Announcement, PlayerId, Round, SpreadSubmission, Stage, Trade};

/// One engine-originated event for the game's room.
#[derive(Debug, Clone)]
pub enum GameEvent {
    /// The round moved to a new stage (round is `None` once all markets are
    /// exhausted).
    StageChanged {
        stage: Stage,
        round: Option<Round>,
    },
    /// The stage-1 spread auction changed.
    SpreadUpdate {
        best_spread: Option<f64>,
        best_spread_player_id: Option<PlayerId>,
        submissions: Vec<SpreadSubmission>,
    },
    /// The resting book changed (post-match aggregate).
    OrderBook(BookSnapshot),
    /// A fill was executed (matched or forced).
    Trade(Trade),
    /// Stage-timer heartbeat.
    Timer {
        stage: Stage,
        ends_at: i64,
        seconds_remaining: i64,
    },
    /// Gamemaster announcement.
    Announcement(Announcement),
    /// A player left the game.
    PlayerLeft {
        player_id: PlayerId,
        display_name: Option<String>,
    },
    /// The game was stopped by the gamemaster.
    Ended { message: String },
    /// Marker telling the gateway to run the per-recipient state broadcast.
    StateSync,
}
