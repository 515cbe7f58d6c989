//! Engine error types.
//!
//! Every variant is a business refusal or validation failure surfaced to the
//! offending connection as a `game:error` event; none of them abort the game.

use thiserror::Error;

/// Engine refusal. The message text is what players see.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("invalid order")]
    InvalidOrder,

    #[error("game has already started")]
    AlreadyStarted,

    #[error("add at least one market before starting")]
    NoMarkets,

    #[error("game is not active")]
    NotPlaying,

    #[error("no round is in progress")]
    NoRound,

    #[error("operation not valid in the current stage")]
    WrongStage,

    #[error("gamemasters cannot trade")]
    GamemasterCannotTrade,

    #[error("unknown player")]
    UnknownPlayer,

    #[error("unknown market")]
    UnknownMarket,

    #[error("spread must be positive")]
    InvalidSpread,

    #[error("spread must be strictly tighter than the current best")]
    SpreadNotTighter,

    #[error("only the market maker may quote")]
    NotMarketMaker,

    #[error("quote width must be positive and match the winning spread")]
    QuoteWidthMismatch,

    #[error("no market maker quote has been set")]
    QuoteMissing,

    #[error("the market maker cannot take their own quote")]
    MarketMakerCannotTrade,

    #[error("trade quantity must be positive")]
    InvalidQuantity,

    #[error("trade would exceed the exposure limit")]
    ExposureExceeded,

    #[error("exposure limit must be non-negative")]
    InvalidExposureLimit,

    #[error("cannot rewind from the current stage")]
    InvalidRewind,

    #[error("all markets must be complete before finalizing pnl")]
    MarketsNotComplete,

    #[error("cannot stop: finalize pnl first")]
    PnlNotFinalized,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, GameError>;
