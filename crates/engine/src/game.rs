//! Authoritative state, transitions, and settlement for one game.
//!
//! `Game` holds the plain state and the pure mutation logic; `GameHandle`
//! wraps it in the per-game critical section (`Arc<Mutex<Game>>`) and owns
//! everything that needs the tokio runtime: stage timers, the rolling
//! no-tighter timer, and expiry callbacks. Every mutation to a game runs
//! serialized behind the one mutex, so no two operations interleave.

use crate::book::OrderBook;
use crate::error::{GameError, Result};
use crate::events::GameEvent;
use crate::values::market_true_value;
use common::{
    new_id, now_ms, Announcement, GameCode, GameStatus, Market, MarketId, MarketMakerQuote,
    Player, PlayerId, Position, Round, Side, SpreadSubmission, Stage, Trade, TradeDirection,
    INITIAL_CASH, MAX_ANNOUNCEMENTS,
};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Width tolerance when checking the market maker's quote against the
/// winning spread.
const QUOTE_WIDTH_TOLERANCE: f64 = 1e-6;

/// Game-level configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct GameConfig {
    pub spread_timer_ms: i64,
    pub open_trading_timer_ms: i64,
    pub no_tighter_window_ms: i64,
    pub gamemaster_secret: String,
}

impl GameConfig {
    pub fn new(gamemaster_secret: impl Into<String>) -> Self {
        Self {
            spread_timer_ms: 60_000,
            open_trading_timer_ms: 120_000,
            no_tighter_window_ms: 10_000,
            gamemaster_secret: gamemaster_secret.into(),
        }
    }
}

/// What an armed stage timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    EndSpreadQuoting,
    EndOpenTrading,
}

/// Abort handles for the game's spawned timer tasks.
#[derive(Debug, Default)]
struct Timers {
    stage: Option<AbortHandle>,
    tick: Option<AbortHandle>,
    no_tighter: Option<AbortHandle>,
}

impl Timers {
    fn clear_stage(&mut self) {
        if let Some(handle) = self.stage.take() {
            handle.abort();
        }
        if let Some(handle) = self.tick.take() {
            handle.abort();
        }
    }

    fn clear_all(&mut self) {
        self.clear_stage();
        if let Some(handle) = self.no_tighter.take() {
            handle.abort();
        }
    }
}

/// Viewer-projected copy of the game state, broadcast as `game:state`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub game_code: GameCode,
    pub status: GameStatus,
    pub markets: Vec<Market>,
    pub current_market_index: usize,
    pub current_round_index: u32,
    pub round: Option<Round>,
    pub players: HashMap<PlayerId, Player>,
    pub announcements: Vec<Announcement>,
    pub show_individual_positions: bool,
    /// Present only in gamemaster projections, augmented with computable
    /// derivative values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_true_values: Option<HashMap<MarketId, f64>>,
    pub all_markets_complete: bool,
    pub pnl_finalized: bool,
    pub max_exposure: i64,
    pub created_at: i64,
}

/// Authoritative state for one game.
#[derive(Debug)]
pub struct Game {
    code: GameCode,
    config: GameConfig,
    status: GameStatus,
    markets: Vec<Market>,
    current_market_index: usize,
    current_round_index: u32,
    round: Option<Round>,
    /// Order book for the current market; at most one at a time.
    book: Option<OrderBook>,
    players: HashMap<PlayerId, Player>,
    announcements: VecDeque<Announcement>,
    show_individual_positions: bool,
    /// Gamemaster-configured settlement values, keyed by market id.
    market_true_values: HashMap<MarketId, f64>,
    all_markets_complete: bool,
    pnl_finalized: bool,
    /// Absolute per-market position limit; 0 disables the check.
    max_exposure: i64,
    created_at: i64,
    /// Outbound event stream; `None` once the game is shut down.
    events: Option<UnboundedSender<GameEvent>>,
    timers: Timers,
    /// Expiry of the armed (or paused) stage timer, kept for resume.
    stage_expiry: Option<Expiry>,
}

impl Game {
    pub fn new(code: GameCode, config: GameConfig, events: UnboundedSender<GameEvent>) -> Self {
        Self {
            code,
            config,
            status: GameStatus::Lobby,
            markets: Vec::new(),
            current_market_index: 0,
            current_round_index: 0,
            round: None,
            book: None,
            players: HashMap::new(),
            announcements: VecDeque::new(),
            show_individual_positions: true,
            market_true_values: HashMap::new(),
            all_markets_complete: false,
            pnl_finalized: false,
            max_exposure: 0,
            created_at: now_ms(),
            events: Some(events),
            timers: Timers::default(),
            stage_expiry: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.round.as_ref().map(|r| r.stage)
    }

    pub fn is_gamemaster(&self, player_id: &str) -> bool {
        self.players
            .get(player_id)
            .map(|p| p.is_gamemaster)
            .unwrap_or(false)
    }

    fn emit(&self, event: GameEvent) {
        // Broadcast hooks never fail the caller; a closed channel just means
        // the gateway side is gone.
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn emit_stage_changed(&self) {
        let stage = self.current_stage().unwrap_or(Stage::RoundEnd);
        self.emit(GameEvent::StageChanged {
            stage,
            round: self.round.clone(),
        });
    }

    fn ensure_playing(&self) -> Result<()> {
        if self.status == GameStatus::Playing {
            Ok(())
        } else {
            Err(GameError::NotPlaying)
        }
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    /// Add a player, or refresh an existing one on re-join of the same id.
    pub fn add_player(&mut self, id: &str, display_name: &str, is_gamemaster: bool) {
        if let Some(player) = self.players.get_mut(id) {
            player.display_name = display_name.to_string();
            if is_gamemaster {
                player.is_gamemaster = true;
            }
            return;
        }
        let mut player = Player::new(id.to_string(), display_name.to_string(), is_gamemaster);
        for market in &self.markets {
            player.positions.insert(market.id.clone(), Position::default());
        }
        self.players.insert(id.to_string(), player);
        debug!(game = %self.code, player = id, "player joined");
    }

    /// Remove a player. Their resting orders stay in the book and may still
    /// match; settlement then applies to whichever principals remain.
    pub fn remove_player(&mut self, id: &str) -> Option<Player> {
        let removed = self.players.remove(id);
        if let Some(player) = &removed {
            self.emit(GameEvent::PlayerLeft {
                player_id: player.id.clone(),
                display_name: Some(player.display_name.clone()),
            });
            self.emit(GameEvent::StateSync);
            debug!(game = %self.code, player = id, "player left");
        }
        removed
    }

    pub fn set_gamemaster(&mut self, id: &str) {
        if let Some(player) = self.players.get_mut(id) {
            player.is_gamemaster = true;
        }
    }

    /// Constant-time comparison against the configured gamemaster secret.
    pub fn check_gamemaster_secret(&self, candidate: &str) -> bool {
        let secret = self.config.gamemaster_secret.as_bytes();
        let candidate = candidate.as_bytes();
        let mut diff = secret.len() ^ candidate.len();
        for i in 0..secret.len().max(candidate.len()) {
            let a = secret.get(i).copied().unwrap_or(0);
            let b = candidate.get(i).copied().unwrap_or(0);
            diff |= (a ^ b) as usize;
        }
        diff == 0
    }

    // ------------------------------------------------------------------
    // Markets
    // ------------------------------------------------------------------

    /// Append a market and give every player a flat position in it. If all
    /// markets had been exhausted, the new market immediately starts a round.
    pub fn add_market(&mut self, market: Market) -> MarketId {
        let id = market.id.clone();
        self.markets.push(market);
        for player in self.players.values_mut() {
            player.positions.insert(id.clone(), Position::default());
        }
        if self.status == GameStatus::Playing
            && self.all_markets_complete
            && self.round.is_none()
            && self.current_market_index < self.markets.len()
        {
            self.all_markets_complete = false;
            self.current_round_index += 1;
            self.start_round();
        }
        id
    }

    pub fn set_true_value(&mut self, market_id: &str, value: f64) -> Result<()> {
        if !self.markets.iter().any(|m| m.id == market_id) {
            return Err(GameError::UnknownMarket);
        }
        self.market_true_values.insert(market_id.to_string(), value);
        Ok(())
    }

    pub fn set_visibility(&mut self, show_individual_positions: bool) {
        self.show_individual_positions = show_individual_positions;
    }

    pub fn set_exposure_limit(&mut self, max_exposure: i64) -> Result<()> {
        if max_exposure < 0 {
            return Err(GameError::InvalidExposureLimit);
        }
        self.max_exposure = max_exposure;
        Ok(())
    }

    /// Record an announcement, evicting the oldest past the ring capacity.
    pub fn announce(&mut self, text: &str) -> Announcement {
        let announcement = Announcement {
            id: new_id(),
            text: text.to_string(),
            at: now_ms(),
        };
        self.announcements.push_back(announcement.clone());
        while self.announcements.len() > MAX_ANNOUNCEMENTS {
            self.announcements.pop_front();
        }
        self.emit(GameEvent::Announcement(announcement.clone()));
        announcement
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn start_game(&mut self) -> Result<()> {
        if self.status != GameStatus::Lobby {
            return Err(GameError::AlreadyStarted);
        }
        if self.markets.is_empty() {
            return Err(GameError::NoMarkets);
        }
        self.status = GameStatus::Playing;
        self.current_market_index = 0;
        self.current_round_index = 0;
        self.all_markets_complete = false;
        info!(game = %self.code, "game started");
        self.start_round();
        Ok(())
    }

    fn start_round(&mut self) {
        let market_id = self.markets[self.current_market_index].id.clone();
        self.book = Some(OrderBook::new(market_id.clone()));
        self.round = Some(Round::new(self.current_round_index, market_id.clone()));
        for player in self.players.values_mut() {
            player.is_market_maker = false;
            player.round_pnl = 0.0;
        }
        info!(game = %self.code, market = %market_id, round = self.current_round_index, "round started");
        self.emit_stage_changed();
    }

    /// End stage 1: the tightest quoter becomes the market maker, or the
    /// round ends if nobody quoted.
    fn end_spread_quoting(&mut self) {
        self.timers.clear_all();
        self.stage_expiry = None;
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if round.stage != Stage::SpreadQuoting {
            return;
        }
        let winner = round.best_spread_player_id.clone();
        match winner {
            Some(winner) => {
                round.stage = Stage::MarketMakerQuote;
                round.stage_ends_at = None;
                round.no_tighter_until = None;
                if let Some(player) = self.players.get_mut(&winner) {
                    player.is_market_maker = true;
                }
                debug!(game = %self.code, market_maker = %winner, "spread quoting ended");
                self.emit_stage_changed();
            }
            None => {
                debug!(game = %self.code, "spread quoting ended with no submissions");
                self.enter_round_end();
            }
        }
    }

    fn begin_forced_trading(&mut self) -> Result<()> {
        let round = self.round.as_mut().ok_or(GameError::NoRound)?;
        if round.quote.is_none() {
            return Err(GameError::QuoteMissing);
        }
        round.stage = Stage::ForcedTrading;
        round.stage_ends_at = None;
        self.timers.clear_stage();
        self.stage_expiry = None;
        self.emit_stage_changed();
        Ok(())
    }

    fn begin_open_trading(&mut self) {
        if let Some(round) = self.round.as_mut() {
            round.stage = Stage::OpenTrading;
        }
        self.emit_stage_changed();
    }

    fn end_open_trading(&mut self) {
        self.timers.clear_stage();
        self.stage_expiry = None;
        self.enter_round_end();
    }

    fn enter_round_end(&mut self) {
        if let Some(round) = self.round.as_mut() {
            round.stage = Stage::RoundEnd;
            round.stage_ends_at = None;
        }
        self.emit_stage_changed();
        self.advance_to_next_market();
    }

    fn advance_to_next_market(&mut self) {
        self.current_market_index += 1;
        if self.current_market_index < self.markets.len() {
            self.current_round_index += 1;
            self.start_round();
        } else {
            self.round = None;
            self.book = None;
            self.all_markets_complete = true;
            info!(game = %self.code, "all markets complete");
            self.emit_stage_changed();
        }
    }

    /// Minimal rewind: MM quote → spread quoting, forced trading → MM quote.
    fn apply_prev_stage(&mut self) -> Result<()> {
        let spread_timer_ms = self.config.spread_timer_ms;
        let round = self.round.as_mut().ok_or(GameError::NoRound)?;
        match round.stage {
            Stage::MarketMakerQuote => {
                round.stage = Stage::SpreadQuoting;
                // Deadline is recorded but the timer is not re-armed; the
                // round will not auto-advance after this rewind.
                round.stage_ends_at = Some(now_ms() + spread_timer_ms);
            }
            Stage::ForcedTrading => {
                if round.quote.is_none() {
                    return Err(GameError::InvalidRewind);
                }
                round.quote = None;
                round.stage = Stage::MarketMakerQuote;
            }
            _ => return Err(GameError::InvalidRewind),
        }
        self.emit_stage_changed();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.ensure_playing()?;
        self.status = GameStatus::Paused;
        // Deadlines (stage_ends_at, stage_expiry) survive for resume.
        self.timers.clear_all();
        info!(game = %self.code, "game paused");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.all_markets_complete && !self.pnl_finalized {
            return Err(GameError::PnlNotFinalized);
        }
        self.status = GameStatus::Stopped;
        self.timers.clear_all();
        self.stage_expiry = None;
        info!(game = %self.code, "game stopped");
        self.emit(GameEvent::Ended {
            message: "The gamemaster has ended the game.".to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage 1: spread quoting
    // ------------------------------------------------------------------

    fn apply_spread(&mut self, player_id: &str, width: f64) -> Result<()> {
        self.ensure_playing()?;
        let player = self.players.get(player_id).ok_or(GameError::UnknownPlayer)?;
        if player.is_gamemaster {
            return Err(GameError::GamemasterCannotTrade);
        }
        if !(width.is_finite() && width > 0.0) {
            return Err(GameError::InvalidSpread);
        }
        let no_tighter_window_ms = self.config.no_tighter_window_ms;
        let round = self.round.as_mut().ok_or(GameError::NoRound)?;
        if round.stage != Stage::SpreadQuoting {
            return Err(GameError::WrongStage);
        }
        if let Some(best) = round.best_spread {
            if width >= best {
                return Err(GameError::SpreadNotTighter);
            }
        }
        round.best_spread = Some(width);
        round.best_spread_player_id = Some(player_id.to_string());
        round.submissions.push(SpreadSubmission {
            player_id: player_id.to_string(),
            width,
            submitted_at: now_ms(),
        });
        round.no_tighter_until = Some(now_ms() + no_tighter_window_ms);

        let update = GameEvent::SpreadUpdate {
            best_spread: round.best_spread,
            best_spread_player_id: round.best_spread_player_id.clone(),
            submissions: round.submissions.clone(),
        };
        self.emit(update);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage 2: market maker quote
    // ------------------------------------------------------------------

    fn apply_quote(&mut self, player_id: &str, bid: f64, ask: f64) -> Result<()> {
        self.ensure_playing()?;
        let round = self.round.as_mut().ok_or(GameError::NoRound)?;
        if round.stage != Stage::MarketMakerQuote {
            return Err(GameError::WrongStage);
        }
        if round.best_spread_player_id.as_deref() != Some(player_id) {
            return Err(GameError::NotMarketMaker);
        }
        let best_spread = round.best_spread.ok_or(GameError::QuoteMissing)?;
        let width = ask - bid;
        if !(bid.is_finite() && ask.is_finite() && bid > 0.0) {
            return Err(GameError::QuoteWidthMismatch);
        }
        if !(width > 0.0) || (width - best_spread).abs() > QUOTE_WIDTH_TOLERANCE {
            return Err(GameError::QuoteWidthMismatch);
        }
        round.quote = Some(MarketMakerQuote { bid, ask });
        self.begin_forced_trading()
    }

    // ------------------------------------------------------------------
    // Stage 3: forced trading
    // ------------------------------------------------------------------

    fn apply_forced_trade(
        &mut self,
        player_id: &str,
        direction: TradeDirection,
        quantity: u32,
    ) -> Result<Trade> {
        self.ensure_playing()?;
        let round = self.round.as_ref().ok_or(GameError::NoRound)?;
        if round.stage != Stage::ForcedTrading {
            return Err(GameError::WrongStage);
        }
        let quote = round.quote.ok_or(GameError::QuoteMissing)?;
        let maker_id = round
            .best_spread_player_id
            .clone()
            .ok_or(GameError::QuoteMissing)?;
        let market_id = round.market_id.clone();

        let player = self.players.get(player_id).ok_or(GameError::UnknownPlayer)?;
        if player.is_gamemaster {
            return Err(GameError::GamemasterCannotTrade);
        }
        if player_id == maker_id || player.is_market_maker {
            return Err(GameError::MarketMakerCannotTrade);
        }
        if quantity == 0 {
            return Err(GameError::InvalidQuantity);
        }

        let delta = match direction {
            TradeDirection::Buy => quantity as i64,
            TradeDirection::Sell => -(quantity as i64),
        };
        if self.max_exposure > 0 {
            let taker_next = player.position_in(&market_id) + delta;
            let maker_next = self
                .players
                .get(&maker_id)
                .map(|p| p.position_in(&market_id))
                .unwrap_or(0)
                - delta;
            if taker_next.abs() > self.max_exposure || maker_next.abs() > self.max_exposure {
                return Err(GameError::ExposureExceeded);
            }
        }

        let price = match direction {
            TradeDirection::Buy => quote.ask,
            TradeDirection::Sell => quote.bid,
        };
        let taker_cash_delta = match direction {
            TradeDirection::Buy => -price * quantity as f64,
            TradeDirection::Sell => price * quantity as f64,
        };

        if let Some(taker) = self.players.get_mut(player_id) {
            taker.cash += taker_cash_delta;
            taker.round_pnl += taker_cash_delta;
            taker
                .positions
                .entry(market_id.clone())
                .or_default()
                .apply_costed_fill(delta, price);
        }
        if let Some(maker) = self.players.get_mut(&maker_id) {
            maker.cash -= taker_cash_delta;
            maker.round_pnl -= taker_cash_delta;
            // The market maker's average cost is intentionally left alone.
            maker
                .positions
                .entry(market_id.clone())
                .or_default()
                .apply_fill(-delta);
        }

        let (buyer_id, seller_id) = match direction {
            TradeDirection::Buy => (player_id.to_string(), maker_id),
            TradeDirection::Sell => (maker_id, player_id.to_string()),
        };
        let trade = Trade {
            id: new_id(),
            market_id,
            buyer_id,
            seller_id,
            bid_order_id: String::new(),
            ask_order_id: String::new(),
            price,
            quantity,
            executed_at: now_ms(),
        };
        debug!(game = %self.code, price, quantity, "forced trade");
        self.emit(GameEvent::Trade(trade.clone()));
        Ok(trade)
    }

    // ------------------------------------------------------------------
    // Stage 4: open trading
    // ------------------------------------------------------------------

    fn apply_order(
        &mut self,
        player_id: &str,
        side: Side,
        price: f64,
        quantity: u32,
    ) -> Result<Vec<Trade>> {
        self.ensure_playing()?;
        let round = self.round.as_ref().ok_or(GameError::NoRound)?;
        if round.stage != Stage::OpenTrading {
            return Err(GameError::WrongStage);
        }
        let market_id = round.market_id.clone();
        let player = self.players.get(player_id).ok_or(GameError::UnknownPlayer)?;
        if player.is_gamemaster {
            return Err(GameError::GamemasterCannotTrade);
        }

        let (trades, book_snapshot) = {
            let max_exposure = self.max_exposure;
            let players = &self.players;
            // Running intra-batch deltas so a multi-fill order cannot walk a
            // principal past the exposure limit.
            let deltas: RefCell<HashMap<String, i64>> = RefCell::new(HashMap::new());
            let market = market_id.clone();
            let validator = move |buyer: &str, seller: &str, _market: &str, qty: u32| -> bool {
                if max_exposure <= 0 {
                    return true;
                }
                let qty = qty as i64;
                let mut deltas = deltas.borrow_mut();
                let position = |id: &str| {
                    players
                        .get(id)
                        .map(|p| p.position_in(&market))
                        .unwrap_or(0)
                };
                let buyer_next = position(buyer) + deltas.get(buyer).copied().unwrap_or(0) + qty;
                let seller_next = position(seller) + deltas.get(seller).copied().unwrap_or(0) - qty;
                if buyer_next.abs() > max_exposure || seller_next.abs() > max_exposure {
                    return false;
                }
                *deltas.entry(buyer.to_string()).or_insert(0) += qty;
                *deltas.entry(seller.to_string()).or_insert(0) -= qty;
                true
            };

            let book = self.book.as_mut().ok_or(GameError::NoRound)?;
            let (_, trades) = book.add_order(player_id, side, price, quantity, Some(&validator))?;
            (trades, book.snapshot())
        };

        for trade in &trades {
            let notional = trade.price * trade.quantity as f64;
            if let Some(buyer) = self.players.get_mut(&trade.buyer_id) {
                buyer.cash -= notional;
                buyer.round_pnl -= notional;
                buyer
                    .positions
                    .entry(market_id.clone())
                    .or_default()
                    .apply_costed_fill(trade.quantity as i64, trade.price);
            }
            if let Some(seller) = self.players.get_mut(&trade.seller_id) {
                seller.cash += notional;
                seller.round_pnl += notional;
                seller
                    .positions
                    .entry(market_id.clone())
                    .or_default()
                    .apply_fill(-(trade.quantity as i64));
            }
        }

        self.emit(GameEvent::OrderBook(book_snapshot));
        for trade in &trades {
            self.emit(GameEvent::Trade(trade.clone()));
        }
        Ok(trades)
    }

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    /// Settle every non-gamemaster player against the configured true
    /// values. Markets whose value is undefined are skipped. Idempotent.
    fn finalize_pnl(&mut self) -> Result<()> {
        if !self.all_markets_complete {
            return Err(GameError::MarketsNotComplete);
        }
        let values: HashMap<MarketId, f64> = self
            .markets
            .iter()
            .filter_map(|m| {
                market_true_value(&m.id, &self.markets, &self.market_true_values)
                    .map(|v| (m.id.clone(), v))
            })
            .collect();
        for player in self.players.values_mut() {
            if player.is_gamemaster {
                continue;
            }
            let mut settlement = player.cash;
            for (market_id, position) in &player.positions {
                if let Some(value) = values.get(market_id) {
                    settlement += position.quantity as f64 * value;
                }
            }
            player.total_pnl = settlement - INITIAL_CASH;
        }
        self.pnl_finalized = true;
        info!(game = %self.code, "pnl finalized");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------

    /// Project the state for one recipient. Gamemasters see true values;
    /// everyone else gets them stripped. With individual positions hidden,
    /// players are reduced to their total P&L. A non-gamemaster viewer also
    /// has their own cash zeroed.
    pub fn snapshot(&self, for_gamemaster: bool, viewer: Option<&str>) -> GameSnapshot {
        let mut players = self.players.clone();
        if !self.show_individual_positions {
            for player in players.values_mut() {
                player.positions.clear();
                player.cash = 0.0;
                player.round_pnl = 0.0;
            }
        }
        if !for_gamemaster {
            if let Some(viewer) = viewer {
                if let Some(player) = players.get_mut(viewer) {
                    if !player.is_gamemaster {
                        player.cash = 0.0;
                    }
                }
            }
        }
        let market_true_values = if for_gamemaster {
            let mut values = HashMap::new();
            for market in &self.markets {
                if let Some(value) =
                    market_true_value(&market.id, &self.markets, &self.market_true_values)
                {
                    values.insert(market.id.clone(), value);
                }
            }
            Some(values)
        } else {
            None
        };
        GameSnapshot {
            game_code: self.code.clone(),
            status: self.status,
            markets: self.markets.clone(),
            current_market_index: self.current_market_index,
            current_round_index: self.current_round_index,
            round: self.round.clone(),
            players,
            announcements: self.announcements.iter().cloned().collect(),
            show_individual_positions: self.show_individual_positions,
            market_true_values,
            all_markets_complete: self.all_markets_complete,
            pnl_finalized: self.pnl_finalized,
            max_exposure: self.max_exposure,
            created_at: self.created_at,
        }
    }
}

// ============================================================================
// GameHandle: the per-game critical section plus the timer subsystem
// ============================================================================

/// Cloneable handle to one game. All mutation goes through the internal
/// mutex; timer tasks hold a clone and re-enter through the same lock.
#[derive(Debug, Clone)]
pub struct GameHandle {
    inner: Arc<Mutex<Game>>,
}

impl GameHandle {
    pub fn new(game: Game) -> Self {
        Self {
            inner: Arc::new(Mutex::new(game)),
        }
    }

    /// Run a closure inside the game's critical section.
    pub async fn with<R>(&self, f: impl FnOnce(&mut Game) -> R) -> R {
        let mut game = self.inner.lock().await;
        f(&mut game)
    }

    pub async fn snapshot(&self, for_gamemaster: bool, viewer: Option<&str>) -> GameSnapshot {
        self.inner.lock().await.snapshot(for_gamemaster, viewer)
    }

    pub async fn check_gamemaster_secret(&self, candidate: &str) -> bool {
        self.inner.lock().await.check_gamemaster_secret(candidate)
    }

    pub async fn is_gamemaster(&self, player_id: &str) -> bool {
        self.inner.lock().await.is_gamemaster(player_id)
    }

    pub async fn player_count(&self) -> usize {
        self.inner.lock().await.player_count()
    }

    /// Add a player and return their tailored joined-state snapshot.
    pub async fn join_player(
        &self,
        id: &str,
        display_name: &str,
        is_gamemaster: bool,
    ) -> GameSnapshot {
        let mut game = self.inner.lock().await;
        game.add_player(id, display_name, is_gamemaster);
        game.emit(GameEvent::StateSync);
        game.snapshot(is_gamemaster, Some(id))
    }

    /// Remove a player; returns the removed row and the remaining count.
    pub async fn remove_player(&self, id: &str) -> (Option<Player>, usize) {
        let mut game = self.inner.lock().await;
        let removed = game.remove_player(id);
        let remaining = game.player_count();
        (removed, remaining)
    }

    pub async fn start_game(&self) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.start_game()?;
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    /// Stage-1 submission; an accepted quote re-arms the no-tighter window.
    pub async fn submit_spread(&self, player_id: &str, width: f64) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.apply_spread(player_id, width)?;
        let window = game.config.no_tighter_window_ms;
        self.arm_no_tighter(&mut game, window);
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    pub async fn submit_quote(&self, player_id: &str, bid: f64, ask: f64) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.apply_quote(player_id, bid, ask)?;
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    pub async fn forced_trade(
        &self,
        player_id: &str,
        direction: TradeDirection,
        quantity: u32,
    ) -> Result<Trade> {
        let mut game = self.inner.lock().await;
        let trade = game.apply_forced_trade(player_id, direction, quantity)?;
        game.emit(GameEvent::StateSync);
        Ok(trade)
    }

    pub async fn submit_order(
        &self,
        player_id: &str,
        side: Side,
        price: f64,
        quantity: u32,
    ) -> Result<Vec<Trade>> {
        let mut game = self.inner.lock().await;
        let trades = game.apply_order(player_id, side, price, quantity)?;
        game.emit(GameEvent::StateSync);
        Ok(trades)
    }

    /// Advance the round's stage. Entering open trading arms its stage timer.
    pub async fn next_stage(&self) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.ensure_playing()?;
        let stage = game.current_stage().ok_or(GameError::NoRound)?;
        match stage {
            Stage::SpreadQuoting => game.end_spread_quoting(),
            Stage::MarketMakerQuote => {
                let round = game.round.as_ref().ok_or(GameError::NoRound)?;
                if round.quote.is_none() {
                    return Err(GameError::QuoteMissing);
                }
                game.begin_forced_trading()?;
            }
            Stage::ForcedTrading => {
                game.begin_open_trading();
                let duration = game.config.open_trading_timer_ms;
                self.arm_stage_timer(&mut game, duration, Expiry::EndOpenTrading);
            }
            Stage::OpenTrading => game.end_open_trading(),
            Stage::RoundEnd => game.advance_to_next_market(),
        }
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    pub async fn prev_stage(&self) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.ensure_playing()?;
        game.apply_prev_stage()?;
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.pause()?;
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    /// Resume a paused game, re-arming the stage timer with the remaining
    /// wall-clock delta if the deadline is still ahead.
    pub async fn resume(&self) -> Result<()> {
        let mut game = self.inner.lock().await;
        if game.status != GameStatus::Paused {
            return Err(GameError::NotPlaying);
        }
        game.status = GameStatus::Playing;
        info!(game = %game.code, "game resumed");
        let deadline = game.round.as_ref().and_then(|r| r.stage_ends_at);
        if let (Some(ends_at), Some(expiry)) = (deadline, game.stage_expiry) {
            let remaining = (ends_at - now_ms()).max(0);
            if remaining > 0 {
                self.arm_stage_timer(&mut game, remaining, expiry);
            }
        }
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.stop()
    }

    /// Replace the stage timer. Meaningful only in spread quoting and open
    /// trading; a no-op elsewhere.
    pub async fn set_timer(&self, seconds: i64) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.ensure_playing()?;
        let expiry = match game.current_stage() {
            Some(Stage::SpreadQuoting) => Expiry::EndSpreadQuoting,
            Some(Stage::OpenTrading) => Expiry::EndOpenTrading,
            _ => return Ok(()),
        };
        self.arm_stage_timer(&mut game, seconds * 1000, expiry);
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    pub async fn add_market(&self, name: &str, description: &str) -> MarketId {
        self.add_market_inner(name, description, None, None).await
    }

    pub async fn add_derivative(
        &self,
        name: &str,
        description: &str,
        underlying_weights: HashMap<MarketId, f64>,
        condition: Option<String>,
    ) -> MarketId {
        self.add_market_inner(name, description, Some(underlying_weights), condition)
            .await
    }

    async fn add_market_inner(
        &self,
        name: &str,
        description: &str,
        underlying_weights: Option<HashMap<MarketId, f64>>,
        condition: Option<String>,
    ) -> MarketId {
        let mut game = self.inner.lock().await;
        let id = game.add_market(Market {
            id: new_id(),
            name: name.to_string(),
            description: description.to_string(),
            underlying_weights,
            condition,
        });
        game.emit(GameEvent::StateSync);
        id
    }

    pub async fn announce(&self, text: &str) {
        let mut game = self.inner.lock().await;
        game.announce(text);
        game.emit(GameEvent::StateSync);
    }

    pub async fn set_true_value(&self, market_id: &str, value: f64) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.set_true_value(market_id, value)?;
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    pub async fn set_visibility(&self, show_individual_positions: bool) {
        let mut game = self.inner.lock().await;
        game.set_visibility(show_individual_positions);
        game.emit(GameEvent::StateSync);
    }

    pub async fn set_exposure_limit(&self, max_exposure: i64) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.set_exposure_limit(max_exposure)?;
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    pub async fn finalize_pnl(&self) -> Result<()> {
        let mut game = self.inner.lock().await;
        game.finalize_pnl()?;
        game.emit(GameEvent::StateSync);
        Ok(())
    }

    /// Tear the game down: cancel timers and close the event stream so the
    /// gateway pump terminates.
    pub async fn shutdown(&self) {
        let mut game = self.inner.lock().await;
        game.timers.clear_all();
        game.events = None;
    }

    // ------------------------------------------------------------------
    // Timer plumbing
    // ------------------------------------------------------------------

    fn arm_stage_timer(&self, game: &mut Game, duration_ms: i64, expiry: Expiry) {
        game.timers.clear_stage();
        let duration_ms = duration_ms.max(0);
        let now = now_ms();
        let ends_at = now + duration_ms;
        let Some(round) = game.round.as_mut() else {
            return;
        };
        round.stage_ends_at = Some(ends_at);
        let stage = round.stage;
        game.stage_expiry = Some(expiry);
        game.emit(GameEvent::Timer {
            stage,
            ends_at,
            seconds_remaining: seconds_remaining(ends_at, now),
        });

        let handle = self.clone();
        let tick = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                let game = handle.inner.lock().await;
                let now = now_ms();
                if now >= ends_at {
                    break;
                }
                let Some(stage) = game.current_stage() else {
                    break;
                };
                game.emit(GameEvent::Timer {
                    stage,
                    ends_at,
                    seconds_remaining: seconds_remaining(ends_at, now),
                });
            }
        });
        game.timers.tick = Some(tick.abort_handle());

        let handle = self.clone();
        let stage_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms as u64)).await;
            handle.on_stage_expiry(expiry).await;
        });
        game.timers.stage = Some(stage_task.abort_handle());
    }

    fn arm_no_tighter(&self, game: &mut Game, window_ms: i64) {
        if let Some(handle) = game.timers.no_tighter.take() {
            handle.abort();
        }
        let handle = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(window_ms.max(0) as u64)).await;
            handle.on_no_tighter_expiry().await;
        });
        game.timers.no_tighter = Some(task.abort_handle());
    }

    async fn on_stage_expiry(&self, expiry: Expiry) {
        let mut game = self.inner.lock().await;
        if game.status != GameStatus::Playing {
            return;
        }
        let relevant = matches!(
            (expiry, game.current_stage()),
            (Expiry::EndSpreadQuoting, Some(Stage::SpreadQuoting))
                | (Expiry::EndOpenTrading, Some(Stage::OpenTrading))
        );
        if !relevant {
            return;
        }
        match expiry {
            Expiry::EndSpreadQuoting => game.end_spread_quoting(),
            Expiry::EndOpenTrading => game.end_open_trading(),
        }
        game.emit(GameEvent::StateSync);
    }

    async fn on_no_tighter_expiry(&self) {
        let mut game = self.inner.lock().await;
        if game.status != GameStatus::Playing {
            return;
        }
        if game.current_stage() != Some(Stage::SpreadQuoting) {
            return;
        }
        game.end_spread_quoting();
        game.emit(GameEvent::StateSync);
    }
}

fn seconds_remaining(ends_at: i64, now: i64) -> i64 {
    ((ends_at - now).max(0) + 999) / 1000
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn make_game() -> (Game, UnboundedReceiver<GameEvent>) {
        let (tx, rx) = unbounded_channel();
        let game = Game::new("TESTAA".to_string(), GameConfig::new("s"), tx);
        (game, rx)
    }

    fn make_market(id: &str) -> Market {
        Market {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            underlying_weights: None,
            condition: None,
        }
    }

    /// Game with a gamemaster, alice, bob, one market, already started.
    fn make_running_game() -> (Game, UnboundedReceiver<GameEvent>) {
        let (mut game, rx) = make_game();
        game.add_player("gm", "Gamemaster", true);
        game.add_player("alice", "Alice", false);
        game.add_player("bob", "Bob", false);
        game.add_market(make_market("m1"));
        game.start_game().unwrap();
        (game, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<GameEvent>) -> Vec<GameEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drive a running game to forced trading with alice as market maker.
    fn to_forced_trading(game: &mut Game) {
        game.apply_spread("alice", 2.0).unwrap();
        game.end_spread_quoting();
        game.apply_quote("alice", 99.0, 101.0).unwrap();
    }

    #[test]
    fn test_start_requires_lobby_and_market() {
        let (mut game, _rx) = make_game();
        assert_eq!(game.start_game().unwrap_err(), GameError::NoMarkets);
        game.add_market(make_market("m1"));
        game.start_game().unwrap();
        assert_eq!(game.start_game().unwrap_err(), GameError::AlreadyStarted);
        assert_eq!(game.current_stage(), Some(Stage::SpreadQuoting));
    }

    #[test]
    fn test_rejoin_same_id_is_idempotent() {
        let (mut game, _rx) = make_running_game();
        let cash_before = game.players["alice"].cash;
        game.add_player("alice", "Alice II", false);
        assert_eq!(game.players["alice"].cash, cash_before);
        assert_eq!(game.players["alice"].display_name, "Alice II");
        assert_eq!(game.player_count(), 3);
    }

    #[test]
    fn test_spread_monotone_tightening() {
        let (mut game, _rx) = make_running_game();
        game.apply_spread("alice", 1.50).unwrap();
        let err = game.apply_spread("bob", 1.50).unwrap_err();
        assert_eq!(err, GameError::SpreadNotTighter);
        assert!(err.to_string().contains("strictly tighter"));
        game.apply_spread("bob", 1.49).unwrap();
        let round = game.round.as_ref().unwrap();
        assert_eq!(round.best_spread, Some(1.49));
        assert_eq!(round.best_spread_player_id.as_deref(), Some("bob"));
        assert_eq!(round.submissions.len(), 2);
        assert!(round.no_tighter_until.is_some());
    }

    #[test]
    fn test_spread_rejects_gamemaster_and_nonpositive() {
        let (mut game, _rx) = make_running_game();
        assert_eq!(
            game.apply_spread("gm", 1.0).unwrap_err(),
            GameError::GamemasterCannotTrade
        );
        assert_eq!(
            game.apply_spread("alice", 0.0).unwrap_err(),
            GameError::InvalidSpread
        );
        assert_eq!(
            game.apply_spread("alice", -1.0).unwrap_err(),
            GameError::InvalidSpread
        );
    }

    #[test]
    fn test_end_spread_assigns_market_maker() {
        let (mut game, _rx) = make_running_game();
        game.apply_spread("alice", 2.0).unwrap();
        game.end_spread_quoting();
        assert_eq!(game.current_stage(), Some(Stage::MarketMakerQuote));
        assert!(game.players["alice"].is_market_maker);
        assert!(!game.players["bob"].is_market_maker);
    }

    #[test]
    fn test_end_spread_without_submissions_ends_round() {
        let (mut game, _rx) = make_running_game();
        game.end_spread_quoting();
        // Single market, so the game runs out of rounds.
        assert!(game.round.is_none());
        assert!(game.all_markets_complete);
    }

    #[test]
    fn test_quote_contract() {
        let (mut game, _rx) = make_running_game();
        game.apply_spread("alice", 2.0).unwrap();
        game.end_spread_quoting();
        assert_eq!(
            game.apply_quote("bob", 99.0, 101.0).unwrap_err(),
            GameError::NotMarketMaker
        );
        assert_eq!(
            game.apply_quote("alice", 99.0, 100.0).unwrap_err(),
            GameError::QuoteWidthMismatch
        );
        game.apply_quote("alice", 99.0, 101.0).unwrap();
        assert_eq!(game.current_stage(), Some(Stage::ForcedTrading));
        let quote = game.round.as_ref().unwrap().quote.unwrap();
        assert_eq!(quote.bid, 99.0);
        assert_eq!(quote.ask, 101.0);
    }

    #[test]
    fn test_forced_trade_settlement() {
        let (mut game, mut rx) = make_running_game();
        to_forced_trading(&mut game);
        drain(&mut rx);

        let trade = game
            .apply_forced_trade("bob", TradeDirection::Buy, 5)
            .unwrap();
        assert_eq!(trade.price, 101.0);
        assert_eq!(trade.quantity, 5);
        assert_eq!(trade.buyer_id, "bob");
        assert_eq!(trade.seller_id, "alice");
        assert!(trade.bid_order_id.is_empty());

        let bob = &game.players["bob"];
        assert!((bob.cash - 9495.0).abs() < 1e-9);
        assert_eq!(bob.position_in("m1"), 5);
        assert!((bob.positions["m1"].avg_cost - 101.0).abs() < 1e-9);
        let alice = &game.players["alice"];
        assert!((alice.cash - 10_505.0).abs() < 1e-9);
        assert_eq!(alice.position_in("m1"), -5);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, GameEvent::Trade(t) if t.price == 101.0 && t.quantity == 5)));
    }

    #[test]
    fn test_forced_trade_cash_and_position_conservation() {
        let (mut game, _rx) = make_running_game();
        to_forced_trading(&mut game);
        let total_cash_before: f64 = game.players.values().map(|p| p.cash).sum();
        game.apply_forced_trade("bob", TradeDirection::Sell, 7).unwrap();
        let total_cash_after: f64 = game.players.values().map(|p| p.cash).sum();
        assert!((total_cash_before - total_cash_after).abs() < 1e-9);
        let net_position: i64 = game
            .players
            .values()
            .map(|p| p.position_in("m1"))
            .sum();
        assert_eq!(net_position, 0);
    }

    #[test]
    fn test_forced_trade_rejects_mm_gm_and_zero_quantity() {
        let (mut game, _rx) = make_running_game();
        to_forced_trading(&mut game);
        assert_eq!(
            game.apply_forced_trade("alice", TradeDirection::Buy, 1).unwrap_err(),
            GameError::MarketMakerCannotTrade
        );
        assert_eq!(
            game.apply_forced_trade("gm", TradeDirection::Buy, 1).unwrap_err(),
            GameError::GamemasterCannotTrade
        );
        assert_eq!(
            game.apply_forced_trade("bob", TradeDirection::Buy, 0).unwrap_err(),
            GameError::InvalidQuantity
        );
    }

    #[test]
    fn test_forced_trade_exposure_limit() {
        let (mut game, _rx) = make_running_game();
        to_forced_trading(&mut game);
        game.set_exposure_limit(3).unwrap();
        assert_eq!(
            game.apply_forced_trade("bob", TradeDirection::Buy, 4).unwrap_err(),
            GameError::ExposureExceeded
        );
        game.apply_forced_trade("bob", TradeDirection::Buy, 3).unwrap();
        assert_eq!(game.players["bob"].position_in("m1"), 3);
    }

    #[test]
    fn test_open_trading_matching_and_settlement() {
        let (mut game, mut rx) = make_running_game();
        to_forced_trading(&mut game);
        game.begin_open_trading();
        drain(&mut rx);

        game.apply_order("alice", Side::Ask, 100.0, 5).unwrap();
        let trades = game.apply_order("bob", Side::Bid, 100.0, 5).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, 100.0);

        let bob = &game.players["bob"];
        assert!((bob.cash - 9500.0).abs() < 1e-9);
        assert_eq!(bob.position_in("m1"), 5);
        assert!((bob.positions["m1"].avg_cost - 100.0).abs() < 1e-9);
        let alice = &game.players["alice"];
        assert!((alice.cash - 10_500.0).abs() < 1e-9);
        assert_eq!(alice.position_in("m1"), -5);

        // ORDER_BOOK precedes TRADE for the matching submission.
        let events = drain(&mut rx);
        let book_at = events
            .iter()
            .position(|e| matches!(e, GameEvent::OrderBook(_)));
        let trade_at = events.iter().position(|e| matches!(e, GameEvent::Trade(_)));
        assert!(book_at.unwrap() < trade_at.unwrap());
    }

    #[test]
    fn test_open_trading_exposure_gates_first_fill() {
        let (mut game, _rx) = make_running_game();
        to_forced_trading(&mut game);
        game.begin_open_trading();
        game.set_exposure_limit(2).unwrap();

        game.apply_order("alice", Side::Ask, 100.0, 3).unwrap();
        let trades = game.apply_order("bob", Side::Bid, 100.0, 3).unwrap();
        assert!(trades.is_empty());
        // Both orders rest, untouched.
        let snapshot = game.book.as_ref().unwrap().snapshot();
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.asks.len(), 1);
        assert_eq!(game.players["bob"].position_in("m1"), 0);
    }

    #[test]
    fn test_open_trading_rejects_wrong_stage_and_gm() {
        let (mut game, _rx) = make_running_game();
        assert_eq!(
            game.apply_order("bob", Side::Bid, 100.0, 1).unwrap_err(),
            GameError::WrongStage
        );
        to_forced_trading(&mut game);
        game.begin_open_trading();
        assert_eq!(
            game.apply_order("gm", Side::Bid, 100.0, 1).unwrap_err(),
            GameError::GamemasterCannotTrade
        );
    }

    #[test]
    fn test_round_end_advances_and_exhausts() {
        let (mut game, _rx) = make_game();
        game.add_player("gm", "Gamemaster", true);
        game.add_player("alice", "Alice", false);
        game.add_market(make_market("m1"));
        game.add_market(make_market("m2"));
        game.start_game().unwrap();

        game.end_open_trading();
        let round = game.round.as_ref().unwrap();
        assert_eq!(round.market_id, "m2");
        assert_eq!(round.index, 1);
        assert_eq!(round.stage, Stage::SpreadQuoting);
        assert!(!game.players["alice"].is_market_maker);

        game.end_open_trading();
        assert!(game.round.is_none());
        assert!(game.all_markets_complete);
    }

    #[test]
    fn test_add_market_restarts_after_exhaustion() {
        let (mut game, _rx) = make_running_game();
        game.end_spread_quoting();
        assert!(game.all_markets_complete);
        game.add_market(make_market("m2"));
        assert!(!game.all_markets_complete);
        let round = game.round.as_ref().unwrap();
        assert_eq!(round.market_id, "m2");
        assert_eq!(round.stage, Stage::SpreadQuoting);
    }

    #[test]
    fn test_prev_stage_rewinds() {
        let (mut game, _rx) = make_running_game();
        game.apply_spread("alice", 2.0).unwrap();
        game.end_spread_quoting();
        assert_eq!(game.apply_prev_stage(), Ok(()));
        let round = game.round.as_ref().unwrap();
        assert_eq!(round.stage, Stage::SpreadQuoting);
        assert!(round.stage_ends_at.is_some());

        game.end_spread_quoting();
        game.apply_quote("alice", 99.0, 101.0).unwrap();
        assert_eq!(game.apply_prev_stage(), Ok(()));
        let round = game.round.as_ref().unwrap();
        assert_eq!(round.stage, Stage::MarketMakerQuote);
        assert!(round.quote.is_none());

        // Rewind from spread quoting is unsupported.
        game.apply_quote("alice", 99.0, 101.0).unwrap();
        game.begin_open_trading();
        assert_eq!(game.apply_prev_stage().unwrap_err(), GameError::InvalidRewind);
    }

    #[test]
    fn test_pause_blocks_mutations_and_preserves_deadline() {
        let (mut game, _rx) = make_running_game();
        game.round.as_mut().unwrap().stage_ends_at = Some(now_ms() + 30_000);
        game.pause().unwrap();
        assert_eq!(game.status(), GameStatus::Paused);
        assert!(game.round.as_ref().unwrap().stage_ends_at.is_some());
        assert_eq!(
            game.apply_spread("alice", 1.0).unwrap_err(),
            GameError::NotPlaying
        );
        assert_eq!(game.pause().unwrap_err(), GameError::NotPlaying);
    }

    #[test]
    fn test_stop_refused_until_pnl_finalized() {
        let (mut game, _rx) = make_running_game();
        game.end_spread_quoting();
        assert!(game.all_markets_complete);
        assert_eq!(game.stop().unwrap_err(), GameError::PnlNotFinalized);
        game.set_true_value("m1", 10.0).unwrap();
        game.finalize_pnl().unwrap();
        game.stop().unwrap();
        assert_eq!(game.status(), GameStatus::Stopped);
    }

    #[test]
    fn test_finalize_requires_complete_markets() {
        let (mut game, _rx) = make_running_game();
        assert_eq!(
            game.finalize_pnl().unwrap_err(),
            GameError::MarketsNotComplete
        );
    }

    #[test]
    fn test_finalize_pnl_values() {
        let (mut game, _rx) = make_running_game();
        to_forced_trading(&mut game);
        game.apply_forced_trade("bob", TradeDirection::Buy, 5).unwrap();
        game.begin_open_trading();
        game.end_open_trading();

        game.set_true_value("m1", 100.0).unwrap();
        game.finalize_pnl().unwrap();
        // Bob paid 101 for 5 units worth 100: -5. Alice is the mirror image.
        assert!((game.players["bob"].total_pnl - (-5.0)).abs() < 1e-9);
        assert!((game.players["alice"].total_pnl - 5.0).abs() < 1e-9);
        assert!(game.pnl_finalized);
        // Idempotent.
        game.finalize_pnl().unwrap();
    }

    #[test]
    fn test_finalize_skips_undefined_markets() {
        let (mut game, _rx) = make_running_game();
        to_forced_trading(&mut game);
        game.apply_forced_trade("bob", TradeDirection::Buy, 5).unwrap();
        game.begin_open_trading();
        game.end_open_trading();

        // No true value set: settlement is cash only.
        game.finalize_pnl().unwrap();
        assert!((game.players["bob"].total_pnl - (-505.0)).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_projection_rules() {
        let (mut game, _rx) = make_running_game();
        game.set_true_value("m1", 42.0).unwrap();

        let gm_view = game.snapshot(true, Some("gm"));
        assert_eq!(
            gm_view.market_true_values.as_ref().unwrap().get("m1"),
            Some(&42.0)
        );

        let player_view = game.snapshot(false, Some("bob"));
        assert!(player_view.market_true_values.is_none());
        assert_eq!(player_view.players["bob"].cash, 0.0);
        assert_eq!(player_view.players["alice"].cash, INITIAL_CASH);

        game.set_visibility(false);
        game.players.get_mut("alice").unwrap().total_pnl = 12.5;
        let hidden_view = game.snapshot(false, Some("bob"));
        for player in hidden_view.players.values() {
            assert!(player.positions.is_empty());
            assert_eq!(player.cash, 0.0);
            assert_eq!(player.round_pnl, 0.0);
        }
        assert_eq!(hidden_view.players["alice"].total_pnl, 12.5);
    }

    #[test]
    fn test_snapshot_includes_derivative_values() {
        let (mut game, _rx) = make_game();
        game.add_market(make_market("a"));
        game.add_market(make_market("b"));
        game.add_market(Market {
            id: "d".to_string(),
            name: "D".to_string(),
            description: String::new(),
            underlying_weights: Some(HashMap::from([
                ("a".to_string(), 1.0),
                ("b".to_string(), -2.0),
            ])),
            condition: None,
        });
        game.set_true_value("a", 10.0).unwrap();
        game.set_true_value("b", 4.0).unwrap();

        let gm_view = game.snapshot(true, None);
        let values = gm_view.market_true_values.unwrap();
        assert_eq!(values.get("d"), Some(&2.0));
    }

    #[test]
    fn test_announcement_ring_caps() {
        let (mut game, _rx) = make_game();
        for i in 0..60 {
            game.announce(&format!("msg {i}"));
        }
        assert_eq!(game.announcements.len(), MAX_ANNOUNCEMENTS);
        assert_eq!(game.announcements.front().unwrap().text, "msg 10");
    }

    #[test]
    fn test_check_gamemaster_secret() {
        let (game, _rx) = make_game();
        assert!(game.check_gamemaster_secret("s"));
        assert!(!game.check_gamemaster_secret("S"));
        assert!(!game.check_gamemaster_secret(""));
        assert!(!game.check_gamemaster_secret("ss"));
    }

    #[test]
    fn test_stage_changed_precedes_timer_deadline() {
        let (mut game, mut rx) = make_running_game();
        drain(&mut rx);
        game.apply_spread("alice", 2.0).unwrap();
        game.end_spread_quoting();
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, GameEvent::StageChanged { stage: Stage::MarketMakerQuote, .. })));
    }

    // ------------------------------------------------------------------
    // Handle/timer tests
    // ------------------------------------------------------------------

    fn make_handle() -> (GameHandle, UnboundedReceiver<GameEvent>) {
        let (game, rx) = make_game();
        (GameHandle::new(game), rx)
    }

    async fn make_running_handle() -> (GameHandle, UnboundedReceiver<GameEvent>) {
        let (handle, rx) = make_handle();
        handle.join_player("gm", "Gamemaster", true).await;
        handle.join_player("alice", "Alice", false).await;
        handle.join_player("bob", "Bob", false).await;
        handle.add_market("X", "market").await;
        handle.start_game().await.unwrap();
        (handle, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timer_expiry_advances_stage() {
        let (handle, _rx) = make_running_handle().await;
        handle.submit_spread("alice", 2.0).await.unwrap();
        handle.set_timer(5).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        let stage = handle.with(|g| g.current_stage()).await;
        assert_eq!(stage, Some(Stage::MarketMakerQuote));
        assert!(handle.with(|g| g.players["alice"].is_market_maker).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tighter_window_ends_stage_one() {
        let (handle, _rx) = make_running_handle().await;
        handle.submit_spread("alice", 2.0).await.unwrap();

        // The default window is 10 s; a tighter submission resets it.
        tokio::time::sleep(Duration::from_secs(6)).await;
        handle.submit_spread("bob", 1.5).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            handle.with(|g| g.current_stage()).await,
            Some(Stage::SpreadQuoting)
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            handle.with(|g| g.current_stage()).await,
            Some(Stage::MarketMakerQuote)
        );
        assert!(handle.with(|g| g.players["bob"].is_market_maker).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_stage_arms_open_trading_timer() {
        let (handle, mut rx) = make_running_handle().await;
        handle.submit_spread("alice", 2.0).await.unwrap();
        handle.next_stage().await.unwrap();
        handle.submit_quote("alice", 99.0, 101.0).await.unwrap();
        drain(&mut rx);

        handle.next_stage().await.unwrap();
        assert_eq!(
            handle.with(|g| g.current_stage()).await,
            Some(Stage::OpenTrading)
        );
        let events = drain(&mut rx);
        let stage_at = events
            .iter()
            .position(|e| matches!(e, GameEvent::StageChanged { stage: Stage::OpenTrading, .. }));
        let timer_at = events.iter().position(|e| matches!(e, GameEvent::Timer { .. }));
        assert!(stage_at.unwrap() < timer_at.unwrap());

        // Expiry ends open trading; with one market the game completes.
        tokio::time::sleep(Duration::from_secs(121)).await;
        tokio::task::yield_now().await;
        assert!(handle.with(|g| g.all_markets_complete).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_stage_requires_quote() {
        let (handle, _rx) = make_running_handle().await;
        handle.submit_spread("alice", 2.0).await.unwrap();
        handle.next_stage().await.unwrap();
        assert_eq!(
            handle.next_stage().await.unwrap_err(),
            GameError::QuoteMissing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_rearms_remaining() {
        let (handle, _rx) = make_running_handle().await;
        handle.set_timer(10).await.unwrap();
        handle.pause().await.unwrap();

        // Time passes while paused; the deadline is wall-clock so it lapses.
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.resume().await.unwrap();
        assert_eq!(
            handle.with(|g| g.status()).await,
            GameStatus::Playing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timer_noop_outside_timed_stages() {
        let (handle, _rx) = make_running_handle().await;
        handle.submit_spread("alice", 2.0).await.unwrap();
        handle.next_stage().await.unwrap();
        handle.set_timer(5).await.unwrap();
        let deadline = handle
            .with(|g| g.round.as_ref().and_then(|r| r.stage_ends_at))
            .await;
        assert!(deadline.is_none());
    }
}
