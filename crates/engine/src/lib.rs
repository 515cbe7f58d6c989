//! Game engine for the market-making game.
//!
//! A registry owns many concurrent games; each game drives per-market rounds
//! through a five-stage state machine, matches open-trading orders through a
//! price-time priority book, and settles forced trades against the market
//! maker's quote. Every state change is pushed onto the game's event channel,
//! which the gateway fans out to connected players.
//!
//! ## Architecture
//!
//! ```text
//! GameRegistry (DashMap, process-wide)
//!         ↓
//! GameHandle = Arc<Mutex<Game>>   (one critical section per game)
//!         ↓
//! mpsc::UnboundedSender<GameEvent>
//!         ↓
//! gateway event pump → WebSocket room
//! ```

pub mod book;
pub mod error;
pub mod events;
pub mod game;
pub mod registry;
pub mod values;

pub use book::{BookSnapshot, OrderBook, PriceLevel};
pub use error::{GameError, Result};
pub use events::GameEvent;
pub use game::{Game, GameConfig, GameHandle, GameSnapshot};
pub use registry::{GameRegistry, LeaveOutcome};
pub use values::market_true_value;
