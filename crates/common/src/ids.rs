//! Identifier aliases and generation.
//!
//! Player, market, order, and trade identifiers are opaque globally-unique
//! strings; game codes are short human-typable strings issued by the
//! registry.

use uuid::Uuid;

/// Opaque player identifier.
pub type PlayerId = String;

/// Opaque market identifier.
pub type MarketId = String;

/// Opaque order identifier.
pub type OrderId = String;

/// Opaque trade identifier.
pub type TradeId = String;

/// Six-character game code, stored uppercase.
pub type GameCode = String;

/// Generate a fresh globally-unique identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
