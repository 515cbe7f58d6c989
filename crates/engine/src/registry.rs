//! Process-wide game registry.
//!
//! The only structure shared across games: a code → game map and a
//! player → code reverse index, both concurrent. Games are created with a
//! collision-checked six-character code and deleted when their last
//! participant leaves.

use crate::events::GameEvent;
use crate::game::{Game, GameConfig, GameHandle, GameSnapshot};
use common::{GameCode, PlayerId, GAME_CODE_ALPHABET, GAME_CODE_LEN};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// Owns every live game and the player routing index.
pub struct GameRegistry {
    games: DashMap<GameCode, GameHandle>,
    /// player id → canonical game code, for O(1) session routing.
    players: DashMap<PlayerId, GameCode>,
}

/// What happened when a player left their game.
#[derive(Debug)]
pub struct LeaveOutcome {
    pub game_code: GameCode,
    pub display_name: Option<String>,
    pub game_deleted: bool,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self {
            games: DashMap::new(),
            players: DashMap::new(),
        }
    }

    /// Create a game under a fresh collision-free code.
    pub fn create_game(
        &self,
        config: GameConfig,
        events: UnboundedSender<GameEvent>,
    ) -> (GameCode, GameHandle) {
        let code = self.issue_code();
        let handle = GameHandle::new(Game::new(code.clone(), config, events));
        self.games.insert(code.clone(), handle.clone());
        info!(game = %code, "game created");
        (code, handle)
    }

    /// Draw codes from the unambiguous alphabet until one is free.
    fn issue_code(&self) -> GameCode {
        let mut rng = rand::thread_rng();
        loop {
            let code: GameCode = (0..GAME_CODE_LEN)
                .map(|_| GAME_CODE_ALPHABET[rng.gen_range(0..GAME_CODE_ALPHABET.len())] as char)
                .collect();
            if !self.games.contains_key(&code) {
                return code;
            }
        }
    }

    /// Case-insensitive lookup; codes are stored uppercase.
    pub fn get(&self, code: &str) -> Option<GameHandle> {
        self.games.get(&code.to_uppercase()).map(|g| g.clone())
    }

    /// Look up a player's game through the reverse index.
    pub fn game_of(&self, player_id: &str) -> Option<(GameCode, GameHandle)> {
        let code = self.players.get(player_id).map(|c| c.clone())?;
        let handle = self.games.get(&code).map(|g| g.clone())?;
        Some((code, handle))
    }

    /// Add a player to the game behind `code`. Returns the canonical code,
    /// the handle, and the player's joined-state snapshot.
    pub async fn join(
        &self,
        code: &str,
        player_id: &str,
        display_name: &str,
        is_gamemaster: bool,
    ) -> Option<(GameCode, GameHandle, GameSnapshot)> {
        let canonical = code.to_uppercase();
        let handle = self.get(&canonical)?;
        let snapshot = handle
            .join_player(player_id, display_name, is_gamemaster)
            .await;
        self.players.insert(player_id.to_string(), canonical.clone());
        Some((canonical, handle, snapshot))
    }

    /// Remove a player from their game; the game itself is deleted once its
    /// last participant is gone.
    pub async fn leave(&self, player_id: &str) -> Option<LeaveOutcome> {
        let (_, code) = self.players.remove(player_id)?;
        let Some(handle) = self.get(&code) else {
            return Some(LeaveOutcome {
                game_code: code,
                display_name: None,
                game_deleted: true,
            });
        };
        let (removed, remaining) = handle.remove_player(player_id).await;
        let game_deleted = remaining == 0;
        if game_deleted {
            self.games.remove(&code);
            handle.shutdown().await;
            info!(game = %code, "last participant left, game deleted");
        }
        Some(LeaveOutcome {
            game_code: code,
            display_name: removed.map(|p| p.display_name),
            game_deleted,
        })
    }

    pub fn game_count(&self) -> usize {
        self.games.len()
    }
}

impl Default for GameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn make_registry() -> GameRegistry {
        GameRegistry::new()
    }

    fn make_game(registry: &GameRegistry) -> (GameCode, GameHandle) {
        let (tx, _rx) = unbounded_channel();
        registry.create_game(GameConfig::new("s"), tx)
    }

    #[test]
    fn test_code_shape() {
        let registry = make_registry();
        let (code, _) = make_game(&registry);
        assert_eq!(code.len(), GAME_CODE_LEN);
        assert!(code.bytes().all(|b| GAME_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = make_registry();
        let (code, _) = make_game(&registry);
        assert!(registry.get(&code).is_some());
        assert!(registry.get(&code.to_lowercase()).is_some());
        assert!(registry.get("ZZZZZZ").is_none());
    }

    #[tokio::test]
    async fn test_join_records_reverse_index() {
        let registry = make_registry();
        let (code, _) = make_game(&registry);
        let joined = registry.join(&code.to_lowercase(), "p1", "Alice", false).await;
        assert!(joined.is_some());
        let (canonical, _, snapshot) = joined.unwrap();
        assert_eq!(canonical, code);
        assert!(snapshot.players.contains_key("p1"));
        assert_eq!(registry.game_of("p1").unwrap().0, code);
    }

    #[tokio::test]
    async fn test_join_unknown_code() {
        let registry = make_registry();
        assert!(registry.join("NOPE22", "p1", "Alice", false).await.is_none());
    }

    #[tokio::test]
    async fn test_last_leave_deletes_game() {
        let registry = make_registry();
        let (code, _) = make_game(&registry);
        registry.join(&code, "p1", "Alice", false).await.unwrap();
        registry.join(&code, "p2", "Bob", false).await.unwrap();

        let outcome = registry.leave("p1").await.unwrap();
        assert!(!outcome.game_deleted);
        assert_eq!(outcome.display_name.as_deref(), Some("Alice"));
        assert!(registry.get(&code).is_some());

        let outcome = registry.leave("p2").await.unwrap();
        assert!(outcome.game_deleted);
        assert!(registry.get(&code).is_none());
        assert_eq!(registry.game_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_unknown_player() {
        let registry = make_registry();
        assert!(registry.leave("ghost").await.is_none());
    }
}
