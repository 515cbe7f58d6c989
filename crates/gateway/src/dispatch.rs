//! Inbound event dispatch.
//!
//! Each event resolves the session's game and player, invokes the matching
//! game-instance method, and reports refusals back to the offending
//! connection as `game:error`. GM-prefixed events verify the gamemaster flag
//! on the looked-up game, not just the session bag; unauthorized callers are
//! silently ignored.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::pump::spawn_event_pump;
use crate::session::{room_key, Session};
use crate::ws_server::GatewayState;
use common::new_id;
use engine::{GameConfig, GameError, GameHandle};
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, warn};

/// Route one parsed inbound event.
pub async fn dispatch(state: &Arc<GatewayState>, session: &Arc<Session>, msg: ClientMessage) {
    match msg {
        ClientMessage::JoinGame {
            game_code,
            display_name,
            is_gamemaster,
            gamemaster_secret,
        } => {
            join_game(
                state,
                session,
                &game_code,
                &display_name,
                is_gamemaster,
                gamemaster_secret.as_deref(),
            )
            .await
        }
        ClientMessage::LeaveGame => leave_current(state, session).await,

        ClientMessage::SubmitSpread { spread_width } => {
            if let Some((game, player)) = game_and_player(state, session) {
                report(session, game.submit_spread(&player, spread_width).await);
            }
        }
        ClientMessage::SubmitQuote { bid, ask } => {
            if let Some((game, player)) = game_and_player(state, session) {
                report(session, game.submit_quote(&player, bid, ask).await);
            }
        }
        ClientMessage::ForcedTrade {
            direction,
            quantity,
        } => {
            if let Some((game, player)) = game_and_player(state, session) {
                report(
                    session,
                    game.forced_trade(&player, direction, quantity).await.map(|_| ()),
                );
            }
        }
        ClientMessage::SubmitOrder {
            side,
            price,
            quantity,
        } => {
            if let Some((game, player)) = game_and_player(state, session) {
                report(
                    session,
                    game.submit_order(&player, side, price, quantity).await.map(|_| ()),
                );
            }
        }
        ClientMessage::CancelOrder { .. } => {
            send_error(session, "order cancellation is not supported");
        }

        ClientMessage::GmCreate {
            gamemaster_secret,
            spread_timer_seconds,
            open_trading_timer_seconds,
            no_tighter_window_seconds,
        } => {
            gm_create(
                state,
                session,
                gamemaster_secret,
                spread_timer_seconds,
                open_trading_timer_seconds,
                no_tighter_window_seconds,
            )
            .await
        }
        ClientMessage::GmStart => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.start_game().await);
            }
        }
        ClientMessage::GmPause => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.pause().await);
            }
        }
        ClientMessage::GmResume => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.resume().await);
            }
        }
        ClientMessage::GmStop => {
            if let Some(game) = gm_game(state, session).await {
                // Success is answered by the pump's GAME_ENDED broadcast.
                report(session, game.stop().await);
            }
        }
        ClientMessage::GmNextStage => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.next_stage().await);
            }
        }
        ClientMessage::GmPrevStage => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.prev_stage().await);
            }
        }
        ClientMessage::GmAddMarket { name, description } => {
            if let Some(game) = gm_game(state, session).await {
                game.add_market(&name, &description).await;
            }
        }
        ClientMessage::GmAddDerivative {
            name,
            description,
            underlying_weights,
            condition,
        } => {
            if let Some(game) = gm_game(state, session).await {
                game.add_derivative(&name, &description, underlying_weights, condition)
                    .await;
            }
        }
        ClientMessage::GmBroadcast { text } => {
            if let Some(game) = gm_game(state, session).await {
                game.announce(&text).await;
            }
        }
        ClientMessage::GmSetTimer { seconds } => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.set_timer(seconds.clamp(1, 3600)).await);
            }
        }
        ClientMessage::GmSetVisibility {
            show_individual_positions,
        } => {
            if let Some(game) = gm_game(state, session).await {
                game.set_visibility(show_individual_positions).await;
            }
        }
        ClientMessage::GmSetTrueValue { market_id, value } => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.set_true_value(&market_id, value).await);
            }
        }
        ClientMessage::GmSetExposureLimit { max_exposure } => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.set_exposure_limit(max_exposure).await);
            }
        }
        ClientMessage::GmFinalizePnl => {
            if let Some(game) = gm_game(state, session).await {
                report(session, game.finalize_pnl().await);
            }
        }
    }
}

// ============================================================================
// Join / leave
// ============================================================================

async fn join_game(
    state: &Arc<GatewayState>,
    session: &Arc<Session>,
    game_code: &str,
    display_name: &str,
    is_gamemaster: bool,
    gamemaster_secret: Option<&str>,
) {
    // A session hops games by leaving its current one first.
    if session.data().game_code.is_some() {
        leave_current(state, session).await;
    }

    let Some(game) = state.games.get(game_code) else {
        send_error(session, "unknown game code");
        return;
    };
    if is_gamemaster {
        let authorized = match gamemaster_secret {
            Some(secret) => game.check_gamemaster_secret(secret).await,
            None => false,
        };
        if !authorized {
            send_error(session, "invalid gamemaster secret");
            return;
        }
    }

    let player_id = new_id();
    let Some((code, _game, snapshot)) = state
        .games
        .join(game_code, &player_id, display_name, is_gamemaster)
        .await
    else {
        send_error(session, "unknown game code");
        return;
    };

    state.sessions.join_room(&room_key(&code), session.id);
    session.set_game(
        player_id.clone(),
        code.clone(),
        display_name.to_string(),
        is_gamemaster,
    );
    debug!(game = %code, player = %player_id, "session joined game");

    let _ = session.send(&ServerMessage::Joined {
        game_code: code,
        player_id,
        is_gamemaster,
        state: snapshot,
    });
}

/// Leave the session's current game, if any. Also runs on disconnect.
pub async fn leave_current(state: &Arc<GatewayState>, session: &Arc<Session>) {
    let data = session.take_game();
    let Some(player_id) = data.player_id else {
        return;
    };
    if let Some(code) = &data.game_code {
        state.sessions.leave_room(&room_key(code), &session.id);
    }
    if let Some(outcome) = state.games.leave(&player_id).await {
        if outcome.game_deleted {
            gauge!("gateway_active_games").set(state.games.game_count() as f64);
        }
    }
}

async fn gm_create(
    state: &Arc<GatewayState>,
    session: &Arc<Session>,
    gamemaster_secret: String,
    spread_timer_seconds: Option<i64>,
    open_trading_timer_seconds: Option<i64>,
    no_tighter_window_seconds: Option<i64>,
) {
    if session.data().game_code.is_some() {
        leave_current(state, session).await;
    }

    let mut config = GameConfig::new(gamemaster_secret);
    if let Some(seconds) = spread_timer_seconds {
        config.spread_timer_ms = seconds.max(1) * 1000;
    }
    if let Some(seconds) = open_trading_timer_seconds {
        config.open_trading_timer_ms = seconds.max(1) * 1000;
    }
    if let Some(seconds) = no_tighter_window_seconds {
        config.no_tighter_window_ms = seconds.max(1) * 1000;
    }

    let (events_tx, events_rx) = unbounded_channel();
    let (code, game) = state.games.create_game(config, events_tx);
    spawn_event_pump(state.clone(), code.clone(), game.clone(), events_rx);
    gauge!("gateway_active_games").set(state.games.game_count() as f64);

    let player_id = new_id();
    let Some((code, _game, snapshot)) = state
        .games
        .join(&code, &player_id, "Gamemaster", true)
        .await
    else {
        warn!(game = %code, "created game disappeared before gm join");
        send_error(session, "failed to create game");
        return;
    };

    state.sessions.join_room(&room_key(&code), session.id);
    session.set_game(player_id.clone(), code.clone(), "Gamemaster".to_string(), true);
    debug!(game = %code, "game created by session {}", session.id);

    let _ = session.send(&ServerMessage::Joined {
        game_code: code,
        player_id,
        is_gamemaster: true,
        state: snapshot,
    });
}

// ============================================================================
// Helpers
// ============================================================================

/// The session's game and player, or `None` (events from sessions that are
/// not in a game are silently ignored).
fn game_and_player(state: &Arc<GatewayState>, session: &Arc<Session>) -> Option<(GameHandle, String)> {
    let data = session.data();
    let player_id = data.player_id?;
    let code = data.game_code?;
    let game = state.games.get(&code)?;
    Some((game, player_id))
}

/// The session's game, only if the player is a gamemaster on that game.
/// Unauthorized calls are silently ignored at this boundary.
async fn gm_game(state: &Arc<GatewayState>, session: &Arc<Session>) -> Option<GameHandle> {
    let (game, player_id) = game_and_player(state, session)?;
    if !game.is_gamemaster(&player_id).await {
        debug!(player = %player_id, "ignoring gm event from non-gamemaster");
        return None;
    }
    Some(game)
}

/// Translate an engine refusal into a targeted error event. Not-found
/// refusals stay silent: the session raced a departure or deletion.
fn report(session: &Arc<Session>, result: engine::Result<()>) {
    match result {
        Ok(()) => {}
        Err(GameError::UnknownPlayer) => {}
        Err(error) => send_error(session, &error.to_string()),
    }
}

fn send_error(session: &Arc<Session>, message: &str) {
    counter!("gateway_errors_emitted_total").increment(1);
    let _ = session.send(&ServerMessage::Error {
        message: message.to_string(),
    });
}

// ============================================================================
// Tests
// ============================================================================
