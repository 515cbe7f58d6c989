//! Engine → room fan-out.
//!
//! One pump task per game consumes the game's event channel and translates
//! engine events into outbound protocol messages. Because a single consumer
//! drains a single ordered channel, recipients see events in emission order:
//! ORDER_BOOK before its TRADEs before the STATE refresh, STAGE_CHANGED
//! before the first TIMER tick. The pump exits when the game is deleted and
//! its channel closes.

use crate::protocol::ServerMessage;
use crate::session::room_key;
use crate::ws_server::GatewayState;
use common::now_ms;
use engine::{GameEvent, GameHandle, GameSnapshot};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// Spawn the fan-out task for one game.
pub fn spawn_event_pump(
    state: Arc<GatewayState>,
    code: String,
    game: GameHandle,
    mut rx: UnboundedReceiver<GameEvent>,
) {
    tokio::spawn(async move {
        let room = room_key(&code);
        while let Some(event) = rx.recv().await {
            match event {
                GameEvent::StateSync => broadcast_state(&state, &room, &game).await,
                GameEvent::StageChanged { stage, round } => {
                    // A deadline recorded at stage-change time (without the
                    // engine arming a timer) still gets announced; armed
                    // timers announce themselves right after this event.
                    let deadline = round.as_ref().and_then(|r| r.stage_ends_at);
                    state
                        .sessions
                        .broadcast_room(&room, &ServerMessage::StageChanged { stage, round });
                    if let Some(ends_at) = deadline {
                        let seconds_remaining = ((ends_at - now_ms()).max(0) + 999) / 1000;
                        state.sessions.broadcast_room(
                            &room,
                            &ServerMessage::Timer {
                                stage,
                                ends_at,
                                seconds_remaining,
                            },
                        );
                    }
                }
                GameEvent::SpreadUpdate {
                    best_spread,
                    best_spread_player_id,
                    submissions,
                } => {
                    state.sessions.broadcast_room(
                        &room,
                        &ServerMessage::SpreadUpdate {
                            best_spread,
                            best_spread_player_id,
                            submissions,
                        },
                    );
                }
                GameEvent::OrderBook(order_book) => {
                    state
                        .sessions
                        .broadcast_room(&room, &ServerMessage::OrderBook { order_book });
                }
                GameEvent::Trade(trade) => {
                    counter!("gateway_trades_routed_total").increment(1);
                    state
                        .sessions
                        .broadcast_room(&room, &ServerMessage::Trade { trade });
                }
                GameEvent::Timer {
                    stage,
                    ends_at,
                    seconds_remaining,
                } => {
                    state.sessions.broadcast_room(
                        &room,
                        &ServerMessage::Timer {
                            stage,
                            ends_at,
                            seconds_remaining,
                        },
                    );
                }
                GameEvent::Announcement(announcement) => {
                    state
                        .sessions
                        .broadcast_room(&room, &ServerMessage::from(announcement));
                }
                GameEvent::PlayerLeft {
                    player_id,
                    display_name,
                } => {
                    state.sessions.broadcast_room(
                        &room,
                        &ServerMessage::PlayerLeft {
                            player_id,
                            display_name,
                        },
                    );
                }
                GameEvent::Ended { message } => {
                    // The room gets the final gamemaster-projected state.
                    let final_state = game.snapshot(true, None).await;
                    state.sessions.broadcast_room(
                        &room,
                        &ServerMessage::Ended {
                            state: final_state,
                            message,
                        },
                    );
                }
            }
        }
        debug!(game = %code, "event pump stopped");
    });
}

/// Per-recipient snapshot broadcast: each room member gets the state
/// projected through their own role and player id, so this cannot be a
/// single room-wide emit.
async fn broadcast_state(state: &Arc<GatewayState>, room: &str, game: &GameHandle) {
    let recipients = state.sessions.room_sessions(room);
    if recipients.is_empty() {
        return;
    }
    let views: Vec<(Arc<crate::session::Session>, GameSnapshot)> = game
        .with(|g| {
            recipients
                .into_iter()
                .map(|session| {
                    let data = session.data();
                    let snapshot = g.snapshot(data.is_gamemaster, data.player_id.as_deref());
                    (session, snapshot)
                })
                .collect()
        })
        .await;
    for (session, snapshot) in views {
        let _ = session.send(&ServerMessage::State { state: snapshot });
    }
}
