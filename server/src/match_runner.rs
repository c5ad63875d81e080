//! The per-match task: countdown, the 30 Hz tick loop, input ingestion
//! and the tick error boundary.
//!
//! The runner exclusively owns its [`LiveMatch`].  Other tasks reach it
//! only through its input port and the shared status/tick fields.  On any
//! terminal condition the runner flips the shared status to `ending`,
//! persists the final snapshot and hands the verdict to the signal loop;
//! settlement happens elsewhere.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use arena_core::error::Error;
use arena_core::protocol::ServerMessage;
use arena_core::types::{MatchEvent, MatchStatus};
use arena_physics::PhysicsConfig;
use arena_storage::Store;
use std::sync::Arc;

use crate::component::{CloseReason, Component, ComponentEnv, ConsumerPorts};
use crate::connection::MatchBroadcaster;
use crate::frame::{DeferredOp, EventFrame, MatchVerdict, SignalFrame};
use crate::match_manager::{now_ms, MatchShared};
use crate::match_state::{LiveMatch, TickEvents, TickSettings};

pub const MAX_CONSECUTIVE_TICK_ERRORS: u32 = 3;

pub struct MatchRunnerContext {
    pub live: LiveMatch,
    pub physics: PhysicsConfig,
    pub settings: TickSettings,
    pub countdown_secs: u64,
    pub persistence_interval: u64,
    pub store: Arc<Store>,
    pub broadcaster: MatchBroadcaster,
    pub shared: Arc<MatchShared>,
    pub signal_tx: mpsc::Sender<SignalFrame>,
    pub deferred_tx: mpsc::Sender<EventFrame>,
}

pub struct MatchRunner {}

enum Exit {
    Verdict(MatchVerdict),
    Shutdown,
}

enum TickFault {
    Transient(Error),
    Critical(Error),
}

fn classify_tick_error(e: Error) -> TickFault {
    match e {
        Error::StorageError(_) | Error::ChainError(_) => TickFault::Transient(e),
        other => TickFault::Critical(other),
    }
}

#[async_trait]
impl Component<MatchRunnerContext> for MatchRunner {
    fn name() -> &'static str {
        "Match Runner"
    }

    async fn run(
        mut ports: ConsumerPorts,
        mut ctx: MatchRunnerContext,
        env: ComponentEnv,
    ) -> CloseReason {
        let match_id = ctx.live.match_id;
        let lobby_id = ctx.live.lobby_id;

        // Roles go point-to-point before anything is broadcast.
        for player in &ctx.live.players {
            ctx.broadcaster
                .send_to(
                    player.user_id,
                    ServerMessage::RoleAssignment {
                        match_id,
                        role: player.body.role,
                    },
                )
                .await;
        }
        ctx.broadcaster
            .broadcast(&ServerMessage::MatchStarting { match_id, lobby_id })
            .await;

        // Countdown at 1 Hz, still draining connection-state frames.
        for seconds in (1..=ctx.countdown_secs).rev() {
            ctx.broadcaster
                .broadcast(&ServerMessage::Countdown {
                    seconds: seconds as u8,
                })
                .await;
            let deadline = tokio::time::sleep(Duration::from_secs(1));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    maybe = ports.recv() => match maybe {
                        Some(frame) => {
                            if let Some(exit) = handle_frame(&mut ctx, frame).await {
                                return finish(ports, ctx, exit, &env).await;
                            }
                        }
                        None => {
                            return finish(
                                ports,
                                ctx,
                                Exit::Verdict(MatchVerdict::Void { reason: "ports_closed".into() }),
                                &env,
                            )
                            .await;
                        }
                    },
                }
            }
        }

        // Whoever is absent at zero never entered the arena.
        let absent: Vec<_> = ctx
            .live
            .players
            .iter()
            .filter(|p| !p.connected && !p.is_bot)
            .map(|p| (p.user_id, p.body.pos.x, p.body.pos.y))
            .collect();
        for (user_id, x, y) in absent {
            info!("{} Player {} absent at countdown end", env.log_prefix, user_id);
            if let Some(player) = ctx.live.player_mut(user_id) {
                player.body.alive = false;
            }
            if let Err(e) = ctx
                .store
                .record_elimination(match_id, user_id, None, x, y)
                .await
            {
                warn!("{} Failed to record absence: {}", env.log_prefix, e);
            }
        }

        ctx.live.status = MatchStatus::Running;
        ctx.shared.set_status(MatchStatus::Running);
        ctx.shared.record_tick(0, now_ms());
        if let Err(e) = ctx.store.set_match_running(match_id).await {
            error!("{} Failed to persist running status: {}", env.log_prefix, e);
            return finish(
                ports,
                ctx,
                Exit::Verdict(MatchVerdict::Void {
                    reason: "storage_failure".into(),
                }),
                &env,
            )
            .await;
        }
        defer_event(&ctx, 0, "start", serde_json::json!({})).await;
        ctx.broadcaster
            .broadcast(&ServerMessage::Snapshot {
                tick: 0,
                players: ctx.live.snapshot_players(),
            })
            .await;

        let mut ticker =
            tokio::time::interval(Duration::from_millis(1000 / ctx.physics.tick_rate as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;

        let exit = loop {
            tokio::select! {
                maybe = ports.recv() => match maybe {
                    Some(frame) => {
                        if let Some(exit) = handle_frame(&mut ctx, frame).await {
                            break exit;
                        }
                    }
                    None => break Exit::Verdict(MatchVerdict::Void { reason: "ports_closed".into() }),
                },
                _ = ticker.tick() => {
                    // Cooperative cancellation: settlement or the health
                    // monitor may have flipped the status already.
                    match ctx.shared.status() {
                        MatchStatus::Running => {}
                        other => {
                            info!("{} Tick loop observed status {:?}, stopping", env.log_prefix, other);
                            return CloseReason::Complete;
                        }
                    }
                    match execute_tick(&mut ctx).await {
                        Ok(Some(verdict)) => break Exit::Verdict(verdict),
                        Ok(None) => consecutive_errors = 0,
                        Err(TickFault::Transient(e)) => {
                            consecutive_errors += 1;
                            warn!(
                                "{} Transient tick error ({}/{}): {}",
                                env.log_prefix, consecutive_errors, MAX_CONSECUTIVE_TICK_ERRORS, e
                            );
                            if consecutive_errors >= MAX_CONSECUTIVE_TICK_ERRORS {
                                break Exit::Verdict(MatchVerdict::Void {
                                    reason: "tick_errors".into(),
                                });
                            }
                        }
                        Err(TickFault::Critical(e)) => {
                            error!("{} Critical tick error: {}", env.log_prefix, e);
                            break Exit::Verdict(MatchVerdict::Void {
                                reason: "critical_tick_error".into(),
                            });
                        }
                    }
                }
            }
        };

        finish(ports, ctx, exit, &env).await
    }
}

async fn finish(
    _ports: ConsumerPorts,
    ctx: MatchRunnerContext,
    exit: Exit,
    env: &ComponentEnv,
) -> CloseReason {
    // Entered atomically before any terminal side effect; invisible to
    // clients and it blocks the stall detector from double-voiding.
    ctx.shared.set_status(MatchStatus::Ending);

    if let Err(e) = ctx
        .store
        .save_match_state(
            ctx.live.match_id,
            ctx.live.tick,
            ctx.live.status,
            &ctx.live.encode(),
        )
        .await
    {
        warn!("{} Failed to persist final snapshot: {}", env.log_prefix, e);
    }

    match exit {
        Exit::Shutdown => {
            // Refunds happen on next startup via recovery.
            ctx.broadcaster
                .broadcast(&ServerMessage::MatchEnd {
                    match_id: ctx.live.match_id,
                    winner: None,
                    reason: "server_restart".into(),
                    payout_amount: None,
                    payout_tx_hash: None,
                })
                .await;
            info!("{} Match paused for server restart", env.log_prefix);
        }
        Exit::Verdict(verdict) => {
            let signal = SignalFrame::MatchEnded {
                match_id: ctx.live.match_id,
                lobby_id: ctx.live.lobby_id,
                verdict,
                final_positions: ctx.live.final_positions(),
            };
            if let Err(e) = ctx.signal_tx.send(signal).await {
                error!("{} Failed to signal match end: {}", env.log_prefix, e);
            }
        }
    }
    CloseReason::Complete
}

/// Returns `Some` when the frame terminates the match.
async fn handle_frame(ctx: &mut MatchRunnerContext, frame: EventFrame) -> Option<Exit> {
    match frame {
        EventFrame::PlayerInput {
            user_id,
            sequence,
            intent,
            frozen,
        } => {
            ctx.live.apply_input(user_id, sequence, intent, frozen);
            None
        }
        EventFrame::PlayerDisconnected { user_id } => {
            ctx.live.mark_disconnected(user_id);
            let grace_remaining = ctx.live.grace_remaining_secs(
                user_id,
                ctx.settings.grace_ticks,
                ctx.physics.tick_rate,
            );
            ctx.broadcaster
                .broadcast(&ServerMessage::PlayerDisconnect {
                    user_id,
                    grace_remaining,
                })
                .await;
            defer_event(
                ctx,
                ctx.live.tick,
                "disconnect",
                serde_json::json!({ "userId": user_id }),
            )
            .await;
            None
        }
        EventFrame::PlayerReconnected { user_id } => {
            ctx.live.mark_reconnected(user_id);
            ctx.broadcaster
                .broadcast(&ServerMessage::PlayerReconnect { user_id })
                .await;
            ctx.broadcaster
                .send_to(
                    user_id,
                    ServerMessage::ReconnectState {
                        match_id: ctx.live.match_id,
                        tick: ctx.live.tick,
                        players: ctx.live.reconnect_players(),
                    },
                )
                .await;
            None
        }
        EventFrame::AbortMatch { reason } => Some(Exit::Verdict(MatchVerdict::Void { reason })),
        EventFrame::Shutdown => Some(Exit::Shutdown),
        EventFrame::Defer(_) => None,
    }
}

async fn execute_tick(ctx: &mut MatchRunnerContext) -> Result<Option<MatchVerdict>, TickFault> {
    let events = ctx.live.run_tick(&ctx.physics, &ctx.settings);
    let tick = ctx.live.tick;
    ctx.shared.record_tick(tick, now_ms());

    broadcast_tick_events(ctx, tick, &events).await;

    for elimination in &events.eliminations {
        ctx.store
            .record_elimination(
                ctx.live.match_id,
                elimination.user_id,
                elimination.eliminated_by,
                elimination.x,
                elimination.y,
            )
            .await
            .map_err(classify_tick_error)?;
        defer_event(
            ctx,
            tick,
            "elimination",
            serde_json::json!({
                "userId": elimination.user_id,
                "by": elimination.eliminated_by,
            }),
        )
        .await;
    }
    for (a, b) in &events.bounces {
        defer_event(ctx, tick, "bounce", serde_json::json!({ "players": [a, b] })).await;
    }

    if tick % ctx.persistence_interval == 0 {
        ctx.store
            .save_match_state(
                ctx.live.match_id,
                tick,
                MatchStatus::Running,
                &ctx.live.encode(),
            )
            .await
            .map_err(classify_tick_error)?;
    }

    Ok(events.verdict.clone())
}

async fn broadcast_tick_events(ctx: &MatchRunnerContext, tick: u64, events: &TickEvents) {
    for (a, b) in &events.bounces {
        ctx.broadcaster
            .broadcast(&ServerMessage::Bounce {
                tick,
                players: [*a, *b],
            })
            .await;
    }
    for elimination in &events.eliminations {
        ctx.broadcaster
            .broadcast(&ServerMessage::Elimination {
                tick,
                victim: elimination.user_id,
                eliminated_by: elimination.eliminated_by,
            })
            .await;
    }
    if let Some(players) = events.showdown_started {
        ctx.broadcaster
            .broadcast(&ServerMessage::ShowdownStart {
                players,
                hearts_to_win: ctx.settings.hearts_to_win,
                freeze_secs: (ctx.settings.freeze_ticks / ctx.physics.tick_rate as u64) as u8,
            })
            .await;
    }
    if events.showdown_ready {
        ctx.broadcaster
            .broadcast(&ServerMessage::ShowdownReady {
                hearts: ctx.live.heart_views(),
            })
            .await;
    }
    for (user_id, captured) in &events.captures {
        ctx.broadcaster
            .broadcast(&ServerMessage::HeartCaptured {
                tick,
                user_id: *user_id,
                captured: *captured,
            })
            .await;
    }
    if events.emit_snapshot {
        ctx.broadcaster
            .broadcast(&ServerMessage::Snapshot {
                tick,
                players: ctx.live.snapshot_players(),
            })
            .await;
    }
}

async fn defer_event(ctx: &MatchRunnerContext, tick: u64, event_type: &str, payload: serde_json::Value) {
    let op = EventFrame::Defer(DeferredOp::MatchEvent(MatchEvent {
        match_id: ctx.live.match_id,
        tick,
        event_type: event_type.to_string(),
        payload,
    }));
    // Best effort; the event log is not settlement-critical.
    let _ = ctx.deferred_tx.try_send(op);
}
