//! Stall detector: a singleton sweep that voids matches whose tick loop
//! stopped advancing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

use arena_core::types::MatchStatus;

use crate::component::{CloseReason, Component, ComponentEnv, ConsumerPorts};
use crate::frame::{EventFrame, MatchVerdict, SignalFrame};
use crate::match_manager::{now_ms, MatchManager};

const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const STALL_THRESHOLD_MS: u64 = 2_000;

pub struct HealthMonitorContext {
    pub matches: Arc<MatchManager>,
    pub signal_tx: mpsc::Sender<SignalFrame>,
}

pub struct HealthMonitor {}

#[async_trait]
impl Component<HealthMonitorContext> for HealthMonitor {
    fn name() -> &'static str {
        "Health Monitor"
    }

    async fn run(
        mut ports: ConsumerPorts,
        ctx: HealthMonitorContext,
        env: ComponentEnv,
    ) -> CloseReason {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                maybe = ports.recv() => match maybe {
                    Some(EventFrame::Shutdown) | None => break,
                    _ => {}
                },
                _ = ticker.tick() => {
                    let now = now_ms();
                    for handle in ctx.matches.active().await {
                        if handle.shared.status() != MatchStatus::Running {
                            continue;
                        }
                        let age = now.saturating_sub(handle.shared.last_tick_ms());
                        if age <= STALL_THRESHOLD_MS {
                            continue;
                        }
                        // Win the ending race or leave it to whoever did.
                        if !handle.shared.begin_ending() {
                            continue;
                        }
                        error!(
                            "{} Match {} stalled for {}ms at tick {}, voiding",
                            env.log_prefix, handle.match_id, age, handle.shared.tick()
                        );
                        let signal = SignalFrame::MatchEnded {
                            match_id: handle.match_id,
                            lobby_id: handle.lobby_id,
                            verdict: MatchVerdict::Void {
                                reason: "game_loop_stalled".into(),
                            },
                            final_positions: Vec::new(),
                        };
                        if ctx.signal_tx.send(signal).await.is_err() {
                            error!("{} Signal loop gone, stopping monitor", env.log_prefix);
                            return CloseReason::Complete;
                        }
                    }
                }
            }
        }
        CloseReason::Complete
    }
}
