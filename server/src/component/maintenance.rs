//! Periodic housekeeping: WAL checkpoints, backups, session expiry,
//! rate-limit map sweeps, stuck-lobby and low-gas alerts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use arena_chain::{ChainT, WalletRegistry};
use arena_storage::Store;

use crate::alerts::{AlertLevel, AlertSink};
use crate::component::{CloseReason, Component, ComponentEnv, ConsumerPorts};
use crate::frame::{DeferredOp, EventFrame};
use crate::rate_limit::IpGuard;

const TICK: Duration = Duration::from_secs(60);
const STUCK_LOBBY_AFTER_HOURS: i64 = 2;
const DAILY: Duration = Duration::from_secs(86_400);

pub struct MaintenanceContext {
    pub store: Arc<Store>,
    pub chain: Arc<dyn ChainT>,
    pub wallets: Arc<WalletRegistry>,
    pub alerts: Arc<AlertSink>,
    pub ip_guard: Arc<IpGuard>,
    pub deferred_tx: mpsc::Sender<EventFrame>,
    pub backup_dir: PathBuf,
    pub wal_checkpoint_mins: u64,
    pub low_gas_threshold: u64,
}

pub struct Maintenance {}

#[async_trait]
impl Component<MaintenanceContext> for Maintenance {
    fn name() -> &'static str {
        "Maintenance"
    }

    async fn run(
        mut ports: ConsumerPorts,
        ctx: MaintenanceContext,
        env: ComponentEnv,
    ) -> CloseReason {
        let mut ticker = tokio::time::interval(TICK);
        let mut minutes: u64 = 0;
        loop {
            tokio::select! {
                maybe = ports.recv() => match maybe {
                    Some(EventFrame::Shutdown) | None => break,
                    _ => {}
                },
                _ = ticker.tick() => {
                    minutes += 1;
                    if ctx.wal_checkpoint_mins > 0 && minutes % ctx.wal_checkpoint_mins == 0 {
                        if let Err(e) = ctx.store.wal_checkpoint().await {
                            warn!("{} WAL checkpoint failed: {}", env.log_prefix, e);
                        }
                    }
                    if minutes % 60 == 0 {
                        hourly(&ctx, &env).await;
                    }
                    stuck_lobby_alerts(&ctx).await;
                    low_gas_alerts(&ctx).await;
                }
            }
        }
        CloseReason::Complete
    }
}

async fn hourly(ctx: &MaintenanceContext, env: &ComponentEnv) {
    if let Err(e) = ctx.store.backup_to(&ctx.backup_dir).await {
        warn!("{} Backup failed: {}", env.log_prefix, e);
    }
    if let Err(e) = ctx.store.delete_expired_sessions(Utc::now()).await {
        warn!("{} Session sweep failed: {}", env.log_prefix, e);
    }
    ctx.ip_guard.sweep(Duration::from_secs(3600));
    let _ = ctx
        .deferred_tx
        .try_send(EventFrame::Defer(DeferredOp::ExpirePayoutAttempts));
}

async fn stuck_lobby_alerts(ctx: &MaintenanceContext) {
    let cutoff = Utc::now() - chrono::Duration::hours(STUCK_LOBBY_AFTER_HOURS);
    let stuck = match ctx.store.stuck_lobbies(cutoff).await {
        Ok(stuck) => stuck,
        Err(e) => {
            warn!("Stuck lobby query failed: {}", e);
            return;
        }
    };
    for lobby in stuck {
        ctx.alerts
            .send_throttled(
                &format!("stuck-lobby-{}", lobby.id),
                DAILY,
                AlertLevel::Warning,
                "STUCK_LOBBY",
                &format!(
                    "lobby {} has been {} since {:?}",
                    lobby.id,
                    lobby.status.as_str(),
                    lobby.first_join_at
                ),
            )
            .await;
    }
}

async fn low_gas_alerts(ctx: &MaintenanceContext) {
    let mut wallets: Vec<(String, arena_core::types::Address)> = (1..=ctx.wallets.lobby_count())
        .filter_map(|id| {
            ctx.wallets
                .lobby_address(id)
                .map(|addr| (format!("lobby {}", id), addr.clone()))
        })
        .collect();
    wallets.push(("treasury".into(), ctx.wallets.treasury_address().clone()));

    for (label, address) in wallets {
        match ctx.chain.native_balance(&address).await {
            Ok(balance) if balance < ctx.low_gas_threshold => {
                ctx.alerts
                    .send_throttled(
                        &format!("low-gas-{}", address),
                        DAILY,
                        AlertLevel::Warning,
                        "LOW_GAS",
                        &format!(
                            "{} wallet {} holds {} native units, below {}",
                            label, address, balance, ctx.low_gas_threshold
                        ),
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!("Gas check failed for {}: {}", address, e),
        }
    }
}
