//! Application runtime context and the signal loop.
//!
//! The signal loop is the seam between Lobby and Match: lobbies ask it to
//! start matches, runners and the health monitor report match ends, and
//! neither module imports the other.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use arena_chain::{ChainT, EthRpcChain, WalletRegistry, WrappedChain};
use arena_core::error::{Error, Result};
use arena_core::protocol::ServerMessage;
use arena_core::types::{Address, LobbyId, LobbyStatus, MatchStatus};
use arena_env::Config;
use arena_physics::PhysicsConfig;
use arena_storage::{NewMatch, NewMatchPlayer, Store};

use crate::alerts::{AlertLevel, AlertSink};
use crate::auth::AuthService;
use crate::bots::{is_bot_wallet, BotManager};
use crate::component::{
    Component, ComponentEnv, DeferredQueue, DeferredQueueContext, DepositMonitor,
    DepositMonitorContext, HealthMonitor, HealthMonitorContext, Maintenance, MaintenanceContext,
};
use crate::connection::{ConnectionTable, MatchBroadcaster};
use crate::frame::{EventFrame, SignalFrame};
use crate::lobby::LobbyCoordinator;
use crate::match_manager::{now_ms, MatchHandle, MatchManager, MatchShared};
use crate::match_runner::{MatchRunner, MatchRunnerContext};
use crate::match_state::{LiveMatch, NewLivePlayer, TickSettings};
use crate::rate_limit::IpGuard;
use crate::settlement::Settlement;

const MATCH_CLEANUP_GRACE: Duration = Duration::from_secs(5);
const TREASURY_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

pub struct ApplicationContext {
    pub config: Config,
    pub physics: PhysicsConfig,
    pub store: Arc<Store>,
    pub chain: Arc<dyn ChainT>,
    pub wallets: Arc<WalletRegistry>,
    pub alerts: Arc<AlertSink>,
    pub connections: Arc<ConnectionTable>,
    pub ip_guard: Arc<IpGuard>,
    pub matches: Arc<MatchManager>,
    pub settlement: Arc<Settlement>,
    pub lobby: Arc<LobbyCoordinator>,
    pub auth: Arc<AuthService>,
    pub bots: Arc<BotManager>,
    pub signal_tx: mpsc::Sender<SignalFrame>,
    pub deferred_tx: mpsc::Sender<EventFrame>,
    pub deferred_pending: Arc<AtomicUsize>,
    pub shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    component_txs: Mutex<Vec<mpsc::Sender<EventFrame>>>,
}

impl ApplicationContext {
    /// Wire every subsystem and start the signal loop plus the background
    /// components.  Chain construction honors the provider list order:
    /// primary first, then fallbacks.
    pub async fn try_new_and_start(config: Config) -> Result<(Arc<Self>, JoinHandle<()>)> {
        info!("Initialize application context");

        let store = Arc::new(Store::try_new(&config.storage.database_path)?);
        store.health_check().await?;

        let token = Address::parse(&config.chain.token_address)
            .map_err(|_| Error::ConfigMissing("valid ARENA_TOKEN_ADDRESS".into()))?;
        let mut providers: Vec<Arc<dyn ChainT>> = Vec::new();
        for url in std::iter::once(&config.chain.rpc_url).chain(&config.chain.rpc_fallback_urls) {
            providers.push(Arc::new(
                EthRpcChain::try_new(url, token.clone())
                    .map_err(|e| Error::ChainError(e.to_string()))?,
            ));
        }
        let chain: Arc<dyn ChainT> = Arc::new(WrappedChain::new(providers));

        let wallets = Arc::new(WalletRegistry::derive(
            &config.wallet.lobby_wallet_seed,
            &config.wallet.wallet_encryption_key,
            &config.wallet.treasury_mnemonic,
            config.game.lobby_count,
        ));
        let alerts = Arc::new(AlertSink::new(config.alert.webhook_urls.clone()));
        let connections = Arc::new(ConnectionTable::default());
        let ip_guard = Arc::new(IpGuard::new(config.net.max_connections_per_ip));
        let matches = Arc::new(MatchManager::default());

        let (signal_tx, signal_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let settlement = Arc::new(Settlement::new(
            store.clone(),
            chain.clone(),
            wallets.clone(),
            alerts.clone(),
            connections.clone(),
            config.wallet.buy_in,
            config.wallet.winner_payout,
            config.chain.min_confirmations,
        ));

        let deferred_pending = Arc::new(AtomicUsize::new(0));
        let deferred_handle = DeferredQueue::start(
            DeferredQueueContext {
                store: store.clone(),
                pending: deferred_pending.clone(),
            },
            ComponentEnv::new("[deferred]"),
        );
        let deferred_tx = deferred_handle.sender();

        let lobby = Arc::new(LobbyCoordinator::new(
            store.clone(),
            chain.clone(),
            wallets.clone(),
            connections.clone(),
            settlement.clone(),
            signal_tx.clone(),
            deferred_tx.clone(),
            config.game.lobby_count,
            config.wallet.buy_in,
            config.chain.min_confirmations,
            config.chain.max_tx_age_secs,
            config.game.lobby_timeout_secs,
        ));
        lobby.ensure_lobbies().await?;

        let auth = Arc::new(AuthService::new(store.clone(), chain.clone()));
        let bots = Arc::new(BotManager::new(store.clone(), lobby.clone()));

        let physics = PhysicsConfig {
            arena_width: config.game.arena_width,
            arena_height: config.game.arena_height,
            player_radius: config.game.player_radius,
            max_speed: config.game.max_speed,
            tick_rate: config.game.tick_rate,
            ..PhysicsConfig::default()
        };

        let ctx = Arc::new(Self {
            config,
            physics,
            store,
            chain,
            wallets,
            alerts,
            connections,
            ip_guard,
            matches,
            settlement,
            lobby,
            auth,
            bots,
            signal_tx,
            deferred_tx,
            deferred_pending,
            shutdown_rx,
            shutdown_tx,
            component_txs: Mutex::new(vec![deferred_handle.sender()]),
        });

        ctx.start_background_components().await;
        let join_handle = ctx.clone().start_signal_loop(signal_rx);
        Ok((ctx, join_handle))
    }

    async fn start_background_components(self: &Arc<Self>) {
        let mut txs = self.component_txs.lock().await;

        let health = HealthMonitor::start(
            HealthMonitorContext {
                matches: self.matches.clone(),
                signal_tx: self.signal_tx.clone(),
            },
            ComponentEnv::new("[health]"),
        );
        txs.push(health.sender());

        let deposits = DepositMonitor::start(
            DepositMonitorContext {
                store: self.store.clone(),
                chain: self.chain.clone(),
                wallets: self.wallets.clone(),
                lobby: self.lobby.clone(),
                buy_in: self.config.wallet.buy_in,
                min_confirmations: self.config.chain.min_confirmations,
            },
            ComponentEnv::new("[deposits]"),
        );
        txs.push(deposits.sender());

        let maintenance = Maintenance::start(
            MaintenanceContext {
                store: self.store.clone(),
                chain: self.chain.clone(),
                wallets: self.wallets.clone(),
                alerts: self.alerts.clone(),
                ip_guard: self.ip_guard.clone(),
                deferred_tx: self.deferred_tx.clone(),
                backup_dir: self.config.storage.backup_dir.clone().into(),
                wal_checkpoint_mins: self.config.storage.wal_checkpoint_mins,
                low_gas_threshold: self.config.chain.low_gas_threshold,
            },
            ComponentEnv::new("[maintenance]"),
        );
        txs.push(maintenance.sender());

        // Treasury sweep of the residual house cut, on its own schedule.
        let settlement = self.settlement.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TREASURY_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => settlement.sweep_treasury().await,
                }
            }
        });
    }

    fn start_signal_loop(
        self: Arc<Self>,
        mut signal_rx: mpsc::Receiver<SignalFrame>,
    ) -> JoinHandle<()> {
        info!("Starting signal loop");
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                match signal {
                    SignalFrame::StartMatch { lobby_id } => {
                        if let Err(e) = self.start_match(lobby_id).await {
                            error!("Failed to start match in lobby {}: {}", lobby_id, e);
                        }
                    }
                    SignalFrame::MatchEnded {
                        match_id,
                        lobby_id,
                        verdict,
                        final_positions,
                    } => {
                        let app = self.clone();
                        tokio::spawn(async move {
                            app.settlement
                                .settle(match_id, lobby_id, verdict, final_positions)
                                .await;
                            tokio::time::sleep(MATCH_CLEANUP_GRACE).await;
                            app.matches.remove(match_id).await;
                        });
                    }
                    SignalFrame::RemoveMatch { match_id } => {
                        self.matches.remove(match_id).await;
                    }
                    SignalFrame::Shutdown => {
                        info!("Signal loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Launch a match for a ready lobby: pre-start balance check, seed
    /// sampling, persisted creation, then the runner task.
    pub async fn start_match(self: &Arc<Self>, lobby_id: LobbyId) -> Result<()> {
        let _guard = self.lobby.lock(lobby_id).await;

        let lobby_row = self
            .store
            .get_lobby(lobby_id)
            .await?
            .ok_or(Error::LobbyNotFound(lobby_id))?;
        if lobby_row.status != LobbyStatus::Ready {
            warn!(
                "Lobby {} not ready anymore ({}), skipping start",
                lobby_id,
                lobby_row.status.as_str()
            );
            return Ok(());
        }
        let members = self.store.active_players(lobby_id).await?;
        if members.len() != 3 {
            return Err(Error::InvariantViolation(format!(
                "lobby {} ready with {} players",
                lobby_id,
                members.len()
            )));
        }

        let mut entrants = Vec::with_capacity(3);
        let mut staked = 0u64;
        for member in &members {
            let user = self
                .store
                .get_user(member.user_id)
                .await?
                .ok_or_else(|| Error::InternalError(format!("user {} missing", member.user_id)))?;
            let is_bot = is_bot_wallet(&user.wallet);
            if !is_bot {
                staked += self.config.wallet.buy_in;
            }
            entrants.push(NewLivePlayer {
                user_id: user.id,
                wallet: user.wallet,
                is_bot,
                connected: is_bot || self.connections.is_connected(member.user_id).await,
            });
        }

        // Pre-start escrow check on the lobby wallet.
        let lobby_wallet = self
            .wallets
            .lobby_address(lobby_id)
            .ok_or_else(|| Error::ConfigMissing(format!("wallet for lobby {}", lobby_id)))?;
        let balance = self
            .chain
            .token_balance(lobby_wallet)
            .await
            .map_err(|e| Error::ChainError(e.to_string()))?;
        if balance < staked {
            self.alerts
                .send(
                    AlertLevel::Critical,
                    "INSUFFICIENT_LOBBY_BALANCE",
                    &format!(
                        "lobby {} escrow {} below staked {}, aborting start",
                        lobby_id, balance, staked
                    ),
                )
                .await;
            for member in &members {
                self.connections
                    .send_to(member.user_id, ServerMessage::error(&Error::InsufficientBalance))
                    .await;
            }
            self.settlement
                .refund_lobby_players(lobby_id, "insufficient_lobby_balance", None)
                .await;
            self.store.reset_lobby(lobby_id).await?;
            return Err(Error::InsufficientBalance);
        }

        let seed = rand::rngs::OsRng.next_u64();
        let match_id = Uuid::new_v4();
        let live = LiveMatch::new(match_id, lobby_id, seed, entrants, &self.physics);

        let db_players: Vec<NewMatchPlayer> = live
            .players
            .iter()
            .map(|p| NewMatchPlayer {
                user_id: p.user_id,
                role: p.body.role,
                spawn_x: p.body.pos.x,
                spawn_y: p.body.pos.y,
            })
            .collect();
        self.store
            .create_match(
                &NewMatch {
                    id: match_id,
                    lobby_id,
                    rng_seed: seed,
                    buy_in: self.config.wallet.buy_in,
                },
                &db_players,
            )
            .await?;

        let shared = Arc::new(MatchShared::new(MatchStatus::Countdown, now_ms()));
        let players = live.player_ids();
        let runner_ctx = MatchRunnerContext {
            live,
            physics: self.physics.clone(),
            settings: TickSettings {
                grace_ticks: self.config.game.reconnect_grace_secs
                    * self.config.game.tick_rate as u64,
                snapshot_rate: self.config.game.snapshot_rate,
                hearts_to_win: self.config.game.showdown_hearts_to_win,
                freeze_ticks: self.config.game.showdown_freeze_secs
                    * self.config.game.tick_rate as u64,
            },
            countdown_secs: self.config.game.countdown_secs,
            persistence_interval: self.config.game.persistence_interval_ticks,
            store: self.store.clone(),
            broadcaster: MatchBroadcaster::new(self.connections.clone(), players.clone()),
            shared: shared.clone(),
            signal_tx: self.signal_tx.clone(),
            deferred_tx: self.deferred_tx.clone(),
        };
        let ports = MatchRunner::start(
            runner_ctx,
            ComponentEnv::new(format!("[match:{:.8}]", match_id.to_string())),
        );
        self.matches
            .insert(MatchHandle {
                match_id,
                lobby_id,
                players,
                shared,
                ports,
            })
            .await;

        self.alerts
            .send(
                AlertLevel::Info,
                "MATCH_STARTED",
                &format!("match {} started in lobby {}", match_id, lobby_id),
            )
            .await;
        Ok(())
    }

    /// Admin force-reset of a lobby: abort any running match, refund
    /// stakes, kick connections with 4000 and clear the slot.
    pub async fn force_reset(self: &Arc<Self>, lobby_id: LobbyId) -> Result<()> {
        let lobby_row = self
            .store
            .get_lobby(lobby_id)
            .await?
            .ok_or(Error::LobbyNotFound(lobby_id))?;

        let members = self.store.active_players(lobby_id).await?;
        for member in &members {
            if let Some(handle) = self.connections.get(member.user_id).await {
                handle
                    .close(arena_core::protocol::close::ADMIN_RESET, "admin reset")
                    .await;
            }
        }

        if let Some(match_id) = lobby_row.current_match_id {
            if self
                .matches
                .send_frame(
                    match_id,
                    EventFrame::AbortMatch {
                        reason: "admin_reset".into(),
                    },
                )
                .await
            {
                // The runner will drive void-and-refund through the
                // signal loop.
                return Ok(());
            }
        }

        let _guard = self.lobby.lock(lobby_id).await;
        self.settlement
            .refund_lobby_players(lobby_id, "admin_reset", None)
            .await;
        let remaining = self.store.active_players(lobby_id).await?;
        if remaining.is_empty() {
            self.store.reset_lobby(lobby_id).await?;
        }
        Ok(())
    }

    /// Graceful shutdown: close the gates, stop the matches, checkpoint.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(true);
        self.matches.shutdown_all().await;
        for tx in self.component_txs.lock().await.iter() {
            let _ = tx.send(EventFrame::Shutdown).await;
        }
        let _ = self.signal_tx.send(SignalFrame::Shutdown).await;
        // Let runners persist their final snapshots.
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.connections
            .close_all(arena_core::protocol::close::SERVER_SHUTDOWN, "server shutdown")
            .await;
        if let Err(e) = self.store.wal_checkpoint().await {
            warn!("Final WAL checkpoint failed: {}", e);
        }
    }
}
