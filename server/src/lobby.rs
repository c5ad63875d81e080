//! Lobby state machine: joins, timeout refunds, the lock registry.
//!
//! Every mutating lobby operation runs under that lobby's async lock.
//! The lock provides ordering only; durability and the duplicate-admit
//! barrier come from store transactions and the UNIQUE tx-hash
//! constraint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use arena_chain::{verify_deposit, ChainT, DepositCheck, VerifyError, WalletRegistry};
use arena_core::error::{Error, Result};
use arena_core::protocol::{LobbySummary, RefundEntry, ServerMessage};
use arena_core::types::{Amount, LobbyId, LobbyStatus, TxHash, User, UserId};
use arena_storage::Store;

use crate::connection::ConnectionTable;
use crate::frame::{DeferredOp, EventFrame, SignalFrame};
use crate::settlement::{process_timeout_refund, Settlement};

/// Delay between the third admit and the match start signal, giving the
/// final LOBBY_UPDATE a moment to fan out.
const START_GRACE: Duration = Duration::from_millis(100);

/// Lazily-created per-lobby async locks.
#[derive(Default)]
pub struct LobbyLocks {
    inner: Mutex<HashMap<LobbyId, Arc<Mutex<()>>>>,
}

impl LobbyLocks {
    pub async fn acquire(&self, lobby_id: LobbyId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inner = self.inner.lock().await;
            inner
                .entry(lobby_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JoinOptions {
    /// Verify the payment on chain; skipped on the admin profile and for
    /// deposit-monitor admits where the event is the evidence.
    pub verify_payment: bool,
    /// Whether this join represents real money (updates paid_wallets).
    pub counts_as_paid: bool,
}

impl JoinOptions {
    pub fn public() -> Self {
        Self {
            verify_payment: true,
            counts_as_paid: true,
        }
    }

    pub fn admin() -> Self {
        Self {
            verify_payment: false,
            counts_as_paid: false,
        }
    }

    pub fn deposit_monitor() -> Self {
        Self {
            verify_payment: false,
            counts_as_paid: true,
        }
    }
}

pub struct LobbyCoordinator {
    store: Arc<Store>,
    chain: Arc<dyn ChainT>,
    wallets: Arc<WalletRegistry>,
    connections: Arc<ConnectionTable>,
    settlement: Arc<Settlement>,
    signal_tx: mpsc::Sender<SignalFrame>,
    deferred_tx: mpsc::Sender<EventFrame>,
    locks: LobbyLocks,
    lobby_count: u32,
    buy_in: Amount,
    min_confirmations: u64,
    max_tx_age_secs: u64,
    lobby_timeout_secs: u64,
}

impl LobbyCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainT>,
        wallets: Arc<WalletRegistry>,
        connections: Arc<ConnectionTable>,
        settlement: Arc<Settlement>,
        signal_tx: mpsc::Sender<SignalFrame>,
        deferred_tx: mpsc::Sender<EventFrame>,
        lobby_count: u32,
        buy_in: Amount,
        min_confirmations: u64,
        max_tx_age_secs: u64,
        lobby_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            chain,
            wallets,
            connections,
            settlement,
            signal_tx,
            deferred_tx,
            locks: LobbyLocks::default(),
            lobby_count,
            buy_in,
            min_confirmations,
            max_tx_age_secs,
            lobby_timeout_secs,
        }
    }

    /// Create the fixed lobby rows from the derived wallet set.
    pub async fn ensure_lobbies(&self) -> Result<()> {
        for lobby_id in 1..=self.lobby_count {
            let address = self
                .wallets
                .lobby_address(lobby_id)
                .ok_or_else(|| Error::ConfigMissing(format!("wallet for lobby {}", lobby_id)))?;
            let key = self
                .wallets
                .encrypted_lobby_key(lobby_id)
                .unwrap_or_default()
                .to_string();
            self.store.ensure_lobby(lobby_id, address, &key).await?;
        }
        Ok(())
    }

    pub async fn lock(&self, lobby_id: LobbyId) -> OwnedMutexGuard<()> {
        self.locks.acquire(lobby_id).await
    }

    pub async fn join(
        &self,
        user: &User,
        lobby_id: LobbyId,
        tx_hash: TxHash,
        options: JoinOptions,
    ) -> Result<LobbySummary> {
        if lobby_id == 0 || lobby_id > self.lobby_count {
            return Err(Error::LobbyNotFound(lobby_id));
        }
        // Fast path; the UNIQUE constraint remains the real barrier.
        if self.store.tx_hash_exists(&tx_hash).await? {
            return Err(Error::DuplicateTxHash);
        }

        let _guard = self.locks.acquire(lobby_id).await;

        let lobby = self
            .store
            .get_lobby(lobby_id)
            .await?
            .ok_or(Error::LobbyNotFound(lobby_id))?;
        if lobby.status == LobbyStatus::InProgress {
            return Err(Error::LobbyFull);
        }

        if options.verify_payment {
            let check = DepositCheck {
                tx_hash: tx_hash.as_str().to_string(),
                expected_sender: user.wallet.clone(),
                expected_recipient: lobby.deposit_address.clone(),
                expected_amount: self.buy_in,
                min_confirmations: self.min_confirmations,
                max_age_secs: self.max_tx_age_secs,
            };
            let now_unix = Utc::now().timestamp().max(0) as u64;
            verify_deposit(self.chain.as_ref(), &check, now_unix)
                .await
                .map_err(|e| match e {
                    VerifyError::Chain(chain_err) => Error::PaymentFailed(chain_err.to_string()),
                    other => Error::PaymentNotConfirmed(other.to_string()),
                })?;
        }

        self.store
            .insert_lobby_player(lobby_id, user.id, &tx_hash, self.lobby_timeout_secs as i64)
            .await?;
        info!(
            "Player {} joined lobby {} (tx {})",
            user.wallet, lobby_id, tx_hash
        );

        if options.counts_as_paid {
            let _ = self.deferred_tx.try_send(EventFrame::Defer(DeferredOp::PaidWallet {
                wallet: user.wallet.clone(),
                at: Utc::now(),
            }));
        }

        let summary = self.lobby_summary(lobby_id).await?;
        self.connections
            .broadcast_all(&ServerMessage::LobbyUpdate {
                lobby: summary.clone(),
            })
            .await;

        if summary.status == LobbyStatus::Ready {
            let signal_tx = self.signal_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(START_GRACE).await;
                if let Err(e) = signal_tx.send(SignalFrame::StartMatch { lobby_id }).await {
                    warn!("Failed to signal match start for lobby {}: {}", lobby_id, e);
                }
            });
        }
        Ok(summary)
    }

    /// Timeout refund, available to any lobby member once `timeout_at`
    /// has passed and no match has started.
    pub async fn request_refund(&self, user_id: UserId) -> Result<Vec<RefundEntry>> {
        // A player with no live stake (including one already refunded)
        // has no refund available.
        let lobby_id = self
            .store
            .find_active_lobby_for_user(user_id)
            .await?
            .ok_or(Error::RefundNotAvailable)?;

        let _guard = self.locks.acquire(lobby_id).await;

        let lobby = self
            .store
            .get_lobby(lobby_id)
            .await?
            .ok_or(Error::LobbyNotFound(lobby_id))?;
        if !matches!(lobby.status, LobbyStatus::Empty | LobbyStatus::Waiting) {
            return Err(Error::RefundNotAvailable);
        }
        match lobby.timeout_at {
            Some(timeout_at) if timeout_at <= Utc::now() => {}
            _ => return Err(Error::RefundNotAvailable),
        }

        let members = self.store.active_players(lobby_id).await?;
        let refunds = process_timeout_refund(&self.settlement, &self.store, lobby_id).await?;
        let msg = ServerMessage::RefundProcessed {
            lobby_id,
            reason: "lobby_timeout".into(),
            refunds: refunds.clone(),
        };
        for member in members {
            self.connections.send_to(member.user_id, msg.clone()).await;
        }
        let summary = self.lobby_summary(lobby_id).await?;
        self.connections
            .broadcast_all(&ServerMessage::LobbyUpdate { lobby: summary })
            .await;
        Ok(refunds)
    }

    pub async fn lobby_summary(&self, lobby_id: LobbyId) -> Result<LobbySummary> {
        let lobby = self
            .store
            .get_lobby(lobby_id)
            .await?
            .ok_or(Error::LobbyNotFound(lobby_id))?;
        let player_count = self.store.active_players(lobby_id).await?.len() as u8;
        Ok(LobbySummary {
            id: lobby.id,
            status: lobby.status,
            player_count,
            deposit_address: lobby.deposit_address.to_string(),
        })
    }

    pub async fn lobby_list(&self) -> Result<Vec<LobbySummary>> {
        let mut summaries = Vec::with_capacity(self.lobby_count as usize);
        for lobby in self.store.list_lobbies().await? {
            let player_count = self.store.active_players(lobby.id).await?.len() as u8;
            summaries.push(LobbySummary {
                id: lobby.id,
                status: lobby.status,
                player_count,
                deposit_address: lobby.deposit_address.to_string(),
            });
        }
        Ok(summaries)
    }

    pub fn lobby_count(&self) -> u32 {
        self.lobby_count
    }
}
