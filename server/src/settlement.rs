//! Match settlement: payouts, refunds and the treasury sweep.
//!
//! End-of-match is a two-phase commit.  The runner (or the health
//! monitor) flips the match to `ending` and stops the scheduler; this
//! module then either pays the winner or voids and refunds.  Every
//! transfer is preceded by a `pending` audit row and an explicit nonce.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use arena_chain::{ChainT, SendTokenParams, WalletRegistry};
use arena_core::error::{Error, Result};
use arena_core::protocol::{RefundEntry, ServerMessage};
use arena_core::types::{Address, Amount, LobbyId, MatchId, PayoutSource, UserId};
use arena_storage::{MatchOutcome, Store};

use crate::alerts::{AlertLevel, AlertSink};
use crate::bots::is_bot_wallet;
use crate::connection::ConnectionTable;
use crate::frame::MatchVerdict;

const REFUND_ATTEMPT_CAP: usize = 5;
const REFUND_ATTEMPT_WINDOW: Duration = Duration::from_secs(3600);

pub struct Settlement {
    store: Arc<Store>,
    chain: Arc<dyn ChainT>,
    wallets: Arc<WalletRegistry>,
    alerts: Arc<AlertSink>,
    connections: Arc<ConnectionTable>,
    buy_in: Amount,
    winner_payout: Amount,
    min_confirmations: u64,
    refund_attempts: Mutex<HashMap<(LobbyId, UserId), Vec<Instant>>>,
}

impl Settlement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainT>,
        wallets: Arc<WalletRegistry>,
        alerts: Arc<AlertSink>,
        connections: Arc<ConnectionTable>,
        buy_in: Amount,
        winner_payout: Amount,
        min_confirmations: u64,
    ) -> Self {
        Self {
            store,
            chain,
            wallets,
            alerts,
            connections,
            buy_in,
            winner_payout,
            min_confirmations,
            refund_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Settle a terminated match.  Safe to call more than once; terminal
    /// rows short-circuit into a re-broadcast.
    pub async fn settle(
        &self,
        match_id: MatchId,
        lobby_id: LobbyId,
        verdict: MatchVerdict,
        final_positions: Vec<(UserId, f64, f64)>,
    ) {
        let row = match self.store.get_match(match_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                error!("Settling unknown match {}", match_id);
                return;
            }
            Err(e) => {
                error!("Failed to load match {} for settlement: {}", match_id, e);
                return;
            }
        };

        if row.status.is_terminal() {
            if let Some(tx_hash) = row.payout_tx_hash.clone() {
                self.broadcast_match_end(
                    match_id,
                    row.winner_id,
                    row.end_reason.as_deref().unwrap_or("finished"),
                    row.payout_amount,
                    Some(tx_hash),
                )
                .await;
            }
            let _ = self.store.delete_match_state(match_id).await;
            return;
        }

        let final_tick = self
            .store
            .get_match_state(match_id)
            .await
            .ok()
            .flatten()
            .map(|s| s.tick)
            .unwrap_or(0);

        match &verdict {
            MatchVerdict::Void { reason } => {
                self.settle_void(match_id, lobby_id, reason).await;
            }
            MatchVerdict::Winner { user_id, reason } => {
                self.settle_winner(match_id, lobby_id, *user_id, reason, &final_positions)
                    .await;
            }
        }

        let end_event = arena_core::types::MatchEvent {
            match_id,
            tick: final_tick,
            event_type: "end".into(),
            payload: serde_json::json!({
                "reason": verdict.reason(),
                "winner": match &verdict {
                    MatchVerdict::Winner { user_id, .. } => Some(*user_id),
                    MatchVerdict::Void { .. } => None,
                },
            }),
        };
        if let Err(e) = self.store.append_match_event(&end_event).await {
            warn!("Failed to log end event for {}: {}", match_id, e);
        }

        if let Err(e) = self.store.delete_match_state(match_id).await {
            warn!("Failed to delete match state for {}: {}", match_id, e);
        }
    }

    async fn settle_void(&self, match_id: MatchId, lobby_id: LobbyId, reason: &str) {
        info!("Voiding match {} ({})", match_id, reason);
        if let Err(e) = self.store.void_match(match_id, reason).await {
            error!("Failed to mark match {} void: {}", match_id, e);
        }
        self.broadcast_match_end(match_id, None, reason, None, None)
            .await;
        let refunds = self
            .refund_lobby_players(lobby_id, reason, Some(match_id))
            .await;
        self.broadcast_to_lobby(
            lobby_id,
            &ServerMessage::RefundProcessed {
                lobby_id,
                reason: reason.to_string(),
                refunds,
            },
        )
        .await;
        // Reset only once every stake has left the lobby wallet; failed
        // refunds keep their rows active for the retry path.
        match self.store.active_players(lobby_id).await {
            Ok(players) if players.is_empty() => {
                if let Err(e) = self.store.reset_lobby(lobby_id).await {
                    error!("Failed to reset lobby {}: {}", lobby_id, e);
                }
            }
            Ok(players) => {
                warn!(
                    "Lobby {} keeps {} unrefunded players after void",
                    lobby_id,
                    players.len()
                );
                let _ = self
                    .store
                    .set_lobby_status(lobby_id, arena_core::types::LobbyStatus::Waiting)
                    .await;
            }
            Err(e) => error!("Failed to check lobby {} after void: {}", lobby_id, e),
        }
    }

    async fn settle_winner(
        &self,
        match_id: MatchId,
        lobby_id: LobbyId,
        winner_id: UserId,
        reason: &str,
        final_positions: &[(UserId, f64, f64)],
    ) {
        // Idempotency: if a previous run already sent the payout, only the
        // broadcast is repeated.
        match self.store.get_match(match_id).await {
            Ok(Some(row)) if row.payout_tx_hash.is_some() => {
                self.broadcast_match_end(
                    match_id,
                    Some(winner_id),
                    reason,
                    row.payout_amount,
                    row.payout_tx_hash,
                )
                .await;
                return;
            }
            _ => {}
        }

        let Some(lobby_wallet) = self.wallets.lobby_address(lobby_id).cloned() else {
            error!("No wallet for lobby {}", lobby_id);
            return;
        };
        let winner_wallet = match self.store.get_user(winner_id).await {
            Ok(Some(user)) => user.wallet,
            _ => {
                error!("Winner {} missing from store", winner_id);
                self.settle_void(match_id, lobby_id, "winner_missing").await;
                return;
            }
        };

        // Pre-payout balance recheck on the lobby wallet.
        match self.chain.token_balance(&lobby_wallet).await {
            Ok(balance) if balance >= self.winner_payout => {}
            Ok(balance) => {
                self.alerts
                    .send(
                        AlertLevel::Critical,
                        "INSUFFICIENT_LOBBY_BALANCE",
                        &format!(
                            "lobby {} holds {} but payout needs {}",
                            lobby_id, balance, self.winner_payout
                        ),
                    )
                    .await;
                self.settle_void(match_id, lobby_id, "insufficient_lobby_balance")
                    .await;
                return;
            }
            Err(e) => {
                self.alerts
                    .send(
                        AlertLevel::Critical,
                        "PAYOUT_BALANCE_CHECK_FAILED",
                        &format!("lobby {}: {}", lobby_id, e),
                    )
                    .await;
                self.settle_void(match_id, lobby_id, "payout_failed").await;
                return;
            }
        }

        let attempt_id = match self
            .store
            .create_payout_attempt(
                match_id,
                lobby_id,
                &winner_wallet,
                self.winner_payout,
                PayoutSource::Lobby,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to log payout attempt: {}", e);
                self.settle_void(match_id, lobby_id, "payout_failed").await;
                return;
            }
        };

        match self
            .send_from_lobby(&lobby_wallet, &winner_wallet, self.winner_payout)
            .await
        {
            Ok(tx_hash) => {
                if let Err(e) = self.store.mark_payout_success(attempt_id, &tx_hash).await {
                    warn!("Failed to mark payout success: {}", e);
                }
                let outcomes = self.build_outcomes(match_id, winner_id).await;
                if let Err(e) = self
                    .store
                    .finish_match(
                        match_id,
                        lobby_id,
                        winner_id,
                        self.winner_payout,
                        &tx_hash,
                        reason,
                        &outcomes,
                        final_positions,
                    )
                    .await
                {
                    error!("Failed to finalize match {}: {}", match_id, e);
                }
                self.alerts
                    .send(
                        AlertLevel::Info,
                        "MATCH_COMPLETED",
                        &format!(
                            "match {} winner {} paid {} ({})",
                            match_id, winner_wallet, self.winner_payout, reason
                        ),
                    )
                    .await;
                self.broadcast_match_end(
                    match_id,
                    Some(winner_id),
                    reason,
                    Some(self.winner_payout),
                    Some(tx_hash),
                )
                .await;
            }
            Err(e) => {
                if let Err(mark_err) = self
                    .store
                    .mark_payout_failed(attempt_id, &e.to_string(), e.error_type())
                    .await
                {
                    warn!("Failed to mark payout failure: {}", mark_err);
                }
                self.alerts
                    .send(
                        AlertLevel::Critical,
                        "PAYOUT_FAILED",
                        &format!("match {} to {}: {}", match_id, winner_wallet, e),
                    )
                    .await;
                self.settle_void(match_id, lobby_id, "payout_failed").await;
            }
        }
    }

    /// Refund every non-refunded player of a lobby from the lobby wallet.
    /// Per-(lobby, player) attempts are capped; exhaustion alerts and
    /// skips so an operator can reconcile by hand.
    pub async fn refund_lobby_players(
        &self,
        lobby_id: LobbyId,
        reason: &str,
        match_id: Option<MatchId>,
    ) -> Vec<RefundEntry> {
        let audit_match_id = match_id.unwrap_or_else(uuid::Uuid::nil);
        let players = match self.store.active_players(lobby_id).await {
            Ok(players) => players,
            Err(e) => {
                error!("Failed to list lobby {} players: {}", lobby_id, e);
                return Vec::new();
            }
        };
        let Some(lobby_wallet) = self.wallets.lobby_address(lobby_id).cloned() else {
            error!("No wallet for lobby {}", lobby_id);
            return Vec::new();
        };

        let mut refunds = Vec::new();
        for player in players {
            let wallet = match self.store.get_user(player.user_id).await {
                Ok(Some(user)) => user.wallet,
                _ => continue,
            };

            if is_bot_wallet(&wallet) {
                // Bots never escrowed anything.
                let _ = self
                    .store
                    .mark_refunded(lobby_id, player.user_id, reason, None)
                    .await;
                continue;
            }

            if !self.allow_refund_attempt(lobby_id, player.user_id).await {
                self.alerts
                    .send(
                        AlertLevel::Critical,
                        "MANUAL INTERVENTION REQUIRED",
                        &format!(
                            "refunds for {} in lobby {} exhausted {} attempts",
                            wallet, lobby_id, REFUND_ATTEMPT_CAP
                        ),
                    )
                    .await;
                continue;
            }

            let attempt_id = match self
                .store
                .create_payout_attempt(
                    audit_match_id,
                    lobby_id,
                    &wallet,
                    self.buy_in,
                    PayoutSource::Lobby,
                )
                .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("Failed to log refund attempt: {}", e);
                    None
                }
            };

            match self.send_from_lobby(&lobby_wallet, &wallet, self.buy_in).await {
                Ok(tx_hash) => {
                    if let Some(id) = attempt_id {
                        let _ = self.store.mark_payout_success(id, &tx_hash).await;
                    }
                    if let Err(e) = self
                        .store
                        .mark_refunded(lobby_id, player.user_id, reason, Some(&tx_hash))
                        .await
                    {
                        warn!("Refund sent but not recorded for {}: {}", wallet, e);
                    }
                    refunds.push(RefundEntry {
                        wallet: wallet.to_string(),
                        amount: self.buy_in,
                        tx_hash: Some(tx_hash),
                    });
                }
                Err(e) => {
                    if let Some(id) = attempt_id {
                        let _ = self
                            .store
                            .mark_payout_failed(id, &e.to_string(), e.error_type())
                            .await;
                    }
                    self.alerts
                        .send(
                            AlertLevel::Warning,
                            "REFUND_FAILED",
                            &format!("lobby {} to {}: {}", lobby_id, wallet, e),
                        )
                        .await;
                }
            }
        }
        refunds
    }

    /// Residual house cut left on empty lobby wallets goes to the
    /// treasury.  Runs on its own schedule, never blocks settlement.
    pub async fn sweep_treasury(&self) {
        for lobby_id in 1..=self.wallets.lobby_count() {
            let Some(lobby_wallet) = self.wallets.lobby_address(lobby_id).cloned() else {
                continue;
            };
            let idle = match self.store.get_lobby(lobby_id).await {
                Ok(Some(lobby)) => {
                    lobby.status == arena_core::types::LobbyStatus::Empty
                        && self
                            .store
                            .active_players(lobby_id)
                            .await
                            .map(|p| p.is_empty())
                            .unwrap_or(false)
                }
                _ => false,
            };
            if !idle {
                continue;
            }
            let balance = match self.chain.token_balance(&lobby_wallet).await {
                Ok(balance) if balance > 0 => balance,
                _ => continue,
            };
            match self
                .send_from_lobby(&lobby_wallet, self.wallets.treasury_address(), balance)
                .await
            {
                Ok(tx_hash) => {
                    info!(
                        "Swept {} from lobby {} to treasury ({})",
                        balance, lobby_id, tx_hash
                    );
                }
                Err(e) => {
                    self.alerts
                        .send_throttled(
                            &format!("sweep-{}", lobby_id),
                            Duration::from_secs(86_400),
                            AlertLevel::Warning,
                            "TREASURY_SWEEP_FAILED",
                            &format!("lobby {}: {}", lobby_id, e),
                        )
                        .await;
                }
            }
        }
    }

    /// The nonce is taken once, before the retry loop inside the wrapped
    /// chain, and reused across providers.
    async fn send_from_lobby(
        &self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> std::result::Result<String, arena_chain::ChainError> {
        let nonce = self.chain.next_nonce(from).await?;
        self.chain
            .send_token_transfer(&SendTokenParams {
                from: from.clone(),
                to: to.clone(),
                amount,
                nonce,
                confirmations: self.min_confirmations,
            })
            .await
    }

    async fn build_outcomes(&self, match_id: MatchId, winner_id: UserId) -> Vec<MatchOutcome> {
        let players = match self.store.match_players(match_id).await {
            Ok(players) => players,
            Err(e) => {
                warn!("Failed to load players for stats: {}", e);
                return Vec::new();
            }
        };
        let now = chrono::Utc::now();
        let mut outcomes = Vec::new();
        for player in players {
            let wallet = match self.store.get_user(player.user_id).await {
                Ok(Some(user)) => user.wallet,
                _ => continue,
            };
            if is_bot_wallet(&wallet) {
                continue;
            }
            let won = player.user_id == winner_id;
            outcomes.push(MatchOutcome {
                wallet,
                won,
                earnings: if won { self.winner_payout } else { 0 },
                spent: self.buy_in,
                at: now,
            });
        }
        outcomes
    }

    async fn broadcast_match_end(
        &self,
        match_id: MatchId,
        winner: Option<UserId>,
        reason: &str,
        payout_amount: Option<Amount>,
        payout_tx_hash: Option<String>,
    ) {
        let msg = ServerMessage::MatchEnd {
            match_id,
            winner,
            reason: reason.to_string(),
            payout_amount,
            payout_tx_hash,
        };
        match self.store.match_players(match_id).await {
            Ok(players) => {
                for player in players {
                    self.connections.send_to(player.user_id, msg.clone()).await;
                }
            }
            Err(e) => warn!("Failed to fan out match end: {}", e),
        }
    }

    async fn broadcast_to_lobby(&self, lobby_id: LobbyId, msg: &ServerMessage) {
        match self.store.active_players(lobby_id).await {
            Ok(players) => {
                for player in players {
                    self.connections.send_to(player.user_id, msg.clone()).await;
                }
            }
            Err(e) => warn!("Failed to fan out to lobby {}: {}", lobby_id, e),
        }
    }

    async fn allow_refund_attempt(&self, lobby_id: LobbyId, user_id: UserId) -> bool {
        let mut attempts = self.refund_attempts.lock().await;
        let entry = attempts.entry((lobby_id, user_id)).or_default();
        entry.retain(|at| at.elapsed() < REFUND_ATTEMPT_WINDOW);
        if entry.len() >= REFUND_ATTEMPT_CAP {
            return false;
        }
        entry.push(Instant::now());
        true
    }
}

/// Timeout refunds reuse the same machinery but are initiated by a
/// player; exposed separately so the lobby can call it under its lock.
pub async fn process_timeout_refund(
    settlement: &Settlement,
    store: &Store,
    lobby_id: LobbyId,
) -> Result<Vec<RefundEntry>> {
    let refunds = settlement
        .refund_lobby_players(lobby_id, "lobby_timeout", None)
        .await;
    let remaining = store.active_players(lobby_id).await?;
    if remaining.is_empty() {
        store.reset_lobby(lobby_id).await?;
    } else {
        return Err(Error::InternalError(format!(
            "{} refunds in lobby {} still pending",
            remaining.len(),
            lobby_id
        )));
    }
    Ok(refunds)
}
