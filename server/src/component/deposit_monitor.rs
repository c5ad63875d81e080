//! Deposit monitor: scans token Transfer events to each lobby wallet and
//! auto-admits depositors whose client died after paying.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use arena_chain::{ChainT, TransferQuery, WalletRegistry};
use arena_core::error::Error;
use arena_core::types::{Amount, LobbyId, TxHash};
use arena_storage::Store;

use crate::component::{CloseReason, Component, ComponentEnv, ConsumerPorts};
use crate::frame::EventFrame;
use crate::lobby::{JoinOptions, LobbyCoordinator};

const SCAN_INTERVAL: Duration = Duration::from_secs(30);
/// At most this many blocks per lobby per sweep.
const SCAN_WINDOW: u64 = 10;

pub struct DepositMonitorContext {
    pub store: Arc<Store>,
    pub chain: Arc<dyn ChainT>,
    pub wallets: Arc<WalletRegistry>,
    pub lobby: Arc<LobbyCoordinator>,
    pub buy_in: Amount,
    pub min_confirmations: u64,
}

pub struct DepositMonitor {}

#[async_trait]
impl Component<DepositMonitorContext> for DepositMonitor {
    fn name() -> &'static str {
        "Deposit Monitor"
    }

    async fn run(
        mut ports: ConsumerPorts,
        ctx: DepositMonitorContext,
        env: ComponentEnv,
    ) -> CloseReason {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        let mut last_scanned: HashMap<LobbyId, u64> = HashMap::new();
        loop {
            tokio::select! {
                maybe = ports.recv() => match maybe {
                    Some(EventFrame::Shutdown) | None => break,
                    _ => {}
                },
                _ = ticker.tick() => {
                    if let Err(e) = scan_once(&ctx, &mut last_scanned, &env).await {
                        warn!("{} Deposit scan failed: {}", env.log_prefix, e);
                    }
                }
            }
        }
        CloseReason::Complete
    }
}

async fn scan_once(
    ctx: &DepositMonitorContext,
    last_scanned: &mut HashMap<LobbyId, u64>,
    env: &ComponentEnv,
) -> Result<(), Error> {
    let latest = ctx
        .chain
        .latest_block()
        .await
        .map_err(|e| Error::ChainError(e.to_string()))?;
    // Only blocks with enough confirmations are worth admitting from.
    let confirmed_head = latest.saturating_sub(ctx.min_confirmations.saturating_sub(1));

    for lobby_id in 1..=ctx.lobby.lobby_count() {
        let Some(deposit_address) = ctx.wallets.lobby_address(lobby_id).cloned() else {
            continue;
        };
        let from_block = last_scanned
            .get(&lobby_id)
            .map(|b| b + 1)
            .unwrap_or_else(|| confirmed_head.saturating_sub(SCAN_WINDOW));
        let to_block = confirmed_head.min(from_block + SCAN_WINDOW - 1);
        if to_block < from_block {
            continue;
        }

        let transfers = ctx
            .chain
            .token_transfers(&TransferQuery {
                from: None,
                to: Some(deposit_address),
                from_block,
                to_block,
            })
            .await
            .map_err(|e| Error::ChainError(e.to_string()))?;

        for transfer in transfers {
            if transfer.amount != ctx.buy_in {
                debug!(
                    "{} Ignoring transfer {} with amount {}",
                    env.log_prefix, transfer.tx_hash, transfer.amount
                );
                continue;
            }
            let tx_hash = TxHash::new(transfer.tx_hash.clone());
            if ctx.store.tx_hash_exists(&tx_hash).await? {
                continue;
            }
            let Some(user) = ctx.store.get_user_by_wallet(&transfer.from).await? else {
                debug!(
                    "{} Deposit from unknown wallet {}",
                    env.log_prefix, transfer.from
                );
                continue;
            };
            // Same admit path as a live join; the on-chain event already
            // is the payment evidence.
            match ctx
                .lobby
                .join(&user, lobby_id, tx_hash, JoinOptions::deposit_monitor())
                .await
            {
                Ok(_) => {
                    info!(
                        "{} Auto-admitted {} to lobby {} from deposit {}",
                        env.log_prefix, user.wallet, lobby_id, transfer.tx_hash
                    );
                }
                Err(Error::DuplicateTxHash) | Err(Error::AlreadyInLobby) => {}
                Err(e) => {
                    warn!(
                        "{} Orphan deposit {} could not be admitted: {}",
                        env.log_prefix, transfer.tx_hash, e
                    );
                }
            }
        }
        last_scanned.insert(lobby_id, to_block);
    }
    Ok(())
}
