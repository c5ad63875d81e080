//! Startup recovery of interrupted matches.
//!
//! Before any listener accepts traffic, every match left non-terminal by
//! the previous process is reconciled against the chain: if the winner
//! payout already went out, the match is finished with that transaction;
//! otherwise it is voided and every stake refunded.  Re-running this over
//! an already-settled match changes nothing.

use std::sync::Arc;

use tracing::{info, warn};

use arena_chain::{ChainT, TransferQuery, WalletRegistry};
use arena_core::error::{Error, Result};
use arena_core::types::Amount;
use arena_storage::{InterruptedMatch, Store, COMPATIBLE_STATE_VERSIONS};

use crate::alerts::{AlertLevel, AlertSink};
use crate::frame::MatchVerdict;
use crate::settlement::Settlement;

pub struct RecoveryContext {
    pub store: Arc<Store>,
    pub chain: Arc<dyn ChainT>,
    pub wallets: Arc<WalletRegistry>,
    pub alerts: Arc<AlertSink>,
    pub settlement: Arc<Settlement>,
    pub winner_payout: Amount,
    pub lookback_blocks: u64,
}

/// Returns how many matches were recovered.
pub async fn recover_interrupted_matches(ctx: &RecoveryContext) -> Result<usize> {
    let interrupted = ctx.store.interrupted_matches().await?;
    if interrupted.is_empty() {
        return Ok(0);
    }
    info!("Recovering {} interrupted match(es)", interrupted.len());

    for item in &interrupted {
        recover_one(ctx, item).await?;
    }
    Ok(interrupted.len())
}

async fn recover_one(ctx: &RecoveryContext, item: &InterruptedMatch) -> Result<()> {
    let match_id = item.row.id;
    let lobby_id = item.row.lobby_id;
    let tick = item.state.as_ref().map(|s| s.tick).unwrap_or(0);

    ctx.alerts
        .send(
            AlertLevel::Warning,
            "MATCH_RECOVERED",
            &format!(
                "match {} in lobby {} interrupted at tick {} ({})",
                match_id,
                lobby_id,
                tick,
                item.row.status.as_str()
            ),
        )
        .await;

    // A snapshot from a foreign schema version cannot be trusted for
    // anything except void-and-refund.
    let state_compatible = item
        .state
        .as_ref()
        .map(|s| COMPATIBLE_STATE_VERSIONS.contains(&s.version))
        .unwrap_or(true);
    if !state_compatible {
        warn!(
            "Match {} snapshot has incompatible version, voiding",
            match_id
        );
        ctx.settlement
            .settle(
                match_id,
                lobby_id,
                MatchVerdict::Void {
                    reason: "incompatible_state_version".into(),
                },
                Vec::new(),
            )
            .await;
        return Ok(());
    }

    // Reconciliation: did the payout already leave the lobby wallet?
    if let Some(tx) = find_completed_payout(ctx, item).await? {
        info!(
            "Match {} payout {} found on chain, marking finished",
            match_id, tx.tx_hash
        );
        ctx.store
            .set_match_payout(match_id, tx.winner_id, ctx.winner_payout, &tx.tx_hash)
            .await?;
        ctx.store
            .consume_lobby_players(lobby_id, "match_settled")
            .await?;
        ctx.store.delete_match_state(match_id).await?;
        return Ok(());
    }

    // No payout on chain: void and refund every stake.
    ctx.settlement
        .settle(
            match_id,
            lobby_id,
            MatchVerdict::Void {
                reason: "server_restart".into(),
            },
            Vec::new(),
        )
        .await;
    Ok(())
}

struct CompletedPayout {
    winner_id: arena_core::types::UserId,
    tx_hash: String,
}

async fn find_completed_payout(
    ctx: &RecoveryContext,
    item: &InterruptedMatch,
) -> Result<Option<CompletedPayout>> {
    // Matches that never ran cannot have paid out.
    if item.row.running_at.is_none() {
        return Ok(None);
    }
    let Some(lobby_wallet) = ctx.wallets.lobby_address(item.row.lobby_id).cloned() else {
        return Ok(None);
    };

    let latest = ctx
        .chain
        .latest_block()
        .await
        .map_err(|e| Error::ChainError(e.to_string()))?;
    let transfers = ctx
        .chain
        .token_transfers(&TransferQuery {
            from: Some(lobby_wallet),
            to: None,
            from_block: latest.saturating_sub(ctx.lookback_blocks),
            to_block: latest,
        })
        .await
        .map_err(|e| Error::ChainError(e.to_string()))?;

    let players = ctx.store.match_players(item.row.id).await?;
    for transfer in transfers {
        if transfer.amount != ctx.winner_payout {
            continue;
        }
        for player in &players {
            let Some(user) = ctx.store.get_user(player.user_id).await? else {
                continue;
            };
            if user.wallet == transfer.to {
                return Ok(Some(CompletedPayout {
                    winner_id: player.user_id,
                    tx_hash: transfer.tx_hash,
                }));
            }
        }
    }
    Ok(None)
}
