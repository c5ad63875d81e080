//! Bot control, admin-port only.
//!
//! Bots are ordinary users with a derived wallet prefix and synthetic
//! `bot_tx_` payment hashes; they skip payment verification and never
//! receive refunds.  Their movement is produced inside the tick, so a
//! botted match replays like any other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use arena_core::error::Result;
use arena_core::protocol::LobbySummary;
use arena_core::types::{Address, LobbyId, TxHash};
use arena_storage::Store;

use crate::lobby::{JoinOptions, LobbyCoordinator};

pub const BOT_WALLET_PREFIX: &str = "0xb07";

pub fn is_bot_wallet(wallet: &Address) -> bool {
    wallet.as_str().starts_with(BOT_WALLET_PREFIX)
}

pub struct BotManager {
    store: Arc<Store>,
    lobby: Arc<LobbyCoordinator>,
    counter: AtomicU64,
}

impl BotManager {
    pub fn new(store: Arc<Store>, lobby: Arc<LobbyCoordinator>) -> Self {
        Self {
            store,
            lobby,
            counter: AtomicU64::new(1),
        }
    }

    pub async fn add_bot(&self, lobby_id: LobbyId) -> Result<LobbySummary> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let wallet = Address::from_raw(format!("{}{:037x}", BOT_WALLET_PREFIX, n));
        let user = self.store.get_or_create_user(&wallet).await?;
        let tx_hash = TxHash::new(format!("0xbot_tx_{}_{}", n, salt));
        let summary = self
            .lobby
            .join(&user, lobby_id, tx_hash, JoinOptions::admin())
            .await?;
        info!("Bot {} added to lobby {}", wallet, lobby_id);
        Ok(summary)
    }

    /// Top the lobby up to three players with bots.
    pub async fn fill_lobby(&self, lobby_id: LobbyId) -> Result<LobbySummary> {
        let mut summary = self.lobby.lobby_summary(lobby_id).await?;
        while summary.player_count < 3 {
            summary = self.add_bot(lobby_id).await?;
        }
        Ok(summary)
    }

    /// Remove all bots from a waiting lobby.  Bots hold no stake, so the
    /// slot is simply released.
    pub async fn remove_bots(&self, lobby_id: LobbyId) -> Result<LobbySummary> {
        let players = self.store.active_players(lobby_id).await?;
        let mut removed = 0;
        for player in players {
            let Some(user) = self.store.get_user(player.user_id).await? else {
                continue;
            };
            if is_bot_wallet(&user.wallet) {
                self.store
                    .mark_refunded(lobby_id, player.user_id, "bot_removed", None)
                    .await?;
                removed += 1;
            }
        }
        if removed > 0 {
            let remaining = self.store.active_players(lobby_id).await?;
            if remaining.is_empty() {
                self.store.reset_lobby(lobby_id).await?;
            }
            info!("Removed {} bots from lobby {}", removed, lobby_id);
        }
        self.lobby.lobby_summary(lobby_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_wallets_are_recognizable_and_well_formed() {
        let wallet = Address::from_raw(format!("{}{:037x}", BOT_WALLET_PREFIX, 7u64));
        assert!(is_bot_wallet(&wallet));
        // Same shape as a real account address.
        assert_eq!(wallet.as_str().len(), 42);
        assert!(!is_bot_wallet(&Address::from_raw(format!("0x{:040x}", 7))));
    }
}
