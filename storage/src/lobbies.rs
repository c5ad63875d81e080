//! Lobbies and lobby players.
//!
//! The UNIQUE constraint on `lobby_players.payment_tx_hash` is the final
//! race barrier against duplicate admits; everything above it is ordering.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use arena_core::error::{Error, Result};
use arena_core::types::{Address, Lobby, LobbyId, LobbyPlayer, LobbyStatus, MatchId, TxHash, UserId};

use crate::{map_err, Store};

fn row_to_lobby(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lobby> {
    let status: String = row.get(1)?;
    let match_id: Option<String> = row.get(6)?;
    Ok(Lobby {
        id: row.get(0)?,
        status: status.parse().unwrap_or(LobbyStatus::Empty),
        deposit_address: Address::from_raw(row.get::<_, String>(2)?),
        encrypted_deposit_key: row.get(3)?,
        first_join_at: row.get(4)?,
        timeout_at: row.get(5)?,
        current_match_id: match_id.and_then(|id| id.parse().ok()),
    })
}

fn row_to_lobby_player(row: &rusqlite::Row<'_>) -> rusqlite::Result<LobbyPlayer> {
    Ok(LobbyPlayer {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        lobby_id: row.get(1)?,
        user_id: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        payment_tx_hash: TxHash::new(row.get::<_, String>(3)?),
        joined_at: row.get(4)?,
        refunded_at: row.get(5)?,
        refund_reason: row.get(6)?,
        refund_tx_hash: row.get(7)?,
    })
}

const LOBBY_COLUMNS: &str =
    "id, status, deposit_address, encrypted_deposit_key, first_join_at, timeout_at, current_match_id";
const PLAYER_COLUMNS: &str =
    "id, lobby_id, user_id, payment_tx_hash, joined_at, refunded_at, refund_reason, refund_tx_hash";

pub(crate) fn get_lobby_row(conn: &Connection, id: LobbyId) -> Result<Option<Lobby>> {
    conn.query_row(
        &format!("SELECT {} FROM lobbies WHERE id = ?1", LOBBY_COLUMNS),
        params![id],
        row_to_lobby,
    )
    .optional()
    .map_err(map_err)
}

pub(crate) fn active_players_rows(conn: &Connection, lobby_id: LobbyId) -> Result<Vec<LobbyPlayer>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM lobby_players WHERE lobby_id = ?1 AND refunded_at IS NULL
             ORDER BY joined_at",
            PLAYER_COLUMNS
        ))
        .map_err(map_err)?;
    let rows = stmt
        .query_map(params![lobby_id], row_to_lobby_player)
        .map_err(map_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
}

pub(crate) fn reset_lobby_row(conn: &Connection, id: LobbyId) -> Result<()> {
    conn.execute(
        "UPDATE lobbies SET status = 'empty', first_join_at = NULL, timeout_at = NULL,
         current_match_id = NULL WHERE id = ?1",
        params![id],
    )
    .map_err(map_err)?;
    Ok(())
}

impl Store {
    /// Ensure the fixed lobby row exists; the derived wallet fields are
    /// refreshed in place so a seed change is visible after restart.
    pub async fn ensure_lobby(
        &self,
        id: LobbyId,
        deposit_address: &Address,
        encrypted_deposit_key: &str,
    ) -> Result<()> {
        let deposit_address = deposit_address.clone();
        let encrypted_deposit_key = encrypted_deposit_key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO lobbies (id, status, deposit_address, encrypted_deposit_key)
                 VALUES (?1, 'empty', ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                   deposit_address = excluded.deposit_address,
                   encrypted_deposit_key = excluded.encrypted_deposit_key",
                params![id, deposit_address.as_str(), encrypted_deposit_key],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn get_lobby(&self, id: LobbyId) -> Result<Option<Lobby>> {
        self.with_conn(move |conn| get_lobby_row(conn, id)).await
    }

    pub async fn list_lobbies(&self) -> Result<Vec<Lobby>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM lobbies ORDER BY id", LOBBY_COLUMNS))
                .map_err(map_err)?;
            let rows = stmt.query_map([], row_to_lobby).map_err(map_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
        })
        .await
    }

    pub async fn set_lobby_status(&self, id: LobbyId, status: LobbyStatus) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE lobbies SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    /// Admit a player.  Performs the precondition re-checks and the
    /// UNIQUE-constrained insert in one transaction; a tx-hash collision
    /// surfaces as [`Error::DuplicateTxHash`].
    pub async fn insert_lobby_player(
        &self,
        lobby_id: LobbyId,
        user_id: UserId,
        tx_hash: &TxHash,
        timeout_secs: i64,
    ) -> Result<LobbyPlayer> {
        let tx_hash = tx_hash.clone();
        self.with_txn(move |txn| {
            let lobby = get_lobby_row(txn, lobby_id)?.ok_or(Error::LobbyNotFound(lobby_id))?;
            if lobby.status == LobbyStatus::InProgress {
                return Err(Error::LobbyFull);
            }
            let active: i64 = txn
                .query_row(
                    "SELECT COUNT(*) FROM lobby_players
                     WHERE lobby_id = ?1 AND refunded_at IS NULL",
                    params![lobby_id],
                    |row| row.get(0),
                )
                .map_err(map_err)?;
            if active >= 3 {
                return Err(Error::LobbyFull);
            }
            let already: i64 = txn
                .query_row(
                    "SELECT COUNT(*) FROM lobby_players
                     WHERE user_id = ?1 AND refunded_at IS NULL",
                    params![user_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(map_err)?;
            if already > 0 {
                return Err(Error::AlreadyInLobby);
            }

            let player = LobbyPlayer {
                id: Uuid::new_v4(),
                lobby_id,
                user_id,
                payment_tx_hash: tx_hash.clone(),
                joined_at: Utc::now(),
                refunded_at: None,
                refund_reason: None,
                refund_tx_hash: None,
            };
            txn.execute(
                "INSERT INTO lobby_players (id, lobby_id, user_id, payment_tx_hash, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    player.id.to_string(),
                    player.lobby_id,
                    player.user_id.to_string(),
                    player.payment_tx_hash.as_str(),
                    player.joined_at
                ],
            )
            .map_err(map_err)?;

            // First active player stamps the timeout clock.
            if active == 0 {
                let now = Utc::now();
                let timeout_at = now + chrono::Duration::seconds(timeout_secs);
                txn.execute(
                    "UPDATE lobbies SET status = 'waiting', first_join_at = ?1, timeout_at = ?2
                     WHERE id = ?3",
                    params![now, timeout_at, lobby_id],
                )
                .map_err(map_err)?;
            } else if active == 2 {
                txn.execute(
                    "UPDATE lobbies SET status = 'ready' WHERE id = ?1",
                    params![lobby_id],
                )
                .map_err(map_err)?;
            }
            Ok(player)
        })
        .await
    }

    pub async fn tx_hash_exists(&self, tx_hash: &TxHash) -> Result<bool> {
        let tx_hash = tx_hash.clone();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM lobby_players WHERE payment_tx_hash = ?1",
                    params![tx_hash.as_str()],
                    |row| row.get(0),
                )
                .map_err(map_err)?;
            Ok(count > 0)
        })
        .await
    }

    pub async fn active_players(&self, lobby_id: LobbyId) -> Result<Vec<LobbyPlayer>> {
        self.with_conn(move |conn| active_players_rows(conn, lobby_id))
            .await
    }

    /// The lobby currently holding this user's stake, if any.
    pub async fn find_active_lobby_for_user(&self, user_id: UserId) -> Result<Option<LobbyId>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT lobby_id FROM lobby_players
                 WHERE user_id = ?1 AND refunded_at IS NULL",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }

    pub async fn mark_refunded(
        &self,
        lobby_id: LobbyId,
        user_id: UserId,
        reason: &str,
        refund_tx_hash: Option<&str>,
    ) -> Result<()> {
        let reason = reason.to_string();
        let refund_tx_hash = refund_tx_hash.map(String::from);
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE lobby_players
                     SET refunded_at = ?1, refund_reason = ?2, refund_tx_hash = ?3
                     WHERE lobby_id = ?4 AND user_id = ?5 AND refunded_at IS NULL",
                    params![Utc::now(), reason, refund_tx_hash, lobby_id, user_id.to_string()],
                )
                .map_err(map_err)?;
            if changed == 0 {
                return Err(Error::NotInLobby);
            }
            Ok(())
        })
        .await
    }

    pub async fn reset_lobby(&self, id: LobbyId) -> Result<()> {
        self.with_conn(move |conn| reset_lobby_row(conn, id)).await
    }

    pub async fn set_lobby_match(&self, id: LobbyId, match_id: MatchId) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE lobbies SET status = 'in_progress', current_match_id = ?1 WHERE id = ?2",
                params![match_id.to_string(), id],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    /// Lobbies sitting in `waiting` or `in_progress` since before `cutoff`.
    pub async fn stuck_lobbies(&self, cutoff: DateTime<Utc>) -> Result<Vec<Lobby>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM lobbies
                     WHERE status IN ('waiting', 'in_progress') AND first_join_at <= ?1",
                    LOBBY_COLUMNS
                ))
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![cutoff], row_to_lobby)
                .map_err(map_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
        })
        .await
    }
}
