//! Matches, match players, the append-only event log and the recovery
//! snapshot.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use arena_core::error::{Error, Result};
use arena_core::types::{
    Amount, MatchEvent, MatchId, MatchPlayer, MatchRow, MatchStateRow, MatchStatus, LobbyId, UserId,
};
use arena_physics::Role;

use crate::stats::{apply_match_outcome, MatchOutcome};
use crate::{map_err, Store};

/// Schema version written into every `match_state` snapshot.
pub const CURRENT_STATE_VERSION: u32 = 1;

/// Versions recovery is able to read.  Anything else forces void-and-refund.
pub const COMPATIBLE_STATE_VERSIONS: &[u32] = &[1];

#[derive(Debug, Clone)]
pub struct NewMatch {
    pub id: MatchId,
    pub lobby_id: LobbyId,
    pub rng_seed: u64,
    pub buy_in: Amount,
}

#[derive(Debug, Clone)]
pub struct NewMatchPlayer {
    pub user_id: UserId,
    pub role: Role,
    pub spawn_x: f64,
    pub spawn_y: f64,
}

/// An interrupted match surfaced by recovery, with its last snapshot when
/// one survived.
#[derive(Debug, Clone)]
pub struct InterruptedMatch {
    pub row: MatchRow,
    pub state: Option<MatchStateRow>,
}

const MATCH_COLUMNS: &str = "id, lobby_id, status, rng_seed, buy_in, countdown_at, running_at, \
                             ended_at, end_reason, winner_id, payout_amount, payout_tx_hash";

fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchRow> {
    let winner: Option<String> = row.get(9)?;
    Ok(MatchRow {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        lobby_id: row.get(1)?,
        status: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(MatchStatus::Void),
        rng_seed: row.get::<_, i64>(3)? as u64,
        countdown_at: row.get(5)?,
        running_at: row.get(6)?,
        ended_at: row.get(7)?,
        end_reason: row.get(8)?,
        winner_id: winner.and_then(|w| w.parse().ok()),
        payout_amount: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        payout_tx_hash: row.get(11)?,
    })
}

fn row_to_match_player(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchPlayer> {
    let eliminated_by: Option<String> = row.get(6)?;
    Ok(MatchPlayer {
        match_id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        user_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        role: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(Role::Rock),
        spawn_x: row.get(3)?,
        spawn_y: row.get(4)?,
        eliminated_at: row.get(5)?,
        eliminated_by: eliminated_by.and_then(|id| id.parse().ok()),
        final_x: row.get(7)?,
        final_y: row.get(8)?,
    })
}

pub(crate) fn get_match_row(conn: &Connection, id: MatchId) -> Result<Option<MatchRow>> {
    conn.query_row(
        &format!("SELECT {} FROM matches WHERE id = ?1", MATCH_COLUMNS),
        params![id.to_string()],
        row_to_match,
    )
    .optional()
    .map_err(map_err)
}

impl Store {
    /// Create the match, its players and flip the lobby to `in_progress`
    /// in one transaction.
    pub async fn create_match(&self, new: &NewMatch, players: &[NewMatchPlayer]) -> Result<()> {
        let new = new.clone();
        let players = players.to_vec();
        self.with_txn(move |txn| {
            txn.execute(
                "INSERT INTO matches (id, lobby_id, status, rng_seed, buy_in, countdown_at)
                 VALUES (?1, ?2, 'countdown', ?3, ?4, ?5)",
                params![
                    new.id.to_string(),
                    new.lobby_id,
                    new.rng_seed as i64,
                    new.buy_in as i64,
                    Utc::now()
                ],
            )
            .map_err(map_err)?;
            for player in &players {
                txn.execute(
                    "INSERT INTO match_players (match_id, user_id, role, spawn_x, spawn_y)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        new.id.to_string(),
                        player.user_id.to_string(),
                        player.role.as_str(),
                        player.spawn_x,
                        player.spawn_y
                    ],
                )
                .map_err(map_err)?;
            }
            txn.execute(
                "UPDATE lobbies SET status = 'in_progress', current_match_id = ?1 WHERE id = ?2",
                params![new.id.to_string(), new.lobby_id],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn get_match(&self, id: MatchId) -> Result<Option<MatchRow>> {
        self.with_conn(move |conn| get_match_row(conn, id)).await
    }

    pub async fn set_match_running(&self, id: MatchId) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE matches SET status = 'running', running_at = ?1 WHERE id = ?2",
                params![Utc::now(), id.to_string()],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn match_players(&self, id: MatchId) -> Result<Vec<MatchPlayer>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT match_id, user_id, role, spawn_x, spawn_y, eliminated_at,
                            eliminated_by, final_x, final_y
                     FROM match_players WHERE match_id = ?1",
                )
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![id.to_string()], row_to_match_player)
                .map_err(map_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
        })
        .await
    }

    pub async fn record_elimination(
        &self,
        match_id: MatchId,
        user_id: UserId,
        eliminated_by: Option<UserId>,
        final_x: f64,
        final_y: f64,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE match_players
                 SET eliminated_at = ?1, eliminated_by = ?2, final_x = ?3, final_y = ?4
                 WHERE match_id = ?5 AND user_id = ?6",
                params![
                    Utc::now(),
                    eliminated_by.map(|id| id.to_string()),
                    final_x,
                    final_y,
                    match_id.to_string(),
                    user_id.to_string()
                ],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    /// Terminal success: match row, final positions, per-player stats and
    /// lobby reset, all in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_match(
        &self,
        id: MatchId,
        lobby_id: LobbyId,
        winner_id: UserId,
        payout_amount: Amount,
        payout_tx_hash: &str,
        reason: &str,
        outcomes: &[MatchOutcome],
        final_positions: &[(UserId, f64, f64)],
    ) -> Result<()> {
        let payout_tx_hash = payout_tx_hash.to_string();
        let reason = reason.to_string();
        let outcomes = outcomes.to_vec();
        let final_positions = final_positions.to_vec();
        self.with_txn(move |txn| {
            let changed = txn
                .execute(
                    "UPDATE matches
                     SET status = 'finished', ended_at = ?1, end_reason = ?2, winner_id = ?3,
                         payout_amount = ?4, payout_tx_hash = ?5
                     WHERE id = ?6 AND status NOT IN ('finished', 'void')",
                    params![
                        Utc::now(),
                        reason,
                        winner_id.to_string(),
                        payout_amount as i64,
                        payout_tx_hash,
                        id.to_string()
                    ],
                )
                .map_err(map_err)?;
            if changed == 0 {
                return Err(Error::InvariantViolation(format!(
                    "match {} already terminal",
                    id
                )));
            }
            for (user_id, x, y) in &final_positions {
                txn.execute(
                    "UPDATE match_players SET final_x = ?1, final_y = ?2
                     WHERE match_id = ?3 AND user_id = ?4 AND final_x IS NULL",
                    params![x, y, id.to_string(), user_id.to_string()],
                )
                .map_err(map_err)?;
            }
            for outcome in &outcomes {
                apply_match_outcome(txn, outcome)?;
            }
            // Stakes are consumed by settlement; the rows stay so the
            // UNIQUE tx-hash barrier outlives the lobby slot.
            txn.execute(
                "UPDATE lobby_players
                 SET refunded_at = ?1, refund_reason = 'match_settled'
                 WHERE lobby_id = ?2 AND refunded_at IS NULL",
                params![Utc::now(), lobby_id],
            )
            .map_err(map_err)?;
            crate::lobbies::reset_lobby_row(txn, lobby_id)?;
            Ok(())
        })
        .await
    }

    /// Recovery found the payout on chain: consume the stakes and free
    /// the lobby without issuing refunds.
    pub async fn consume_lobby_players(&self, lobby_id: LobbyId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.with_txn(move |txn| {
            txn.execute(
                "UPDATE lobby_players SET refunded_at = ?1, refund_reason = ?2
                 WHERE lobby_id = ?3 AND refunded_at IS NULL",
                params![Utc::now(), reason, lobby_id],
            )
            .map_err(map_err)?;
            crate::lobbies::reset_lobby_row(txn, lobby_id)?;
            Ok(())
        })
        .await
    }

    /// Terminal failure: the match is void; refunds are recorded separately
    /// per player as they complete.
    pub async fn void_match(&self, id: MatchId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE matches SET status = 'void', ended_at = ?1, end_reason = ?2
                 WHERE id = ?3 AND status NOT IN ('finished', 'void')",
                params![Utc::now(), reason, id.to_string()],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    /// Idempotency anchor for recovery: record a payout found on chain.
    pub async fn set_match_payout(
        &self,
        id: MatchId,
        winner_id: UserId,
        payout_amount: Amount,
        payout_tx_hash: &str,
    ) -> Result<()> {
        let payout_tx_hash = payout_tx_hash.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE matches
                 SET status = 'finished', ended_at = COALESCE(ended_at, ?1),
                     winner_id = ?2, payout_amount = ?3, payout_tx_hash = ?4
                 WHERE id = ?5",
                params![
                    Utc::now(),
                    winner_id.to_string(),
                    payout_amount as i64,
                    payout_tx_hash,
                    id.to_string()
                ],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn append_match_event(&self, event: &MatchEvent) -> Result<()> {
        let event = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO match_events (match_id, tick, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.match_id.to_string(),
                    event.tick as i64,
                    event.event_type,
                    event.payload.to_string(),
                    Utc::now()
                ],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn match_events(&self, match_id: MatchId) -> Result<Vec<MatchEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT match_id, tick, event_type, payload FROM match_events
                     WHERE match_id = ?1 ORDER BY id",
                )
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![match_id.to_string()], |row| {
                    let payload: String = row.get(3)?;
                    Ok(MatchEvent {
                        match_id: row
                            .get::<_, String>(0)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        tick: row.get::<_, i64>(1)? as u64,
                        event_type: row.get(2)?,
                        payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::Null),
                    })
                })
                .map_err(map_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
        })
        .await
    }

    /// Upsert the live snapshot.  Re-running with the same arguments
    /// leaves a row equal to the last call's arguments.
    pub async fn save_match_state(
        &self,
        match_id: MatchId,
        tick: u64,
        status: MatchStatus,
        state_json: &str,
    ) -> Result<()> {
        let state_json = state_json.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO match_state (match_id, version, tick, status, state_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(match_id) DO UPDATE SET
                   version = excluded.version,
                   tick = excluded.tick,
                   status = excluded.status,
                   state_json = excluded.state_json,
                   updated_at = excluded.updated_at",
                params![
                    match_id.to_string(),
                    CURRENT_STATE_VERSION,
                    tick as i64,
                    status.as_str(),
                    state_json,
                    Utc::now()
                ],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn get_match_state(&self, match_id: MatchId) -> Result<Option<MatchStateRow>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT match_id, version, tick, status, state_json, updated_at
                 FROM match_state WHERE match_id = ?1",
                params![match_id.to_string()],
                |row| {
                    Ok(MatchStateRow {
                        match_id: row
                            .get::<_, String>(0)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        version: row.get::<_, i64>(1)? as u32,
                        tick: row.get::<_, i64>(2)? as u64,
                        status: row
                            .get::<_, String>(3)?
                            .parse()
                            .unwrap_or(MatchStatus::Void),
                        state_json: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }

    pub async fn delete_match_state(&self, match_id: MatchId) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM match_state WHERE match_id = ?1",
                params![match_id.to_string()],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    /// Matches left non-terminal by a previous process.
    pub async fn interrupted_matches(&self) -> Result<Vec<InterruptedMatch>> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM matches
                         WHERE status IN ('countdown', 'running', 'ending')",
                        MATCH_COLUMNS
                    ))
                    .map_err(map_err)?;
                let rows = stmt.query_map([], row_to_match).map_err(map_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
            })
            .await?;
        let mut interrupted = Vec::with_capacity(rows.len());
        for row in rows {
            let state = self.get_match_state(row.id).await?;
            interrupted.push(InterruptedMatch { row, state });
        }
        Ok(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_core::types::{Address, LobbyStatus, TxHash};

    async fn seeded_store() -> (Store, Vec<UserId>) {
        let store = Store::try_new_mem().unwrap();
        store
            .ensure_lobby(1, &Address::from_raw("0xlobby1"), "enc")
            .await
            .unwrap();
        let mut users = Vec::new();
        for tail in 1..=3u8 {
            let user = store
                .get_or_create_user(&Address::parse(&format!("0x{:040x}", tail)).unwrap())
                .await
                .unwrap();
            store
                .insert_lobby_player(1, user.id, &TxHash::new(format!("0xdev_{}", tail)), 600)
                .await
                .unwrap();
            users.push(user.id);
        }
        (store, users)
    }

    fn new_match(lobby_id: LobbyId) -> NewMatch {
        NewMatch {
            id: Uuid::new_v4(),
            lobby_id,
            rng_seed: 0xdead_beef,
            buy_in: 1_000_000,
        }
    }

    fn players(users: &[UserId]) -> Vec<NewMatchPlayer> {
        users
            .iter()
            .zip(Role::ALL)
            .map(|(user_id, role)| NewMatchPlayer {
                user_id: *user_id,
                role,
                spawn_x: 100.0,
                spawn_y: 100.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn create_match_flips_lobby_atomically() {
        let (store, users) = seeded_store().await;
        let new = new_match(1);
        store.create_match(&new, &players(&users)).await.unwrap();

        let lobby = store.get_lobby(1).await.unwrap().unwrap();
        assert_eq!(lobby.status, LobbyStatus::InProgress);
        assert_eq!(lobby.current_match_id, Some(new.id));

        let row = store.get_match(new.id).await.unwrap().unwrap();
        assert_eq!(row.status, MatchStatus::Countdown);
        assert_eq!(row.rng_seed, 0xdead_beef);
        assert_eq!(store.match_players(new.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn match_state_upsert_is_idempotent() {
        let (store, users) = seeded_store().await;
        let new = new_match(1);
        store.create_match(&new, &players(&users)).await.unwrap();

        store
            .save_match_state(new.id, 10, MatchStatus::Running, r#"{"tick":10}"#)
            .await
            .unwrap();
        store
            .save_match_state(new.id, 15, MatchStatus::Running, r#"{"tick":15}"#)
            .await
            .unwrap();
        let state = store.get_match_state(new.id).await.unwrap().unwrap();
        assert_eq!(state.tick, 15);
        assert_eq!(state.version, CURRENT_STATE_VERSION);
        assert_eq!(state.state_json, r#"{"tick":15}"#);

        store
            .save_match_state(new.id, 15, MatchStatus::Running, r#"{"tick":15}"#)
            .await
            .unwrap();
        let again = store.get_match_state(new.id).await.unwrap().unwrap();
        assert_eq!(again.tick, 15);
        assert_eq!(again.state_json, state.state_json);

        store.delete_match_state(new.id).await.unwrap();
        assert!(store.get_match_state(new.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupted_matches_surface_with_state() {
        let (store, users) = seeded_store().await;
        let new = new_match(1);
        store.create_match(&new, &players(&users)).await.unwrap();
        store.set_match_running(new.id).await.unwrap();
        store
            .save_match_state(new.id, 412, MatchStatus::Running, r#"{"tick":412}"#)
            .await
            .unwrap();

        let interrupted = store.interrupted_matches().await.unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].row.id, new.id);
        assert_eq!(interrupted[0].state.as_ref().unwrap().tick, 412);

        store.void_match(new.id, "server_restart").await.unwrap();
        assert!(store.interrupted_matches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_match_is_terminal_once() {
        let (store, users) = seeded_store().await;
        let new = new_match(1);
        store.create_match(&new, &players(&users)).await.unwrap();
        store.set_match_running(new.id).await.unwrap();

        store
            .finish_match(
                new.id,
                1,
                users[0],
                2_400_000,
                "0xpayout",
                "last_standing",
                &[],
                &[(users[0], 400.0, 300.0)],
            )
            .await
            .unwrap();

        let row = store.get_match(new.id).await.unwrap().unwrap();
        assert_eq!(row.status, MatchStatus::Finished);
        assert_eq!(row.winner_id, Some(users[0]));
        assert_eq!(row.payout_tx_hash.as_deref(), Some("0xpayout"));
        assert_eq!(store.get_lobby(1).await.unwrap().unwrap().status, LobbyStatus::Empty);

        // Terminal states are immutable.
        let err = store
            .finish_match(new.id, 1, users[1], 0, "0xother", "x", &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn event_log_appends_in_order() {
        let (store, users) = seeded_store().await;
        let new = new_match(1);
        store.create_match(&new, &players(&users)).await.unwrap();
        for (tick, event_type) in [(0, "start"), (150, "elimination"), (400, "end")] {
            store
                .append_match_event(&MatchEvent {
                    match_id: new.id,
                    tick,
                    event_type: event_type.to_string(),
                    payload: serde_json::json!({ "tick": tick }),
                })
                .await
                .unwrap();
        }
        let events = store.match_events(new.id).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, "start");
        assert_eq!(events[2].tick, 400);
    }
}
