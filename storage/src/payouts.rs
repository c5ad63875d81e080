//! Payout attempt audit trail.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use arena_core::error::Result;
use arena_core::types::{Address, Amount, LobbyId, MatchId, PayoutAttempt, PayoutSource, PayoutStatus};

use crate::{map_err, Store};

impl Store {
    /// Log a `pending` attempt before the transfer goes out.
    pub async fn create_payout_attempt(
        &self,
        match_id: MatchId,
        lobby_id: LobbyId,
        recipient: &Address,
        amount: Amount,
        source_wallet: PayoutSource,
    ) -> Result<Uuid> {
        let recipient = recipient.clone();
        self.with_txn(move |txn| {
            let attempt_number: i64 = txn
                .query_row(
                    "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM payout_attempts
                     WHERE match_id = ?1 AND recipient = ?2",
                    params![match_id.to_string(), recipient.as_str()],
                    |row| row.get(0),
                )
                .map_err(map_err)?;
            let id = Uuid::new_v4();
            txn.execute(
                "INSERT INTO payout_attempts
                   (id, match_id, lobby_id, recipient, amount, attempt_number, status,
                    source_wallet, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
                params![
                    id.to_string(),
                    match_id.to_string(),
                    lobby_id,
                    recipient.as_str(),
                    amount as i64,
                    attempt_number,
                    source_wallet.as_str(),
                    Utc::now()
                ],
            )
            .map_err(map_err)?;
            Ok(id)
        })
        .await
    }

    pub async fn mark_payout_success(&self, id: Uuid, tx_hash: &str) -> Result<()> {
        let tx_hash = tx_hash.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE payout_attempts SET status = 'success', tx_hash = ?1 WHERE id = ?2",
                params![tx_hash, id.to_string()],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn mark_payout_failed(&self, id: Uuid, error: &str, error_type: &str) -> Result<()> {
        let error = error.to_string();
        let error_type = error_type.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE payout_attempts SET status = 'failed', error = ?1, error_type = ?2
                 WHERE id = ?3",
                params![error, error_type, id.to_string()],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn payout_attempts_for_match(&self, match_id: MatchId) -> Result<Vec<PayoutAttempt>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, match_id, lobby_id, recipient, amount, attempt_number, status,
                            source_wallet, tx_hash, error, error_type, created_at
                     FROM payout_attempts WHERE match_id = ?1 ORDER BY created_at",
                )
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![match_id.to_string()], |row| {
                    Ok(PayoutAttempt {
                        id: row
                            .get::<_, String>(0)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        match_id: row
                            .get::<_, String>(1)?
                            .parse()
                            .unwrap_or_else(|_| Uuid::nil()),
                        lobby_id: row.get(2)?,
                        recipient: Address::from_raw(row.get::<_, String>(3)?),
                        amount: row.get::<_, i64>(4)? as u64,
                        attempt_number: row.get::<_, i64>(5)? as u32,
                        status: row
                            .get::<_, String>(6)?
                            .parse()
                            .unwrap_or(PayoutStatus::Failed),
                        source_wallet: row
                            .get::<_, String>(7)?
                            .parse()
                            .unwrap_or(PayoutSource::Lobby),
                        tx_hash: row.get(8)?,
                        error: row.get(9)?,
                        error_type: row.get(10)?,
                        created_at: row.get(11)?,
                    })
                })
                .map_err(map_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)
        })
        .await
    }

    /// Successful rows can be expired; failed rows are kept for operators.
    pub async fn expire_successful_payout_attempts(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM payout_attempts WHERE status = 'success' AND created_at <= ?1",
                params![older_than],
            )
            .map_err(map_err)
        })
        .await
    }

    pub async fn latest_successful_payout(&self, match_id: MatchId) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT tx_hash FROM payout_attempts
                 WHERE match_id = ?1 AND status = 'success' AND tx_hash IS NOT NULL
                 ORDER BY created_at DESC LIMIT 1",
                params![match_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }
}
