//! Transactional persistence on rusqlite.
//!
//! One connection behind an async mutex, WAL mode, explicit transactions
//! with `SQLITE_BUSY` retry.  Multi-step invariants (match creation, match
//! settlement, refunds) are exposed as composite operations that run in a
//! single transaction.

mod backup;
mod lobbies;
mod matches;
mod payouts;
mod schema;
mod stats;
mod users;

pub use matches::{InterruptedMatch, NewMatch, NewMatchPlayer, COMPATIBLE_STATE_VERSIONS, CURRENT_STATE_VERSION};
pub use stats::MatchOutcome;

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::warn;

use arena_core::error::{Error, Result};

const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(50);

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<String>,
}

impl Store {
    pub fn try_new(db_file_path: &str) -> Result<Self> {
        let conn = Connection::open(db_file_path).map_err(map_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_err)?;
        schema::init_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(db_file_path.to_string()),
        })
    }

    pub fn try_new_mem() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_err)?;
        schema::init_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(map_err)
    }

    /// Run `f` inside one transaction, retrying the whole closure when
    /// SQLite reports the database busy.
    pub(crate) async fn with_txn<T>(
        &self,
        f: impl Fn(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let mut backoff = BUSY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = {
                let txn = conn.transaction().map_err(map_err)?;
                match f(&txn) {
                    Ok(value) => {
                        txn.commit().map_err(map_err)?;
                        Ok(value)
                    }
                    Err(e) => {
                        drop(txn);
                        Err(e)
                    }
                }
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if is_busy(&e) && attempt <= BUSY_RETRIES {
                        warn!(attempt, "database busy, retrying transaction");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    pub(crate) async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}

pub(crate) fn map_err(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(f, ref message) = e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation
            && message
                .as_deref()
                .map(|m| m.contains("payment_tx_hash"))
                .unwrap_or(false)
        {
            return Error::DuplicateTxHash;
        }
    }
    Error::StorageError(e.to_string())
}

fn is_busy(e: &Error) -> bool {
    match e {
        Error::StorageError(message) => {
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_on_fresh_store() {
        let store = Store::try_new_mem().unwrap();
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn txn_rolls_back_on_error() {
        let store = Store::try_new_mem().unwrap();
        let result: Result<()> = store
            .with_txn(|txn| {
                txn.execute(
                    "INSERT INTO paid_wallets (wallet, first_payment_at, total_payments, last_payment_at)
                     VALUES ('0xaa', datetime('now'), 1, datetime('now'))",
                    [],
                )
                .map_err(map_err)?;
                Err(Error::InternalError("boom".into()))
            })
            .await;
        assert!(result.is_err());
        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM paid_wallets", [], |row| row.get(0))
                    .map_err(map_err)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
