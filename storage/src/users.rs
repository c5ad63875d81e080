//! Users and sessions.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use arena_core::error::{Error, Result};
use arena_core::types::{Address, Session, User, UserId};

use crate::{map_err, Store};

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        wallet: Address::from_raw(row.get::<_, String>(1)?),
        display_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row
            .get::<_, String>(0)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        user_id: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or_else(|_| Uuid::nil()),
        token: row.get(2)?,
        expires_at: row.get(3)?,
    })
}

pub(crate) fn get_user_by_id(conn: &Connection, id: UserId) -> Result<Option<User>> {
    conn.query_row(
        "SELECT id, wallet, display_name, created_at FROM users WHERE id = ?1",
        params![id.to_string()],
        row_to_user,
    )
    .optional()
    .map_err(map_err)
}

impl Store {
    /// Find or create the user for a wallet; called on first login.
    pub async fn get_or_create_user(&self, wallet: &Address) -> Result<User> {
        let wallet = wallet.clone();
        self.with_txn(move |txn| {
            let existing = txn
                .query_row(
                    "SELECT id, wallet, display_name, created_at FROM users WHERE wallet = ?1",
                    params![wallet.as_str()],
                    row_to_user,
                )
                .optional()
                .map_err(map_err)?;
            if let Some(user) = existing {
                return Ok(user);
            }
            let user = User {
                id: Uuid::new_v4(),
                wallet: wallet.clone(),
                display_name: None,
                created_at: Utc::now(),
            };
            txn.execute(
                "INSERT INTO users (id, wallet, display_name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    user.id.to_string(),
                    user.wallet.as_str(),
                    user.display_name,
                    user.created_at
                ],
            )
            .map_err(map_err)?;
            Ok(user)
        })
        .await
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.with_conn(move |conn| get_user_by_id(conn, id)).await
    }

    pub async fn get_user_by_wallet(&self, wallet: &Address) -> Result<Option<User>> {
        let wallet = wallet.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, wallet, display_name, created_at FROM users WHERE wallet = ?1",
                params![wallet.as_str()],
                row_to_user,
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }

    pub async fn create_session(
        &self,
        user_id: UserId,
        token: &str,
        ttl_secs: i64,
    ) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            token: token.to_string(),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
        };
        let inserted = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, token, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    inserted.id.to_string(),
                    inserted.user_id.to_string(),
                    inserted.token,
                    inserted.expires_at
                ],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await?;
        Ok(session)
    }

    pub async fn get_session_by_token(&self, token: &str) -> Result<Option<Session>> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, user_id, token, expires_at FROM sessions WHERE token = ?1",
                params![token],
                row_to_session,
            )
            .optional()
            .map_err(map_err)
        })
        .await
    }

    /// Replace the token of a session.  The old token is invalid as soon
    /// as this returns.
    pub async fn rotate_session(&self, session_id: Uuid, new_token: &str) -> Result<()> {
        let new_token = new_token.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET token = ?1 WHERE id = ?2",
                    params![new_token, session_id.to_string()],
                )
                .map_err(map_err)?;
            if changed == 0 {
                return Err(Error::InvalidSession);
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_session(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
                .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    pub async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])
                .map_err(map_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(tail: u8) -> Address {
        Address::parse(&format!("0x{:040x}", tail)).unwrap()
    }

    #[tokio::test]
    async fn user_creation_is_idempotent_per_wallet() {
        let store = Store::try_new_mem().unwrap();
        let first = store.get_or_create_user(&wallet(1)).await.unwrap();
        let second = store.get_or_create_user(&wallet(1)).await.unwrap();
        assert_eq!(first.id, second.id);
        let other = store.get_or_create_user(&wallet(2)).await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let store = Store::try_new_mem().unwrap();
        let user = store.get_or_create_user(&wallet(1)).await.unwrap();
        let session = store.create_session(user.id, "tok-1", 3600).await.unwrap();

        let found = store.get_session_by_token("tok-1").await.unwrap().unwrap();
        assert_eq!(found.user_id, user.id);

        store.rotate_session(session.id, "tok-2").await.unwrap();
        assert!(store.get_session_by_token("tok-1").await.unwrap().is_none());
        assert!(store.get_session_by_token("tok-2").await.unwrap().is_some());

        store.delete_session("tok-2").await.unwrap();
        assert!(store.get_session_by_token("tok-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let store = Store::try_new_mem().unwrap();
        let user = store.get_or_create_user(&wallet(1)).await.unwrap();
        store.create_session(user.id, "stale", -10).await.unwrap();
        store.create_session(user.id, "fresh", 3600).await.unwrap();
        let removed = store.delete_expired_sessions(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_session_by_token("fresh").await.unwrap().is_some());
    }
}
