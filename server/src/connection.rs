//! Live WebSocket connection registry.
//!
//! Each connection owns its socket; everyone else reaches it through the
//! outbound channel registered here.  A match task holds a
//! [`MatchBroadcaster`] scoped to its three players and never touches the
//! socket directly.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use arena_core::protocol::ServerMessage;
use arena_core::types::UserId;

/// What the session send-loop writes to the socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(ServerMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub user_id: UserId,
    pub ip: IpAddr,
    pub tx: mpsc::Sender<Outbound>,
    pub last_rtt_ms: Arc<AtomicU64>,
}

impl ConnectionHandle {
    /// Non-blocking: a slow client loses frames, never stalls a tick.
    pub async fn send(&self, msg: ServerMessage) -> bool {
        self.tx.try_send(Outbound::Frame(msg)).is_ok()
    }

    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .tx
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<HashMap<UserId, ConnectionHandle>>,
    next_conn_id: AtomicU64,
}

impl ConnectionTable {
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a connection, returning the handle it replaced for the
    /// same user, if any.  The caller closes the old one with 1008.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock().await;
        inner.insert(handle.user_id, handle)
    }

    /// Remove only if the entry still belongs to this connection; a newer
    /// connection of the same user must not be evicted by a stale close.
    pub async fn remove_if_current(&self, user_id: UserId, conn_id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.get(&user_id).map(|h| h.conn_id) == Some(conn_id) {
            inner.remove(&user_id);
        }
    }

    pub async fn get(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.inner.lock().await.get(&user_id).cloned()
    }

    pub async fn is_connected(&self, user_id: UserId) -> bool {
        self.inner.lock().await.contains_key(&user_id)
    }

    pub async fn send_to(&self, user_id: UserId, msg: ServerMessage) -> bool {
        match self.get(user_id).await {
            Some(handle) => handle.send(msg).await,
            None => false,
        }
    }

    pub async fn broadcast_all(&self, msg: &ServerMessage) {
        let handles: Vec<ConnectionHandle> =
            self.inner.lock().await.values().cloned().collect();
        for handle in handles {
            if !handle.send(msg.clone()).await {
                debug!(user = %handle.user_id, "dropping broadcast to dead connection");
            }
        }
    }

    pub async fn close_all(&self, code: u16, reason: &str) {
        let handles: Vec<ConnectionHandle> =
            self.inner.lock().await.values().cloned().collect();
        for handle in handles {
            handle.close(code, reason).await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Fan-out scoped to one match's players.
#[derive(Clone)]
pub struct MatchBroadcaster {
    connections: Arc<ConnectionTable>,
    players: Vec<UserId>,
}

impl MatchBroadcaster {
    pub fn new(connections: Arc<ConnectionTable>, players: Vec<UserId>) -> Self {
        Self {
            connections,
            players,
        }
    }

    pub async fn broadcast(&self, msg: &ServerMessage) {
        for user_id in &self.players {
            self.connections.send_to(*user_id, msg.clone()).await;
        }
    }

    pub async fn send_to(&self, user_id: UserId, msg: ServerMessage) -> bool {
        self.connections.send_to(user_id, msg).await
    }

    pub fn players(&self) -> &[UserId] {
        &self.players
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn handle(table: &ConnectionTable, user_id: UserId) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (
            ConnectionHandle {
                conn_id: table.next_conn_id(),
                user_id,
                ip: "127.0.0.1".parse().unwrap(),
                tx,
                last_rtt_ms: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn register_replaces_previous_connection() {
        let table = ConnectionTable::default();
        let user = Uuid::new_v4();
        let (first, _rx1) = handle(&table, user);
        let first_id = first.conn_id;
        assert!(table.register(first).await.is_none());
        let (second, _rx2) = handle(&table, user);
        let replaced = table.register(second).await.unwrap();
        assert_eq!(replaced.conn_id, first_id);
    }

    #[tokio::test]
    async fn stale_close_does_not_evict_newer_connection() {
        let table = ConnectionTable::default();
        let user = Uuid::new_v4();
        let (first, _rx1) = handle(&table, user);
        let first_id = first.conn_id;
        table.register(first).await;
        let (second, _rx2) = handle(&table, user);
        table.register(second).await;

        table.remove_if_current(user, first_id).await;
        assert!(table.is_connected(user).await);
    }

    #[tokio::test]
    async fn broadcaster_reaches_only_its_players() {
        let table = Arc::new(ConnectionTable::default());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (ha, mut rx_a) = handle(&table, alice);
        let (hb, mut rx_b) = handle(&table, bob);
        table.register(ha).await;
        table.register(hb).await;

        let broadcaster = MatchBroadcaster::new(table.clone(), vec![alice]);
        broadcaster
            .broadcast(&ServerMessage::Countdown { seconds: 3 })
            .await;

        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Frame(_))));
        assert!(rx_b.try_recv().is_err());
    }
}
