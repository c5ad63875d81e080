//! Active match registry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use arena_core::types::{LobbyId, MatchId, MatchStatus, UserId};

use crate::component::PortsHandle;
use crate::frame::EventFrame;

/// The few fields of a running match other tasks may read or flip:
/// status for cooperative cancellation, tick and last-tick time for the
/// stall detector.
pub struct MatchShared {
    status: AtomicU8,
    tick: AtomicU64,
    last_tick_ms: AtomicU64,
}

impl MatchShared {
    pub fn new(status: MatchStatus, now_ms: u64) -> Self {
        Self {
            status: AtomicU8::new(encode_status(status)),
            tick: AtomicU64::new(0),
            last_tick_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn status(&self) -> MatchStatus {
        decode_status(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: MatchStatus) {
        self.status.store(encode_status(status), Ordering::Release);
    }

    /// Flip running -> ending; returns false when someone else got there
    /// first (or the match never reached running).
    pub fn begin_ending(&self) -> bool {
        self.status
            .compare_exchange(
                encode_status(MatchStatus::Running),
                encode_status(MatchStatus::Ending),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn record_tick(&self, tick: u64, now_ms: u64) {
        self.tick.store(tick, Ordering::Release);
        self.last_tick_ms.store(now_ms, Ordering::Release);
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub fn last_tick_ms(&self) -> u64 {
        self.last_tick_ms.load(Ordering::Acquire)
    }
}

fn encode_status(status: MatchStatus) -> u8 {
    match status {
        MatchStatus::Countdown => 0,
        MatchStatus::Running => 1,
        MatchStatus::Ending => 2,
        MatchStatus::Finished => 3,
        MatchStatus::Void => 4,
    }
}

fn decode_status(value: u8) -> MatchStatus {
    match value {
        0 => MatchStatus::Countdown,
        1 => MatchStatus::Running,
        2 => MatchStatus::Ending,
        3 => MatchStatus::Finished,
        _ => MatchStatus::Void,
    }
}

pub struct MatchHandle {
    pub match_id: MatchId,
    pub lobby_id: LobbyId,
    pub players: Vec<UserId>,
    pub shared: Arc<MatchShared>,
    pub ports: PortsHandle,
}

#[derive(Debug, Clone)]
pub struct MatchHealth {
    pub match_id: MatchId,
    pub lobby_id: LobbyId,
    pub status: MatchStatus,
    pub tick: u64,
    pub last_tick_age_ms: u64,
}

#[derive(Default)]
pub struct MatchManager {
    matches: Mutex<HashMap<MatchId, Arc<MatchHandle>>>,
}

impl MatchManager {
    /// Register a launched match.  Refuses duplicates.
    pub async fn insert(&self, handle: MatchHandle) -> bool {
        let mut matches = self.matches.lock().await;
        match matches.entry(handle.match_id) {
            Entry::Vacant(slot) => {
                info!("Match handle registered: {}", handle.match_id);
                slot.insert(Arc::new(handle));
                true
            }
            Entry::Occupied(_) => {
                warn!("Match {} already loaded", handle.match_id);
                false
            }
        }
    }

    pub async fn remove(&self, match_id: MatchId) {
        let mut matches = self.matches.lock().await;
        if matches.remove(&match_id).is_some() {
            info!("Match handle removed: {}", match_id);
        }
    }

    pub async fn get(&self, match_id: MatchId) -> Option<Arc<MatchHandle>> {
        self.matches.lock().await.get(&match_id).cloned()
    }

    pub async fn find_for_user(&self, user_id: UserId) -> Option<Arc<MatchHandle>> {
        self.matches
            .lock()
            .await
            .values()
            .find(|h| h.players.contains(&user_id))
            .cloned()
    }

    pub async fn send_frame(&self, match_id: MatchId, frame: EventFrame) -> bool {
        match self.get(match_id).await {
            Some(handle) => {
                handle.ports.send(frame).await;
                true
            }
            None => false,
        }
    }

    pub async fn active(&self) -> Vec<Arc<MatchHandle>> {
        self.matches.lock().await.values().cloned().collect()
    }

    pub async fn health_snapshot(&self, now_ms: u64) -> Vec<MatchHealth> {
        self.active()
            .await
            .into_iter()
            .map(|h| MatchHealth {
                match_id: h.match_id,
                lobby_id: h.lobby_id,
                status: h.shared.status(),
                tick: h.shared.tick(),
                last_tick_age_ms: now_ms.saturating_sub(h.shared.last_tick_ms()),
            })
            .collect()
    }

    /// Ask every active match to stop for a server restart.
    pub async fn shutdown_all(&self) {
        for handle in self.active().await {
            handle.ports.send(EventFrame::Shutdown).await;
        }
    }
}

/// Milliseconds since the Unix epoch; the simulation clock.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_ending_is_one_shot() {
        let shared = MatchShared::new(MatchStatus::Running, 0);
        assert!(shared.begin_ending());
        assert!(!shared.begin_ending());
        assert_eq!(shared.status(), MatchStatus::Ending);
    }

    #[test]
    fn status_round_trips_through_atomic() {
        for status in [
            MatchStatus::Countdown,
            MatchStatus::Running,
            MatchStatus::Ending,
            MatchStatus::Finished,
            MatchStatus::Void,
        ] {
            let shared = MatchShared::new(status, 0);
            assert_eq!(shared.status(), status);
        }
    }
}
