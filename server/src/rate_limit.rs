//! Token buckets and per-IP connection accounting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Refilling token bucket; capacity doubles as the per-second rate.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_second(rate: u32) -> Self {
        Self {
            capacity: rate as f64,
            tokens: rate as f64,
            refill_per_sec: rate as f64,
            last_refill: Instant::now(),
        }
    }

    pub fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct IpEntry {
    connections: usize,
    last_seen: Instant,
}

/// Concurrent-connection cap per source address.  Entries idle for an
/// hour or at zero connections are swept periodically.
pub struct IpGuard {
    max_per_ip: usize,
    entries: Mutex<HashMap<IpAddr, IpEntry>>,
}

impl IpGuard {
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            max_per_ip,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(ip).or_insert(IpEntry {
            connections: 0,
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        if entry.connections >= self.max_per_ip {
            return false;
        }
        entry.connections += 1;
        true
    }

    pub fn release(&self, ip: IpAddr) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&ip) {
            entry.connections = entry.connections.saturating_sub(1);
            entry.last_seen = Instant::now();
        }
    }

    /// Drop idle and empty entries.
    pub fn sweep(&self, idle_for: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.connections > 0 && entry.last_seen.elapsed() < idle_for
        });
        before - entries.len()
    }

    pub fn tracked_ips(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_and_refills() {
        let mut bucket = TokenBucket::per_second(10);
        for _ in 0..10 {
            assert!(bucket.try_take());
        }
        assert!(!bucket.try_take());
        // Manually age the bucket past one refill period.
        bucket.last_refill = Instant::now() - Duration::from_secs(1);
        assert!(bucket.try_take());
    }

    #[test]
    fn ip_guard_caps_concurrent_connections() {
        let guard = IpGuard::new(3);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(guard.try_acquire(ip));
        assert!(guard.try_acquire(ip));
        assert!(guard.try_acquire(ip));
        assert!(!guard.try_acquire(ip));
        guard.release(ip);
        assert!(guard.try_acquire(ip));
    }

    #[test]
    fn sweep_removes_idle_entries() {
        let guard = IpGuard::new(3);
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        guard.try_acquire(ip);
        guard.release(ip);
        assert_eq!(guard.tracked_ips(), 1);
        assert_eq!(guard.sweep(Duration::from_secs(3600)), 1);
        assert_eq!(guard.tracked_ips(), 0);
    }
}
