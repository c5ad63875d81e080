//! Webhook alert sink.
//!
//! Fire-and-forget POSTs to the configured webhook URLs.  Repeat alerts
//! can be throttled by key so a stuck lobby pages once a day, not once a
//! sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    fn tag(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

pub struct AlertSink {
    client: reqwest::Client,
    urls: Vec<String>,
    throttle: Mutex<HashMap<String, Instant>>,
}

impl AlertSink {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls,
            throttle: Mutex::new(HashMap::new()),
        }
    }

    pub async fn send(&self, level: AlertLevel, title: &str, body: &str) {
        match level {
            AlertLevel::Critical => error!(title, body, "alert"),
            AlertLevel::Warning => warn!(title, body, "alert"),
            AlertLevel::Info => info!(title, body, "alert"),
        }
        let content = format!("[{}] {}\n{}", level.tag(), title, body);
        for url in &self.urls {
            let result = self
                .client
                .post(url)
                .json(&json!({ "content": content }))
                .send()
                .await;
            if let Err(e) = result {
                warn!(url, error = %e, "failed to deliver alert");
            }
        }
    }

    /// Send at most once per `min_interval` for a given key.
    pub async fn send_throttled(
        &self,
        key: &str,
        min_interval: Duration,
        level: AlertLevel,
        title: &str,
        body: &str,
    ) {
        {
            let mut throttle = self.throttle.lock().unwrap();
            if let Some(last) = throttle.get(key) {
                if last.elapsed() < min_interval {
                    return;
                }
            }
            throttle.insert(key.to_string(), Instant::now());
        }
        self.send(level, title, body).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn throttle_suppresses_repeats() {
        // No URLs configured: send is a logging no-op, throttling still applies.
        let sink = AlertSink::new(vec![]);
        sink.send_throttled(
            "lobby-1",
            Duration::from_secs(3600),
            AlertLevel::Warning,
            "stuck",
            "lobby 1",
        )
        .await;
        {
            let throttle = sink.throttle.lock().unwrap();
            assert!(throttle.contains_key("lobby-1"));
        }
        // A second call inside the window keeps the original stamp.
        let before = *sink.throttle.lock().unwrap().get("lobby-1").unwrap();
        sink.send_throttled(
            "lobby-1",
            Duration::from_secs(3600),
            AlertLevel::Warning,
            "stuck",
            "lobby 1",
        )
        .await;
        let after = *sink.throttle.lock().unwrap().get("lobby-1").unwrap();
        assert_eq!(before, after);
    }
}
