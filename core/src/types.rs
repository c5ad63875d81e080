//! Shared identifiers, monetary units and entity rows.
//!
//! Monetary amounts are integer minor units of the stablecoin (6 decimals).
//! Times are absolute UTC instants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use arena_physics::Role;

use crate::error::{Error, Result};

pub type UserId = Uuid;
pub type MatchId = Uuid;
pub type LobbyId = u32;

/// Integer minor units, 6 decimals.
pub type Amount = u64;

/// A lowercased hex account address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Parse a strict `0x` + 40 hex digit address, normalizing case.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let hex_part = s
            .strip_prefix("0x")
            .ok_or_else(|| Error::MalformedMessage(format!("bad address: {}", s)))?;
        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::MalformedMessage(format!("bad address: {}", s)));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Accept any derived or dev address, normalizing case only.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payment transaction hash as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// `0x` followed by exactly 64 hex digits.
    pub fn is_onchain_format(&self) -> bool {
        match self.0.strip_prefix("0x") {
            Some(rest) => rest.len() == 64 && rest.chars().all(|c| c.is_ascii_hexdigit()),
            None => false,
        }
    }

    /// `0x` followed by `dev_` or `bot_tx_` and word characters; accepted
    /// only on the admin profile.
    pub fn is_dev_format(&self) -> bool {
        let Some(rest) = self.0.strip_prefix("0x") else {
            return false;
        };
        let tail = rest
            .strip_prefix("dev_")
            .or_else(|| rest.strip_prefix("bot_tx_"));
        match tail {
            Some(tail) => {
                !tail.is_empty() && tail.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub wallet: Address,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub user_id: UserId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyStatus {
    Empty,
    Waiting,
    Ready,
    InProgress,
}

impl LobbyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LobbyStatus::Empty => "empty",
            LobbyStatus::Waiting => "waiting",
            LobbyStatus::Ready => "ready",
            LobbyStatus::InProgress => "in_progress",
        }
    }
}

impl std::str::FromStr for LobbyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "empty" => Ok(LobbyStatus::Empty),
            "waiting" => Ok(LobbyStatus::Waiting),
            "ready" => Ok(LobbyStatus::Ready),
            "in_progress" => Ok(LobbyStatus::InProgress),
            other => Err(Error::StorageError(format!("bad lobby status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lobby {
    pub id: LobbyId,
    pub status: LobbyStatus,
    pub deposit_address: Address,
    pub encrypted_deposit_key: String,
    pub first_join_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub current_match_id: Option<MatchId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyPlayer {
    pub id: Uuid,
    pub lobby_id: LobbyId,
    pub user_id: UserId,
    pub payment_tx_hash: TxHash,
    pub joined_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refund_reason: Option<String>,
    pub refund_tx_hash: Option<String>,
}

impl LobbyPlayer {
    /// A player occupies a lobby slot until refunded.
    pub fn is_active(&self) -> bool {
        self.refunded_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Countdown,
    Running,
    /// Settlement in progress.  Never persisted, never shown to clients.
    Ending,
    Finished,
    Void,
}

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Finished | MatchStatus::Void)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Countdown => "countdown",
            MatchStatus::Running => "running",
            MatchStatus::Ending => "ending",
            MatchStatus::Finished => "finished",
            MatchStatus::Void => "void",
        }
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "countdown" => Ok(MatchStatus::Countdown),
            "running" => Ok(MatchStatus::Running),
            "ending" => Ok(MatchStatus::Ending),
            "finished" => Ok(MatchStatus::Finished),
            "void" => Ok(MatchStatus::Void),
            other => Err(Error::StorageError(format!("bad match status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRow {
    pub id: MatchId,
    pub lobby_id: LobbyId,
    pub status: MatchStatus,
    pub rng_seed: u64,
    pub countdown_at: DateTime<Utc>,
    pub running_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub winner_id: Option<UserId>,
    pub payout_amount: Option<Amount>,
    pub payout_tx_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchPlayer {
    pub match_id: MatchId,
    pub user_id: UserId,
    pub role: Role,
    pub spawn_x: f64,
    pub spawn_y: f64,
    pub eliminated_at: Option<DateTime<Utc>>,
    pub eliminated_by: Option<UserId>,
    pub final_x: Option<f64>,
    pub final_y: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    pub match_id: MatchId,
    pub tick: u64,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchStateRow {
    pub match_id: MatchId,
    pub version: u32,
    pub tick: u64,
    pub status: MatchStatus,
    pub state_json: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Success,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Success => "success",
            PayoutStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PayoutStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "success" => Ok(PayoutStatus::Success),
            "failed" => Ok(PayoutStatus::Failed),
            other => Err(Error::StorageError(format!("bad payout status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutSource {
    Lobby,
    Treasury,
}

impl PayoutSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutSource::Lobby => "lobby",
            PayoutSource::Treasury => "treasury",
        }
    }
}

impl std::str::FromStr for PayoutSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lobby" => Ok(PayoutSource::Lobby),
            "treasury" => Ok(PayoutSource::Treasury),
            other => Err(Error::StorageError(format!("bad payout source: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutAttempt {
    pub id: Uuid,
    pub match_id: MatchId,
    pub lobby_id: LobbyId,
    pub recipient: Address,
    pub amount: Amount,
    pub attempt_number: u32,
    pub status: PayoutStatus,
    pub source_wallet: PayoutSource,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub wallet: Address,
    pub matches_played: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_earnings: Amount,
    pub total_spent: Amount,
    pub current_win_streak: u64,
    pub best_win_streak: u64,
    pub first_match_at: DateTime<Utc>,
    pub last_match_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidWallet {
    pub wallet: Address,
    pub first_payment_at: DateTime<Utc>,
    pub total_payments: u64,
    pub last_payment_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_normalizes_case() {
        let addr = Address::parse("0xAbCd000000000000000000000000000000001234").unwrap();
        assert_eq!(addr.as_str(), "0xabcd000000000000000000000000000000001234");
    }

    #[test]
    fn address_parse_rejects_garbage() {
        assert!(Address::parse("abcd").is_err());
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xzzzz000000000000000000000000000000001234").is_err());
    }

    #[test]
    fn tx_hash_onchain_format() {
        let good = TxHash::new(format!("0x{}", "ab".repeat(32)));
        assert!(good.is_onchain_format());
        assert!(!TxHash::new("0x1234").is_onchain_format());
        assert!(!TxHash::new("ab".repeat(33)).is_onchain_format());
    }

    #[test]
    fn tx_hash_dev_format() {
        assert!(TxHash::new("0xdev_alice_1").is_dev_format());
        assert!(TxHash::new("0xbot_tx_42").is_dev_format());
        assert!(!TxHash::new("0xdev_").is_dev_format());
        assert!(!TxHash::new("0xbot_tx_!!").is_dev_format());
        assert!(!TxHash::new(format!("0x{}", "ab".repeat(32))).is_dev_format());
    }

    #[test]
    fn lobby_player_active_until_refunded() {
        let mut player = LobbyPlayer {
            id: Uuid::new_v4(),
            lobby_id: 1,
            user_id: Uuid::new_v4(),
            payment_tx_hash: TxHash::new("0xdev_a"),
            joined_at: Utc::now(),
            refunded_at: None,
            refund_reason: None,
            refund_tx_hash: None,
        };
        assert!(player.is_active());
        player.refunded_at = Some(Utc::now());
        assert!(!player.is_active());
    }

    #[test]
    fn status_round_trips() {
        for status in [
            LobbyStatus::Empty,
            LobbyStatus::Waiting,
            LobbyStatus::Ready,
            LobbyStatus::InProgress,
        ] {
            assert_eq!(status.as_str().parse::<LobbyStatus>().unwrap(), status);
        }
        for status in [
            MatchStatus::Countdown,
            MatchStatus::Running,
            MatchStatus::Ending,
            MatchStatus::Finished,
            MatchStatus::Void,
        ] {
            assert_eq!(status.as_str().parse::<MatchStatus>().unwrap(), status);
        }
    }
}
