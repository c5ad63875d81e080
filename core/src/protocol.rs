//! Wire protocol: JSON text frames over WebSocket.
//!
//! Every frame carries a string `type` tag; unknown types are rejected at
//! decode time.  Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use arena_physics::Role;

use crate::error::{Error, Result};
use crate::types::{Amount, LobbyId, LobbyStatus, MatchId, TxHash, UserId};

/// Maximum accepted inbound frame size.
pub const MAX_FRAME_BYTES: usize = 16 * 1024;

/// WebSocket close codes.
pub mod close {
    pub const SERVER_SHUTDOWN: u16 = 1001;
    pub const DUPLICATE_RECONNECT: u16 = 1008;
    pub const ADMIN_RESET: u16 = 4000;
    pub const INVALID_SESSION: u16 = 4001;
    pub const TOO_MANY_CONNECTIONS: u16 = 4429;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Hello {
        session_token: String,
    },
    JoinLobby {
        lobby_id: LobbyId,
        payment_tx_hash: String,
    },
    RequestRefund,
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_time: Option<f64>,
    },
    Input {
        sequence: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir_x: Option<i8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir_y: Option<i8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_x: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_y: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frozen: Option<bool>,
    },
}

impl ClientMessage {
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    /// Schema validation beyond what serde enforces.  `allow_dev_tx`
    /// reflects the admin port profile.
    pub fn validate(&self, allow_dev_tx: bool) -> Result<()> {
        match self {
            ClientMessage::Hello { session_token } => {
                if session_token.is_empty() {
                    return Err(Error::MalformedMessage("empty session token".into()));
                }
            }
            ClientMessage::JoinLobby {
                payment_tx_hash, ..
            } => {
                let hash = TxHash::new(payment_tx_hash.clone());
                let ok = hash.is_onchain_format() || (allow_dev_tx && hash.is_dev_format());
                if !ok {
                    return Err(Error::MalformedMessage("bad payment tx hash".into()));
                }
            }
            ClientMessage::Input {
                dir_x,
                dir_y,
                target_x,
                target_y,
                ..
            } => {
                let has_dir = dir_x.is_some() && dir_y.is_some();
                let has_target = target_x.is_some() && target_y.is_some();
                if has_dir == has_target {
                    return Err(Error::MalformedMessage(
                        "input needs a direction or a target".into(),
                    ));
                }
                if has_dir {
                    for d in [dir_x.unwrap(), dir_y.unwrap()] {
                        if !(-1..=1).contains(&d) {
                            return Err(Error::MalformedMessage("direction out of range".into()));
                        }
                    }
                }
                if has_target {
                    for t in [target_x.unwrap(), target_y.unwrap()] {
                        if !t.is_finite() {
                            return Err(Error::MalformedMessage("target not finite".into()));
                        }
                    }
                }
            }
            ClientMessage::RequestRefund | ClientMessage::Ping { .. } => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbySummary {
    pub id: LobbyId,
    pub status: LobbyStatus,
    pub player_count: u8,
    pub deposit_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPlayer {
    pub id: UserId,
    pub x: f64,
    pub y: f64,
    pub alive: bool,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPlayer {
    pub id: UserId,
    pub x: f64,
    pub y: f64,
    pub alive: bool,
    pub role: Role,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundEntry {
    pub wallet: String,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartView {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Welcome {
        user_id: UserId,
        wallet: String,
    },
    LobbyList {
        lobbies: Vec<LobbySummary>,
    },
    LobbyUpdate {
        lobby: LobbySummary,
    },
    RefundProcessed {
        lobby_id: LobbyId,
        reason: String,
        refunds: Vec<RefundEntry>,
    },
    MatchStarting {
        match_id: MatchId,
        lobby_id: LobbyId,
    },
    RoleAssignment {
        match_id: MatchId,
        role: Role,
    },
    Countdown {
        seconds: u8,
    },
    Snapshot {
        tick: u64,
        players: Vec<SnapshotPlayer>,
    },
    Elimination {
        tick: u64,
        victim: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eliminated_by: Option<UserId>,
    },
    Bounce {
        tick: u64,
        players: [UserId; 2],
    },
    MatchEnd {
        match_id: MatchId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        winner: Option<UserId>,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payout_amount: Option<Amount>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payout_tx_hash: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_time: Option<f64>,
        server_time: f64,
    },
    Error {
        code: u16,
        message: String,
    },
    PlayerDisconnect {
        user_id: UserId,
        grace_remaining: u64,
    },
    PlayerReconnect {
        user_id: UserId,
    },
    ReconnectState {
        match_id: MatchId,
        tick: u64,
        players: Vec<ReconnectPlayer>,
    },
    TokenUpdate {
        session_token: String,
    },
    ShowdownStart {
        players: [UserId; 2],
        hearts_to_win: u8,
        freeze_secs: u8,
    },
    ShowdownReady {
        hearts: Vec<HeartView>,
    },
    HeartCaptured {
        tick: u64,
        user_id: UserId,
        captured: u8,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        // Serialization of our own enums cannot fail.
        serde_json::to_string(self).expect("encode server message")
    }

    pub fn error(err: &Error) -> Self {
        ServerMessage::Error {
            code: err.user_code(),
            message: err.to_string(),
        }
    }
}

/// Round a coordinate to two decimals for snapshots.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip() {
        let raw = r#"{"type":"HELLO","sessionToken":"abc123"}"#;
        let msg = ClientMessage::decode(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Hello {
                session_token: "abc123".into()
            }
        );
        let encoded = serde_json::to_string(&msg).unwrap();
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientMessage::decode(r#"{"type":"SUDO","x":1}"#).is_err());
        assert!(ClientMessage::decode(r#"{"no_type":true}"#).is_err());
    }

    #[test]
    fn join_lobby_validation_by_profile() {
        let onchain = ClientMessage::JoinLobby {
            lobby_id: 1,
            payment_tx_hash: format!("0x{}", "ab".repeat(32)),
        };
        assert!(onchain.validate(false).is_ok());

        let dev = ClientMessage::JoinLobby {
            lobby_id: 1,
            payment_tx_hash: "0xbot_tx_7".into(),
        };
        assert!(dev.validate(false).is_err());
        assert!(dev.validate(true).is_ok());
    }

    #[test]
    fn input_requires_direction_xor_target() {
        let both = ClientMessage::Input {
            sequence: 1,
            dir_x: Some(1),
            dir_y: Some(0),
            target_x: Some(10.0),
            target_y: Some(10.0),
            frozen: None,
        };
        assert!(both.validate(false).is_err());

        let neither = ClientMessage::Input {
            sequence: 1,
            dir_x: None,
            dir_y: None,
            target_x: None,
            target_y: None,
            frozen: None,
        };
        assert!(neither.validate(false).is_err());

        let dir = ClientMessage::Input {
            sequence: 1,
            dir_x: Some(-1),
            dir_y: Some(1),
            target_x: None,
            target_y: None,
            frozen: None,
        };
        assert!(dir.validate(false).is_ok());

        let bad_dir = ClientMessage::Input {
            sequence: 1,
            dir_x: Some(2),
            dir_y: Some(0),
            target_x: None,
            target_y: None,
            frozen: None,
        };
        assert!(bad_dir.validate(false).is_err());

        let bad_target = ClientMessage::Input {
            sequence: 1,
            dir_x: None,
            dir_y: None,
            target_x: Some(f64::NAN),
            target_y: Some(0.0),
            frozen: None,
        };
        assert!(bad_target.validate(false).is_err());
    }

    #[test]
    fn server_message_tags_match_protocol() {
        let msg = ServerMessage::Countdown { seconds: 3 };
        let encoded = msg.encode();
        assert!(encoded.contains(r#""type":"COUNTDOWN""#));

        let msg = ServerMessage::PlayerDisconnect {
            user_id: uuid::Uuid::nil(),
            grace_remaining: 30,
        };
        let encoded = msg.encode();
        assert!(encoded.contains(r#""type":"PLAYER_DISCONNECT""#));
        assert!(encoded.contains(r#""graceRemaining":30"#));
    }

    #[test]
    fn snapshot_encode_decode_identity() {
        let msg = ServerMessage::Snapshot {
            tick: 42,
            players: vec![SnapshotPlayer {
                id: uuid::Uuid::nil(),
                x: round2(123.456),
                y: round2(78.9),
                alive: true,
                role: Role::Rock,
            }],
        };
        let encoded = msg.encode();
        let decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert!(encoded.contains("123.46"));
    }

    #[test]
    fn round2_rounds_to_two_decimals() {
        assert_eq!(round2(1.006), 1.01);
        assert_eq!(round2(1.004), 1.0);
        assert_eq!(round2(-2.346), -2.35);
    }
}
