//! Internal frames passed between tasks.

use arena_core::types::{LobbyId, MatchId, UserId};
use arena_physics::Intent;
use chrono::{DateTime, Utc};

/// Frames delivered into component input ports.
#[derive(Debug, Clone)]
pub enum EventFrame {
    PlayerInput {
        user_id: UserId,
        sequence: u64,
        intent: Intent,
        frozen: Option<bool>,
    },
    PlayerDisconnected {
        user_id: UserId,
    },
    PlayerReconnected {
        user_id: UserId,
    },
    /// Terminate a match without a winner.
    AbortMatch {
        reason: String,
    },
    /// Non-critical storage work handed to the deferred queue.
    Defer(DeferredOp),
    Shutdown,
}

impl std::fmt::Display for EventFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventFrame::PlayerInput {
                user_id, sequence, ..
            } => write!(f, "PlayerInput: {} seq {}", user_id, sequence),
            EventFrame::PlayerDisconnected { user_id } => {
                write!(f, "PlayerDisconnected: {}", user_id)
            }
            EventFrame::PlayerReconnected { user_id } => {
                write!(f, "PlayerReconnected: {}", user_id)
            }
            EventFrame::AbortMatch { reason } => write!(f, "AbortMatch: {}", reason),
            EventFrame::Defer(op) => write!(f, "Defer: {}", op),
            EventFrame::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeferredOp {
    PaidWallet {
        wallet: arena_core::types::Address,
        at: DateTime<Utc>,
    },
    MatchEvent(arena_core::types::MatchEvent),
    ExpirePayoutAttempts,
}

impl std::fmt::Display for DeferredOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferredOp::PaidWallet { wallet, .. } => write!(f, "PaidWallet: {}", wallet),
            DeferredOp::MatchEvent(event) => {
                write!(f, "MatchEvent: {} @{}", event.event_type, event.tick)
            }
            DeferredOp::ExpirePayoutAttempts => write!(f, "ExpirePayoutAttempts"),
        }
    }
}

/// How a match came to its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchVerdict {
    Winner { user_id: UserId, reason: String },
    Void { reason: String },
}

impl MatchVerdict {
    pub fn reason(&self) -> &str {
        match self {
            MatchVerdict::Winner { reason, .. } => reason,
            MatchVerdict::Void { reason } => reason,
        }
    }
}

/// Signals handled by the application signal loop.
#[derive(Debug, Clone)]
pub enum SignalFrame {
    StartMatch {
        lobby_id: LobbyId,
    },
    MatchEnded {
        match_id: MatchId,
        lobby_id: LobbyId,
        verdict: MatchVerdict,
        final_positions: Vec<(UserId, f64, f64)>,
    },
    RemoveMatch {
        match_id: MatchId,
    },
    Shutdown,
}

impl std::fmt::Display for SignalFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalFrame::StartMatch { lobby_id } => write!(f, "StartMatch: lobby {}", lobby_id),
            SignalFrame::MatchEnded {
                match_id, verdict, ..
            } => write!(f, "MatchEnded: {} ({})", match_id, verdict.reason()),
            SignalFrame::RemoveMatch { match_id } => write!(f, "RemoveMatch: {}", match_id),
            SignalFrame::Shutdown => write!(f, "Shutdown"),
        }
    }
}
