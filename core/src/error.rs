use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Server-wide error type.
///
/// The first group maps one-to-one onto the numeric codes sent to clients
/// in `ERROR` frames; the rest are infrastructure and logic failures that
/// surface to clients only as `INTERNAL_ERROR`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid session")]
    InvalidSession,

    #[error("Session expired")]
    SessionExpired,

    #[error("Lobby not found: {0}")]
    LobbyNotFound(u32),

    #[error("Lobby is full")]
    LobbyFull,

    #[error("Already in a lobby")]
    AlreadyInLobby,

    #[error("Lobby timed out")]
    LobbyTimeout,

    #[error("Payment not confirmed: {0}")]
    PaymentNotConfirmed(String),

    #[error("Payment transaction already used")]
    DuplicateTxHash,

    #[error("Refund not available")]
    RefundNotAvailable,

    #[error("Not in a lobby")]
    NotInLobby,

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Match not found")]
    MatchNotFound,

    #[error("Not in a match")]
    NotInMatch,

    #[error("Rate limited")]
    RateLimited,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Chain error: {0}")]
    ChainError(String),

    #[error("Wallet error: {0}")]
    WalletError(String),

    #[error("Match state version {0} is not compatible")]
    IncompatibleStateVersion(u32),

    #[error("Match not loaded")]
    MatchNotLoaded,

    #[error("Configuration missing: {0}")]
    ConfigMissing(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl Error {
    /// Numeric code for `ERROR` frames.  Infrastructure failures collapse
    /// into 9999.
    pub fn user_code(&self) -> u16 {
        match self {
            Error::InvalidSession => 1001,
            Error::SessionExpired => 1002,
            Error::LobbyNotFound(_) => 2001,
            Error::LobbyFull => 2002,
            Error::AlreadyInLobby => 2003,
            Error::LobbyTimeout => 2004,
            Error::PaymentNotConfirmed(_) | Error::DuplicateTxHash => 2005,
            Error::RefundNotAvailable => 2006,
            Error::NotInLobby => 2007,
            Error::PaymentFailed(_) => 3001,
            Error::InsufficientBalance => 3002,
            Error::MatchNotFound => 4001,
            Error::NotInMatch => 4002,
            Error::RateLimited => 5001,
            Error::MalformedMessage(_) => 9999,
            _ => 9999,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_codes_match_protocol_table() {
        assert_eq!(Error::InvalidSession.user_code(), 1001);
        assert_eq!(Error::SessionExpired.user_code(), 1002);
        assert_eq!(Error::LobbyNotFound(9).user_code(), 2001);
        assert_eq!(Error::LobbyFull.user_code(), 2002);
        assert_eq!(Error::AlreadyInLobby.user_code(), 2003);
        assert_eq!(Error::LobbyTimeout.user_code(), 2004);
        assert_eq!(Error::DuplicateTxHash.user_code(), 2005);
        assert_eq!(Error::RefundNotAvailable.user_code(), 2006);
        assert_eq!(Error::NotInLobby.user_code(), 2007);
        assert_eq!(Error::PaymentFailed("x".into()).user_code(), 3001);
        assert_eq!(Error::InsufficientBalance.user_code(), 3002);
        assert_eq!(Error::MatchNotFound.user_code(), 4001);
        assert_eq!(Error::NotInMatch.user_code(), 4002);
        assert_eq!(Error::RateLimited.user_code(), 5001);
        assert_eq!(Error::InternalError("x".into()).user_code(), 9999);
    }
}
