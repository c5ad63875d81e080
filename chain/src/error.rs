use thiserror::Error;

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// How an error should be treated by retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying, possibly on another provider.
    Transient,
    /// Retrying cannot help.
    Permanent,
    /// Not classifiable; treated as permanent by senders.
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Rpc error: {0}")]
    Rpc(String),

    #[error("Rpc timeout: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Execution reverted: {0}")]
    Reverted(String),

    #[error("Nonce error: {0}")]
    BadNonce(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("All attempts failed ({attempts}): {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("Chain error: {0}")]
    Unknown(String),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Rpc(_) | ChainError::Timeout(_) | ChainError::RateLimited(_) => {
                ErrorKind::Transient
            }
            ChainError::InsufficientFunds(_)
            | ChainError::Reverted(_)
            | ChainError::BadNonce(_)
            | ChainError::InvalidAddress(_)
            | ChainError::MalformedResponse(_) => ErrorKind::Permanent,
            ChainError::Exhausted { .. } => ErrorKind::Permanent,
            ChainError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Classify a raw provider error string into a [`ChainError`] by matching
/// the well-known message fragments and status codes.
pub fn classify(message: &str) -> ChainError {
    let lower = message.to_ascii_lowercase();
    const TRANSIENT: &[&str] = &[
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "broken pipe",
        "temporarily unavailable",
        "service unavailable",
        "bad gateway",
        "gateway timeout",
        "502",
        "503",
        "504",
        "busy",
    ];
    const RATE_LIMIT: &[&str] = &["429", "too many requests", "rate limit"];
    if RATE_LIMIT.iter().any(|p| lower.contains(p)) {
        return ChainError::RateLimited(message.to_string());
    }
    if TRANSIENT.iter().any(|p| lower.contains(p)) {
        return ChainError::Timeout(message.to_string());
    }
    if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
        return ChainError::InsufficientFunds(message.to_string());
    }
    if lower.contains("execution reverted") || lower.contains("revert") {
        return ChainError::Reverted(message.to_string());
    }
    if lower.contains("nonce too low")
        || lower.contains("nonce too high")
        || lower.contains("already known")
        || lower.contains("replacement transaction underpriced")
    {
        return ChainError::BadNonce(message.to_string());
    }
    if lower.contains("invalid address") || lower.contains("unknown account") {
        return ChainError::InvalidAddress(message.to_string());
    }
    ChainError::Unknown(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_patterns() {
        assert_eq!(classify("request timed out").kind(), ErrorKind::Transient);
        assert_eq!(classify("HTTP 503 Service Unavailable").kind(), ErrorKind::Transient);
        assert_eq!(classify("connection reset by peer").kind(), ErrorKind::Transient);
        assert_eq!(classify("429 Too Many Requests").kind(), ErrorKind::Transient);
    }

    #[test]
    fn permanent_patterns() {
        assert_eq!(
            classify("insufficient funds for gas * price + value").kind(),
            ErrorKind::Permanent
        );
        assert_eq!(classify("execution reverted: ERC20").kind(), ErrorKind::Permanent);
        assert_eq!(classify("nonce too low").kind(), ErrorKind::Permanent);
        assert_eq!(classify("unknown account 0xabc").kind(), ErrorKind::Permanent);
    }

    #[test]
    fn unmatched_is_unknown() {
        assert_eq!(classify("something odd happened").kind(), ErrorKind::Unknown);
    }
}
