//! Failure taxonomy for ledger connectivity.

use thiserror::Error;

/// JSON-RPC error code the ledger's RPC layer uses to signal rate limiting.
/// Only failures carrying this code are retried.
pub const RATE_LIMIT_CODE: i64 = -32016;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A single rate-limited attempt. The gateway retries these; callers
    /// normally see [`LedgerError::RateLimitExceeded`] instead.
    #[error("ledger rate limited: {0}")]
    RateLimited(String),

    /// Rate limiting persisted through the whole retry budget.
    #[error("rate limit exceeded after {attempts} attempts: {message}")]
    RateLimitExceeded { attempts: u32, message: String },

    /// The ledger rejected the call. Not retryable.
    #[error("ledger call {operation} failed: {message}")]
    CallFailed { operation: String, message: String },

    /// Transport-level failure reaching the ledger. Callers holding a
    /// still-valid cached value may serve it instead of failing.
    #[error("ledger unreachable: {0}")]
    NetworkUnavailable(String),

    /// A signed operation was attempted without a configured signer.
    #[error("signer not configured for {operation}")]
    SignerNotConfigured { operation: String },

    /// The ledger answered with something we could not decode.
    #[error("failed to decode ledger response: {0}")]
    Decode(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::RateLimited(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, LedgerError::NetworkUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_are_retryable() {
        assert!(LedgerError::RateLimited("slow down".into()).is_retryable());
        assert!(!LedgerError::CallFailed {
            operation: "ownerOf".into(),
            message: "revert".into(),
        }
        .is_retryable());
        assert!(!LedgerError::NetworkUnavailable("refused".into()).is_retryable());
        assert!(LedgerError::NetworkUnavailable("refused".into()).is_network());
    }
}
