//! Application-wide error types.

use thiserror::Error;

use crate::types::{Status, Step};

#[derive(Debug, Error)]
pub enum DisburserError {
    /// Transient chain / transaction-service failure. Retryable.
    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    /// The referenced transaction or disbursement does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The user declined a wallet prompt.
    #[error("User rejected the request: {0}")]
    UserRejected(String),

    /// Wallet or provider malfunction.
    #[error("Wallet error: {0}")]
    WalletError(String),

    #[error("Invalid state transition: cannot {action} while {step} is {status}")]
    InvalidStateTransition {
        action: &'static str,
        step: Step,
        status: Status,
    },

    #[error("Transaction already executed")]
    AlreadyExecuted,

    #[error("Disbursement cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DisburserError {
    /// Transient failures the poller retries with back-off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChainUnavailable(_))
    }

    /// Wallet failures leave the step in `ERROR` and can be retried by the user.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChainUnavailable(_) | Self::UserRejected(_) | Self::WalletError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DisburserError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_chain_errors_are_retried_by_the_poller() {
        assert!(DisburserError::ChainUnavailable("503".into()).is_retryable());
        assert!(!DisburserError::NotFound("0xabc".into()).is_retryable());
        assert!(!DisburserError::UserRejected("no".into()).is_retryable());
    }

    #[test]
    fn wallet_failures_are_recoverable_state_errors_are_not() {
        assert!(DisburserError::UserRejected("no".into()).is_recoverable());
        assert!(DisburserError::WalletError("nonce too low".into()).is_recoverable());
        assert!(!DisburserError::AlreadyExecuted.is_recoverable());
        assert!(!DisburserError::Cancelled.is_recoverable());
        assert!(!DisburserError::InvalidStateTransition {
            action: "sign",
            step: Step::Propose,
            status: Status::Pending,
        }
        .is_recoverable());
    }
}
