//! Error types for the consent gateway

use std::io;

use thiserror::Error;

/// Result type alias for the consent gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Consent gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anti-CSRF correlation missing or expired
    #[error("Unknown or expired authorization state")]
    InvalidState,

    /// No transaction with the given id (or it is already finalized)
    #[error("Transaction not found")]
    TransactionNotFound,

    /// The transaction passed its deadline before completing
    #[error("Transaction expired")]
    TransactionExpired,

    /// Bad, used, or expired downstream code, or a binding mismatch
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Missing, malformed, or expired caller credential
    #[error("Unauthenticated")]
    Unauthenticated,

    /// Malformed request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The OAuth-style error code reported to clients.
    ///
    /// State-correlation failures collapse to `access_denied` so that
    /// upstream provider detail never leaks to the end client.
    #[must_use]
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Self::InvalidState => "access_denied",
            Self::TransactionNotFound => "transaction_not_found",
            Self::TransactionExpired => "transaction_expired",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidRequest(_) => "invalid_request",
            _ => "server_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_collapse_to_access_denied() {
        // GIVEN: an error that must not leak correlation detail
        // THEN: it maps to the generic code
        assert_eq!(Error::InvalidState.oauth_code(), "access_denied");
    }

    #[test]
    fn grant_and_credential_errors_keep_standard_codes() {
        assert_eq!(
            Error::InvalidGrant("consumed".into()).oauth_code(),
            "invalid_grant"
        );
        assert_eq!(Error::Unauthenticated.oauth_code(), "unauthenticated");
        assert_eq!(Error::TransactionExpired.oauth_code(), "transaction_expired");
    }
}
