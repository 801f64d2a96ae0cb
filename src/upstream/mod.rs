//! Upstream exchange adapter boundary.
//!
//! The flow engine calls [`UpstreamExchange`] exactly once per transaction
//! to turn the provider's one-time authorization code into a normalized
//! identity. Everything provider-specific (wire format, token shapes)
//! stays behind this trait; the engine only ever sees a
//! [`VerifiedSubject`].

mod http;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpUpstreamExchange;

/// Normalized identity returned by a successful upstream exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedSubject {
    /// Stable provider-issued subject identifier (`sub` claim).
    pub subject: String,
    /// Remaining identity claims (email, name, ...).
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// Error variants for a failed upstream exchange.
///
/// All of them are fatal to the transaction: provider codes are
/// single-use, so the engine never retries.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The provider rejected the code (invalid, expired, or already used).
    #[error("Provider rejected the authorization code: HTTP {status}")]
    Rejected {
        /// HTTP status returned by the token endpoint.
        status: u16,
    },

    /// Network failure or bounded timeout on the token-endpoint call.
    #[error("Token endpoint unreachable: {0}")]
    Transport(String),

    /// The token response could not be parsed or carried no usable identity.
    #[error("Malformed token response: {0}")]
    MalformedResponse(String),
}

/// Adapter that exchanges a provider authorization code for identity claims.
#[async_trait]
pub trait UpstreamExchange: Send + Sync + 'static {
    /// Exchange `code` (with the gateway's PKCE `verifier`) for a
    /// normalized identity. Must be called at most once per code.
    async fn exchange(
        &self,
        code: &str,
        verifier: &str,
    ) -> std::result::Result<VerifiedSubject, ExchangeError>;
}
