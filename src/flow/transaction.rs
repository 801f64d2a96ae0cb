//! Transaction and pending-authorization records.
//!
//! A [`Transaction`] correlates one intercepted provider callback with the
//! original client's flow parameters while the flow is paused for consent.
//! A [`PendingAuthorization`] is the pre-transaction correlation stored
//! between the client's authorization request and the provider's redirect
//! back, keyed by the gateway-generated upstream `state`.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Provider callback received, upstream code not yet exchanged.
    CodeReceived,
    /// Upstream code exchanged for identity claims.
    Exchanged,
    /// Paused; waiting for the consent UI to submit a selection.
    AwaitingConsent,
    /// Consent submission accepted; preferences written.
    ConsentRecorded,
    /// Downstream code minted and flow resumed. Terminal.
    Completed,
    /// Deadline passed before completion. Terminal.
    Expired,
    /// Upstream exchange failed. Terminal.
    Failed,
}

impl TransactionStatus {
    /// Terminal statuses permit no further transitions or field mutation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Failed)
    }
}

/// The original client's flow parameters, captured before interception and
/// never altered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBinding {
    /// Where the client asked to be redirected with its code.
    pub redirect_uri: String,
    /// The client's CSRF state, echoed verbatim on completion.
    pub state: Option<String>,
    /// The client's PKCE S256 challenge, if it sent one.
    pub code_challenge: Option<String>,
}

/// One in-flight authorization flow paused for consent.
///
/// Owned exclusively by the flow engine; all mutation goes through
/// [`TransactionStore::update`](super::store::TransactionStore::update).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Opaque unguessable id; primary key.
    pub id: String,
    /// Current lifecycle status.
    pub status: TransactionStatus,
    /// Creation time (Unix epoch seconds).
    pub created_at: u64,
    /// Absolute deadline (Unix epoch seconds).
    pub expires_at: u64,
    /// The provider's one-time authorization code. Taken exactly once for
    /// the upstream exchange, `None` afterwards.
    pub upstream_code: Option<String>,
    /// The original client's flow parameters.
    pub client: ClientBinding,
    /// Stable provider-issued subject identifier (absent before exchange).
    pub subject: Option<String>,
    /// Identity claims from the exchange (absent before exchange).
    pub claims: BTreeMap<String, serde_json::Value>,
}

impl Transaction {
    /// Create a fresh transaction in `CodeReceived` with the given TTL.
    #[must_use]
    pub fn new(upstream_code: String, client: ClientBinding, ttl: Duration) -> Self {
        let now = epoch_secs();
        Self {
            id: format!("txn_{}", uuid::Uuid::new_v4().simple()),
            status: TransactionStatus::CodeReceived,
            created_at: now,
            expires_at: now + ttl.as_secs(),
            upstream_code: Some(upstream_code),
            client,
            subject: None,
            claims: BTreeMap::new(),
        }
    }

    /// Returns `true` if the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        epoch_secs() >= self.expires_at
    }

    /// A display identity for the consent UI: `email` claim if present,
    /// otherwise the subject id, otherwise a placeholder.
    #[must_use]
    pub fn display_identity(&self) -> String {
        self.claims
            .get("email")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| self.subject.clone())
            .unwrap_or_else(|| "user".to_string())
    }
}

/// Pre-transaction correlation between the client's authorization request
/// and the provider's eventual redirect back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    /// Gateway-generated upstream `state` (anti-CSRF key).
    pub state: String,
    /// PKCE verifier the gateway generated for the upstream hop.
    pub proxy_code_verifier: String,
    /// The original client's flow parameters.
    pub client: ClientBinding,
    /// Absolute deadline (Unix epoch seconds).
    pub expires_at: u64,
}

impl PendingAuthorization {
    /// Returns `true` if the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        epoch_secs() >= self.expires_at
    }
}

/// Current Unix time in seconds.
#[must_use]
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> ClientBinding {
        ClientBinding {
            redirect_uri: "https://client/cb".to_string(),
            state: Some("abc".to_string()),
            code_challenge: None,
        }
    }

    #[test]
    fn new_transaction_starts_in_code_received() {
        // GIVEN/WHEN: a fresh transaction
        let txn = Transaction::new("XYZ".to_string(), binding(), Duration::from_secs(900));

        // THEN: status and deadline are set, code present, no identity yet
        assert_eq!(txn.status, TransactionStatus::CodeReceived);
        assert_eq!(txn.expires_at, txn.created_at + 900);
        assert_eq!(txn.upstream_code.as_deref(), Some("XYZ"));
        assert!(txn.subject.is_none());
        assert!(!txn.is_expired());
    }

    #[test]
    fn transaction_ids_are_unique_and_prefixed() {
        let a = Transaction::new("X".to_string(), binding(), Duration::from_secs(1));
        let b = Transaction::new("X".to_string(), binding(), Duration::from_secs(1));

        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("txn_"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Expired.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(!TransactionStatus::CodeReceived.is_terminal());
        assert!(!TransactionStatus::AwaitingConsent.is_terminal());
        assert!(!TransactionStatus::ConsentRecorded.is_terminal());
    }

    #[test]
    fn display_identity_prefers_email_claim() {
        let mut txn = Transaction::new("X".to_string(), binding(), Duration::from_secs(1));
        assert_eq!(txn.display_identity(), "user");

        txn.subject = Some("u1".to_string());
        assert_eq!(txn.display_identity(), "u1");

        txn.claims
            .insert("email".to_string(), serde_json::json!("a@b.com"));
        assert_eq!(txn.display_identity(), "a@b.com");
    }
}
