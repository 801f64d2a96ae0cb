//! Session tokens — the credential the token endpoint hands back.
//!
//! Opaque bearer values (`cgw_<base64url>`, 256 bits of entropy; the
//! prefix keeps tokens greppable and detectable by secret scanners),
//! indexed by value for O(1) resolution at the capability gate. Expired
//! tokens are lazily evicted on access and bulk-purged by the sweeper.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::flow::transaction::epoch_secs;

/// A minted session token asserting a subject and its claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    /// The opaque bearer value (`cgw_<base64>`).
    pub token: String,
    /// Subject the token asserts.
    pub subject: String,
    /// Identity claims captured at exchange time.
    pub claims: BTreeMap<String, serde_json::Value>,
    /// Issued-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds).
    pub exp: u64,
}

impl SessionToken {
    /// Returns `true` if the token has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        epoch_secs() >= self.exp
    }
}

/// In-memory session store keyed by bearer value.
pub struct SessionStore {
    inner: DashMap<String, SessionToken>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a store minting tokens with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            ttl,
        }
    }

    /// Mint and store a session token for `subject`.
    pub fn mint(
        &self,
        subject: String,
        claims: BTreeMap<String, serde_json::Value>,
    ) -> SessionToken {
        let now = epoch_secs();
        let token = SessionToken {
            token: generate_bearer(),
            subject,
            claims,
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        self.inner.insert(token.token.clone(), token.clone());
        token
    }

    /// Resolve a bearer value to its session.
    ///
    /// Returns `None` for unknown or expired tokens; expired entries are
    /// evicted on the spot.
    #[must_use]
    pub fn resolve(&self, bearer: &str) -> Option<SessionToken> {
        let entry = self.inner.get(bearer)?;
        let token = entry.clone();
        drop(entry);

        if token.is_expired() {
            self.inner.remove(bearer);
            debug!(subject = %token.subject, "Lazy-evicted expired session");
            return None;
        }

        Some(token)
    }

    /// The minting TTL in seconds (reported as `expires_in`).
    #[must_use]
    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Remove expired sessions; returns how many.
    pub fn sweep(&self) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, t| !t.is_expired());
        before.saturating_sub(self.inner.len())
    }
}

/// Generate a cryptographically random opaque bearer token.
fn generate_bearer() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    format!("cgw_{}", URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert("email".to_string(), serde_json::json!("a@b.com"));
        map
    }

    #[test]
    fn mint_and_resolve_round_trip() {
        // GIVEN: a store and a minted token
        let store = SessionStore::new(Duration::from_secs(3600));
        let minted = store.mint("u1".to_string(), claims());

        // WHEN: resolved by bearer value
        let found = store.resolve(&minted.token).unwrap();

        // THEN: subject and claims survive
        assert_eq!(found.subject, "u1");
        assert_eq!(found.claims["email"], "a@b.com");
        assert_eq!(minted.exp, minted.iat + 3600);
    }

    #[test]
    fn unknown_bearer_resolves_to_none() {
        let store = SessionStore::new(Duration::from_secs(3600));
        assert!(store.resolve("cgw_nonexistent").is_none());
    }

    #[test]
    fn expired_session_is_lazily_evicted() {
        // GIVEN: a token already past expiry
        let store = SessionStore::new(Duration::ZERO);
        let minted = store.mint("u1".to_string(), claims());

        // WHEN: resolved
        let found = store.resolve(&minted.token);

        // THEN: gone, and the entry was removed
        assert!(found.is_none());
        assert!(store.inner.is_empty());
    }

    #[test]
    fn bearer_tokens_carry_prefix_and_entropy() {
        let a = generate_bearer();
        let b = generate_bearer();
        assert!(a.starts_with("cgw_"));
        assert!(a.len() > 40);
        assert_ne!(a, b);
    }

    #[test]
    fn sweep_purges_only_expired() {
        let live = SessionStore::new(Duration::from_secs(3600));
        let mut expired = live.mint("u1".to_string(), claims());
        expired.exp = 0;
        live.inner.insert(expired.token.clone(), expired);
        live.mint("u2".to_string(), claims());

        assert_eq!(live.sweep(), 1);
    }
}
