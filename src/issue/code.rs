//! Downstream authorization codes.
//!
//! The code the gateway grants the original client at the COMPLETED
//! transition. Single-use, short-lived, and bound at issuance to the
//! client's redirect URI, state, PKCE challenge, and the resolved subject.
//! Consumption is an atomic check-and-set: the shard guard is held from
//! the binding checks through flipping the `consumed` flag, so two racing
//! exchange attempts cannot both succeed.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::flow::transaction::{Transaction, epoch_secs};
use crate::{Error, Result};

/// An issued downstream authorization code and its bindings.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    /// The opaque code value; primary key.
    pub code: String,
    /// Redirect URI the code is bound to.
    pub redirect_uri: String,
    /// Client state recorded at issuance (or its absence).
    pub state: Option<String>,
    /// Client PKCE S256 challenge, if the client sent one.
    pub code_challenge: Option<String>,
    /// Subject the code asserts.
    pub subject: String,
    /// Identity claims carried into the session token.
    pub claims: BTreeMap<String, serde_json::Value>,
    /// Absolute deadline (Unix epoch seconds).
    pub expires_at: u64,
    /// Whether the code has been exchanged.
    pub consumed: bool,
}

impl IssuedCode {
    fn is_expired(&self) -> bool {
        epoch_secs() >= self.expires_at
    }
}

/// Store of issued downstream codes with atomic single-use consumption.
pub struct DownstreamCodeStore {
    inner: DashMap<String, IssuedCode>,
    ttl: Duration,
}

impl DownstreamCodeStore {
    /// Create a store issuing codes with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            ttl,
        }
    }

    /// Mint a code bound to the transaction's client parameters and
    /// resolved subject.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the transaction carries no subject
    /// (it must be past the exchange step).
    pub fn issue(&self, txn: &Transaction) -> Result<String> {
        let subject = txn
            .subject
            .clone()
            .ok_or_else(|| Error::Internal("cannot issue a code before exchange".to_string()))?;

        let code = generate_code();
        self.inner.insert(
            code.clone(),
            IssuedCode {
                code: code.clone(),
                redirect_uri: txn.client.redirect_uri.clone(),
                state: txn.client.state.clone(),
                code_challenge: txn.client.code_challenge.clone(),
                subject,
                claims: txn.claims.clone(),
                expires_at: epoch_secs() + self.ttl.as_secs(),
                consumed: false,
            },
        );

        debug!(txn = %txn.id, "Issued downstream code");
        Ok(code)
    }

    /// Atomically consume a code, verifying its bindings.
    ///
    /// Fails with `invalid_grant` if the code is unknown, expired, already
    /// consumed, the presented redirect URI differs from the recorded one,
    /// or the PKCE verifier does not hash to the recorded challenge. The
    /// `consumed` flag flips while the shard guard is held, so exactly one
    /// of two concurrent attempts proceeds.
    pub fn consume(
        &self,
        code: &str,
        redirect_uri: &str,
        verifier: Option<&str>,
    ) -> Result<IssuedCode> {
        let mut entry = self
            .inner
            .get_mut(code)
            .ok_or_else(|| Error::InvalidGrant("unknown code".to_string()))?;

        if entry.consumed {
            return Err(Error::InvalidGrant("code already used".to_string()));
        }
        if entry.is_expired() {
            return Err(Error::InvalidGrant("code expired".to_string()));
        }
        if entry.redirect_uri != redirect_uri {
            return Err(Error::InvalidGrant("redirect_uri mismatch".to_string()));
        }

        if let Some(challenge) = &entry.code_challenge {
            let verifier =
                verifier.ok_or_else(|| Error::InvalidGrant("code_verifier required".to_string()))?;
            if !verify_s256(verifier, challenge) {
                return Err(Error::InvalidGrant("PKCE verification failed".to_string()));
            }
        }

        entry.consumed = true;
        Ok(entry.clone())
    }

    /// Remove consumed and expired codes; returns how many.
    pub fn sweep(&self) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, c| !c.consumed && !c.is_expired());
        before.saturating_sub(self.inner.len())
    }

    /// Number of live entries (test/diagnostic use).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if no codes are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Generate a cryptographically random code (256 bits, base64url).
fn generate_code() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Check `BASE64URL(SHA256(verifier)) == challenge` in constant time.
fn verify_s256(verifier: &str, challenge: &str) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let computed = URL_SAFE_NO_PAD.encode(hasher.finalize());
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}

/// Compute the S256 challenge for a verifier (authorization-endpoint side).
#[must_use]
pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
