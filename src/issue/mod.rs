//! Downstream code and session-token issuance.
//!
//! [`Issuer`] is the single path by which a caller obtains a usable
//! credential: the flow engine mints a downstream code at the COMPLETED
//! transition, and the token endpoint exchanges that code — atomically and
//! at most once — for an opaque session token.

mod code;
mod session;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

pub use code::{DownstreamCodeStore, IssuedCode, s256_challenge};
pub use session::{SessionStore, SessionToken};

use crate::Result;
use crate::flow::transaction::Transaction;

/// Token response returned by the gateway token endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TokenGrant {
    /// The opaque session bearer token.
    pub access_token: String,
    /// Always `"Bearer"`.
    pub token_type: String,
    /// Seconds until expiry.
    pub expires_in: u64,
}

/// Coordinator over the code store and session store.
pub struct Issuer {
    codes: DownstreamCodeStore,
    sessions: Arc<SessionStore>,
}

impl Issuer {
    /// Create an issuer with the given code and session TTLs.
    #[must_use]
    pub fn new(code_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            codes: DownstreamCodeStore::new(code_ttl),
            sessions: Arc::new(SessionStore::new(session_ttl)),
        }
    }

    /// Mint a downstream code bound to the transaction.
    pub fn issue(&self, txn: &Transaction) -> Result<String> {
        self.codes.issue(txn)
    }

    /// Exchange a downstream code for a session token.
    ///
    /// Verifies the redirect-URI and PKCE bindings, consumes the code
    /// atomically, and mints the session. Fails with `invalid_grant` on
    /// any mismatch, reuse, or expiry.
    pub fn exchange(
        &self,
        code: &str,
        redirect_uri: &str,
        verifier: Option<&str>,
    ) -> Result<TokenGrant> {
        let consumed = self.codes.consume(code, redirect_uri, verifier)?;
        let session = self.sessions.mint(consumed.subject, consumed.claims);

        Ok(TokenGrant {
            access_token: session.token,
            token_type: "Bearer".to_string(),
            expires_in: self.sessions.ttl_secs(),
        })
    }

    /// A shared handle on the session store, for the capability gate.
    #[must_use]
    pub fn sessions(&self) -> Arc<SessionStore> {
        Arc::clone(&self.sessions)
    }

    /// Number of stored downstream codes (test/diagnostic use).
    #[must_use]
    pub fn live_codes(&self) -> usize {
        self.codes.len()
    }

    /// Remove consumed/expired codes and expired sessions; returns how
    /// many entries went away.
    pub fn sweep(&self) -> usize {
        self.codes.sweep() + self.sessions.sweep()
    }
}

impl crate::flow::store::Sweep for Issuer {
    fn sweep(&self) -> usize {
        Issuer::sweep(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::transaction::{ClientBinding, TransactionStatus};

    fn exchanged_txn() -> Transaction {
        let mut txn = Transaction::new(
            "XYZ".to_string(),
            ClientBinding {
                redirect_uri: "https://client/cb".to_string(),
                state: Some("abc".to_string()),
                code_challenge: None,
            },
            Duration::from_secs(900),
        );
        txn.status = TransactionStatus::ConsentRecorded;
        txn.subject = Some("u1".to_string());
        txn
    }

    #[test]
    fn exchange_mints_resolvable_session() {
        // GIVEN: an issued code
        let issuer = Issuer::new(Duration::from_secs(60), Duration::from_secs(3600));
        let code = issuer.issue(&exchanged_txn()).unwrap();

        // WHEN: exchanged
        let grant = issuer.exchange(&code, "https://client/cb", None).unwrap();

        // THEN: a Bearer session usable at the gate comes back
        assert_eq!(grant.token_type, "Bearer");
        assert_eq!(grant.expires_in, 3600);
        let session = issuer.sessions().resolve(&grant.access_token).unwrap();
        assert_eq!(session.subject, "u1");
    }

    #[test]
    fn second_exchange_of_same_code_is_invalid_grant() {
        // GIVEN: a code exchanged once
        let issuer = Issuer::new(Duration::from_secs(60), Duration::from_secs(3600));
        let code = issuer.issue(&exchanged_txn()).unwrap();
        issuer.exchange(&code, "https://client/cb", None).unwrap();

        // WHEN: exchanged again with identical parameters
        let second = issuer.exchange(&code, "https://client/cb", None);

        // THEN: invalid_grant
        assert!(matches!(second, Err(crate::Error::InvalidGrant(_))));
    }
}
