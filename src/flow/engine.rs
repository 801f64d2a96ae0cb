//! The interception state machine.
//!
//! [`FlowEngine`] drives one authorization flow end to end: it redirects
//! the browser upstream, intercepts the provider callback, exchanges the
//! provider code exactly once, pauses the flow for consent, and resumes it
//! by minting a downstream code against the original client binding.
//!
//! All transaction mutation goes through
//! [`TransactionStore::update`], so every transition is an atomic
//! check-and-set. The `AwaitingConsent -> ConsentRecorded` transition is
//! the idempotency boundary for consent submission: the one caller that
//! claims it writes preferences and finalizes; every other caller fails
//! before touching the preference store.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use super::policy::ConsentPolicy;
use super::store::{PendingStore, TransactionStore};
use super::transaction::{
    ClientBinding, PendingAuthorization, Transaction, TransactionStatus, epoch_secs,
};
use crate::config::{CapabilitySpec, Config};
use crate::issue::{Issuer, s256_challenge};
use crate::prefs::PreferenceStore;
use crate::upstream::UpstreamExchange;
use crate::{Error, Result};

/// Parameters of the original client's authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    /// Where the client wants its code delivered.
    pub redirect_uri: String,
    /// The client's CSRF state, echoed verbatim on completion.
    pub state: Option<String>,
    /// The client's PKCE S256 challenge, if any.
    pub code_challenge: Option<String>,
    /// PKCE method; only `S256` is accepted when a challenge is present.
    pub code_challenge_method: Option<String>,
}

/// What the callback handler should do next.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Flow paused; send the browser to the consent page.
    ConsentRequired {
        /// Id of the paused transaction.
        transaction_id: String,
    },
    /// Flow completed without a pause (returning subject under the
    /// consent-once policy); redirect to the client with its code.
    Completed {
        /// Client redirect carrying `code` (and `state`).
        redirect: Url,
    },
    /// Upstream exchange failed; redirect to the client with a generic
    /// authorization error, never provider detail.
    Denied {
        /// Client redirect carrying `error=access_denied`.
        redirect: Url,
    },
}

/// Data the consent page renders.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentView {
    /// Id of the paused transaction (round-trips through the form).
    pub transaction_id: String,
    /// Who is consenting (email claim, subject id, or a placeholder).
    pub identity: String,
    /// The capabilities on offer.
    pub capabilities: Vec<CapabilitySpec>,
}

/// Drives the pause-and-resume authorization flow.
pub struct FlowEngine {
    transactions: Arc<TransactionStore>,
    pending: Arc<PendingStore>,
    prefs: Arc<dyn PreferenceStore>,
    issuer: Arc<Issuer>,
    upstream: Arc<dyn UpstreamExchange>,
    policy: Arc<dyn ConsentPolicy>,
    capabilities: Vec<CapabilitySpec>,
    authorization_endpoint: String,
    client_id: String,
    scopes: Vec<String>,
    upstream_redirect_uri: String,
    transaction_ttl: std::time::Duration,
    pending_ttl: std::time::Duration,
    retain_claims: bool,
}

impl FlowEngine {
    /// Wire an engine from configuration and its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        transactions: Arc<TransactionStore>,
        pending: Arc<PendingStore>,
        prefs: Arc<dyn PreferenceStore>,
        issuer: Arc<Issuer>,
        upstream: Arc<dyn UpstreamExchange>,
        policy: Arc<dyn ConsentPolicy>,
    ) -> Self {
        Self {
            transactions,
            pending,
            prefs,
            issuer,
            upstream,
            policy,
            capabilities: config.capabilities.clone(),
            authorization_endpoint: config.upstream.authorization_endpoint.clone(),
            client_id: config.upstream.resolve_client_id(),
            scopes: config.upstream.scopes.clone(),
            upstream_redirect_uri: config.server.upstream_redirect_uri(),
            transaction_ttl: config.flow.transaction_ttl,
            pending_ttl: config.flow.pending_ttl,
            retain_claims: config.flow.retain_claims_until_ttl,
        }
    }

    /// Start a flow: record the client's binding and build the provider
    /// authorization URL to redirect the browser to.
    ///
    /// The gateway substitutes its own `state` and PKCE pair on the
    /// upstream hop; the client's values are stored untouched and come
    /// back only at completion.
    ///
    /// # Errors
    ///
    /// `invalid_request` if the redirect URI is not an absolute URL or the
    /// PKCE method is anything but `S256`.
    pub fn begin_authorization(&self, req: AuthorizeRequest) -> Result<Url> {
        Url::parse(&req.redirect_uri)
            .map_err(|_| Error::InvalidRequest("redirect_uri must be an absolute URL".into()))?;

        match (&req.code_challenge, req.code_challenge_method.as_deref()) {
            (Some(_), Some("S256")) | (None, None) => {}
            (Some(_), _) => {
                return Err(Error::InvalidRequest(
                    "code_challenge_method must be S256".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::InvalidRequest(
                    "code_challenge_method without code_challenge".into(),
                ));
            }
        }

        let state = generate_state();
        let verifier = generate_verifier();
        let challenge = s256_challenge(&verifier);

        self.pending.put(PendingAuthorization {
            state: state.clone(),
            proxy_code_verifier: verifier,
            client: ClientBinding {
                redirect_uri: req.redirect_uri,
                state: req.state,
                code_challenge: req.code_challenge,
            },
            expires_at: epoch_secs() + self.pending_ttl.as_secs(),
        });

        let mut url = Url::parse(&self.authorization_endpoint)
            .map_err(|e| Error::Config(format!("upstream.authorization_endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.upstream_redirect_uri)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");

        debug!(state = %state, "Authorization flow started");
        Ok(url)
    }

    /// Intercept the provider callback.
    ///
    /// Consumes the pending correlation (one shot, so a duplicate callback
    /// fails here), creates the transaction, exchanges the provider code
    /// exactly once, and asks the consent policy whether to pause.
    ///
    /// # Errors
    ///
    /// `invalid_state` for an unknown, expired, or replayed `state`.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<CallbackOutcome> {
        let pending = self.pending.take(state)?;

        let txn = Transaction::new(
            code.to_string(),
            pending.client.clone(),
            self.transaction_ttl,
        );
        let txn_id = txn.id.clone();
        self.transactions.put(txn);

        // Take the provider code out of the transaction so nothing can
        // present it upstream a second time.
        let mut taken = None;
        self.transactions.update(&txn_id, |t| {
            taken = t.upstream_code.take();
            Ok(())
        })?;
        let upstream_code = taken
            .ok_or_else(|| Error::Internal("provider code already consumed".to_string()))?;

        let identity = match self
            .upstream
            .exchange(&upstream_code, &pending.proxy_code_verifier)
            .await
        {
            Ok(identity) => identity,
            Err(err) => {
                warn!(txn = %txn_id, error = %err, "Upstream exchange failed");
                self.transactions.update(&txn_id, |t| {
                    t.status = TransactionStatus::Failed;
                    if !self.retain_claims {
                        t.subject = None;
                        t.claims.clear();
                    }
                    Ok(())
                })?;
                let redirect = denied_redirect(&pending.client)?;
                return Ok(CallbackOutcome::Denied { redirect });
            }
        };

        self.transactions.update(&txn_id, |t| {
            t.status = TransactionStatus::Exchanged;
            t.subject = Some(identity.subject.clone());
            t.claims = identity.claims.clone();
            Ok(())
        })?;
        let txn = self.transactions.update(&txn_id, |t| {
            t.status = TransactionStatus::AwaitingConsent;
            Ok(())
        })?;

        if self.policy.divert(&txn).await {
            info!(txn = %txn_id, "Flow paused for consent");
            Ok(CallbackOutcome::ConsentRequired {
                transaction_id: txn_id,
            })
        } else {
            // Returning subject: claim the transition and complete against
            // existing preferences, without touching them.
            let txn = self.claim_consent_transition(&txn_id)?;
            let redirect = self.finalize(&txn)?;
            info!(txn = %txn_id, "Flow completed without consent pause");
            Ok(CallbackOutcome::Completed { redirect })
        }
    }

    /// Handle a provider error callback (user cancelled, scope refused).
    ///
    /// Consumes the pending correlation and builds the generic-denial
    /// redirect for the client; no transaction is ever created.
    ///
    /// # Errors
    ///
    /// `invalid_state` for an unknown, expired, or replayed `state`.
    pub fn handle_provider_error(&self, state: &str) -> Result<Url> {
        let pending = self.pending.take(state)?;
        denied_redirect(&pending.client)
    }

    /// Fetch the data the consent page needs for a paused transaction.
    ///
    /// # Errors
    ///
    /// Not-found for any transaction that is not currently paused
    /// (finalized, claimed, or unknown); expired for one past its deadline.
    pub fn consent_view(&self, txn_id: &str) -> Result<ConsentView> {
        let txn = self.lookup(txn_id)?;
        if txn.status != TransactionStatus::AwaitingConsent {
            return Err(Error::TransactionNotFound);
        }

        let identity = txn.display_identity();
        Ok(ConsentView {
            transaction_id: txn.id,
            identity,
            capabilities: self.capabilities.clone(),
        })
    }

    /// Record a consent submission and resume the flow.
    ///
    /// The selection is a full replacement of the subject's enabled set;
    /// an empty selection is a valid everything-disabled decision. Exactly
    /// one concurrent submission for a transaction wins; the rest fail
    /// before any preference write.
    ///
    /// # Errors
    ///
    /// `invalid_request` for unknown capability names (nothing is written);
    /// not-found/expired per the transaction's state.
    pub async fn record_consent(&self, txn_id: &str, selection: &BTreeSet<String>) -> Result<Url> {
        for name in selection {
            if !self.capabilities.iter().any(|c| &c.name == name) {
                return Err(Error::InvalidRequest(format!(
                    "unknown capability: {name}"
                )));
            }
        }

        let txn = self.claim_consent_transition(txn_id)?;
        let subject = txn
            .subject
            .clone()
            .ok_or_else(|| Error::Internal("consent recorded before exchange".to_string()))?;

        self.prefs.set(&subject, selection.clone()).await;
        info!(txn = %txn_id, enabled = selection.len(), "Consent recorded");

        self.finalize(&txn)
    }

    /// CAS `AwaitingConsent -> ConsentRecorded`; the single winner per
    /// transaction proceeds past this point.
    fn claim_consent_transition(&self, txn_id: &str) -> Result<Transaction> {
        let result = self.transactions.update(txn_id, |t| {
            if t.status == TransactionStatus::AwaitingConsent {
                t.status = TransactionStatus::ConsentRecorded;
                Ok(())
            } else {
                Err(Error::TransactionNotFound)
            }
        });
        if matches!(result, Err(Error::TransactionExpired)) && !self.retain_claims {
            self.transactions.scrub_identity(txn_id);
        }
        result
    }

    /// Finalize the transaction, mint the downstream code, and build the
    /// client redirect.
    ///
    /// The `Completed` transition is claimed before the code is minted:
    /// if the transaction expired in the meantime, the abort leaves no
    /// orphaned live code behind.
    fn finalize(&self, txn: &Transaction) -> Result<Url> {
        self.transactions.update(&txn.id, |t| {
            t.status = TransactionStatus::Completed;
            Ok(())
        })?;
        let code = self.issuer.issue(txn)?;

        let mut redirect = Url::parse(&txn.client.redirect_uri)
            .map_err(|e| Error::Internal(format!("stored redirect_uri unparseable: {e}")))?;
        {
            let mut pairs = redirect.query_pairs_mut();
            pairs.append_pair("code", &code);
            if let Some(state) = &txn.client.state {
                pairs.append_pair("state", state);
            }
        }
        Ok(redirect)
    }

    fn lookup(&self, txn_id: &str) -> Result<Transaction> {
        let result = self.transactions.get(txn_id);
        if matches!(result, Err(Error::TransactionExpired)) && !self.retain_claims {
            self.transactions.scrub_identity(txn_id);
        }
        result
    }
}

/// Build the generic-error redirect for a failed exchange. Provider detail
/// stays in the logs.
fn denied_redirect(client: &ClientBinding) -> Result<Url> {
    let mut redirect = Url::parse(&client.redirect_uri)
        .map_err(|e| Error::Internal(format!("stored redirect_uri unparseable: {e}")))?;
    {
        let mut pairs = redirect.query_pairs_mut();
        pairs.append_pair("error", "access_denied");
        if let Some(state) = &client.state {
            pairs.append_pair("state", state);
        }
    }
    Ok(redirect)
}

/// Random upstream `state` (128 bits, base64url).
fn generate_state() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Random PKCE verifier for the upstream hop (256 bits, base64url).
fn generate_verifier() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}
