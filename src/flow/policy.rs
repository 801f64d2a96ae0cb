//! Interception hook for the provider callback.
//!
//! The engine calls [`ConsentPolicy::divert`] at the exact moment a
//! provider callback has been exchanged, before default completion. A
//! `true` answer pauses the flow on the consent page; `false` lets it
//! complete immediately against the subject's existing preferences.

use std::sync::Arc;

use async_trait::async_trait;

use super::transaction::Transaction;
use crate::prefs::PreferenceStore;

/// Strategy deciding whether a freshly exchanged flow pauses for consent.
#[async_trait]
pub trait ConsentPolicy: Send + Sync + 'static {
    /// `true` to divert to the consent pause, `false` to proceed normally.
    async fn divert(&self, txn: &Transaction) -> bool;
}

/// Pause every login for consent (the default).
pub struct AlwaysRequireConsent;

#[async_trait]
impl ConsentPolicy for AlwaysRequireConsent {
    async fn divert(&self, _txn: &Transaction) -> bool {
        true
    }
}

/// Pause only subjects without a recorded consent decision; returning
/// subjects complete immediately against their stored preferences.
pub struct ConsentOncePolicy {
    prefs: Arc<dyn PreferenceStore>,
}

impl ConsentOncePolicy {
    /// Create the policy over the given preference store.
    #[must_use]
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        Self { prefs }
    }
}

#[async_trait]
impl ConsentPolicy for ConsentOncePolicy {
    async fn divert(&self, txn: &Transaction) -> bool {
        match &txn.subject {
            Some(subject) => !self.prefs.has(subject).await,
            // No identity yet — always pause rather than guess.
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::flow::transaction::ClientBinding;
    use crate::prefs::InMemoryPreferenceStore;

    fn txn_for(subject: Option<&str>) -> Transaction {
        let mut txn = Transaction::new(
            "XYZ".to_string(),
            ClientBinding {
                redirect_uri: "https://client/cb".to_string(),
                state: None,
                code_challenge: None,
            },
            Duration::from_secs(900),
        );
        txn.subject = subject.map(str::to_string);
        txn
    }

    #[tokio::test]
    async fn always_require_consent_diverts() {
        assert!(AlwaysRequireConsent.divert(&txn_for(Some("u1"))).await);
    }

    #[tokio::test]
    async fn consent_once_diverts_only_new_subjects() {
        // GIVEN: u1 has consented before (even to an empty set), u2 has not
        let prefs = Arc::new(InMemoryPreferenceStore::new());
        prefs.set("u1", BTreeSet::new()).await;
        let policy = ConsentOncePolicy::new(prefs);

        // THEN: u1 proceeds, u2 pauses
        assert!(!policy.divert(&txn_for(Some("u1"))).await);
        assert!(policy.divert(&txn_for(Some("u2"))).await);
        assert!(policy.divert(&txn_for(None)).await);
    }
}
