//! Capability access gate.
//!
//! Runtime check invoked by every protected operation. Resolves the
//! caller's subject from the presented bearer credential and consults the
//! preference store on each call — decisions are never cached, since
//! preferences can change between calls. Side-effect-free.

use std::sync::Arc;

use tracing::debug;

use crate::issue::SessionStore;
use crate::prefs::PreferenceStore;

/// Outcome of a gate check.
#[derive(Debug, Clone)]
pub enum Decision {
    /// The caller may run the operation.
    Allow(AuthorizedCaller),
    /// The caller may not; a deny is a normal outcome, not a failure.
    Deny(DenyReason),
}

impl Decision {
    /// Convenience predicate for tests and call sites.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// Why a gate check denied the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Credential missing, unknown, malformed, or expired.
    Unauthenticated,
    /// The subject has not enabled this capability (or never consented).
    CapabilityDisabled,
}

/// The resolved caller behind an allowed operation.
#[derive(Debug, Clone)]
pub struct AuthorizedCaller {
    /// Subject identifier from the session.
    pub subject: String,
    /// Identity claims captured at exchange time.
    pub claims: std::collections::BTreeMap<String, serde_json::Value>,
}

/// The gate itself: session resolution + per-call preference lookup.
pub struct CapabilityGate {
    sessions: Arc<SessionStore>,
    prefs: Arc<dyn PreferenceStore>,
}

impl CapabilityGate {
    /// Create a gate over the given session and preference stores.
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, prefs: Arc<dyn PreferenceStore>) -> Self {
        Self { sessions, prefs }
    }

    /// Authorize one protected-operation call.
    ///
    /// `Allow` iff the credential resolves to a live session whose subject
    /// has `capability` in its enabled set. Reads only; never mutates the
    /// preference store.
    pub async fn authorize(&self, credential: Option<&str>, capability: &str) -> Decision {
        let Some(bearer) = credential else {
            return Decision::Deny(DenyReason::Unauthenticated);
        };

        let Some(session) = self.sessions.resolve(bearer) else {
            debug!(capability = %capability, "Gate: unresolvable credential");
            return Decision::Deny(DenyReason::Unauthenticated);
        };

        let enabled = self.prefs.get(&session.subject).await;
        if enabled.contains(capability) {
            Decision::Allow(AuthorizedCaller {
                subject: session.subject,
                claims: session.claims,
            })
        } else {
            debug!(subject = %session.subject, capability = %capability, "Gate: capability disabled");
            Decision::Deny(DenyReason::CapabilityDisabled)
        }
    }
}
