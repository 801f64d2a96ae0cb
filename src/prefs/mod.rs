//! Per-subject capability preference store.
//!
//! Absence of an entry is equivalent to an empty set: deny by default.
//! Writes are full-replace, last-write-wins per subject; revocation is an
//! empty-set overwrite. Entries never auto-expire.
//!
//! The consent-handling path is the sole writer; the capability gate only
//! reads.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::flow::transaction::epoch_secs;

/// A subject's recorded capability selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    /// Enabled capability names.
    pub enabled_capabilities: BTreeSet<String>,
    /// Last write time (Unix epoch seconds).
    pub updated_at: u64,
}

/// Trait abstracting the preference storage backend.
#[async_trait]
pub trait PreferenceStore: Send + Sync + 'static {
    /// The enabled-capability set for `subject`; empty if absent.
    async fn get(&self, subject: &str) -> BTreeSet<String>;

    /// Replace the subject's capability set (last-write-wins).
    async fn set(&self, subject: &str, capabilities: BTreeSet<String>);

    /// Whether any entry exists for `subject` (an explicit empty set
    /// counts — it records a consent decision).
    async fn has(&self, subject: &str) -> bool;
}

/// In-memory preference store backed by a `DashMap`.
pub struct InMemoryPreferenceStore {
    inner: DashMap<String, Preference>,
}

impl InMemoryPreferenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }
}

impl Default for InMemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get(&self, subject: &str) -> BTreeSet<String> {
        self.inner
            .get(subject)
            .map(|p| p.enabled_capabilities.clone())
            .unwrap_or_default()
    }

    async fn set(&self, subject: &str, capabilities: BTreeSet<String>) {
        debug!(subject = %subject, count = capabilities.len(), "Preference written");
        self.inner.insert(
            subject.to_string(),
            Preference {
                enabled_capabilities: capabilities,
                updated_at: epoch_secs(),
            },
        );
    }

    async fn has(&self, subject: &str) -> bool {
        self.inner.contains_key(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn absent_subject_gets_empty_set() {
        // GIVEN: empty store
        let store = InMemoryPreferenceStore::new();

        // THEN: default-deny
        assert!(store.get("u1").await.is_empty());
        assert!(!store.has("u1").await);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryPreferenceStore::new();
        store.set("u1", caps(&["get_email", "get_name"])).await;

        assert_eq!(store.get("u1").await, caps(&["get_email", "get_name"]));
        assert!(store.has("u1").await);
    }

    #[tokio::test]
    async fn later_set_fully_replaces_earlier() {
        // GIVEN: an existing selection
        let store = InMemoryPreferenceStore::new();
        store.set("u1", caps(&["get_email", "get_name"])).await;

        // WHEN: a later write with a different set
        store.set("u1", caps(&["get_name"])).await;

        // THEN: the earlier set is fully replaced, not merged
        assert_eq!(store.get("u1").await, caps(&["get_name"]));
    }

    #[tokio::test]
    async fn empty_set_overwrite_revokes_but_entry_remains() {
        // GIVEN: an existing selection
        let store = InMemoryPreferenceStore::new();
        store.set("u1", caps(&["get_email"])).await;

        // WHEN: revoked with an empty set
        store.set("u1", BTreeSet::new()).await;

        // THEN: nothing enabled, but the consent decision is still recorded
        assert!(store.get("u1").await.is_empty());
        assert!(store.has("u1").await);
    }

    #[tokio::test]
    async fn subjects_are_independent() {
        let store = InMemoryPreferenceStore::new();
        store.set("u1", caps(&["get_email"])).await;
        store.set("u2", caps(&["get_name"])).await;

        assert_eq!(store.get("u1").await, caps(&["get_email"]));
        assert_eq!(store.get("u2").await, caps(&["get_name"]));
    }
}
