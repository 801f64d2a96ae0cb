//! Ephemeral stores for the interception flow.
//!
//! [`TransactionStore`] holds paused transactions; [`PendingStore`] holds
//! the pre-transaction correlations in a distinct keyspace. Both are
//! `DashMap`-backed. Per-key atomicity comes from holding the shard guard
//! across a read-modify-write: concurrent [`TransactionStore::update`]
//! calls on the same id serialize, and the loser observes the winner's
//! post-mutation state.
//!
//! Expired entries are evicted lazily on access and in bulk by a
//! background sweeper (see [`spawn_sweeper`]).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::transaction::{PendingAuthorization, Transaction, TransactionStatus};
use crate::{Error, Result};

/// Keyed store of in-flight transactions.
pub struct TransactionStore {
    inner: DashMap<String, Transaction>,
}

impl TransactionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Insert a transaction under its id.
    pub fn put(&self, txn: Transaction) {
        self.inner.insert(txn.id.clone(), txn);
    }

    /// Look up a transaction by id.
    ///
    /// A non-terminal transaction past its deadline is marked `Expired` in
    /// place and reported as [`Error::TransactionExpired`]. Terminal
    /// transactions are still returned; callers gate on status themselves.
    pub fn get(&self, id: &str) -> Result<Transaction> {
        let mut entry = self.inner.get_mut(id).ok_or(Error::TransactionNotFound)?;

        if !entry.status.is_terminal() && entry.is_expired() {
            entry.status = TransactionStatus::Expired;
            debug!(txn = %id, "Transaction expired on access");
            return Err(Error::TransactionExpired);
        }

        Ok(entry.clone())
    }

    /// Atomically mutate the transaction with the given id.
    ///
    /// The mutator runs while the shard guard is held, so concurrent
    /// updates on the same id serialize. Preconditions enforced before the
    /// mutator runs:
    ///
    /// - unknown id → [`Error::TransactionNotFound`]
    /// - terminal status → [`Error::TransactionNotFound`] (finalized
    ///   transactions behave as gone; a stale consent link cannot reach
    ///   them)
    /// - past deadline → marked `Expired`, [`Error::TransactionExpired`]
    ///
    /// Returns the post-mutation state on success.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Transaction>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let mut entry = self.inner.get_mut(id).ok_or(Error::TransactionNotFound)?;

        if entry.status.is_terminal() {
            return Err(Error::TransactionNotFound);
        }
        if entry.is_expired() {
            entry.status = TransactionStatus::Expired;
            return Err(Error::TransactionExpired);
        }

        mutate(&mut entry)?;
        Ok(entry.clone())
    }

    /// Remove entries past their deadline (terminal or not) and terminal
    /// entries; returns how many were removed.
    ///
    /// Safe to run concurrently with foreground access: `retain` takes the
    /// same per-shard locks as `update`, so a sweep never observes a
    /// half-applied mutation.
    pub fn sweep(&self) -> usize {
        let before = self.inner.len();
        self.inner
            .retain(|_, txn| !txn.is_expired() && !txn.status.is_terminal());
        let removed = before.saturating_sub(self.inner.len());
        if removed > 0 {
            debug!(count = removed, "Swept transactions");
        }
        removed
    }

    /// Drop identity data from a transaction without touching its status.
    ///
    /// Used when claim retention is disabled and the transaction has gone
    /// EXPIRED or FAILED. A no-op for unknown ids.
    pub fn scrub_identity(&self, id: &str) {
        if let Some(mut entry) = self.inner.get_mut(id) {
            entry.subject = None;
            entry.claims.clear();
        }
    }

    /// Number of live entries (test/diagnostic use).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed store of pre-transaction correlations, keyed by the
/// gateway-generated upstream `state`.
pub struct PendingStore {
    inner: DashMap<String, PendingAuthorization>,
}

impl PendingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Store a correlation under its upstream state.
    pub fn put(&self, pending: PendingAuthorization) {
        self.inner.insert(pending.state.clone(), pending);
    }

    /// Resolve and remove the correlation for an upstream `state` in one
    /// atomic step.
    ///
    /// The removal is what rejects a duplicate provider callback: the
    /// second request finds nothing and fails with `invalid_state`, so the
    /// already-consumed upstream code is never exchanged twice.
    pub fn take(&self, state: &str) -> Result<PendingAuthorization> {
        let (_, pending) = self.inner.remove(state).ok_or(Error::InvalidState)?;

        if pending.is_expired() {
            debug!(state = %state, "Pending authorization expired");
            return Err(Error::InvalidState);
        }

        Ok(pending)
    }

    /// Remove correlations past their deadline; returns how many.
    pub fn sweep(&self) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, p| !p.is_expired());
        let removed = before.saturating_sub(self.inner.len());
        if removed > 0 {
            debug!(count = removed, "Swept pending authorizations");
        }
        removed
    }

    /// Number of live entries (test/diagnostic use).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for PendingStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything the background sweeper can purge.
pub trait Sweep: Send + Sync + 'static {
    /// Remove expired entries; returns how many were removed.
    fn sweep(&self) -> usize;
}

impl Sweep for TransactionStore {
    fn sweep(&self) -> usize {
        TransactionStore::sweep(self)
    }
}

impl Sweep for PendingStore {
    fn sweep(&self) -> usize {
        PendingStore::sweep(self)
    }
}

/// Spawn a background task that sweeps `store` every `interval`.
///
/// The task exits when the `shutdown` receiver fires. Sweeping is low
/// priority and never blocks foreground request handling.
pub fn spawn_sweeper(
    name: &'static str,
    store: Arc<dyn Sweep>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = store.sweep();
                    if swept > 0 {
                        debug!(store = name, count = swept, "Sweeper purged expired entries");
                    }
                }
                _ = shutdown.recv() => {
                    debug!(store = name, "Sweeper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::transaction::ClientBinding;

    fn binding() -> ClientBinding {
        ClientBinding {
            redirect_uri: "https://client/cb".to_string(),
            state: Some("abc".to_string()),
            code_challenge: None,
        }
    }

    fn make_txn(ttl_secs: i64) -> Transaction {
        let mut txn = Transaction::new(
            "XYZ".to_string(),
            binding(),
            Duration::from_secs(ttl_secs.unsigned_abs()),
        );
        if ttl_secs < 0 {
            txn.expires_at = txn.created_at.saturating_sub(ttl_secs.unsigned_abs());
        }
        txn
    }

    #[test]
    fn put_and_get_round_trip() {
        // GIVEN: a store with one transaction
        let store = TransactionStore::new();
        let txn = make_txn(900);
        let id = txn.id.clone();
        store.put(txn);

        // WHEN: we look it up
        let found = store.get(&id).unwrap();

        // THEN: the stored state comes back
        assert_eq!(found.status, TransactionStatus::CodeReceived);
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let store = TransactionStore::new();
        assert!(matches!(
            store.get("txn_missing"),
            Err(Error::TransactionNotFound)
        ));
    }

    #[test]
    fn get_marks_overdue_transaction_expired() {
        // GIVEN: a transaction past its deadline
        let store = TransactionStore::new();
        let txn = make_txn(-1);
        let id = txn.id.clone();
        store.put(txn);

        // WHEN: any access happens
        let err = store.get(&id).unwrap_err();

        // THEN: it reports expiry and the stored status flipped to Expired
        assert!(matches!(err, Error::TransactionExpired));
        assert_eq!(
            store.inner.get(&id).unwrap().status,
            TransactionStatus::Expired
        );
    }

    #[test]
    fn update_applies_mutator_and_returns_new_state() {
        let store = TransactionStore::new();
        let txn = make_txn(900);
        let id = txn.id.clone();
        store.put(txn);

        let updated = store
            .update(&id, |t| {
                t.status = TransactionStatus::AwaitingConsent;
                t.subject = Some("u1".to_string());
                Ok(())
            })
            .unwrap();

        assert_eq!(updated.status, TransactionStatus::AwaitingConsent);
        assert_eq!(updated.subject.as_deref(), Some("u1"));
    }

    #[test]
    fn update_rejects_terminal_transaction() {
        // GIVEN: a completed transaction
        let store = TransactionStore::new();
        let mut txn = make_txn(900);
        txn.status = TransactionStatus::Completed;
        let id = txn.id.clone();
        store.put(txn);

        // WHEN: an update is attempted
        let err = store
            .update(&id, |t| {
                t.subject = Some("tampered".to_string());
                Ok(())
            })
            .unwrap_err();

        // THEN: it fails as not-found and the state is untouched
        assert!(matches!(err, Error::TransactionNotFound));
        assert!(store.inner.get(&id).unwrap().subject.is_none());
    }

    #[test]
    fn update_rejects_expired_transaction() {
        let store = TransactionStore::new();
        let txn = make_txn(-1);
        let id = txn.id.clone();
        store.put(txn);

        let err = store
            .update(&id, |t| {
                t.status = TransactionStatus::ConsentRecorded;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::TransactionExpired));
    }

    #[test]
    fn mutator_error_propagates_without_status_change() {
        // GIVEN: a mutator that rejects (state-machine precondition)
        let store = TransactionStore::new();
        let txn = make_txn(900);
        let id = txn.id.clone();
        store.put(txn);

        let err = store
            .update(&id, |t| {
                if t.status == TransactionStatus::AwaitingConsent {
                    t.status = TransactionStatus::ConsentRecorded;
                    Ok(())
                } else {
                    Err(Error::TransactionNotFound)
                }
            })
            .unwrap_err();

        assert!(matches!(err, Error::TransactionNotFound));
        assert_eq!(
            store.inner.get(&id).unwrap().status,
            TransactionStatus::CodeReceived
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_serialize_to_one_winner() {
        // GIVEN: an AwaitingConsent transaction and two racing updates that
        // each require AwaitingConsent as a precondition
        let store = Arc::new(TransactionStore::new());
        let mut txn = make_txn(900);
        txn.status = TransactionStatus::AwaitingConsent;
        let id = txn.id.clone();
        store.put(txn);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.update(&id, |t| {
                    if t.status == TransactionStatus::AwaitingConsent {
                        t.status = TransactionStatus::ConsentRecorded;
                        Ok(())
                    } else {
                        Err(Error::TransactionNotFound)
                    }
                })
            }));
        }

        let mut wins = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                wins += 1;
            }
        }

        // THEN: exactly one update claimed the transition
        assert_eq!(wins, 1);
    }

    #[test]
    fn scrub_identity_clears_subject_and_claims_in_place() {
        // GIVEN: an expired transaction still carrying identity data
        let store = TransactionStore::new();
        let mut txn = make_txn(-1);
        txn.subject = Some("u1".to_string());
        txn.claims
            .insert("email".to_string(), serde_json::json!("a@b.com"));
        let id = txn.id.clone();
        store.put(txn);
        let _ = store.get(&id); // flips the status to Expired

        // WHEN: identity is scrubbed
        store.scrub_identity(&id);

        // THEN: the row remains, status untouched, identity gone
        let entry = store.inner.get(&id).unwrap();
        assert_eq!(entry.status, TransactionStatus::Expired);
        assert!(entry.subject.is_none());
        assert!(entry.claims.is_empty());

        // Unknown ids are a no-op
        store.scrub_identity("txn_missing");
    }

    #[test]
    fn sweep_removes_expired_and_completed() {
        let store = TransactionStore::new();
        let live = make_txn(900);
        let dead = make_txn(-5);
        let mut done = make_txn(900);
        done.status = TransactionStatus::Completed;

        store.put(live);
        store.put(dead);
        store.put(done);

        let removed = store.sweep();

        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn pending_take_is_one_shot() {
        // GIVEN: one stored correlation
        let store = PendingStore::new();
        let pending = PendingAuthorization {
            state: "st_1".to_string(),
            proxy_code_verifier: "verifier".to_string(),
            client: binding(),
            expires_at: super::super::transaction::epoch_secs() + 600,
        };
        store.put(pending);

        // WHEN: taken twice (duplicate provider callback)
        let first = store.take("st_1");
        let second = store.take("st_1");

        // THEN: the first resolves, the second is invalid_state
        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::InvalidState)));
    }

    #[test]
    fn pending_take_rejects_expired_correlation() {
        let store = PendingStore::new();
        let pending = PendingAuthorization {
            state: "st_old".to_string(),
            proxy_code_verifier: "verifier".to_string(),
            client: binding(),
            expires_at: 0,
        };
        store.put(pending);

        assert!(matches!(store.take("st_old"), Err(Error::InvalidState)));
        // Consumed even though expired
        assert!(store.is_empty());
    }

    #[test]
    fn pending_sweep_removes_expired() {
        let store = PendingStore::new();
        let now = super::super::transaction::epoch_secs();
        store.put(PendingAuthorization {
            state: "st_live".to_string(),
            proxy_code_verifier: "v".to_string(),
            client: binding(),
            expires_at: now + 600,
        });
        store.put(PendingAuthorization {
            state: "st_dead".to_string(),
            proxy_code_verifier: "v".to_string(),
            client: binding(),
            expires_at: 0,
        });

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }
}
