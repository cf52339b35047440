//! Idempotent operation ledger: at-most-once execution of mutating
//! operations keyed by caller-supplied idempotency tokens.
//!
//! The ledger guarantees three things for a given `(namespace, key)`:
//!
//! - the operation body executes **at most once**, even under concurrent
//!   duplicates (test-and-set install of an in-flight entry);
//! - every duplicate caller — concurrent or later — observes the **same
//!   outcome**, success and failure alike;
//! - a caller that gives up waiting (timeout, disconnect) never aborts the
//!   in-flight operation: the work runs on a spawned task and its outcome
//!   is stored for everyone else.
//!
//! Entries are sharded by key hash so unrelated keys never contend on one
//! lock; shard locks are held only for map bookkeeping, never across the
//! operation itself. Completed entries are retained for a bounded window so
//! client retries replay the stored outcome, then reclaimed.
//!
//! # Example
//!
//! ```rust
//! use velvet_runtime::ledger::{IdempotencyLedger, LedgerConfig};
//! use velvet_core::{IdempotencyKey, Namespace, RequestFingerprint};
//!
//! # async fn example() -> Result<(), velvet_core::CoreError> {
//! let ledger: IdempotencyLedger<u64> = IdempotencyLedger::new(LedgerConfig::default());
//! let key = IdempotencyKey::parse("client-retry-1")?;
//! let fp = RequestFingerprint::of(&42u64)?;
//!
//! let outcome = ledger
//!     .execute(Namespace::Hold, key, fp, || async { Ok(42) })
//!     .await?;
//! assert_eq!(outcome, 42);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use metrics::counter;
use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry as MapEntry};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use velvet_core::clock::{Clock, SystemClock};
use velvet_core::error::CoreError;
use velvet_core::idempotency::{IdempotencyKey, Namespace, RequestFingerprint};

/// Outcome stored and replayed by the ledger.
pub type Outcome<T> = Result<T, CoreError>;

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long completed entries are retained for replay.
    pub retention: Duration,
    /// Completed-entry cap per shard; oldest completed entries are dropped
    /// first. In-flight entries are never dropped.
    pub max_entries_per_shard: usize,
    /// Number of shards the entry map is split into.
    pub shards: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(15 * 60),
            max_entries_per_shard: 1024,
            shards: 16,
        }
    }
}

impl LedgerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> LedgerConfigBuilder {
        LedgerConfigBuilder {
            retention: None,
            max_entries_per_shard: None,
            shards: None,
        }
    }
}

/// Builder for [`LedgerConfig`].
#[derive(Debug, Clone)]
pub struct LedgerConfigBuilder {
    retention: Option<Duration>,
    max_entries_per_shard: Option<usize>,
    shards: Option<usize>,
}

impl LedgerConfigBuilder {
    /// Set the completed-entry retention window.
    #[must_use]
    pub const fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Set the completed-entry cap per shard.
    #[must_use]
    pub const fn max_entries_per_shard(mut self, max: usize) -> Self {
        self.max_entries_per_shard = Some(max);
        self
    }

    /// Set the shard count. Clamped to at least one.
    #[must_use]
    pub const fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> LedgerConfig {
        let defaults = LedgerConfig::default();
        LedgerConfig {
            retention: self.retention.unwrap_or(defaults.retention),
            max_entries_per_shard: self
                .max_entries_per_shard
                .unwrap_or(defaults.max_entries_per_shard),
            shards: self.shards.unwrap_or(defaults.shards).max(1),
        }
    }
}

type LedgerKey = (Namespace, IdempotencyKey);

enum Entry<T> {
    InFlight {
        fingerprint: RequestFingerprint,
        rx: watch::Receiver<Option<Outcome<T>>>,
    },
    Completed {
        fingerprint: RequestFingerprint,
        outcome: Outcome<T>,
        stored_at: DateTime<Utc>,
    },
}

struct Inner<T> {
    shards: Vec<Mutex<HashMap<LedgerKey, Entry<T>>>>,
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
}

impl<T> Inner<T> {
    fn shard_index(&self, namespace: Namespace, key: &IdempotencyKey) -> usize {
        let mut hasher = DefaultHasher::new();
        namespace.as_str().hash(&mut hasher);
        key.as_str().hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    fn retention_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.retention).unwrap_or(TimeDelta::MAX)
    }

    /// Drop completed entries past retention. Shard lock must be held.
    fn prune_expired(&self, shard: &mut HashMap<LedgerKey, Entry<T>>, now: DateTime<Utc>) {
        let retention = self.retention_delta();
        let before = shard.len();
        shard.retain(|_, entry| match entry {
            Entry::Completed { stored_at, .. } => now - *stored_at < retention,
            Entry::InFlight { .. } => true,
        });
        let pruned = before - shard.len();
        if pruned > 0 {
            counter!("ledger_entries_pruned_total").increment(pruned as u64);
        }
    }

    /// Drop oldest completed entries above the per-shard cap. Shard lock
    /// must be held.
    fn enforce_capacity(&self, shard: &mut HashMap<LedgerKey, Entry<T>>) {
        let cap = self.config.max_entries_per_shard;
        if shard.len() <= cap {
            return;
        }
        let mut completed: Vec<(LedgerKey, DateTime<Utc>)> = shard
            .iter()
            .filter_map(|(k, e)| match e {
                Entry::Completed { stored_at, .. } => Some((k.clone(), *stored_at)),
                Entry::InFlight { .. } => None,
            })
            .collect();
        completed.sort_by_key(|(_, stored_at)| *stored_at);
        let overflow = shard.len() - cap;
        for (key, _) in completed.into_iter().take(overflow) {
            shard.remove(&key);
            counter!("ledger_entries_pruned_total").increment(1);
        }
    }
}

enum Plan<T> {
    Run(watch::Sender<Option<Outcome<T>>>),
    Replay(Outcome<T>),
    Wait(watch::Receiver<Option<Outcome<T>>>),
    Conflict,
}

/// Deduplicating ledger for mutating operations.
///
/// Cloning is cheap and shares the underlying state; construct one per
/// logical ledger and pass clones to the components that need it. `clear`
/// provides the defined teardown for test isolation and shutdown.
pub struct IdempotencyLedger<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for IdempotencyLedger<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> IdempotencyLedger<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a ledger with the given configuration and the system clock.
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a ledger with an injected clock (tests).
    #[must_use]
    pub fn with_clock(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        let shard_count = config.shards.max(1);
        let shards = (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(Inner {
                shards,
                config,
                clock,
            }),
        }
    }

    /// Execute `operation` at most once for `(namespace, key)`.
    ///
    /// The first caller installs an in-flight entry and the operation runs
    /// on a spawned task; concurrent duplicates with a matching fingerprint
    /// wait for that task's outcome, later duplicates within the retention
    /// window replay the stored outcome. Callers may bound their own wait
    /// (e.g. `tokio::time::timeout`) without affecting the operation.
    ///
    /// # Errors
    ///
    /// - `Conflict` when the key is reused with a different request
    ///   fingerprint;
    /// - the operation's own error, replayed identically to every caller;
    /// - `Internal` when the operation panicked or its task was torn down.
    pub async fn execute<F, Fut>(
        &self,
        namespace: Namespace,
        key: IdempotencyKey,
        fingerprint: RequestFingerprint,
        operation: F,
    ) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        counter!("ledger_executions_total", "namespace" => namespace.as_str()).increment(1);
        let now = self.inner.clock.now();
        let idx = self.inner.shard_index(namespace, &key);

        let plan = {
            let mut shard = self.inner.shards[idx].lock().await;
            self.inner.prune_expired(&mut shard, now);
            match shard.entry((namespace, key.clone())) {
                MapEntry::Occupied(entry) => match entry.get() {
                    Entry::Completed {
                        fingerprint: stored,
                        outcome,
                        ..
                    } => {
                        if *stored == fingerprint {
                            Plan::Replay(outcome.clone())
                        } else {
                            Plan::Conflict
                        }
                    }
                    Entry::InFlight {
                        fingerprint: stored,
                        rx,
                    } => {
                        if *stored == fingerprint {
                            Plan::Wait(rx.clone())
                        } else {
                            Plan::Conflict
                        }
                    }
                },
                MapEntry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(None);
                    slot.insert(Entry::InFlight {
                        fingerprint: fingerprint.clone(),
                        rx,
                    });
                    Plan::Run(tx)
                }
            }
        };

        match plan {
            Plan::Replay(outcome) => {
                counter!("ledger_replays_total", "namespace" => namespace.as_str()).increment(1);
                tracing::debug!(namespace = %namespace, key = %key, "replaying stored outcome");
                outcome
            }
            Plan::Conflict => {
                counter!("ledger_conflicts_total", "namespace" => namespace.as_str()).increment(1);
                tracing::warn!(
                    namespace = %namespace,
                    key = %key,
                    "idempotency key reused with a different request"
                );
                Err(CoreError::Conflict(
                    "idempotency key reused with a different request".into(),
                ))
            }
            Plan::Wait(rx) => {
                counter!("ledger_coalesced_waits_total", "namespace" => namespace.as_str())
                    .increment(1);
                tracing::debug!(namespace = %namespace, key = %key, "waiting on in-flight duplicate");
                await_outcome(rx).await
            }
            Plan::Run(tx) => {
                let rx = tx.subscribe();
                self.spawn_driver(namespace, key, fingerprint, idx, tx, operation());
                await_outcome(rx).await
            }
        }
    }

    /// Drop all entries. Defined teardown for tests and shutdown.
    pub async fn clear(&self) {
        for shard in &self.inner.shards {
            shard.lock().await.clear();
        }
    }

    /// Prune completed entries past the retention window in every shard.
    pub async fn purge_expired(&self) {
        let now = self.inner.clock.now();
        for shard in &self.inner.shards {
            let mut shard = shard.lock().await;
            self.inner.prune_expired(&mut shard, now);
        }
    }

    /// Total entries currently held (in-flight and completed).
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.inner.shards {
            total += shard.lock().await.len();
        }
        total
    }

    /// True when the ledger holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn spawn_driver<Fut>(
        &self,
        namespace: Namespace,
        key: IdempotencyKey,
        fingerprint: RequestFingerprint,
        idx: usize,
        tx: watch::Sender<Option<Outcome<T>>>,
        operation: Fut,
    ) where
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(namespace = %namespace, key = %key, "operation panicked");
                    Err(CoreError::Internal("operation panicked".into()))
                }
            };
            let stored_at = inner.clock.now();
            {
                let mut shard = inner.shards[idx].lock().await;
                shard.insert(
                    (namespace, key),
                    Entry::Completed {
                        fingerprint,
                        outcome: outcome.clone(),
                        stored_at,
                    },
                );
                inner.enforce_capacity(&mut shard);
            }
            // Waiters that grabbed the in-flight receiver before the swap
            // above still get notified; send_replace never fails.
            tx.send_replace(Some(outcome));
        });
    }
}

async fn await_outcome<T: Clone>(mut rx: watch::Receiver<Option<Outcome<T>>>) -> Outcome<T> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return Err(CoreError::Internal("in-flight operation abandoned".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(raw: &str) -> IdempotencyKey {
        IdempotencyKey::parse(raw).unwrap()
    }

    fn fp(tag: u32) -> RequestFingerprint {
        RequestFingerprint::of(&tag).unwrap()
    }

    #[tokio::test]
    async fn first_call_executes_and_stores() {
        let ledger: IdempotencyLedger<u32> = IdempotencyLedger::new(LedgerConfig::default());
        let out = ledger
            .execute(Namespace::Hold, key("k1"), fp(1), || async { Ok(7) })
            .await;
        assert_eq!(out, Ok(7));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn replay_does_not_rerun_the_operation() {
        let ledger: IdempotencyLedger<u32> = IdempotencyLedger::new(LedgerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let out = ledger
                .execute(Namespace::Hold, key("k1"), fp(1), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(out, Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_replayed_verbatim() {
        let ledger: IdempotencyLedger<u32> = IdempotencyLedger::new(LedgerConfig::default());
        let expected = Err(CoreError::Conflict("table taken".into()));
        let out = ledger
            .execute(Namespace::Hold, key("k1"), fp(1), || async {
                Err(CoreError::Conflict("table taken".into()))
            })
            .await;
        assert_eq!(out, expected);

        // The stored failure comes back without re-running anything.
        let out = ledger
            .execute(Namespace::Hold, key("k1"), fp(1), || async {
                Ok(99) // would succeed if it ran
            })
            .await;
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_a_conflict() {
        let ledger: IdempotencyLedger<u32> = IdempotencyLedger::new(LedgerConfig::default());
        ledger
            .execute(Namespace::Hold, key("k1"), fp(1), || async { Ok(7) })
            .await
            .unwrap();
        let out = ledger
            .execute(Namespace::Hold, key("k1"), fp(2), || async { Ok(8) })
            .await;
        assert_eq!(out.unwrap_err().kind(), "conflict");
    }

    #[tokio::test]
    async fn namespaces_do_not_share_keys() {
        let ledger: IdempotencyLedger<u32> = IdempotencyLedger::new(LedgerConfig::default());
        let a = ledger
            .execute(Namespace::Hold, key("k1"), fp(1), || async { Ok(1) })
            .await;
        let b = ledger
            .execute(Namespace::Confirm, key("k1"), fp(1), || async { Ok(2) })
            .await;
        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(2));
    }

    #[tokio::test]
    async fn panicking_operation_yields_internal() {
        let ledger: IdempotencyLedger<u32> = IdempotencyLedger::new(LedgerConfig::default());
        let out = ledger
            .execute(Namespace::Hold, key("k1"), fp(1), || async {
                panic!("boom");
            })
            .await;
        assert_eq!(out.unwrap_err().kind(), "internal");
    }

    #[tokio::test]
    async fn capacity_cap_drops_oldest_completed() {
        let config = LedgerConfig::builder()
            .shards(1)
            .max_entries_per_shard(2)
            .build();
        let ledger: IdempotencyLedger<u32> = IdempotencyLedger::new(config);
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            ledger
                .execute(Namespace::Hold, key(k), fp(i as u32), move || async move {
                    Ok(i as u32)
                })
                .await
                .unwrap();
        }
        assert_eq!(ledger.len().await, 2);
    }

    #[tokio::test]
    async fn clear_empties_the_ledger() {
        let ledger: IdempotencyLedger<u32> = IdempotencyLedger::new(LedgerConfig::default());
        ledger
            .execute(Namespace::Hold, key("k1"), fp(1), || async { Ok(7) })
            .await
            .unwrap();
        ledger.clear().await;
        assert!(ledger.is_empty().await);
    }
}
