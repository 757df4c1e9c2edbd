//! Request coalescing to deduplicate concurrent identical requests.
//!
//! When many callers ask for the same key at once, only the first one
//! (the executor) runs the underlying call; everyone else joins its
//! in-flight future and receives the identical result or error. A
//! successful result then stays cached for the rest of the coalescing
//! window, measured from when the execution started.
//!
//! Failures are never cached: the entry is dropped as soon as the call
//! fails, so the next caller retries.

use crate::cache::TimedCache;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use herd_core::{HerdError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use validator::Validate;

/// Configuration for request coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CoalescerSettings {
    /// How long a completed result is reused, measured from execution start.
    #[serde(with = "herd_core::serde_ms", rename = "window_ms")]
    pub window: Duration,
    /// Maximum number of requests one completed result may serve,
    /// counting the execution itself. `None` means unlimited.
    #[validate(range(min = 1))]
    pub max_requests: Option<u32>,
    /// Maximum number of keys tracked at once. Requests for new keys beyond
    /// this run uncoalesced.
    #[validate(range(min = 1))]
    pub max_entries: usize,
}

impl Default for CoalescerSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(100),
            max_requests: None,
            max_entries: 10_000,
        }
    }
}

/// Statistics for request coalescing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoalescerStats {
    /// Total requests received.
    pub total_requests: u64,
    /// Requests that joined an in-flight execution.
    pub coalesced_requests: u64,
    /// Requests served from a completed result within its window.
    pub cache_hits: u64,
    /// Executions of the underlying call.
    pub executions: u64,
    /// Executions that ran uncoalesced because the entry table was full.
    pub bypassed: u64,
    /// Executions that failed.
    pub failures: u64,
    /// Keys with an execution currently in flight.
    pub in_flight: usize,
    /// Keys currently tracked (in flight or cached).
    pub entries: usize,
}

impl CoalescerStats {
    /// Returns the share of requests that did not trigger an execution.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.coalesced_requests + self.cache_hits) as f64 / self.total_requests as f64
        }
    }

    /// Folds another coalescer's counters into this one.
    pub fn merge(&mut self, other: &CoalescerStats) {
        self.total_requests += other.total_requests;
        self.coalesced_requests += other.coalesced_requests;
        self.cache_hits += other.cache_hits;
        self.executions += other.executions;
        self.bypassed += other.bypassed;
        self.failures += other.failures;
        self.in_flight += other.in_flight;
        self.entries += other.entries;
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

enum EntryState<V> {
    InFlight(SharedFetch<V>),
    Ready(V),
}

struct Entry<V> {
    generation: u64,
    started_at: Instant,
    served: u32,
    state: EntryState<V>,
}

enum Plan<V> {
    Ready(V),
    Join(SharedFetch<V>),
    Execute,
    Bypass,
}

#[derive(Default)]
struct StatsInner {
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    cache_hits: AtomicU64,
    executions: AtomicU64,
    bypassed: AtomicU64,
    failures: AtomicU64,
}

struct Inner<K, V> {
    entries: Mutex<TimedCache<K, Entry<V>>>,
    settings: CoalescerSettings,
    next_generation: AtomicU64,
    stats: StatsInner,
}

/// Request coalescer for deduplicating concurrent requests.
///
/// Cloning is cheap and yields a handle to the same coalescer.
pub struct RequestCoalescer<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for RequestCoalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for RequestCoalescer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl<K, V> RequestCoalescer<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new request coalescer.
    pub fn new(settings: CoalescerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(TimedCache::new(settings.window)),
                settings,
                next_generation: AtomicU64::new(0),
                stats: StatsInner::default(),
            }),
        }
    }

    /// Creates a coalescer with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CoalescerSettings::default())
    }

    /// Creates a coalescer after validating its settings.
    pub fn try_new(settings: CoalescerSettings) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| HerdError::config(e.to_string()))?;
        Ok(Self::new(settings))
    }

    /// Returns the coalescer settings.
    pub fn settings(&self) -> &CoalescerSettings {
        &self.inner.settings
    }

    /// Runs `fetch` for `key`, or shares the outcome of an execution that is
    /// already running or recently completed for the same key.
    ///
    /// `fetch` is only invoked when this caller is elected executor. The
    /// call keeps running as long as any caller awaits it, so an executor
    /// that gives up does not strand the callers that joined it.
    pub async fn execute<F, Fut, E>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let inner = &self.inner;
        inner.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let candidate = Inner::fetch_future(Arc::downgrade(inner), key.clone(), generation, fetch);

        match inner.plan(&key, generation, &candidate) {
            Plan::Ready(value) => Ok(value),
            Plan::Join(in_flight) => in_flight.await,
            Plan::Execute | Plan::Bypass => candidate.await,
        }
    }

    /// Drops the cached result for `key`. An in-flight execution is left
    /// alone. Returns true if a result was dropped.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut entries = self.inner.entries.lock();
        let cached = entries
            .get(key)
            .is_some_and(|entry| matches!(entry.state, EntryState::Ready(_)));
        if cached {
            entries.remove(key);
        }
        cached
    }

    /// Drops every cached result, keeping in-flight executions.
    pub fn clear(&self) {
        self.inner
            .entries
            .lock()
            .retain(|_, entry| matches!(entry.state, EntryState::InFlight(_)));
    }

    /// Drops results whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.entries.lock().purge_expired()
    }

    /// Returns statistics.
    pub fn stats(&self) -> CoalescerStats {
        let (in_flight, entries) = {
            let entries = self.inner.entries.lock();
            let in_flight = entries
                .values()
                .filter(|entry| matches!(entry.state, EntryState::InFlight(_)))
                .count();
            (in_flight, entries.len())
        };

        let stats = &self.inner.stats;
        CoalescerStats {
            total_requests: stats.total_requests.load(Ordering::Relaxed),
            coalesced_requests: stats.coalesced_requests.load(Ordering::Relaxed),
            cache_hits: stats.cache_hits.load(Ordering::Relaxed),
            executions: stats.executions.load(Ordering::Relaxed),
            bypassed: stats.bypassed.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            in_flight,
            entries,
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds the lazily-started execution for one generation. Nothing runs
    /// until the future is first polled, so an unused candidate never
    /// invokes `fetch`. The future holds the coalescer weakly since the
    /// coalescer's own entry table holds the future.
    fn fetch_future<F, Fut, E>(
        inner: Weak<Self>,
        key: K,
        generation: u64,
        fetch: F,
    ) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        async move {
            let outcome = AssertUnwindSafe(async move { fetch().await })
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(HerdError::execution(err)),
                Err(payload) => Err(HerdError::from_panic("coalesced call", payload)),
            };
            if let Some(inner) = inner.upgrade() {
                inner.complete(&key, generation, &result);
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Decides, under the entry lock, how this request is served. On
    /// `Execute` the candidate is registered as the key's in-flight work.
    fn plan(&self, key: &K, generation: u64, candidate: &SharedFetch<V>) -> Plan<V> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            match &entry.state {
                EntryState::InFlight(in_flight) => {
                    self.stats.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                    return Plan::Join(in_flight.clone());
                }
                EntryState::Ready(value) => {
                    entry.served += 1;
                    let exhausted = self
                        .settings
                        .max_requests
                        .is_some_and(|max| entry.served >= max);
                    if !exhausted {
                        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Plan::Ready(value.clone());
                    }
                    debug!(served = entry.served, "Request limit reached, refreshing result");
                }
            }
        } else if entries.len() >= self.settings.max_entries {
            entries.purge_expired();
            if entries.len() >= self.settings.max_entries {
                self.stats.bypassed.fetch_add(1, Ordering::Relaxed);
                self.stats.executions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    max_entries = self.settings.max_entries,
                    "Entry table full, executing uncoalesced"
                );
                return Plan::Bypass;
            }
        }

        entries.insert_pinned(
            key.clone(),
            Entry {
                generation,
                started_at: Instant::now(),
                served: 1,
                state: EntryState::InFlight(candidate.clone()),
            },
        );
        self.stats.executions.fetch_add(1, Ordering::Relaxed);
        Plan::Execute
    }

    /// Commits an execution's outcome if the entry still belongs to it.
    fn complete(&self, key: &K, generation: u64, result: &Result<V>) {
        if result.is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut entries = self.entries.lock();
        let deadline = match entries.get_mut(key) {
            Some(entry) if entry.generation == generation => match result {
                Ok(value) => {
                    let deadline = entry.started_at + self.settings.window;
                    entry.state = EntryState::Ready(value.clone());
                    Some(deadline)
                }
                Err(_) => None,
            },
            _ => return,
        };

        match deadline {
            Some(deadline) if deadline > Instant::now() => {
                entries.set_expiry(key, Some(deadline));
            }
            Some(_) => {
                debug!(generation, "Execution outlived its window, result not cached");
                entries.remove(key);
            }
            None => {
                debug!(generation, "Execution failed, entry cleared for retry");
                entries.remove(key);
            }
        }
    }
}
