//! Named registry of coalescers.

use crate::coalescer::{CoalescerSettings, CoalescerStats, RequestCoalescer};
use herd_core::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;
use tracing::debug;

/// Holds one [`RequestCoalescer`] per name, created on first use.
///
/// Different call sites coalescing unrelated work should use different
/// names so their keys never collide.
pub struct CoalescingManager<K, V> {
    coalescers: RwLock<HashMap<String, RequestCoalescer<K, V>>>,
    defaults: CoalescerSettings,
}

impl<K, V> CoalescingManager<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a manager whose lazily-created coalescers use `defaults`.
    pub fn new(defaults: CoalescerSettings) -> Self {
        Self {
            coalescers: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    /// Returns the coalescer registered under `name`, creating it with the
    /// default settings if needed.
    pub fn coalescer(&self, name: &str) -> RequestCoalescer<K, V> {
        if let Some(existing) = self.coalescers.read().get(name) {
            return existing.clone();
        }

        self.coalescers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name, "Creating coalescer");
                RequestCoalescer::new(self.defaults.clone())
            })
            .clone()
    }

    /// Registers a coalescer with explicit settings. An existing coalescer
    /// under the same name is kept and returned unchanged.
    pub fn register(&self, name: &str, settings: CoalescerSettings) -> RequestCoalescer<K, V> {
        self.coalescers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| RequestCoalescer::new(settings))
            .clone()
    }

    /// Coalesces `fetch` under the named coalescer.
    pub async fn execute<F, Fut, E>(&self, name: &str, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.coalescer(name).execute(key, fetch).await
    }

    /// Returns the registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.coalescers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns statistics summed over every coalescer.
    pub fn stats(&self) -> CoalescerStats {
        self.coalescers
            .read()
            .values()
            .fold(CoalescerStats::default(), |mut total, coalescer| {
                total.merge(&coalescer.stats());
                total
            })
    }

    /// Returns statistics per coalescer name.
    pub fn stats_by_name(&self) -> BTreeMap<String, CoalescerStats> {
        self.coalescers
            .read()
            .iter()
            .map(|(name, coalescer)| (name.clone(), coalescer.stats()))
            .collect()
    }
}

impl<K, V> Default for CoalescingManager<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CoalescerSettings::default())
    }
}
