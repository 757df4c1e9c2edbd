//! Keyed batch collectors sharing one batch function.

use crate::collector::{batch_fn, BatchCollector, BatchFn, BatchSettings, BatchStats};
use herd_core::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use tracing::debug;

/// Routes items to independent [`BatchCollector`]s by key.
///
/// Each key gets its own size and timer state, so logically separate
/// streams (one per table, one per downstream endpoint) never share a
/// batch. Collectors are created on first use.
pub struct BatchProcessor<T, R> {
    settings: BatchSettings,
    batch_fn: BatchFn<T, R>,
    collectors: RwLock<HashMap<String, BatchCollector<T, R>>>,
}

impl<T, R> BatchProcessor<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Creates a processor whose collectors all use `settings` and `f`.
    pub fn new<F, Fut>(settings: BatchSettings, f: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<R>>> + Send + 'static,
    {
        Self {
            settings,
            batch_fn: batch_fn(f),
            collectors: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the collector for `key`, creating it if needed.
    pub fn collector(&self, key: &str) -> BatchCollector<T, R> {
        if let Some(collector) = self.collectors.read().get(key) {
            return collector.clone();
        }

        self.collectors
            .write()
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, "Creating batch collector");
                BatchCollector::with_batch_fn(self.settings.clone(), self.batch_fn.clone())
            })
            .clone()
    }

    fn existing(&self, key: &str) -> Option<BatchCollector<T, R>> {
        self.collectors.read().get(key).cloned()
    }

    fn all(&self) -> Vec<BatchCollector<T, R>> {
        self.collectors.read().values().cloned().collect()
    }

    /// Submits one item to the collector for `key` and waits for its result.
    pub async fn process(&self, key: &str, item: T) -> Result<R> {
        self.collector(key).submit(item).await
    }

    /// Submits several items to the collector for `key` and waits for all
    /// of them. Results are returned in input order.
    pub async fn process_many(&self, key: &str, items: Vec<T>) -> Vec<Result<R>> {
        let collector = self.collector(key);
        let tickets: Vec<_> = items.into_iter().map(|item| collector.add(item)).collect();
        futures::future::join_all(tickets).await
    }

    /// Processes the open batch for `key` now. Returns how many items it
    /// held; an unknown key holds none.
    pub async fn flush(&self, key: &str) -> usize {
        match self.existing(key) {
            Some(collector) => collector.flush().await,
            None => 0,
        }
    }

    /// Processes every open batch now.
    pub async fn flush_all(&self) -> usize {
        let mut flushed = 0;
        for collector in self.all() {
            flushed += collector.flush().await;
        }
        flushed
    }

    /// Returns statistics for `key`.
    pub fn stats(&self, key: &str) -> Option<BatchStats> {
        self.existing(key).map(|collector| collector.stats())
    }

    /// Returns statistics for every key.
    pub fn all_stats(&self) -> BTreeMap<String, BatchStats> {
        self.collectors
            .read()
            .iter()
            .map(|(key, collector)| (key.clone(), collector.stats()))
            .collect()
    }

    /// Resets statistics for `key`. Returns false for an unknown key.
    pub fn reset_stats(&self, key: &str) -> bool {
        match self.existing(key) {
            Some(collector) => {
                collector.reset_stats();
                true
            }
            None => false,
        }
    }

    /// Resets statistics for every key.
    pub fn reset_all_stats(&self) {
        for collector in self.all() {
            collector.reset_stats();
        }
    }

    /// Waits until every collector has resolved all accepted items.
    pub async fn wait_for_all_empty(&self) {
        for collector in self.all() {
            collector.wait_until_empty().await;
        }
    }

    /// Returns the keys with a collector, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.collectors.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn doubling(settings: BatchSettings) -> BatchProcessor<u64, u64> {
        BatchProcessor::new(settings, |items: Vec<u64>| async move {
            Ok(items.into_iter().map(|i| i * 2).collect())
        })
    }

    #[tokio::test]
    async fn test_keys_batch_independently() {
        let processor = doubling(BatchSettings {
            max_batch_size: 2,
            max_wait: Duration::from_secs(3600),
            auto_process: true,
        });

        let users = processor.collector("users").add(1);
        let orders = processor.collector("orders").add(2);

        // One item per key: neither reaches the size threshold.
        assert_eq!(processor.collector("users").pending_len(), 1);
        assert_eq!(processor.collector("orders").pending_len(), 1);

        assert_eq!(processor.flush_all().await, 2);
        assert_eq!(users.await.unwrap(), 2);
        assert_eq!(orders.await.unwrap(), 4);
        assert_eq!(processor.keys(), vec!["orders".to_string(), "users".to_string()]);
    }

    #[tokio::test]
    async fn test_process_many_preserves_order() {
        let processor = doubling(BatchSettings {
            max_batch_size: 3,
            max_wait: Duration::from_millis(5),
            auto_process: true,
        });

        let results = processor.process_many("k", (1..=7).collect()).await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![2, 4, 6, 8, 10, 12, 14]);

        let stats = processor.stats("k").unwrap();
        assert_eq!(stats.total_items, 7);
        assert_eq!(stats.size_triggered, 2);
        assert_eq!(stats.timer_triggered, 1);
    }

    #[tokio::test]
    async fn test_process_single_item() {
        let processor = doubling(BatchSettings {
            max_batch_size: 1,
            ..Default::default()
        });
        assert_eq!(processor.process("default", 21).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_unknown_keys() {
        let processor = doubling(BatchSettings::default());
        assert_eq!(processor.flush("missing").await, 0);
        assert!(processor.stats("missing").is_none());
        assert!(!processor.reset_stats("missing"));
        assert!(processor.keys().is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let processor = doubling(BatchSettings {
            auto_process: false,
            ..Default::default()
        });

        for key in ["a", "b"] {
            let ticket = processor.collector(key).add(1);
            processor.flush(key).await;
            ticket.await.unwrap();
        }

        let all = processor.all_stats();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"].total_batches, 1);

        assert!(processor.reset_stats("a"));
        assert_eq!(processor.stats("a").unwrap().total_batches, 0);
        assert_eq!(processor.stats("b").unwrap().total_batches, 1);

        processor.reset_all_stats();
        assert_eq!(processor.stats("b").unwrap().total_batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_all_empty() {
        let processor = doubling(BatchSettings {
            max_batch_size: 10,
            max_wait: Duration::from_millis(100),
            auto_process: true,
        });

        let tickets: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|key| processor.collector(key).add(1))
            .collect();

        processor.wait_for_all_empty().await;
        for key in ["a", "b", "c"] {
            assert_eq!(processor.collector(key).outstanding(), 0);
        }
        for ticket in tickets {
            assert_eq!(ticket.await.unwrap(), 2);
        }
    }
}
