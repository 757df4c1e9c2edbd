//! The explicitly constructed owner of a process's herd components.

use crate::config::HerdConfig;
use crate::telemetry::{Snapshot, Telemetry};
use async_trait::async_trait;
use herd_batch::{BatchProcessor, BatchStats};
use herd_coalesce::{CoalescerStats, RequestCoalescer};
use herd_core::{HerdError, Result};
use herd_pool::{ConnectionFactory, ConnectionPool, PoolManager};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

trait RegisteredCoalescer: Send + Sync {
    fn stats(&self) -> CoalescerStats;
    fn as_any(&self) -> &dyn Any;
}

impl<K, V> RegisteredCoalescer for RequestCoalescer<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn stats(&self) -> CoalescerStats {
        RequestCoalescer::stats(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
trait RegisteredProcessor: Send + Sync {
    fn stats(&self) -> BTreeMap<String, BatchStats>;
    /// Processes everything pending and waits for in-flight batches.
    async fn drain(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<T, R> RegisteredProcessor for BatchProcessor<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn stats(&self) -> BTreeMap<String, BatchStats> {
        self.all_stats()
    }

    async fn drain(&self) -> usize {
        let flushed = self.flush_all().await;
        self.wait_for_all_empty().await;
        flushed
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Builds coalescers, batch processors and pools from one [`HerdConfig`],
/// tracks them for telemetry, and shuts them down together.
///
/// Components are looked up by name: asking twice for the same name returns
/// the same component.
///
/// ```rust
/// use herd::{Context, HerdConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> herd_core::Result<()> {
/// let context = Context::new(HerdConfig::default())?;
///
/// let users = context.coalescer::<u64, String>("users")?;
/// let name = users
///     .execute(7, || async { Ok::<_, anyhow::Error>("ada".to_string()) })
///     .await?;
/// assert_eq!(name, "ada");
///
/// context.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Context {
    config: HerdConfig,
    coalescers: RwLock<BTreeMap<String, Arc<dyn RegisteredCoalescer>>>,
    processors: RwLock<BTreeMap<String, Arc<dyn RegisteredProcessor>>>,
    pools: PoolManager,
    shut_down: AtomicBool,
}

impl Context {
    /// Creates a context after validating `config`.
    pub fn new(config: HerdConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            config,
            coalescers: RwLock::new(BTreeMap::new()),
            processors: RwLock::new(BTreeMap::new()),
            pools: PoolManager::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Returns the configuration this context was built from.
    pub fn config(&self) -> &HerdConfig {
        &self.config
    }

    /// Installs the global log subscriber described by the logging section.
    /// Returns false if one was already installed.
    pub fn init_logging(&self) -> bool {
        herd_core::init_logging(&self.config.logging.level, self.config.logging.format)
    }

    /// Returns the coalescer named `name`, creating it with the configured
    /// coalescer settings on first use.
    ///
    /// Fails with [`HerdError::Config`] if `name` is already registered with
    /// different key or value types.
    pub fn coalescer<K, V>(&self, name: &str) -> Result<RequestCoalescer<K, V>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.ensure_running()?;

        if let Some(existing) = self.coalescers.read().get(name) {
            return Self::downcast_coalescer(name, existing.as_ref());
        }

        let mut coalescers = self.coalescers.write();
        if let Some(existing) = coalescers.get(name) {
            return Self::downcast_coalescer(name, existing.as_ref());
        }
        let coalescer = RequestCoalescer::<K, V>::new(self.config.coalescer.clone());
        coalescers.insert(name.to_string(), Arc::new(coalescer.clone()));
        info!(coalescer = name, "Registered request coalescer");
        Ok(coalescer)
    }

    fn downcast_coalescer<K, V>(
        name: &str,
        entry: &dyn RegisteredCoalescer,
    ) -> Result<RequestCoalescer<K, V>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        entry
            .as_any()
            .downcast_ref::<RequestCoalescer<K, V>>()
            .cloned()
            .ok_or_else(|| {
                HerdError::config(format!(
                    "coalescer `{name}` is registered with different key or value types"
                ))
            })
    }

    /// Returns the batch processor named `name`, creating it with the
    /// configured batch settings and `f` on first use. `f` is ignored when
    /// the processor already exists.
    ///
    /// Registered processors are drained by [`shutdown`](Self::shutdown).
    pub fn batch_processor<T, R, F, Fut>(&self, name: &str, f: F) -> Result<Arc<BatchProcessor<T, R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<R>>> + Send + 'static,
    {
        self.ensure_running()?;

        let mut processors = self.processors.write();
        if let Some(existing) = processors.get(name) {
            return Arc::clone(existing)
                .into_any()
                .downcast::<BatchProcessor<T, R>>()
                .map_err(|_| {
                    HerdError::config(format!(
                        "batch processor `{name}` is registered with different item or result types"
                    ))
                });
        }

        let processor = Arc::new(BatchProcessor::new(self.config.batch.clone(), f));
        processors.insert(name.to_string(), Arc::clone(&processor) as Arc<dyn RegisteredProcessor>);
        info!(processor = name, "Registered batch processor");
        Ok(processor)
    }

    /// Creates the pool named `name` with its configured settings, or
    /// returns it if it already exists.
    pub async fn create_pool<F: ConnectionFactory>(
        &self,
        name: &str,
        factory: F,
    ) -> Result<ConnectionPool<F>> {
        self.ensure_running()?;
        self.pools
            .create_pool(name, factory, self.config.pool_settings(name))
            .await
    }

    /// Returns the pool manager, for lookups and per-pool control.
    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    /// Collects the statistics of every registered component.
    pub fn snapshot(&self) -> Snapshot {
        let coalescers = self
            .coalescers
            .read()
            .iter()
            .map(|(name, coalescer)| (name.clone(), coalescer.stats()))
            .collect();
        let batches = self
            .processors
            .read()
            .iter()
            .map(|(name, processor)| (name.clone(), processor.stats()))
            .collect();

        Snapshot {
            coalescers,
            batches,
            pools: self.pools.stats(),
        }
    }

    /// Builds telemetry from a fresh [`snapshot`](Self::snapshot).
    pub fn telemetry(&self) -> Telemetry {
        Telemetry::from_snapshot(&self.snapshot())
    }

    /// Processes every pending batch item, waits for in-flight batches, then
    /// closes every pool. Later calls are no-ops, and creating components
    /// afterwards fails with [`HerdError::Closed`].
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let processors: Vec<_> = self.processors.read().values().cloned().collect();
        let mut drained = 0;
        for processor in processors {
            drained += processor.drain().await;
        }

        self.pools.close_all().await;
        info!(drained_items = drained, "Herd context shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) has started.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(HerdError::closed("herd context"))
        } else {
            Ok(())
        }
    }
}
