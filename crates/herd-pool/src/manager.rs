//! Named connection pools.

use crate::factory::ConnectionFactory;
use crate::metrics::PoolStats;
use crate::pool::ConnectionPool;
use crate::settings::PoolSettings;
use async_trait::async_trait;
use herd_core::{HerdError, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use validator::Validate;

/// The type-independent face of a pool, so pools with different connection
/// types can share one registry.
#[async_trait]
trait ManagedPool: Send + Sync {
    fn stats(&self) -> PoolStats;
    async fn close(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<F: ConnectionFactory> ManagedPool for ConnectionPool<F> {
    fn stats(&self) -> PoolStats {
        ConnectionPool::stats(self)
    }

    async fn close(&self) {
        ConnectionPool::close(self).await;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Owns the process's connection pools, keyed by name.
#[derive(Default)]
pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<dyn ManagedPool>>>,
    // Serializes creation so two callers never initialize the same name twice.
    creating: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl PoolManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool named `name`, creating and initializing it first if
    /// it does not exist yet.
    ///
    /// Fails with [`HerdError::PoolTypeMismatch`] if the existing pool uses a
    /// different factory type, and with [`HerdError::Closed`] after
    /// [`close_all`](Self::close_all).
    pub async fn create_pool<F: ConnectionFactory>(
        &self,
        name: &str,
        factory: F,
        settings: PoolSettings,
    ) -> Result<ConnectionPool<F>> {
        if self.is_closed() {
            return Err(HerdError::closed("pool manager"));
        }

        let _creating = self.creating.lock().await;
        if self.is_closed() {
            return Err(HerdError::closed("pool manager"));
        }
        if let Some(existing) = self.get_pool::<F>(name)? {
            return Ok(existing);
        }

        settings
            .validate()
            .map_err(|e| HerdError::config(format!("pool `{name}`: {e}")))?;

        let pool = ConnectionPool::new(name, factory, settings);
        pool.initialize().await;
        self.pools
            .write()
            .insert(name.to_string(), Arc::new(pool.clone()));
        info!(pool = name, "Registered connection pool");
        Ok(pool)
    }

    /// Returns the pool named `name`, if any.
    pub fn get_pool<F: ConnectionFactory>(&self, name: &str) -> Result<Option<ConnectionPool<F>>> {
        let Some(entry) = self.pools.read().get(name).cloned() else {
            return Ok(None);
        };

        entry
            .into_any()
            .downcast::<ConnectionPool<F>>()
            .map(|pool| Some(ConnectionPool::clone(&pool)))
            .map_err(|_| HerdError::PoolTypeMismatch(name.to_string()))
    }

    /// Closes and forgets the pool named `name`. Returns false if absent.
    pub async fn close_pool(&self, name: &str) -> bool {
        let removed = self.pools.write().remove(name);
        match removed {
            Some(pool) => {
                pool.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes every pool. Later calls to [`create_pool`](Self::create_pool)
    /// fail. Calling this again is a no-op.
    pub async fn close_all(&self) {
        let _creating = self.creating.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pools: Vec<_> = self.pools.write().drain().collect();
        let count = pools.len();
        for (_, pool) in pools {
            pool.close().await;
        }
        info!(pools = count, "Closed all connection pools");
    }

    /// Returns true once [`close_all`](Self::close_all) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the pool names, sorted.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns statistics per pool.
    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .read()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }
}
