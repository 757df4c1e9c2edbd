//! Prometheus exposition of component statistics.
//!
//! Components keep their own counters; [`Telemetry`] turns a [`Snapshot`] of
//! them into a `prometheus-client` registry:
//! - Coalescers labelled by name
//! - Batch collectors labelled by processor and key
//! - Pools labelled by pool name

use herd_batch::BatchStats;
use herd_coalesce::CoalescerStats;
use herd_pool::PoolStats;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::AtomicU64;

type FloatGauge = Gauge<f64, AtomicU64>;

/// Statistics of every component registered with a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Coalescer statistics by name.
    pub coalescers: BTreeMap<String, CoalescerStats>,
    /// Batch statistics by processor name, then collector key.
    pub batches: BTreeMap<String, BTreeMap<String, BatchStats>>,
    /// Pool statistics by pool name.
    pub pools: BTreeMap<String, PoolStats>,
}

/// Labels for per-coalescer metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CoalescerLabels {
    /// Coalescer name.
    pub name: String,
}

/// Labels for per-collector metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BatchLabels {
    /// Processor name.
    pub processor: String,
    /// Collector key within the processor.
    pub key: String,
}

/// Labels for batch flush counts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FlushLabels {
    /// Processor name.
    pub processor: String,
    /// Collector key within the processor.
    pub key: String,
    /// What triggered the flush: size, timer or manual.
    pub trigger: String,
}

/// Labels for per-pool metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolLabels {
    /// Pool name.
    pub pool: String,
}

fn family<L, M>(registry: &mut Registry, name: &str, help: &str) -> Family<L, M>
where
    L: EncodeLabelSet + Clone + Hash + Eq + Debug + Send + Sync + 'static,
    Family<L, M>: prometheus_client::registry::Metric + Clone + Default,
{
    let family = Family::<L, M>::default();
    registry.register(name, help, family.clone());
    family
}

fn gauge_value(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// A registry filled from one [`Snapshot`].
pub struct Telemetry {
    registry: Registry,
}

impl Telemetry {
    /// Builds a registry holding the values in `snapshot`.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut registry = Registry::with_prefix("herd");
        Self::register_coalescers(&mut registry, &snapshot.coalescers);
        Self::register_batches(&mut registry, &snapshot.batches);
        Self::register_pools(&mut registry, &snapshot.pools);
        Self { registry }
    }

    /// Returns the underlying registry, e.g. to serve it next to other
    /// metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes the registry in Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("writing to a String cannot fail");
        buffer
    }

    fn register_coalescers(registry: &mut Registry, stats: &BTreeMap<String, CoalescerStats>) {
        let requests: Family<CoalescerLabels, Counter> =
            family(registry, "coalescer_requests", "Requests received");
        let coalesced: Family<CoalescerLabels, Counter> = family(
            registry,
            "coalescer_coalesced",
            "Requests that joined an in-flight execution",
        );
        let cache_hits: Family<CoalescerLabels, Counter> = family(
            registry,
            "coalescer_cache_hits",
            "Requests served from a completed result",
        );
        let executions: Family<CoalescerLabels, Counter> =
            family(registry, "coalescer_executions", "Executions of the underlying call");
        let bypassed: Family<CoalescerLabels, Counter> = family(
            registry,
            "coalescer_bypassed",
            "Executions run uncoalesced because the entry table was full",
        );
        let failures: Family<CoalescerLabels, Counter> =
            family(registry, "coalescer_failures", "Executions that failed");
        let in_flight: Family<CoalescerLabels, Gauge> =
            family(registry, "coalescer_in_flight", "Keys with an execution in flight");
        let entries: Family<CoalescerLabels, Gauge> =
            family(registry, "coalescer_entries", "Keys currently tracked");
        let ratio: Family<CoalescerLabels, FloatGauge> = family(
            registry,
            "coalescer_ratio",
            "Share of requests that did not trigger an execution",
        );

        for (name, stats) in stats {
            let labels = CoalescerLabels { name: name.clone() };
            requests.get_or_create(&labels).inc_by(stats.total_requests);
            coalesced.get_or_create(&labels).inc_by(stats.coalesced_requests);
            cache_hits.get_or_create(&labels).inc_by(stats.cache_hits);
            executions.get_or_create(&labels).inc_by(stats.executions);
            bypassed.get_or_create(&labels).inc_by(stats.bypassed);
            failures.get_or_create(&labels).inc_by(stats.failures);
            in_flight.get_or_create(&labels).set(gauge_value(stats.in_flight));
            entries.get_or_create(&labels).set(gauge_value(stats.entries));
            ratio.get_or_create(&labels).set(stats.coalescing_ratio());
        }
    }

    fn register_batches(
        registry: &mut Registry,
        stats: &BTreeMap<String, BTreeMap<String, BatchStats>>,
    ) {
        let items: Family<BatchLabels, Counter> =
            family(registry, "batch_items", "Items processed");
        let batches: Family<BatchLabels, Counter> =
            family(registry, "batch_batches", "Batches processed");
        let failed: Family<BatchLabels, Counter> =
            family(registry, "batch_failed", "Batches whose function failed");
        let flushes: Family<FlushLabels, Counter> =
            family(registry, "batch_flushes", "Batches processed by trigger");
        let pending: Family<BatchLabels, Gauge> =
            family(registry, "batch_pending", "Items waiting in the open batch");
        let avg_size: Family<BatchLabels, FloatGauge> =
            family(registry, "batch_avg_size", "Mean items per batch");
        let avg_seconds: Family<BatchLabels, FloatGauge> = family(
            registry,
            "batch_avg_processing_seconds",
            "Mean time spent in the batch function",
        );

        for (processor, collectors) in stats {
            for (key, stats) in collectors {
                let labels = BatchLabels {
                    processor: processor.clone(),
                    key: key.clone(),
                };
                items.get_or_create(&labels).inc_by(stats.total_items);
                batches.get_or_create(&labels).inc_by(stats.total_batches);
                failed.get_or_create(&labels).inc_by(stats.failed_batches);
                pending.get_or_create(&labels).set(gauge_value(stats.pending));
                avg_size.get_or_create(&labels).set(stats.avg_batch_size);
                avg_seconds
                    .get_or_create(&labels)
                    .set(stats.avg_processing_time.as_secs_f64());

                for (trigger, count) in [
                    ("size", stats.size_triggered),
                    ("timer", stats.timer_triggered),
                    ("manual", stats.manual_flushes),
                ] {
                    let labels = FlushLabels {
                        processor: processor.clone(),
                        key: key.clone(),
                        trigger: trigger.to_string(),
                    };
                    flushes.get_or_create(&labels).inc_by(count);
                }
            }
        }
    }

    fn register_pools(registry: &mut Registry, stats: &BTreeMap<String, PoolStats>) {
        let active: Family<PoolLabels, Gauge> =
            family(registry, "pool_active", "Connections checked out");
        let idle: Family<PoolLabels, Gauge> =
            family(registry, "pool_idle", "Connections waiting for reuse");
        let max_size: Family<PoolLabels, Gauge> =
            family(registry, "pool_max_size", "Configured capacity");
        let requests: Family<PoolLabels, Counter> =
            family(registry, "pool_requests", "Acquire calls");
        let timeouts: Family<PoolLabels, Counter> =
            family(registry, "pool_timeouts", "Acquires that gave up waiting");
        let errors: Family<PoolLabels, Counter> =
            family(registry, "pool_errors", "Factory failures");
        let created: Family<PoolLabels, Counter> =
            family(registry, "pool_created", "Connections opened");
        let closed: Family<PoolLabels, Counter> =
            family(registry, "pool_closed", "Connections closed");
        let invalid: Family<PoolLabels, Counter> = family(
            registry,
            "pool_validation_failures",
            "Connections discarded by a liveness or lifetime check",
        );
        let utilization: Family<PoolLabels, FloatGauge> =
            family(registry, "pool_utilization", "Share of capacity checked out");
        let acquire_seconds: Family<PoolLabels, FloatGauge> = family(
            registry,
            "pool_avg_acquire_seconds",
            "Mean time for a successful acquire",
        );

        for (name, stats) in stats {
            let labels = PoolLabels { pool: name.clone() };
            active.get_or_create(&labels).set(gauge_value(stats.active));
            idle.get_or_create(&labels).set(gauge_value(stats.idle));
            max_size.get_or_create(&labels).set(gauge_value(stats.max_size));
            requests.get_or_create(&labels).inc_by(stats.total_requests);
            timeouts.get_or_create(&labels).inc_by(stats.timeouts);
            errors.get_or_create(&labels).inc_by(stats.errors);
            created.get_or_create(&labels).inc_by(stats.total_created);
            closed.get_or_create(&labels).inc_by(stats.total_closed);
            invalid.get_or_create(&labels).inc_by(stats.validation_failures);
            utilization.get_or_create(&labels).set(stats.utilization());
            acquire_seconds
                .get_or_create(&labels)
                .set(stats.avg_acquire_time.as_secs_f64());
        }
    }
}
