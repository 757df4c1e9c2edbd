//! Batch collection.
//!
//! A [`BatchCollector`] accumulates individual items and hands them to a
//! batch function in groups. A batch is captured when it reaches
//! `max_batch_size` items, when `max_wait` has passed since its first item
//! arrived, or when [`BatchCollector::flush`] is called. Capturing empties
//! the pending list at once, so new items start the next batch while the
//! captured one is still being processed.
//!
//! The batch function must return exactly one result per item, in order.
//! If it fails, panics, or returns the wrong number of results, every item
//! in that batch receives the same error.

use futures::future::BoxFuture;
use futures::FutureExt;
use herd_core::{HerdError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use validator::Validate;

/// A type-erased batch function.
pub type BatchFn<T, R> =
    Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, anyhow::Result<Vec<R>>> + Send + Sync>;

type Callback<R> = Box<dyn FnOnce(&[R]) + Send>;

/// Erases a batch function's concrete future type.
pub fn batch_fn<T, R, F, Fut>(f: F) -> BatchFn<T, R>
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<R>>> + Send + 'static,
{
    Arc::new(move |items| f(items).boxed())
}

/// Configuration for a batch collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatchSettings {
    /// Number of items that triggers processing.
    #[validate(range(min = 1))]
    pub max_batch_size: usize,
    /// How long the first item of a batch may wait before the batch is
    /// processed. Zero disables the timer.
    #[serde(with = "herd_core::serde_ms", rename = "max_wait_ms")]
    pub max_wait: Duration,
    /// Whether size and timer triggers fire. When false, batches are only
    /// processed by explicit flushes.
    pub auto_process: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait: Duration::from_millis(100),
            auto_process: true,
        }
    }
}

/// What caused a batch to be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    /// The batch reached `max_batch_size`.
    Size,
    /// `max_wait` elapsed since the batch's first item.
    Timer,
    /// An explicit flush.
    Manual,
}

/// Batch collector statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    /// Items processed, successfully or not.
    pub total_items: u64,
    /// Batches processed.
    pub total_batches: u64,
    /// Batches whose function failed.
    pub failed_batches: u64,
    /// Smallest batch processed (0 before the first batch).
    pub min_batch_size: usize,
    /// Largest batch processed.
    pub max_batch_size: usize,
    /// Mean number of items per batch.
    pub avg_batch_size: f64,
    /// Mean time spent in the batch function.
    #[serde(with = "herd_core::serde_ms", rename = "avg_processing_time_ms")]
    pub avg_processing_time: Duration,
    /// Batches triggered by size.
    pub size_triggered: u64,
    /// Batches triggered by the timer.
    pub timer_triggered: u64,
    /// Batches triggered by explicit flushes.
    pub manual_flushes: u64,
    /// Items currently waiting in the open batch.
    pub pending: usize,
}

impl BatchStats {
    /// Returns the share of batches that failed.
    pub fn failure_rate(&self) -> f64 {
        if self.total_batches == 0 {
            0.0
        } else {
            self.failed_batches as f64 / self.total_batches as f64
        }
    }
}

#[derive(Default)]
struct StatsInner {
    total_items: u64,
    total_batches: u64,
    failed_batches: u64,
    min_batch_size: usize,
    max_batch_size: usize,
    total_processing_time: Duration,
    size_triggered: u64,
    timer_triggered: u64,
    manual_flushes: u64,
}

impl StatsInner {
    fn record(&mut self, size: usize, elapsed: Duration, trigger: FlushTrigger, failed: bool) {
        self.total_items += size as u64;
        self.total_batches += 1;
        if failed {
            self.failed_batches += 1;
        }
        self.min_batch_size = if self.total_batches == 1 {
            size
        } else {
            self.min_batch_size.min(size)
        };
        self.max_batch_size = self.max_batch_size.max(size);
        self.total_processing_time += elapsed;
        match trigger {
            FlushTrigger::Size => self.size_triggered += 1,
            FlushTrigger::Timer => self.timer_triggered += 1,
            FlushTrigger::Manual => self.manual_flushes += 1,
        }
    }

    fn snapshot(&self, pending: usize) -> BatchStats {
        let (avg_batch_size, avg_processing_time) = if self.total_batches == 0 {
            (0.0, Duration::ZERO)
        } else {
            let batches = self.total_batches as f64;
            (
                self.total_items as f64 / batches,
                self.total_processing_time.div_f64(batches),
            )
        };

        BatchStats {
            total_items: self.total_items,
            total_batches: self.total_batches,
            failed_batches: self.failed_batches,
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            avg_batch_size,
            avg_processing_time,
            size_triggered: self.size_triggered,
            timer_triggered: self.timer_triggered,
            manual_flushes: self.manual_flushes,
            pending,
        }
    }
}

struct PendingItem<T, R> {
    payload: T,
    sink: oneshot::Sender<Result<R>>,
    callback: Option<Callback<R>>,
}

struct OpenBatch<T, R> {
    items: Vec<PendingItem<T, R>>,
    opened_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    epoch: u64,
}

impl<T, R> OpenBatch<T, R> {
    /// Moves the pending items out and starts a new epoch, so a timer armed
    /// for the captured batch can no longer fire against the next one.
    fn capture(&mut self, trigger: FlushTrigger) -> Vec<PendingItem<T, R>> {
        self.epoch = self.epoch.wrapping_add(1);
        self.opened_at = None;
        if let Some(timer) = self.timer.take() {
            // The timer task itself captures on expiry and must not abort itself.
            if trigger != FlushTrigger::Timer {
                timer.abort();
            }
        }
        std::mem::take(&mut self.items)
    }
}

struct CollectorInner<T, R> {
    settings: BatchSettings,
    batch_fn: BatchFn<T, R>,
    open: Mutex<OpenBatch<T, R>>,
    outstanding: watch::Sender<usize>,
    stats: Mutex<StatsInner>,
}

/// Accumulates items and processes them in batches.
///
/// Cloning is cheap and yields a handle to the same collector.
pub struct BatchCollector<T, R> {
    inner: Arc<CollectorInner<T, R>>,
}

impl<T, R> Clone for BatchCollector<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> BatchCollector<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Creates a collector that processes batches with `f`.
    ///
    /// Settings are used as given. With a `max_batch_size` of zero every
    /// add flushes on its own; use [`try_new`](Self::try_new) to reject
    /// such settings up front.
    pub fn new<F, Fut>(settings: BatchSettings, f: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<R>>> + Send + 'static,
    {
        Self::with_batch_fn(settings, batch_fn(f))
    }

    /// Creates a collector after validating its settings.
    pub fn try_new<F, Fut>(settings: BatchSettings, f: F) -> Result<Self>
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<R>>> + Send + 'static,
    {
        settings
            .validate()
            .map_err(|e| HerdError::config(e.to_string()))?;
        Ok(Self::new(settings, f))
    }

    /// Creates a collector around an already type-erased batch function.
    pub fn with_batch_fn(settings: BatchSettings, batch_fn: BatchFn<T, R>) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(CollectorInner {
                settings,
                batch_fn,
                open: Mutex::new(OpenBatch {
                    items: Vec::new(),
                    opened_at: None,
                    timer: None,
                    epoch: 0,
                }),
                outstanding,
                stats: Mutex::new(StatsInner::default()),
            }),
        }
    }

    /// Returns the collector settings.
    pub fn settings(&self) -> &BatchSettings {
        &self.inner.settings
    }

    /// Adds an item and returns a ticket resolving to its result.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; batch timers and
    /// size-triggered batches are spawned onto it.
    pub fn add(&self, item: T) -> BatchTicket<R> {
        self.enqueue(item, None)
    }

    /// Adds an item with a callback that receives the results of the whole
    /// batch once it succeeds. The callback is not invoked on failure.
    pub fn add_with_callback<C>(&self, item: T, callback: C) -> BatchTicket<R>
    where
        C: FnOnce(&[R]) + Send + 'static,
    {
        self.enqueue(item, Some(Box::new(callback)))
    }

    /// Adds an item and waits for its result.
    pub async fn submit(&self, item: T) -> Result<R> {
        self.add(item).await
    }

    fn enqueue(&self, payload: T, callback: Option<Callback<R>>) -> BatchTicket<R> {
        let (sink, receiver) = oneshot::channel();
        self.inner.outstanding.send_modify(|n| *n += 1);

        let settings = &self.inner.settings;
        let full = {
            let mut open = self.inner.open.lock();
            open.items.push(PendingItem {
                payload,
                sink,
                callback,
            });

            if settings.auto_process && open.items.len() >= settings.max_batch_size {
                Some(open.capture(FlushTrigger::Size))
            } else {
                if open.items.len() == 1 {
                    open.opened_at = Some(Instant::now());
                    if settings.auto_process && !settings.max_wait.is_zero() {
                        let epoch = open.epoch;
                        open.timer = Some(self.inner.arm_timer(epoch));
                    }
                }
                None
            }
        };

        if let Some(batch) = full {
            tokio::spawn(Arc::clone(&self.inner).process(batch, FlushTrigger::Size));
        }

        BatchTicket { receiver }
    }

    /// Processes the open batch now and returns how many items it held.
    ///
    /// The batch runs on its own task, so dropping the returned future
    /// stops the wait but not the batch.
    pub async fn flush(&self) -> usize {
        let batch = self.inner.open.lock().capture(FlushTrigger::Manual);
        let size = batch.len();
        if size > 0 {
            let handle = tokio::spawn(Arc::clone(&self.inner).process(batch, FlushTrigger::Manual));
            if let Err(err) = handle.await {
                warn!(error = %err, "Manual batch task failed");
            }
        }
        size
    }

    /// Waits until every accepted item has been resolved, including items
    /// in batches that are still being processed.
    pub async fn wait_until_empty(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    /// Returns the number of items waiting in the open batch.
    pub fn pending_len(&self) -> usize {
        self.inner.open.lock().items.len()
    }

    /// Returns the number of accepted items not yet resolved.
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    /// Returns how long the open batch's first item has been waiting.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.inner
            .open
            .lock()
            .opened_at
            .map(|opened| opened.elapsed())
    }

    /// Returns statistics.
    pub fn stats(&self) -> BatchStats {
        let pending = self.pending_len();
        self.inner.stats.lock().snapshot(pending)
    }

    /// Resets statistics.
    pub fn reset_stats(&self) {
        *self.inner.stats.lock() = StatsInner::default();
    }
}

impl<T, R> CollectorInner<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn arm_timer(self: &Arc<Self>, epoch: u64) -> JoinHandle<()> {
        let inner: Weak<Self> = Arc::downgrade(self);
        let wait = self.settings.max_wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(inner) = inner.upgrade() {
                inner.flush_epoch(epoch).await;
            }
        })
    }

    async fn flush_epoch(self: Arc<Self>, epoch: u64) {
        let batch = {
            let mut open = self.open.lock();
            if open.epoch != epoch || open.items.is_empty() {
                return;
            }
            open.capture(FlushTrigger::Timer)
        };
        self.process(batch, FlushTrigger::Timer).await;
    }

    async fn process(self: Arc<Self>, batch: Vec<PendingItem<T, R>>, trigger: FlushTrigger) {
        let size = batch.len();
        if size == 0 {
            return;
        }

        let mut payloads = Vec::with_capacity(size);
        let mut waiters = Vec::with_capacity(size);
        for item in batch {
            payloads.push(item.payload);
            waiters.push((item.sink, item.callback));
        }

        let batch_fn = Arc::clone(&self.batch_fn);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { batch_fn(payloads).await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(results)) if results.len() == size => Ok(results),
            Ok(Ok(results)) => Err(HerdError::ResultCount {
                expected: size,
                actual: results.len(),
            }),
            Ok(Err(err)) => Err(HerdError::execution(err)),
            Err(payload) => Err(HerdError::from_panic("batch function", payload)),
        };

        self.stats
            .lock()
            .record(size, elapsed, trigger, result.is_err());

        match result {
            Ok(results) => {
                debug!(
                    size,
                    ?trigger,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch processed"
                );
                let mut sinks = Vec::with_capacity(size);
                for (sink, callback) in waiters {
                    if let Some(callback) = callback {
                        let ran = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&results)));
                        if ran.is_err() {
                            warn!(size, "Batch callback panicked");
                        }
                    }
                    sinks.push(sink);
                }
                for (sink, result) in sinks.into_iter().zip(results) {
                    // The caller may have dropped its ticket.
                    let _ = sink.send(Ok(result));
                }
            }
            Err(err) => {
                warn!(size, ?trigger, error = %err, "Batch failed");
                for (sink, _) in waiters {
                    let _ = sink.send(Err(err.clone()));
                }
            }
        }

        self.outstanding.send_modify(|n| *n = n.saturating_sub(size));
    }
}

/// Resolves to the result of one item added to a [`BatchCollector`].
///
/// Resolves to [`HerdError::Closed`] if the collector is dropped before the
/// item's batch is processed.
#[must_use = "a ticket does nothing unless awaited"]
pub struct BatchTicket<R> {
    receiver: oneshot::Receiver<Result<R>>,
}

impl<R> Future for BatchTicket<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(HerdError::closed("batch collector"))))
    }
}
