//! One-shot bulk execution over a fixed list of items.
//!
//! Unlike a [`BatchCollector`](crate::BatchCollector), nothing here is
//! long-lived: the caller already holds every item and just wants it
//! processed in chunks, optionally in parallel.

use futures::stream::{self, StreamExt, TryStreamExt};
use herd_core::{HerdError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// How [`execute_batch`] schedules its chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One chunk at a time.
    #[default]
    Sequential,
    /// Up to `max_workers` chunks at a time.
    Parallel {
        /// Maximum chunks in flight. Zero is treated as one.
        max_workers: usize,
    },
}

/// Splits `items` into contiguous chunks of `batch_size`. The last chunk may
/// be shorter. A `batch_size` of zero yields a single chunk.
pub fn chunks<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let size = if batch_size == 0 { items.len() } else { batch_size };

    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut rest = items.into_iter().peekable();
    while rest.peek().is_some() {
        chunks.push(rest.by_ref().take(size).collect());
    }
    chunks
}

/// Runs `batch_fn` over `items` in chunks of `batch_size` and concatenates
/// the results in chunk order.
///
/// The first failing chunk fails the whole call.
pub async fn execute_batch<T, R, F, Fut>(
    batch_fn: F,
    items: Vec<T>,
    batch_size: usize,
    mode: ExecutionMode,
) -> Result<Vec<R>>
where
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<Vec<R>>>,
{
    let chunks = chunks(items, batch_size);
    let mut results = Vec::new();

    match mode {
        ExecutionMode::Parallel { max_workers } if chunks.len() > 1 => {
            let permits = Arc::new(Semaphore::new(max_workers.max(1)));
            let batch_fn = &batch_fn;
            let runs = chunks.into_iter().map(|chunk| {
                let permits = Arc::clone(&permits);
                async move {
                    let _permit = permits
                        .acquire()
                        .await
                        .map_err(|_| HerdError::closed("batch executor"))?;
                    batch_fn(chunk).await.map_err(HerdError::execution)
                }
            });
            for chunk_results in futures::future::try_join_all(runs).await? {
                results.extend(chunk_results);
            }
        }
        _ => {
            for chunk in chunks {
                results.extend(batch_fn(chunk).await.map_err(HerdError::execution)?);
            }
        }
    }

    Ok(results)
}

/// Applies `f` to every item with at most `worker_count` calls in flight.
/// Results keep input order.
///
/// `batch_size` only controls how items are grouped when handed to the
/// workers; it never changes the output.
pub async fn map<T, R, F, Fut>(
    f: F,
    items: Vec<T>,
    batch_size: usize,
    worker_count: usize,
) -> Result<Vec<R>>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    stream::iter(chunks(items, batch_size))
        .flat_map(stream::iter)
        .map(f)
        .buffered(worker_count.max(1))
        .map_err(HerdError::execution)
        .try_collect()
        .await
}

/// Left-folds `items` with `f`, starting from `initial`, strictly in order.
pub async fn reduce<T, A, F, Fut>(mut f: F, items: Vec<T>, initial: A, batch_size: usize) -> Result<A>
where
    F: FnMut(A, T) -> Fut,
    Fut: Future<Output = anyhow::Result<A>>,
{
    let mut acc = initial;
    for chunk in chunks(items, batch_size) {
        for item in chunk {
            acc = f(acc, item).await.map_err(HerdError::execution)?;
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_chunks() {
        assert_eq!(chunks(vec![1, 2, 3, 4, 5], 2), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(chunks(vec![1, 2, 3], 0), vec![vec![1, 2, 3]]);
        assert_eq!(chunks(vec![1, 2], 10), vec![vec![1, 2]]);
        assert!(chunks(Vec::<u8>::new(), 3).is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_never_calls() {
        let calls = AtomicUsize::new(0);
        let results: Vec<u8> = execute_batch(
            |chunk: Vec<u8>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(chunk) }
            },
            Vec::new(),
            10,
            ExecutionMode::Parallel { max_workers: 4 },
        )
        .await
        .unwrap();

        assert!(results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequential_concatenates_in_order() {
        let sizes = parking_lot::Mutex::new(Vec::new());
        let results = execute_batch(
            |chunk: Vec<u32>| {
                sizes.lock().push(chunk.len());
                async move { Ok(chunk.into_iter().map(|i| i + 100).collect::<Vec<_>>()) }
            },
            (0..7).collect(),
            3,
            ExecutionMode::Sequential,
        )
        .await
        .unwrap();

        assert_eq!(results, (100..107).collect::<Vec<_>>());
        assert_eq!(*sizes.lock(), vec![3, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_respects_worker_bound() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = execute_batch(
            |chunk: Vec<u32>| {
                let (running, peak) = (&running, &peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    // Later chunks finish first; order must still hold.
                    tokio::time::sleep(Duration::from_millis(100 - u64::from(chunk[0]))).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(chunk)
                }
            },
            (0..20).collect(),
            2,
            ExecutionMode::Parallel { max_workers: 3 },
        )
        .await
        .unwrap();

        assert_eq!(results, (0..20).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failing_chunk_fails_call() {
        let err = execute_batch(
            |chunk: Vec<u32>| async move {
                if chunk.contains(&5) {
                    anyhow::bail!("row 5 violates constraint");
                }
                Ok(chunk)
            },
            (0..10).collect(),
            4,
            ExecutionMode::Parallel { max_workers: 2 },
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("row 5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_bounded_and_ordered() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = map(
            |i: u64| {
                let (running, peak) = (&running, &peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50 - i)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i * i)
                }
            },
            (0..10).collect(),
            4,
            2,
        )
        .await
        .unwrap();

        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_reduce_is_order_sensitive_fold() {
        let concat = |acc: String, s: &'static str| async move { Ok(acc + s) };
        for batch_size in [0, 1, 2, 5] {
            let result = reduce(concat, vec!["a", "b", "c", "d"], String::new(), batch_size)
                .await
                .unwrap();
            assert_eq!(result, "abcd");
        }

        let untouched = reduce(concat, Vec::new(), "seed".to_string(), 3).await.unwrap();
        assert_eq!(untouched, "seed");
    }
}
