//! Size-triggered request batching.
//!
//! Requests accumulate in one pending batch. When the batch reaches the
//! configured size and no other batch is draining, up to `batch_size`
//! requests are taken from the front under the lock and handed to the handler
//! concurrently. Anything beyond that stays queued for the next dispatch.
//! There is no timer; [`BatchProcessor::flush`] drains a partial batch.

use crate::config::BatchConfig;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// A request as seen by the batch handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem<T> {
    /// Sequence number of the dispatch this request belongs to, from 0.
    pub batch: u64,
    /// Insertion position within that dispatch.
    pub position: usize,
    pub request: T,
}

type Handler<T> = Arc<dyn Fn(BatchItem<T>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Pending<T> {
    items: Vec<T>,
    draining: bool,
}

/// Counters describing what a processor has dispatched so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches: u64,
    pub requests: u64,
    /// Requests whose handler panicked.
    pub failed: u64,
}

/// Groups independent requests and processes each group concurrently.
pub struct BatchProcessor<T> {
    batch_size: usize,
    pending: Mutex<Pending<T>>,
    idle: Notify,
    handler: Handler<T>,
    batches: AtomicU64,
    requests: AtomicU64,
    failed: AtomicU64,
}

impl<T: Send + 'static> BatchProcessor<T> {
    pub fn new<F, Fut>(batch_size: usize, handler: F) -> Self
    where
        F: Fn(BatchItem<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            batch_size: batch_size.max(1),
            pending: Mutex::new(Pending {
                items: Vec::new(),
                draining: false,
            }),
            idle: Notify::new(),
            handler: Arc::new(move |item| handler(item).boxed()),
            batches: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn from_config<F, Fut>(config: &BatchConfig, handler: F) -> Self
    where
        F: Fn(BatchItem<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(config.size, handler)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Queue a request, dispatching a batch if one is now full.
    ///
    /// When this call triggers a dispatch it returns after the batch has been
    /// processed, draining any further full batches queued meanwhile. Every
    /// dispatch holds at most `batch_size` requests.
    pub async fn add(&self, request: T) {
        let first = {
            let mut pending = self.pending.lock().await;
            pending.items.push(request);
            if pending.items.len() >= self.batch_size && !pending.draining {
                pending.draining = true;
                Some(self.split_batch(&mut pending.items))
            } else {
                None
            }
        };

        if let Some(batch) = first {
            self.drain_from(batch, false).await;
        }
    }

    /// Dispatch whatever is pending, regardless of size.
    ///
    /// Waits for an in-flight dispatch to finish first. Returns the number of
    /// requests dispatched by this call.
    pub async fn flush(&self) -> usize {
        let batch = loop {
            let idle = self.idle.notified();
            {
                let mut pending = self.pending.lock().await;
                if !pending.draining {
                    if pending.items.is_empty() {
                        return 0;
                    }
                    pending.draining = true;
                    break self.split_batch(&mut pending.items);
                }
            }
            idle.await;
        };

        self.drain_from(batch, true).await
    }

    /// Number of requests waiting for the next dispatch.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.items.len()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches: self.batches.load(Ordering::Acquire),
            requests: self.requests.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }

    /// Take up to `batch_size` requests from the front of the queue.
    fn split_batch(&self, items: &mut Vec<T>) -> Vec<T> {
        let take = items.len().min(self.batch_size);
        items.drain(..take).collect()
    }

    /// Dispatch `batch`, then keep taking full batches, or any leftovers when
    /// `partial` is set. Releases the draining flag when done.
    async fn drain_from(&self, batch: Vec<T>, partial: bool) -> usize {
        let mut dispatched = 0;
        let mut next = Some(batch);
        while let Some(batch) = next {
            dispatched += batch.len();
            self.dispatch(batch).await;
            next = self.take_next(partial).await;
        }
        dispatched
    }

    async fn take_next(&self, partial: bool) -> Option<Vec<T>> {
        let mut pending = self.pending.lock().await;
        let ready = pending.items.len() >= self.batch_size
            || (partial && !pending.items.is_empty());
        if ready {
            Some(self.split_batch(&mut pending.items))
        } else {
            pending.draining = false;
            self.idle.notify_waiters();
            None
        }
    }

    async fn dispatch(&self, batch: Vec<T>) {
        let batch_id = self.batches.fetch_add(1, Ordering::AcqRel);
        let size = batch.len();
        info!("Dispatching batch {} with {} requests", batch_id, size);

        let tasks: Vec<_> = batch
            .into_iter()
            .enumerate()
            .map(|(position, request)| {
                tokio::spawn((self.handler)(BatchItem {
                    batch: batch_id,
                    position,
                    request,
                }))
            })
            .collect();

        let mut failed = 0u64;
        for (position, outcome) in join_all(tasks).await.into_iter().enumerate() {
            if let Err(e) = outcome {
                warn!(
                    "Request {} of batch {} did not complete: {}",
                    position, batch_id, e
                );
                failed += 1;
            }
        }

        self.requests.fetch_add(size as u64, Ordering::AcqRel);
        self.failed.fetch_add(failed, Ordering::AcqRel);
        debug!(
            "Batch {} done: {} requests, {} failed",
            batch_id, size, failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use std::time::Duration;

    type Seen = Arc<SyncMutex<Vec<BatchItem<u32>>>>;

    fn recording(batch_size: usize) -> (Arc<BatchProcessor<u32>>, Seen) {
        recording_slow(batch_size, Duration::from_millis(5))
    }

    fn recording_slow(batch_size: usize, delay: Duration) -> (Arc<BatchProcessor<u32>>, Seen) {
        let seen: Seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let processor = BatchProcessor::new(batch_size, move |item: BatchItem<u32>| {
            let sink = sink.clone();
            async move {
                tokio::time::sleep(delay).await;
                sink.lock().push(item);
            }
        });
        (Arc::new(processor), seen)
    }

    fn batch_sizes(seen: &Seen) -> HashMap<u64, usize> {
        let mut sizes = HashMap::new();
        for item in seen.lock().iter() {
            *sizes.entry(item.batch).or_default() += 1;
        }
        sizes
    }

    #[tokio::test]
    async fn test_full_batch_dispatches_once_in_order() {
        let (processor, seen) = recording(10);

        for i in 0..10 {
            processor.add(i).await;
        }

        assert_eq!(processor.pending_len().await, 0);
        assert_eq!(
            processor.stats(),
            BatchStats {
                batches: 1,
                requests: 10,
                failed: 0
            }
        );

        let mut items = seen.lock().clone();
        assert_eq!(items.len(), 10);
        assert!(items.iter().all(|item| item.batch == 0));
        items.sort_by_key(|item| item.position);
        let requests: Vec<u32> = items.iter().map(|item| item.request).collect();
        assert_eq!(requests, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_below_threshold_waits() {
        let (processor, seen) = recording(10);

        for i in 0..9 {
            processor.add(i).await;
        }

        assert_eq!(processor.pending_len().await, 9);
        assert_eq!(processor.stats().batches, 0);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_flush_drains_partial_batch() {
        let (processor, seen) = recording(10);

        for i in 0..4 {
            processor.add(i).await;
        }
        assert_eq!(processor.flush().await, 4);
        assert_eq!(processor.pending_len().await, 0);
        assert_eq!(seen.lock().len(), 4);
        assert_eq!(processor.flush().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_lose_nothing() {
        let (processor, seen) = recording(7);

        let adders: Vec<_> = (0..100u32)
            .map(|i| {
                let processor = processor.clone();
                tokio::spawn(async move { processor.add(i).await })
            })
            .collect();
        for adder in adders {
            adder.await.unwrap();
        }
        processor.flush().await;

        let mut requests: Vec<u32> = seen.lock().iter().map(|item| item.request).collect();
        requests.sort_unstable();
        assert_eq!(requests, (0..100).collect::<Vec<_>>());
        assert_eq!(processor.stats().requests, 100);
        assert!(batch_sizes(&seen).values().all(|&size| size <= 7));
        assert_eq!(processor.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_never_exceeds_batch_size() {
        let (processor, seen) = recording_slow(2, Duration::from_millis(100));

        let adders: Vec<_> = (0..8u32)
            .map(|i| {
                let processor = processor.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10 * i as u64)).await;
                    processor.add(i).await
                })
            })
            .collect();
        for adder in adders {
            adder.await.unwrap();
        }
        processor.flush().await;

        let sizes = batch_sizes(&seen);
        assert!(sizes.values().all(|&size| size <= 2), "sizes: {:?}", sizes);
        assert_eq!(sizes.values().sum::<usize>(), 8);
        assert_eq!(processor.stats().batches, 4);
        assert_eq!(processor.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_flush_splits_backlog_into_batches() {
        let (processor, seen) = recording(3);
        {
            let mut pending = processor.pending.lock().await;
            pending.items.extend(0..7);
        }

        assert_eq!(processor.flush().await, 7);
        assert_eq!(processor.stats().batches, 3);

        let sizes = batch_sizes(&seen);
        assert_eq!(sizes.get(&0), Some(&3));
        assert_eq!(sizes.get(&1), Some(&3));
        assert_eq!(sizes.get(&2), Some(&1));
    }

    #[tokio::test]
    async fn test_handler_panic_is_counted() {
        let processor = BatchProcessor::new(2, |item: BatchItem<u32>| async move {
            if item.request == 1 {
                panic!("bad request");
            }
        });

        processor.add(0).await;
        processor.add(1).await;

        let stats = processor.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.failed, 1);
    }
}
