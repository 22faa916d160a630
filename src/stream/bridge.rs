//! Blocking-call-to-stream bridge.
//!
//! A call is dispatched to a worker as soon as the stream is opened. The
//! returned stream polls a partial-output channel while the worker runs,
//! then yields the final result as its last chunk. A failed call yields a
//! single `Error: ...` chunk instead.
//!
//! Dropping the stream does not stop a call that is already running. The
//! call can observe the abandonment through [`PartialSink::is_closed`].

use crate::config::StreamConfig;
use crate::worker::WorkerPool;
use async_stream::stream;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Prefix of the chunk yielded when the bridged call fails.
pub const STREAM_ERROR_PREFIX: &str = "Error: ";

/// Chunks delivered to an asynchronous consumer.
pub type ChunkStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Write side of a session's partial-output channel.
#[derive(Debug, Clone)]
pub struct PartialSink {
    tx: mpsc::UnboundedSender<String>,
}

impl PartialSink {
    /// A sink whose chunks go nowhere.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Queue a partial chunk. Empty chunks are skipped.
    ///
    /// Returns `false` once the consumer has gone away.
    pub fn publish(&self, chunk: impl Into<String>) -> bool {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(chunk).is_ok()
    }

    /// Whether the consuming stream has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One in-flight call plus the channel its partial output arrives on.
pub struct StreamSession {
    id: Uuid,
    partials: mpsc::UnboundedReceiver<String>,
    worker: JoinHandle<Result<String, String>>,
    poll_interval: Duration,
}

impl StreamSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the underlying call has completed.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Turn the session into the consumer-facing chunk stream.
    pub fn into_stream(self) -> ChunkStream {
        let StreamSession {
            id,
            mut partials,
            worker,
            poll_interval,
        } = self;

        Box::pin(stream! {
            let mut delivered = 0usize;

            loop {
                while let Ok(chunk) = partials.try_recv() {
                    delivered += 1;
                    yield chunk;
                }
                if worker.is_finished() {
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }

            // Chunks queued just before completion.
            while let Ok(chunk) = partials.try_recv() {
                delivered += 1;
                yield chunk;
            }

            debug!("Stream {} finished after {} partial chunks", id, delivered);

            let last = match worker.await {
                Ok(Ok(text)) => text,
                Ok(Err(message)) => error_chunk(&message),
                Err(e) => error_chunk(&e.to_string()),
            };
            yield last;
        })
    }
}

fn error_chunk(message: &str) -> String {
    format!("{}{}", STREAM_ERROR_PREFIX, message)
}

/// Opens stream sessions over the shared worker pool.
#[derive(Debug, Clone)]
pub struct StreamBridge {
    pool: WorkerPool,
    poll_interval: Duration,
}

impl StreamBridge {
    pub fn new(pool: WorkerPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    pub fn from_config(pool: WorkerPool, config: &StreamConfig) -> Self {
        Self::new(pool, config.poll_interval())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The pool sessions run their calls on.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run a blocking call on the pool and stream its output.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<F>(&self, call: F) -> ChunkStream
    where
        F: FnOnce(&PartialSink) -> anyhow::Result<String> + Send + 'static,
    {
        self.session(call).into_stream()
    }

    /// Like [`open`](Self::open), returning the session instead of the stream.
    pub fn session<F>(&self, call: F) -> StreamSession
    where
        F: FnOnce(&PartialSink) -> anyhow::Result<String> + Send + 'static,
    {
        let pool = self.pool.clone();
        self.spawn(move |sink| async move {
            match pool.run(move || call(&sink)).await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Stream the result of an asynchronous task, typically one that itself
    /// drives several blocking calls through the pool.
    pub fn open_task<F, Fut>(&self, task: F) -> ChunkStream
    where
        F: FnOnce(PartialSink) -> Fut,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.spawn(task).into_stream()
    }

    fn spawn<F, Fut>(&self, task: F) -> StreamSession
    where
        F: FnOnce(PartialSink) -> Fut,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let (tx, partials) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        debug!("Opening stream session {}", id);

        let fut = task(PartialSink { tx });
        let worker = tokio::spawn(async move { fut.await.map_err(|e| format!("{:#}", e)) });

        StreamSession {
            id,
            partials,
            worker,
            poll_interval: self.poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn bridge() -> StreamBridge {
        StreamBridge::new(WorkerPool::new(4), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_single_final_chunk_without_partials() {
        let chunks: Vec<String> = bridge()
            .open(|_| {
                std::thread::sleep(Duration::from_millis(50));
                Ok("full answer".to_string())
            })
            .collect()
            .await;

        assert_eq!(chunks, vec!["full answer".to_string()]);
    }

    #[tokio::test]
    async fn test_partials_precede_final_in_order() {
        let chunks: Vec<String> = bridge()
            .open(|sink| {
                for word in ["one", "two", "three"] {
                    sink.publish(word);
                    std::thread::sleep(Duration::from_millis(15));
                }
                Ok("one two three".to_string())
            })
            .collect()
            .await;

        assert_eq!(chunks, vec!["one", "two", "three", "one two three"]);
    }

    #[tokio::test]
    async fn test_partials_published_right_before_completion_are_kept() {
        let chunks: Vec<String> = bridge()
            .open(|sink| {
                sink.publish("a");
                sink.publish("");
                sink.publish("b");
                Ok("done".to_string())
            })
            .collect()
            .await;

        assert_eq!(chunks, vec!["a", "b", "done"]);
    }

    #[tokio::test]
    async fn test_failure_yields_error_marker() {
        let chunks: Vec<String> = bridge()
            .open(|sink| {
                sink.publish("partial");
                Err(anyhow::anyhow!("model unavailable"))
            })
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "partial");
        assert_eq!(chunks[1], "Error: model unavailable");
    }

    #[tokio::test]
    async fn test_deadline_yields_error_marker() {
        let pool = WorkerPool::new(1).with_deadline(Duration::from_millis(30));
        let bridge = StreamBridge::new(pool, Duration::from_millis(5));

        let chunks: Vec<String> = bridge
            .open(|_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok("too late".to_string())
            })
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].starts_with(STREAM_ERROR_PREFIX));
        assert!(chunks[0].contains("deadline"));
    }

    #[tokio::test]
    async fn test_open_task_streams_async_result() {
        let chunks: Vec<String> = bridge()
            .open_task(|sink| async move {
                sink.publish("working");
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok("finished".to_string())
            })
            .collect()
            .await;

        assert_eq!(chunks, vec!["working", "finished"]);
    }

    #[tokio::test]
    async fn test_call_is_dispatched_before_polling() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();

        let session = bridge().session(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(String::new())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.load(Ordering::SeqCst));
        assert!(session.is_finished());

        let chunks: Vec<String> = session.into_stream().collect().await;
        assert_eq!(chunks, vec![String::new()]);
    }

    #[tokio::test]
    async fn test_dropped_stream_closes_sink() {
        let observed_closed = Arc::new(AtomicBool::new(false));
        let flag = observed_closed.clone();

        let stream = bridge().open(move |sink| {
            std::thread::sleep(Duration::from_millis(60));
            flag.store(sink.is_closed(), Ordering::SeqCst);
            Ok("ignored".to_string())
        });
        drop(stream);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(observed_closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_detached_sink() {
        let sink = PartialSink::detached();
        assert!(sink.is_closed());
        assert!(!sink.publish("nobody listens"));
    }
}
