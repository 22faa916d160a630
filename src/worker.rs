//! Bounded pool for blocking agent calls.
//!
//! Every blocking call is admitted through a semaphore permit and executed on
//! Tokio's blocking threads. The permit travels with the job, so a call that
//! outlives its deadline keeps its slot until it actually returns.

use crate::error::WorkerError;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// A process-wide pool of blocking workers, cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    deadline: Option<Duration>,
}

impl WorkerPool {
    /// Create a pool running at most `size` blocking calls at once.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            deadline: None,
        }
    }

    /// Attach a deadline to every call submitted through this pool.
    ///
    /// The deadline starts once a worker is free; time spent queued for a
    /// permit does not count against it.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Number of workers currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop admitting new calls. Calls already running finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Run a blocking job on the pool and wait for its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;

        debug!(
            "Dispatching blocking call ({} of {} workers free)",
            self.available(),
            self.size
        );

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });

        let joined = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Blocking call exceeded deadline of {:?}", deadline);
                    return Err(WorkerError::DeadlineExceeded(deadline));
                }
            },
            None => handle.await,
        };

        joined.map_err(|e| {
            if e.is_panic() {
                WorkerError::Panicked(panic_message(e.into_panic()))
            } else {
                WorkerError::Panicked("worker task was cancelled".to_string())
            }
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
