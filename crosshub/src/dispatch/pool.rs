use std::{future::Future, sync::Arc};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::*;

/// Runs submitted tasks with bounded concurrency. Submitting waits for a free worker, and shutting down waits for
/// every task in flight.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    span: Span,
}

impl WorkerPool {
    pub fn new(workers: usize, span: Span) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            span,
        }
    }

    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("worker pool is shut down"))?;

        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "worker task failed");
            }
        }
        tasks.spawn(
            async move {
                task.await;
                drop(permit);
            }
            .instrument(self.span.clone()),
        );
        Ok(())
    }

    /// Number of tasks which have been submitted but not reaped.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Refuses new tasks and waits for the ones in flight.
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "worker task failed");
            }
        }
    }
}
