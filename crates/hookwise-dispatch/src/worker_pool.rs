//! Supervised set of ingest workers sharing one inbound queue.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DispatchError, Result},
    worker::{IngestWorker, PipelineStats, Processor, SharedReceiver},
};

/// Fixed-size pool of ingest workers.
///
/// Workers stop on their own once the queue's sender is dropped and the
/// buffer is empty. Cancelling the token stops them after their current
/// notification.
pub struct WorkerPool {
    worker_count: usize,
    receiver: SharedReceiver,
    processor: Arc<Processor>,
    stats: Arc<RwLock<PipelineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(
        worker_count: usize,
        receiver: SharedReceiver,
        processor: Arc<Processor>,
        stats: Arc<RwLock<PipelineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_count,
            receiver,
            processor,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns the configured number of workers.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning ingest workers");

        self.stats.write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let worker = IngestWorker::new(
                worker_id,
                self.receiver.clone(),
                self.processor.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
            );

            let stats = self.stats.clone();
            let handle = tokio::spawn(async move {
                info!(worker_id, "ingest worker starting");
                worker.run().await;

                let mut stats = stats.write().await;
                stats.active_workers = stats.active_workers.saturating_sub(1);
                info!(worker_id, "ingest worker stopped");
            });

            self.worker_handles.push(handle);
        }
    }

    /// Waits up to `timeout` for workers to drain the closed queue.
    ///
    /// The queue's sender must already be dropped. On timeout the workers
    /// are cancelled and stop after their current notification.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the queue was not drained in time and
    /// `WorkerPanic` if a worker task panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_ms = timeout.as_millis(),
            "draining ingest workers"
        );

        let handles = std::mem::take(&mut self.worker_handles);
        let drain = async {
            let mut panicked = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "ingest worker panicked");
                    panicked.get_or_insert(DispatchError::WorkerPanic {
                        worker_id,
                        error: join_error.to_string(),
                    });
                }
            }
            panicked
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(None) => {
                info!("ingest workers drained");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_) => {
                self.cancellation_token.cancel();
                let remaining = self.receiver.lock().await.len();
                warn!(
                    remaining,
                    timeout_ms = timeout.as_millis(),
                    "queue not drained before shutdown timeout, workers cancelled"
                );
                Err(DispatchError::ShutdownTimeout { timeout })
            },
        }
    }

    /// True while any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped while running, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
