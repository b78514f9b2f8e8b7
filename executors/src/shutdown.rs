use std::sync::Arc;

use relayer_core::error::RelayerError;

/// Anything run as a long-lived background task.
pub trait NamedWorker: Send + Sync + 'static {
    fn name(&self) -> &str;
}

/// Handle for a single worker that can be shut down gracefully
pub struct WorkerHandle<W: NamedWorker> {
    pub join_handle: tokio::task::JoinHandle<Result<(), RelayerError>>,
    pub shutdown_tx: tokio::sync::oneshot::Sender<()>,
    pub worker: Arc<W>,
}

impl<W: NamedWorker> WorkerHandle<W> {
    /// Shutdown this worker gracefully
    pub async fn shutdown(self) -> Result<(), RelayerError> {
        let name = self.worker.name().to_string();
        tracing::info!(worker = name, "Initiating graceful shutdown of worker");

        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!(worker = name, "Worker was already shutting down");
        }

        match self.join_handle.await {
            Ok(Ok(())) => {
                tracing::info!(worker = name, "Worker shut down gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(worker = name, error = ?e, "Worker shut down with error");
                Err(e)
            }
            Err(e) => {
                tracing::error!(worker = name, error = ?e, "Worker task panicked during shutdown");
                Err(RelayerError::InternalError {
                    message: format!("Worker {name} panic: {e}"),
                })
            }
        }
    }
}

/// Handle for coordinating shutdown of multiple workers
pub struct ShutdownHandle {
    join_handles: Vec<(String, tokio::task::JoinHandle<Result<(), RelayerError>>)>,
    shutdown_txs: Vec<tokio::sync::oneshot::Sender<()>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            join_handles: Vec::new(),
            shutdown_txs: Vec::new(),
        }
    }

    pub fn add_worker<W: NamedWorker>(&mut self, worker: WorkerHandle<W>) {
        self.join_handles
            .push((worker.worker.name().to_string(), worker.join_handle));
        self.shutdown_txs.push(worker.shutdown_tx);
    }

    /// Builder-style method to add a worker
    pub fn and_worker<W: NamedWorker>(mut self, worker: WorkerHandle<W>) -> Self {
        self.add_worker(worker);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.join_handles.len()
    }

    /// Signal every worker first, then wait for all of them. Each worker
    /// finishes its in-flight work before its task completes.
    pub async fn shutdown(self) -> Result<(), RelayerError> {
        let worker_count = self.join_handles.len();
        tracing::info!("Initiating graceful shutdown of {} workers", worker_count);

        for shutdown_tx in self.shutdown_txs {
            if shutdown_tx.send(()).is_err() {
                tracing::warn!("A worker was already shutting down");
            }
        }

        let (names, handles): (Vec<_>, Vec<_>) = self.join_handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;
        let mut errors = Vec::new();

        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(Ok(())) => {
                    tracing::debug!(worker = name, "Worker shut down gracefully");
                }
                Ok(Err(e)) => {
                    tracing::error!(worker = name, error = ?e, "Worker shut down with error");
                    errors.push(e);
                }
                Err(e) => {
                    tracing::error!(worker = name, error = ?e, "Worker task panicked during shutdown");
                    errors.push(RelayerError::InternalError {
                        message: format!("Worker {name} panic: {e}"),
                    });
                }
            }
        }

        match errors.into_iter().next() {
            None => {
                tracing::info!("All {} workers shut down gracefully", worker_count);
                Ok(())
            }
            Some(first) => Err(first),
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}
