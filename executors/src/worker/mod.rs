use std::{future::Future, sync::Arc, time::Duration};

use relayer_core::{
    chain::{ChainService, GasPricing},
    error::RelayerError,
    intent::{Sender, UnsignedCall},
    signer::SigningGateway,
};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::{
    nonce::{NonceManager, NonceStore},
    propagator::LiveConfig,
    shutdown::{NamedWorker, WorkerHandle},
    store::{
        AttemptKind, AttemptOutcome, PreparedAttempt, TransactionAttempt, TransactionStore,
        now_millis,
    },
};

pub mod confirm;
pub mod error;
pub mod prune;
pub mod retry;
pub mod send;
pub mod transaction;

pub use confirm::ConfirmationWorker;
pub use error::WorkerError;
pub use prune::HistoryPruner;
pub use retry::RetryScheduler;
pub use send::{SendWorker, SendWorkerOptions};

/// Everything the pipeline stages share. Cheap to clone.
pub struct PipelineContext<S, N, G, CS> {
    pub store: Arc<S>,
    pub nonces: NonceManager<N>,
    pub signer: Arc<G>,
    pub chains: Arc<CS>,
    pub config: LiveConfig,
}

impl<S, N, G, CS> Clone for PipelineContext<S, N, G, CS> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            nonces: self.nonces.clone(),
            signer: self.signer.clone(),
            chains: self.chains.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, N, G, CS> PipelineContext<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    pub fn get_chain(&self, chain_id: u64) -> Result<CS::Chain, WorkerError> {
        self.chains
            .get_chain(chain_id)
            .map_err(|e| WorkerError::ChainServiceError {
                chain_id,
                message: format!("Failed to get chain instance: {e}"),
            })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn sign_attempt(
        &self,
        chain_id: u64,
        sender: &Sender,
        call: UnsignedCall,
        nonce: u64,
        gas_limit: u64,
        pricing: GasPricing,
        kind: AttemptKind,
    ) -> Result<PreparedAttempt, WorkerError> {
        let typed = transaction::typed_transaction(chain_id, &call, nonce, gas_limit, pricing);

        let signed = self
            .signer
            .sign_transaction(chain_id, sender, typed)
            .await
            .map_err(|e: RelayerError| WorkerError::SigningError {
                message: e.to_string(),
                inner_error: e,
            })?;

        let (transaction_hash, raw) = transaction::encode_signed(signed);

        Ok(PreparedAttempt {
            attempt: TransactionAttempt {
                kind,
                transaction_hash,
                nonce,
                gas_limit,
                pricing,
                broadcast_at: now_millis(),
                outcome: AttemptOutcome::Pending,
            },
            call,
            raw,
        })
    }
}

/// A pipeline stage driven by a polling loop.
pub trait PipelineWorker: NamedWorker {
    /// Run one round of work. Returns how many records were picked up.
    fn tick(&self) -> impl Future<Output = Result<usize, WorkerError>> + Send;

    /// Wait for work started by earlier ticks to finish.
    fn drain(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Run `worker` every `polling_interval` until shut down. On shutdown the
/// loop stops picking up work and drains what is in flight.
pub fn spawn_worker<W: PipelineWorker>(worker: Arc<W>, polling_interval: Duration) -> WorkerHandle<W> {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let name = worker.name().to_string();
    let task_worker = worker.clone();

    let join_handle = tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(polling_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!("Worker started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!("Shutdown signal received");
                        break;
                    }

                    _ = interval.tick() => {
                        match task_worker.tick().await {
                            Ok(0) => tracing::trace!("Nothing to do"),
                            Ok(count) => tracing::debug!(count, "Processed batch"),
                            Err(e) => tracing::error!(error = %e, "Worker tick failed"),
                        }
                    }
                }
            }

            task_worker.drain().await;
            tracing::info!("In-flight work drained, worker stopped");
            Ok(())
        }
        .instrument(tracing::info_span!("pipeline_worker", worker = %name)),
    );

    WorkerHandle {
        join_handle,
        shutdown_tx,
        worker,
    }
}
