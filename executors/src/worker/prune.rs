use relayer_core::{chain::ChainService, signer::SigningGateway};

use crate::{
    nonce::NonceStore,
    shutdown::NamedWorker,
    store::TransactionStore,
    worker::{PipelineContext, PipelineWorker, error::WorkerError},
};

/// Keeps the terminal history bounded by the live `history.max_transactions`.
pub struct HistoryPruner<S, N, G, CS> {
    ctx: PipelineContext<S, N, G, CS>,
}

impl<S, N, G, CS> HistoryPruner<S, N, G, CS> {
    pub fn new(ctx: PipelineContext<S, N, G, CS>) -> Self {
        Self { ctx }
    }
}

impl<S, N, G, CS> NamedWorker for HistoryPruner<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    fn name(&self) -> &str {
        "prune"
    }
}

impl<S, N, G, CS> PipelineWorker for HistoryPruner<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    async fn tick(&self) -> Result<usize, WorkerError> {
        let max_transactions = self.ctx.config.load().history.max_transactions;
        let removed = self.ctx.store.prune(max_transactions).await?;
        if removed > 0 {
            tracing::info!(removed, max_transactions, "Pruned terminal transactions");
        }
        Ok(removed)
    }
}
