use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::primitives::{Address, B256};
use dashmap::DashMap;
use relayer_core::{
    chain::{ChainClient, ChainService, GasPricing},
    error::RelayerError,
    intent::UnsignedCall,
    signer::SigningGateway,
};
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::{
    nonce::NonceStore,
    shutdown::NamedWorker,
    store::{
        AttemptKind, AttemptOutcome, FailureReason, PreparedAttempt, QueuedTransaction,
        TransactionAttempt, TransactionFilter, TransactionStatus, TransactionStore,
        TransactionUpdate, now_millis,
    },
    worker::{
        PipelineContext, PipelineWorker,
        error::{
            SendErrorClassification, WorkerError, classify_estimation_error, classify_send_error,
            is_retryable_preparation_error, should_trigger_nonce_reset,
        },
        transaction::{buffered_gas_limit, estimation_request},
    },
};

#[derive(Debug, Clone)]
pub struct SendWorkerOptions {
    pub worker_id: String,
    /// How long a claimed record stays reserved for this worker.
    pub claim_lease: Duration,
    /// Hard ceiling on in-flight sends for this process. The live config
    /// limit is applied beneath it.
    pub max_concurrency: usize,
}

impl Default for SendWorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: format!("send-{}", uuid::Uuid::new_v4()),
            claim_lease: Duration::from_secs(60),
            max_concurrency: 1_000,
        }
    }
}

type SenderKey = (u64, Address);

/// Removes the sender from the busy set even if its task panics.
struct BusyGuard {
    busy: Arc<DashMap<SenderKey, ()>>,
    key: SenderKey,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.remove(&self.key);
    }
}

/// Moves due QUEUED transactions onto the chain.
///
/// Each tick claims at most the live send concurrency minus what is still
/// in flight. Claimed transactions are grouped by (chain, sender): groups
/// run concurrently, a group's transactions run one after another so a
/// sender's nonces are allocated in claim order.
pub struct SendWorker<S, N, G, CS> {
    core: Arc<SendCore<S, N, G, CS>>,
    permits: Arc<Semaphore>,
    busy: Arc<DashMap<SenderKey, ()>>,
}

struct SendCore<S, N, G, CS> {
    ctx: PipelineContext<S, N, G, CS>,
    options: SendWorkerOptions,
}

impl<S, N, G, CS> SendWorker<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    pub fn new(ctx: PipelineContext<S, N, G, CS>, options: SendWorkerOptions) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(options.max_concurrency)),
            busy: Arc::new(DashMap::new()),
            core: Arc::new(SendCore { ctx, options }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.core.options.max_concurrency - self.permits.available_permits()
    }

    async fn claim_batch(
        &self,
        budget: usize,
    ) -> Result<HashMap<SenderKey, Vec<QueuedTransaction>>, WorkerError> {
        let ctx = &self.core.ctx;
        let options = &self.core.options;

        let candidates = ctx
            .store
            .query(TransactionFilter::DueQueued {
                now: now_millis(),
                limit: budget.saturating_mul(2),
            })
            .await?;

        let mut groups: HashMap<SenderKey, Vec<QueuedTransaction>> = HashMap::new();
        let mut claimed = 0;

        for candidate in candidates {
            if claimed >= budget {
                break;
            }

            let key = (candidate.chain_id(), candidate.sender().address);
            if self.busy.contains_key(&key) {
                continue;
            }

            match ctx
                .store
                .claim(candidate.id, &options.worker_id, options.claim_lease)
                .await
            {
                Ok(record) => {
                    groups.entry(key).or_default().push(record);
                    claimed += 1;
                }
                Err(e) if e.is_lost_race() => {
                    tracing::debug!(transaction_id = %candidate.id, error = %e, "Skipping transaction claimed elsewhere");
                }
                Err(e) => {
                    // Whatever was claimed so far still gets processed.
                    tracing::error!(transaction_id = %candidate.id, error = %e, "Failed to claim transaction");
                    break;
                }
            }
        }

        Ok(groups)
    }
}

impl<S, N, G, CS> NamedWorker for SendWorker<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    fn name(&self) -> &str {
        "send"
    }
}

impl<S, N, G, CS> PipelineWorker for SendWorker<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    async fn tick(&self) -> Result<usize, WorkerError> {
        let config = self.core.ctx.config.load();
        let live_limit = config.send.concurrency.min(self.core.options.max_concurrency);
        let budget = live_limit.saturating_sub(self.in_flight());
        if budget == 0 {
            tracing::trace!("Send concurrency exhausted, waiting");
            return Ok(0);
        }

        let groups = self.claim_batch(budget).await?;
        let mut dispatched = 0;

        for (key, transactions) in groups {
            let Ok(permit) = self
                .permits
                .clone()
                .try_acquire_many_owned(transactions.len() as u32)
            else {
                // The claims lapse and the records are picked up again.
                tracing::warn!(chain_id = key.0, sender = %key.1, "No send capacity for claimed group");
                continue;
            };

            self.busy.insert(key, ());
            let guard = BusyGuard {
                busy: self.busy.clone(),
                key,
            };
            dispatched += transactions.len();

            let core = self.core.clone();
            tokio::spawn(
                async move {
                    for transaction in transactions {
                        let transaction_id = transaction.id;
                        if let Err(e) = core.process(transaction).await {
                            tracing::error!(%transaction_id, error = %e, "Failed to send transaction");
                        }
                    }
                    drop(guard);
                    drop(permit);
                }
                .instrument(tracing::info_span!("send_group", chain_id = key.0, sender = %key.1)),
            );
        }

        Ok(dispatched)
    }

    async fn drain(&self) {
        let max = self.core.options.max_concurrency as u32;
        tracing::info!(in_flight = self.in_flight(), "Waiting for in-flight sends");
        if let Ok(permits) = self.permits.acquire_many(max).await {
            drop(permits);
        }
    }
}

impl<S, N, G, CS> SendCore<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    async fn process(&self, transaction: QueuedTransaction) -> Result<(), WorkerError> {
        if transaction.cancel_requested && transaction.prepared.is_none() {
            return self.cancel_unsent(&transaction).await;
        }

        let chain = match self.ctx.chains.get_chain(transaction.chain_id()) {
            Ok(chain) => chain,
            Err(e @ RelayerError::UnsupportedChain { .. }) => {
                let error = WorkerError::PreparationFailed {
                    message: e.to_string(),
                    inner_error: e,
                };
                return self
                    .handle_failure(&transaction, error, None, None, false)
                    .await;
            }
            Err(e) => {
                let error = WorkerError::ChainServiceError {
                    chain_id: transaction.chain_id(),
                    message: e.to_string(),
                };
                return self
                    .handle_failure(&transaction, error, None, None, true)
                    .await;
            }
        };

        // An expired claim left a signed attempt behind; resend the same
        // bytes rather than spending another nonce.
        if let Some(prepared) = transaction.prepared.clone() {
            tracing::info!(
                transaction_id = %transaction.id,
                nonce = prepared.attempt.nonce,
                "Rebroadcasting previously prepared attempt"
            );
            return self.rebroadcast(&chain, &transaction, prepared).await;
        }

        let (call, gas_limit, pricing) = match self.prepare(&chain, &transaction).await {
            Ok(prepared) => prepared,
            Err(error) => {
                let retryable = is_retryable_preparation_error(&error);
                return self
                    .handle_failure(&transaction, error, None, None, retryable)
                    .await;
            }
        };

        let config = self.ctx.config.load();
        let nonce = match self
            .ctx
            .nonces
            .allocate(&chain, transaction.sender().address, config.nonce.reconcile_interval())
            .await
        {
            Ok(nonce) => nonce,
            Err(e) => {
                let error = WorkerError::from(e);
                let retryable = is_retryable_preparation_error(&error);
                return self
                    .handle_failure(&transaction, error, None, None, retryable)
                    .await;
            }
        };

        let prepared = match self
            .ctx
            .sign_attempt(
                chain.chain_id(),
                transaction.sender(),
                call,
                nonce,
                gas_limit,
                pricing,
                AttemptKind::Original,
            )
            .await
        {
            Ok(prepared) => prepared,
            Err(error) => {
                let retryable = is_retryable_preparation_error(&error);
                return self
                    .handle_failure(&transaction, error, Some(nonce), None, retryable)
                    .await;
            }
        };

        if let Err(e) = self
            .ctx
            .store
            .prepare(transaction.id, &self.options.worker_id, prepared.clone())
            .await
        {
            self.release_nonce(&transaction, nonce).await;
            if e.is_lost_race() {
                tracing::debug!(transaction_id = %transaction.id, error = %e, "Lost claim before broadcast");
                return Ok(());
            }
            return Err(e.into());
        }

        self.broadcast(&chain, &transaction, prepared).await
    }

    async fn prepare(
        &self,
        chain: &CS::Chain,
        transaction: &QueuedTransaction,
    ) -> Result<(UnsignedCall, u64, GasPricing), WorkerError> {
        let call = self
            .ctx
            .signer
            .prepare_call(transaction.sender(), transaction.intent.call())
            .map_err(|e| WorkerError::PreparationFailed {
                message: e.to_string(),
                inner_error: e,
            })?;

        let overrides = &transaction.intent.gas_overrides;

        let gas_limit = match overrides.gas_limit {
            Some(gas_limit) => gas_limit,
            None => {
                let estimate = chain
                    .estimate_gas(estimation_request(&call))
                    .await
                    .map_err(classify_estimation_error)?;
                buffered_gas_limit(estimate)
            }
        };

        let pricing = match overrides.pricing() {
            Some(pricing) => pricing,
            None => chain
                .estimate_fees()
                .await
                .map_err(|e| WorkerError::RpcError {
                    message: format!("Fee estimation failed: {e}"),
                    inner_error: e,
                })?,
        };

        Ok((call, gas_limit, pricing))
    }

    async fn broadcast(
        &self,
        chain: &CS::Chain,
        transaction: &QueuedTransaction,
        prepared: PreparedAttempt,
    ) -> Result<(), WorkerError> {
        let result = chain.broadcast(prepared.raw.clone()).await;
        self.handle_broadcast_result(transaction, prepared, result)
            .await
    }

    /// Resend bytes a previous claim holder signed. The earlier broadcast
    /// may or may not have landed, so only an answer from the node tells us
    /// anything about the nonce.
    async fn rebroadcast(
        &self,
        chain: &CS::Chain,
        transaction: &QueuedTransaction,
        prepared: PreparedAttempt,
    ) -> Result<(), WorkerError> {
        match chain.broadcast(prepared.raw.clone()).await {
            Err(e) if !e.rpc_kind().is_some_and(|kind| kind.is_error_resp()) => {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Rebroadcast did not reach the node, leaving claim to lapse"
                );
                Ok(())
            }
            result => {
                self.handle_broadcast_result(transaction, prepared, result)
                    .await
            }
        }
    }

    async fn handle_broadcast_result(
        &self,
        transaction: &QueuedTransaction,
        prepared: PreparedAttempt,
        result: Result<B256, RelayerError>,
    ) -> Result<(), WorkerError> {
        let nonce = prepared.attempt.nonce;

        match result {
            Ok(hash) => {
                if hash != prepared.attempt.transaction_hash {
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        expected = %prepared.attempt.transaction_hash,
                        reported = %hash,
                        "Node reported a different transaction hash"
                    );
                }
                self.mark_sent(transaction, prepared).await
            }
            Err(e) => match classify_send_error(&e) {
                SendErrorClassification::PossiblySent => {
                    tracing::info!(
                        transaction_id = %transaction.id,
                        nonce,
                        error = %e,
                        "Broadcast returned an error but the transaction may be in the mempool"
                    );
                    self.mark_sent(transaction, prepared).await
                }
                classification => {
                    let retryable =
                        classification == SendErrorClassification::DeterministicFailure;
                    if retryable && should_trigger_nonce_reset(&e) {
                        self.request_reconcile(transaction).await;
                    }

                    let mut rejected = prepared.attempt;
                    rejected.broadcast_at = now_millis();
                    rejected.outcome = AttemptOutcome::Rejected;

                    let error = WorkerError::RpcError {
                        message: format!("Transaction send failed: {e}"),
                        inner_error: e,
                    };
                    self.handle_failure(transaction, error, Some(nonce), Some(rejected), retryable)
                        .await
                }
            },
        }
    }

    async fn mark_sent(
        &self,
        transaction: &QueuedTransaction,
        prepared: PreparedAttempt,
    ) -> Result<(), WorkerError> {
        let nonce = prepared.attempt.nonce;
        let transaction_hash = prepared.attempt.transaction_hash;

        let mut attempt = prepared.attempt;
        attempt.broadcast_at = now_millis();

        let update = TransactionUpdate {
            nonce: Some(nonce),
            call: Some(prepared.call),
            attempt: Some(attempt),
            ..Default::default()
        };

        match self
            .ctx
            .store
            .transition(
                transaction.id,
                TransactionStatus::Queued,
                TransactionStatus::Sent,
                update,
            )
            .await
        {
            Ok(_) => {
                tracing::info!(
                    transaction_id = %transaction.id,
                    nonce,
                    %transaction_hash,
                    "Transaction sent"
                );
                Ok(())
            }
            Err(e) if e.is_lost_race() => {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Transaction was moved by another worker after broadcast"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a failed send, along with the attempt the node rejected if
    /// there was one. Nonces are only released here, for attempts that
    /// provably never reached the mempool.
    async fn handle_failure(
        &self,
        transaction: &QueuedTransaction,
        error: WorkerError,
        nonce: Option<u64>,
        rejected: Option<TransactionAttempt>,
        retryable: bool,
    ) -> Result<(), WorkerError> {
        if let Some(nonce) = nonce {
            self.release_nonce(transaction, nonce).await;
        }

        let config = self.ctx.config.load();
        let failures = transaction.send_failures + 1;
        let message = error.to_string();

        let (to, update) = if !retryable || failures >= config.send.max_send_attempts {
            let failure = match &error {
                WorkerError::PreparationFailed { .. }
                | WorkerError::TransactionSimulationFailed { .. } => {
                    FailureReason::PreparationFailed {
                        message: message.clone(),
                    }
                }
                _ => FailureReason::SendFailed {
                    message: message.clone(),
                },
            };
            tracing::warn!(
                transaction_id = %transaction.id,
                failures,
                error = %message,
                "Transaction failed before reaching the chain"
            );
            (
                TransactionStatus::Errored,
                TransactionUpdate {
                    attempt: rejected,
                    send_error: Some(message),
                    failure: Some(failure),
                    ..Default::default()
                },
            )
        } else {
            let delay = config.send.backoff(failures);
            tracing::info!(
                transaction_id = %transaction.id,
                failures,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Send failed, requeueing"
            );
            (
                TransactionStatus::Queued,
                TransactionUpdate {
                    attempt: rejected,
                    send_error: Some(message),
                    available_at: Some(now_millis() + delay.as_millis() as u64),
                    ..Default::default()
                },
            )
        };

        match self
            .ctx
            .store
            .transition(transaction.id, TransactionStatus::Queued, to, update)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_lost_race() => {
                tracing::debug!(transaction_id = %transaction.id, error = %e, "Record moved before failure was recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel_unsent(&self, transaction: &QueuedTransaction) -> Result<(), WorkerError> {
        match self
            .ctx
            .store
            .transition(
                transaction.id,
                TransactionStatus::Queued,
                TransactionStatus::Cancelled,
                TransactionUpdate::default(),
            )
            .await
        {
            Ok(_) => {
                tracing::info!(transaction_id = %transaction.id, "Cancelled before broadcast");
                Ok(())
            }
            Err(e) if e.is_lost_race() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_nonce(&self, transaction: &QueuedTransaction, nonce: u64) {
        if let Err(e) = self
            .ctx
            .nonces
            .release(transaction.chain_id(), transaction.sender().address, nonce)
            .await
        {
            tracing::error!(
                transaction_id = %transaction.id,
                nonce,
                error = %e,
                "Failed to release nonce"
            );
        }
    }

    async fn request_reconcile(&self, transaction: &QueuedTransaction) {
        if let Err(e) = self
            .ctx
            .nonces
            .request_reconcile(transaction.chain_id(), transaction.sender().address)
            .await
        {
            tracing::error!(transaction_id = %transaction.id, error = %e, "Failed to flag nonce reconcile");
        }
    }
}
