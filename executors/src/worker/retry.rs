use std::collections::HashSet;

use futures::StreamExt;
use relayer_core::{
    chain::{ChainClient, ChainService},
    signer::SigningGateway,
};
use uuid::Uuid;

use crate::{
    nonce::NonceStore,
    shutdown::NamedWorker,
    store::{
        AttemptKind, AttemptOutcome, FailureReason, QueuedTransaction, TransactionFilter,
        TransactionStatus, TransactionStore, TransactionUpdate, now_millis,
    },
    worker::{
        PipelineContext, PipelineWorker,
        error::{SendErrorClassification, WorkerError, classify_send_error},
        transaction::{NOOP_GAS_LIMIT, bump_pricing, noop_call},
    },
};

/// Replaces SENT transactions that have been pending too long, at the same
/// nonce and a higher price, and sends cancellations on request.
///
/// A replacement is appended to the record before it is broadcast. The
/// append is compare-and-set on the attempt count, so two schedulers can
/// never both replace the same attempt.
pub struct RetryScheduler<S, N, G, CS> {
    ctx: PipelineContext<S, N, G, CS>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replacement {
    GasBump,
    Cancellation,
}

impl<S, N, G, CS> RetryScheduler<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    pub fn new(ctx: PipelineContext<S, N, G, CS>) -> Self {
        Self { ctx }
    }

    async fn collect(&self, limit: usize) -> Result<Vec<(QueuedTransaction, Replacement)>, WorkerError> {
        let config = self.ctx.config.load();
        let timeout_ms = config.retry.pending_timeout().as_millis() as u64;

        let cancellations = self
            .ctx
            .store
            .query(TransactionFilter::CancelRequested { limit })
            .await?;

        let mut seen = HashSet::<Uuid>::new();
        let mut work = Vec::new();

        for transaction in cancellations {
            let already_cancelling = transaction
                .latest_attempt()
                .is_some_and(|attempt| attempt.kind == AttemptKind::Cancellation);
            if !already_cancelling {
                seen.insert(transaction.id);
                work.push((transaction, Replacement::Cancellation));
            }
        }

        let remaining = limit.saturating_sub(work.len());
        if remaining > 0 {
            let stalled = self
                .ctx
                .store
                .query(TransactionFilter::StalledSent {
                    sent_before: now_millis().saturating_sub(timeout_ms),
                    limit: remaining,
                })
                .await?;

            for transaction in stalled {
                if seen.insert(transaction.id) {
                    work.push((transaction, Replacement::GasBump));
                }
            }
        }

        Ok(work)
    }

    async fn replace(
        &self,
        transaction: QueuedTransaction,
        replacement: Replacement,
    ) -> Result<(), WorkerError> {
        let (Some(nonce), Some(previous)) = (transaction.nonce, transaction.latest_attempt().cloned())
        else {
            return Err(WorkerError::InternalError {
                message: format!("Sent transaction {} has no attempts", transaction.id),
            });
        };

        let config = self.ctx.config.load();
        let chain = self.ctx.get_chain(transaction.chain_id())?;
        let sender = transaction.sender().address;

        // Once the nonce is spent, confirmation owns the outcome.
        let chain_count = chain
            .get_transaction_count(sender)
            .await
            .map_err(|e| WorkerError::RpcError {
                message: format!("Failed to read transaction count: {e}"),
                inner_error: e,
            })?;
        if chain_count > nonce {
            tracing::debug!(
                transaction_id = %transaction.id,
                nonce,
                chain_count,
                "Nonce already consumed, skipping replacement"
            );
            return Ok(());
        }

        let attempts = transaction.attempts.len();
        let sent_attempts = transaction.sent_attempts();
        let cancelling = replacement == Replacement::Cancellation
            || previous.kind == AttemptKind::Cancellation;

        let pricing = if sent_attempts >= config.retry.max_attempts as usize {
            None
        } else {
            bump_pricing(
                previous.pricing,
                config.retry.gas_bump_percent,
                config.retry.max_gas_price_wei,
            )
        };

        // Cancellations share the attempt budget. A cancellation with no
        // room left errors the transaction like any other exhausted retry.
        let Some(pricing) = pricing else {
            if cancelling {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    attempts = sent_attempts,
                    "No room to price a cancellation above the pending attempt"
                );
            }
            return self.exhaust(&chain, &transaction, sent_attempts).await;
        };

        let (kind, call, gas_limit) = if cancelling {
            (AttemptKind::Cancellation, noop_call(sender), NOOP_GAS_LIMIT)
        } else {
            let call = transaction.call.clone().ok_or_else(|| WorkerError::InternalError {
                message: format!("Sent transaction {} has no signed call", transaction.id),
            })?;
            (AttemptKind::GasBump, call, previous.gas_limit)
        };

        let prepared = self
            .ctx
            .sign_attempt(
                chain.chain_id(),
                transaction.sender(),
                call,
                nonce,
                gas_limit,
                pricing,
                kind,
            )
            .await?;

        match self
            .ctx
            .store
            .append_attempt(transaction.id, attempts, prepared.attempt.clone())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_lost_race() => {
                tracing::debug!(transaction_id = %transaction.id, error = %e, "Attempt already replaced");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match chain.broadcast(prepared.raw).await {
            Ok(_) => {}
            Err(e) => match classify_send_error(&e) {
                SendErrorClassification::PossiblySent => {
                    tracing::debug!(transaction_id = %transaction.id, error = %e, "Replacement possibly sent");
                }
                _ => {
                    // The rejected attempt stays in the history and the
                    // transaction is replaced again after the next timeout.
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        nonce,
                        error = %e,
                        "Replacement broadcast rejected"
                    );
                    if let Err(e) = self
                        .ctx
                        .store
                        .set_attempt_outcome(
                            transaction.id,
                            prepared.attempt.transaction_hash,
                            AttemptOutcome::Rejected,
                        )
                        .await
                    {
                        if !e.is_lost_race() {
                            return Err(e.into());
                        }
                    }
                    return Ok(());
                }
            },
        }

        tracing::info!(
            transaction_id = %transaction.id,
            nonce,
            attempt = sent_attempts + 1,
            kind = ?kind,
            transaction_hash = %prepared.attempt.transaction_hash,
            "Broadcast replacement attempt"
        );
        Ok(())
    }

    /// Give up on a transaction. Its nonce may still be taken by any
    /// attempt already in the mempool, so it is never released; instead the
    /// pair is reconciled and the nonce stays outstanding until the chain
    /// moves past it.
    async fn exhaust(
        &self,
        chain: &CS::Chain,
        transaction: &QueuedTransaction,
        attempts: usize,
    ) -> Result<(), WorkerError> {
        let update = TransactionUpdate {
            failure: Some(FailureReason::RetriesExhausted { attempts }),
            ..Default::default()
        };

        match self
            .ctx
            .store
            .transition(
                transaction.id,
                TransactionStatus::Sent,
                TransactionStatus::Errored,
                update,
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_lost_race() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        tracing::warn!(
            transaction_id = %transaction.id,
            nonce = transaction.nonce,
            attempts,
            "Retries exhausted, transaction errored"
        );

        if let Err(e) = self
            .ctx
            .nonces
            .reconcile(chain, transaction.sender().address)
            .await
        {
            tracing::error!(transaction_id = %transaction.id, error = %e, "Nonce reconcile failed");
        }
        Ok(())
    }
}

impl<S, N, G, CS> NamedWorker for RetryScheduler<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    fn name(&self) -> &str {
        "retry"
    }
}

impl<S, N, G, CS> PipelineWorker for RetryScheduler<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    async fn tick(&self) -> Result<usize, WorkerError> {
        let concurrency = self.ctx.config.load().retry.concurrency.max(1);
        let work = self.collect(concurrency).await?;
        let count = work.len();

        futures::stream::iter(work)
            .for_each_concurrent(concurrency, |(transaction, replacement)| async move {
                let transaction_id = transaction.id;
                if let Err(e) = self.replace(transaction, replacement).await {
                    tracing::warn!(%transaction_id, error = %e, "Replacement failed");
                }
            })
            .await;

        Ok(count)
    }
}
