use futures::StreamExt;
use relayer_core::{
    chain::{ChainClient, ChainReceipt, ChainService},
    signer::SigningGateway,
};

use crate::{
    nonce::NonceStore,
    shutdown::NamedWorker,
    store::{
        AttemptKind, FailureReason, QueuedTransaction, SentCursor, TransactionAttempt,
        TransactionFilter, TransactionStatus, TransactionStore, TransactionUpdate, now_millis,
    },
    worker::{PipelineContext, PipelineWorker, error::WorkerError},
};

/// Polls receipts for SENT transactions and moves them to their terminal
/// state.
///
/// Sweeps the SENT set a page at a time, the page size being the live
/// confirm concurrency. Pages continue after the last record seen, so
/// records leaving SENT mid-sweep never push others past the cursor. Every
/// attempt the node accepted is checked, newest first, since any of them
/// may be the one that mined.
pub struct ConfirmationWorker<S, N, G, CS> {
    ctx: PipelineContext<S, N, G, CS>,
    cursor: tokio::sync::Mutex<Option<SentCursor>>,
}

enum Resolution {
    Mined(ChainReceipt),
    Cancelled(ChainReceipt),
    Reverted {
        receipt: ChainReceipt,
        revert_reason: Option<String>,
    },
    Dropped,
    Pending,
}

impl<S, N, G, CS> ConfirmationWorker<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    pub fn new(ctx: PipelineContext<S, N, G, CS>) -> Self {
        Self {
            ctx,
            cursor: tokio::sync::Mutex::new(None),
        }
    }

    async fn next_page(&self, limit: usize) -> Result<Vec<QueuedTransaction>, WorkerError> {
        let mut cursor = self.cursor.lock().await;

        let mut page = self
            .ctx
            .store
            .query(TransactionFilter::SentAfter {
                after: *cursor,
                limit,
            })
            .await?;

        if page.is_empty() && cursor.is_some() {
            page = self
                .ctx
                .store
                .query(TransactionFilter::SentAfter { after: None, limit })
                .await?;
        }

        // A short page means the sweep reached the end of the set.
        *cursor = if page.len() < limit {
            None
        } else {
            page.last().map(SentCursor::of)
        };
        Ok(page)
    }

    async fn check(&self, transaction: QueuedTransaction) -> Result<(), WorkerError> {
        let Some(nonce) = transaction.nonce else {
            return Err(WorkerError::InternalError {
                message: format!("Sent transaction {} has no nonce", transaction.id),
            });
        };

        let chain = self.ctx.get_chain(transaction.chain_id())?;
        let resolution = self.resolve(&chain, &transaction, nonce).await?;

        let (to, update) = match resolution {
            Resolution::Pending => return Ok(()),
            Resolution::Mined(receipt) => (
                TransactionStatus::Mined,
                TransactionUpdate {
                    receipt: Some(receipt),
                    ..Default::default()
                },
            ),
            Resolution::Cancelled(receipt) => (
                TransactionStatus::Cancelled,
                TransactionUpdate {
                    receipt: Some(receipt),
                    ..Default::default()
                },
            ),
            Resolution::Reverted {
                receipt,
                revert_reason,
            } => (
                TransactionStatus::Errored,
                TransactionUpdate {
                    failure: Some(FailureReason::Reverted {
                        transaction_hash: receipt.transaction_hash,
                        revert_reason,
                    }),
                    receipt: Some(receipt),
                    ..Default::default()
                },
            ),
            Resolution::Dropped => (
                TransactionStatus::Errored,
                TransactionUpdate {
                    failure: Some(FailureReason::Dropped { nonce }),
                    ..Default::default()
                },
            ),
        };

        match self
            .ctx
            .store
            .transition(transaction.id, TransactionStatus::Sent, to, update)
            .await
        {
            Ok(record) => {
                tracing::info!(
                    transaction_id = %record.id,
                    nonce,
                    status = record.status.as_str(),
                    "Transaction confirmed"
                );
                Ok(())
            }
            Err(e) if e.is_lost_race() => {
                tracing::debug!(transaction_id = %transaction.id, error = %e, "Transaction already resolved");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve(
        &self,
        chain: &CS::Chain,
        transaction: &QueuedTransaction,
        nonce: u64,
    ) -> Result<Resolution, WorkerError> {
        if let Some((attempt, receipt)) = self.find_receipt(chain, transaction).await? {
            if !receipt.status {
                let revert_reason = chain
                    .revert_reason(receipt.transaction_hash, receipt.block_number)
                    .await;
                return Ok(Resolution::Reverted {
                    receipt,
                    revert_reason,
                });
            }
            return Ok(match attempt.kind {
                AttemptKind::Cancellation => Resolution::Cancelled(receipt),
                AttemptKind::Original | AttemptKind::GasBump => Resolution::Mined(receipt),
            });
        }

        let sender = transaction.sender().address;
        let chain_count = chain
            .get_transaction_count(sender)
            .await
            .map_err(|e| WorkerError::RpcError {
                message: format!("Failed to read transaction count: {e}"),
                inner_error: e,
            })?;

        if chain_count <= nonce {
            return Ok(Resolution::Pending);
        }

        // The nonce is spent but none of our hashes has a receipt. Either a
        // receipt is still propagating or something else used the nonce.
        tracing::warn!(
            transaction_id = %transaction.id,
            nonce,
            chain_count,
            attempts = transaction.attempts.len(),
            "Nonce consumed on chain without a receipt for any attempt"
        );
        if let Err(e) = self.ctx.nonces.reconcile(chain, sender).await {
            tracing::error!(transaction_id = %transaction.id, error = %e, "Nonce reconcile failed");
        }

        let timeout = self.ctx.config.load().retry.pending_timeout();
        let last_broadcast = transaction
            .latest_attempt()
            .map(|attempt| attempt.broadcast_at)
            .unwrap_or(transaction.queued_at);
        if now_millis().saturating_sub(last_broadcast) >= timeout.as_millis() as u64 {
            return Ok(Resolution::Dropped);
        }
        Ok(Resolution::Pending)
    }

    async fn find_receipt(
        &self,
        chain: &CS::Chain,
        transaction: &QueuedTransaction,
    ) -> Result<Option<(TransactionAttempt, ChainReceipt)>, WorkerError> {
        for attempt in transaction.live_attempts() {
            let receipt = chain
                .get_receipt(attempt.transaction_hash)
                .await
                .map_err(|e| WorkerError::RpcError {
                    message: format!("Failed to fetch receipt: {e}"),
                    inner_error: e,
                })?;

            if let Some(receipt) = receipt.filter(|receipt| receipt.block_number.is_some()) {
                return Ok(Some((attempt.clone(), receipt)));
            }
        }
        Ok(None)
    }
}

impl<S, N, G, CS> NamedWorker for ConfirmationWorker<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    fn name(&self) -> &str {
        "confirm"
    }
}

impl<S, N, G, CS> PipelineWorker for ConfirmationWorker<S, N, G, CS>
where
    S: TransactionStore,
    N: NonceStore,
    G: SigningGateway + 'static,
    CS: ChainService + 'static,
{
    async fn tick(&self) -> Result<usize, WorkerError> {
        let concurrency = self.ctx.config.load().confirm.concurrency.max(1);
        let page = self.next_page(concurrency).await?;
        let count = page.len();

        futures::stream::iter(page)
            .for_each_concurrent(concurrency, |transaction| async move {
                let transaction_id = transaction.id;
                if let Err(e) = self.check(transaction).await {
                    tracing::warn!(%transaction_id, error = %e, "Confirmation check failed");
                }
            })
            .await;

        Ok(count)
    }
}
