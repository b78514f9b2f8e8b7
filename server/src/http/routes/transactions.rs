use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use relayer_core::{
    chain::ChainReceipt,
    error::RelayerError,
    intent::{Sender, TransactionIntent},
};
use relayer_executors::{
    propagator::ConfigSource,
    store::{
        CancelOutcome, FailureReason, QueuedTransaction, TransactionAttempt, TransactionStatus,
        TransactionStore,
    },
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http::{
    error::{ApiRelayerError, RelayerResult},
    extractors::RelayerJson,
    server::RelayerServerState,
    types::SuccessResponse,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionResponse {
    pub transaction_id: Uuid,
    /// False when the idempotency key matched an earlier transaction.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusResponse {
    pub transaction_id: Uuid,
    pub chain_id: u64,
    pub sender: Sender,
    pub status: TransactionStatus,
    pub nonce: Option<u64>,
    pub attempts: Vec<TransactionAttempt>,
    pub receipt: Option<ChainReceipt>,
    pub failure: Option<FailureReason>,
    pub failure_message: Option<String>,
    pub cancel_requested: bool,
    pub queued_at: u64,
    pub sent_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl From<QueuedTransaction> for TransactionStatusResponse {
    fn from(tx: QueuedTransaction) -> Self {
        Self {
            transaction_id: tx.id,
            chain_id: tx.intent.chain_id,
            sender: tx.intent.sender,
            status: tx.status,
            nonce: tx.nonce,
            failure_message: tx.failure.as_ref().map(FailureReason::message),
            attempts: tx.attempts,
            receipt: tx.receipt,
            failure: tx.failure,
            cancel_requested: tx.cancel_requested,
            queued_at: tx.queued_at,
            sent_at: tx.sent_at,
            completed_at: tx.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCancelResponse {
    pub transaction_id: Uuid,
    pub result: CancelOutcome,
}

fn parse_transaction_id(raw: &str) -> Result<Uuid, ApiRelayerError> {
    Uuid::parse_str(raw).map_err(|e| {
        ApiRelayerError(RelayerError::ValidationError {
            message: format!("Invalid transaction id {raw}: {e}"),
        })
    })
}

/// Enqueue Transaction
///
/// Accepts an unsigned call for relaying. Returns the transaction id right
/// away; sending happens in the background.
pub async fn create_transaction<S: TransactionStore, C: ConfigSource>(
    State(state): State<RelayerServerState<S, C>>,
    RelayerJson(intent): RelayerJson<TransactionIntent>,
) -> Result<(StatusCode, Json<SuccessResponse<CreateTransactionResponse>>), ApiRelayerError> {
    intent.validate()?;

    let chain_id = intent.chain_id;
    let sender = intent.sender.address;
    let outcome = state.store.enqueue(intent).await.api_error()?;

    if outcome.created {
        tracing::info!(
            transaction_id = %outcome.id,
            chain_id,
            sender = %sender,
            "Transaction queued"
        );
    } else {
        tracing::debug!(
            transaction_id = %outcome.id,
            "Idempotency key matched an existing transaction"
        );
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SuccessResponse::new(CreateTransactionResponse {
            transaction_id: outcome.id,
            created: outcome.created,
        })),
    ))
}

/// Transaction Status
pub async fn get_transaction<S: TransactionStore, C: ConfigSource>(
    State(state): State<RelayerServerState<S, C>>,
    Path(transaction_id): Path<String>,
) -> Result<(StatusCode, Json<SuccessResponse<TransactionStatusResponse>>), ApiRelayerError> {
    let id = parse_transaction_id(&transaction_id)?;

    let transaction = state
        .store
        .get(id)
        .await
        .api_error()?
        .ok_or_else(|| {
            ApiRelayerError(RelayerError::TransactionNotFound {
                transaction_id: transaction_id.clone(),
            })
        })?;

    Ok((
        StatusCode::OK,
        Json(SuccessResponse::new(transaction.into())),
    ))
}

/// Cancel Transaction
///
/// A transaction that was never broadcast is cancelled in place. One that is
/// already on the way gets a no-op replacement at its nonce and reaches
/// CANCELLED once that replacement mines.
pub async fn cancel_transaction<S: TransactionStore, C: ConfigSource>(
    State(state): State<RelayerServerState<S, C>>,
    Path(transaction_id): Path<String>,
) -> Result<(StatusCode, Json<SuccessResponse<TransactionCancelResponse>>), ApiRelayerError> {
    let id = parse_transaction_id(&transaction_id)?;

    tracing::info!(
        transaction_id = %id,
        "Processing transaction cancellation request"
    );

    let result = state.store.request_cancel(id).await.api_error()?;

    match &result {
        CancelOutcome::CancelledImmediately => {
            tracing::info!(transaction_id = %id, "Transaction cancelled immediately");
        }
        CancelOutcome::CancellationPending => {
            tracing::info!(transaction_id = %id, "Transaction cancellation pending");
        }
        CancelOutcome::CannotCancel { status } => {
            tracing::info!(
                transaction_id = %id,
                status = status.as_str(),
                "Transaction cannot be cancelled"
            );
        }
    }

    Ok((
        StatusCode::OK,
        Json(SuccessResponse::new(TransactionCancelResponse {
            transaction_id: id,
            result,
        })),
    ))
}
