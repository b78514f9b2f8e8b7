use std::{future::Future, time::Duration};

use alloy::primitives::{B256, Bytes};
use relayer_core::{
    chain::{ChainReceipt, GasPricing},
    intent::{Sender, TransactionIntent, UnsignedCall},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod memory;
pub mod mutation;
pub mod redis;

pub use error::StoreError;
pub use memory::InMemoryTransactionStore;
pub use redis::RedisTransactionStore;

/// Current wall clock in unix milliseconds. All store timestamps use this.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Queued,
    Sent,
    Mined,
    Errored,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 5] = [
        TransactionStatus::Queued,
        TransactionStatus::Sent,
        TransactionStatus::Mined,
        TransactionStatus::Errored,
        TransactionStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Mined | TransactionStatus::Errored | TransactionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Queued => "queued",
            TransactionStatus::Sent => "sent",
            TransactionStatus::Mined => "mined",
            TransactionStatus::Errored => "errored",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    /// Legal edges of the status machine. `Queued -> Queued` is a requeue
    /// after a send that never reached the mempool. Terminal states have no
    /// outgoing edges.
    pub fn can_transition_to(&self, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, to),
            (Queued, Sent)
                | (Queued, Queued)
                | (Queued, Errored)
                | (Queued, Cancelled)
                | (Sent, Mined)
                | (Sent, Errored)
                | (Sent, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptKind {
    Original,
    GasBump,
    Cancellation,
}

/// What became of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    /// Accepted by the node, or possibly accepted, and not yet resolved.
    #[default]
    Pending,
    /// The node refused the broadcast. It never reached the mempool.
    Rejected,
    Mined,
    Reverted,
    /// Another attempt at the same nonce settled the transaction.
    Replaced,
}

/// One signed broadcast of a transaction. Every accepted attempt shares the
/// transaction's nonce. A rejected attempt from before the first send keeps
/// the nonce it was signed with, which was released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAttempt {
    pub kind: AttemptKind,
    pub transaction_hash: B256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub pricing: GasPricing,
    pub broadcast_at: u64,
    #[serde(default)]
    pub outcome: AttemptOutcome,
}

/// A signed attempt persisted before it is broadcast, so a worker that picks
/// up an expired claim rebroadcasts the same bytes instead of signing anew.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedAttempt {
    pub attempt: TransactionAttempt,
    pub call: UnsignedCall,
    pub raw: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub worker_id: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum FailureReason {
    /// Gas estimation or call preparation showed the call cannot succeed.
    #[serde(rename_all = "camelCase")]
    PreparationFailed { message: String },

    /// Broadcast kept failing without the transaction reaching the mempool.
    #[serde(rename_all = "camelCase")]
    SendFailed { message: String },

    /// Mined with a failed status.
    #[serde(rename_all = "camelCase")]
    Reverted {
        transaction_hash: B256,
        #[serde(skip_serializing_if = "Option::is_none")]
        revert_reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    RetriesExhausted { attempts: usize },

    /// The nonce was consumed on chain by a transaction we have no receipt
    /// for.
    #[serde(rename_all = "camelCase")]
    Dropped { nonce: u64 },
}

impl FailureReason {
    pub fn message(&self) -> String {
        match self {
            FailureReason::PreparationFailed { message } => {
                format!("Transaction preparation failed: {message}")
            }
            FailureReason::SendFailed { message } => format!("Transaction send failed: {message}"),
            FailureReason::Reverted {
                revert_reason: Some(reason),
                ..
            } => format!("Transaction reverted: {reason}"),
            FailureReason::Reverted { .. } => "Transaction reverted".to_string(),
            FailureReason::RetriesExhausted { attempts } => {
                format!("Transaction not mined after {attempts} attempts")
            }
            FailureReason::Dropped { nonce } => {
                format!("Nonce {nonce} was consumed on chain by an unknown transaction")
            }
        }
    }
}

/// The pipeline's unit of work. Attempts are append-only and all share
/// `nonce`, which is assigned exactly once on the first send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTransaction {
    pub id: Uuid,
    pub intent: TransactionIntent,
    pub status: TransactionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,

    /// The call as signed, after account wrapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<UnsignedCall>,

    #[serde(default)]
    pub attempts: Vec<TransactionAttempt>,

    /// Failed sends that never reached the mempool.
    #[serde(default)]
    pub send_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_send_error: Option<String>,

    pub available_at: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepared: Option<PreparedAttempt>,

    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<ChainReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    pub queued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl QueuedTransaction {
    pub fn new(intent: TransactionIntent, now: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent,
            status: TransactionStatus::Queued,
            nonce: None,
            call: None,
            attempts: Vec::new(),
            send_failures: 0,
            last_send_error: None,
            available_at: now,
            claim: None,
            prepared: None,
            cancel_requested: false,
            cancel_requested_at: None,
            receipt: None,
            failure: None,
            queued_at: now,
            sent_at: None,
            completed_at: None,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.intent.chain_id
    }

    pub fn sender(&self) -> &Sender {
        &self.intent.sender
    }

    pub fn latest_attempt(&self) -> Option<&TransactionAttempt> {
        self.attempts.last()
    }

    /// Attempts from the first accepted broadcast on. Rejected sends from
    /// while the record was queued are not counted.
    pub fn sent_attempts(&self) -> usize {
        let rejected_before_send = self
            .attempts
            .iter()
            .take_while(|attempt| attempt.outcome == AttemptOutcome::Rejected)
            .count();
        self.attempts.len() - rejected_before_send
    }

    /// Attempts that may be on chain, newest first.
    pub fn live_attempts(&self) -> impl Iterator<Item = &TransactionAttempt> {
        self.attempts
            .iter()
            .rev()
            .filter(|attempt| attempt.outcome != AttemptOutcome::Rejected)
    }

    /// Score used by the status indexes: due time while queued, latest
    /// broadcast while sent, completion time once terminal.
    pub fn index_score(&self) -> u64 {
        match self.status {
            TransactionStatus::Queued => self.available_at,
            TransactionStatus::Sent => self
                .latest_attempt()
                .map(|attempt| attempt.broadcast_at)
                .or(self.sent_at)
                .unwrap_or(self.queued_at),
            _ => self.completed_at.unwrap_or(self.queued_at),
        }
    }

    pub fn has_live_claim(&self, now: u64) -> bool {
        matches!(&self.claim, Some(claim) if claim.expires_at > now)
    }
}

/// Fields written alongside a status transition. Unset fields keep their
/// stored value.
#[derive(Debug, Clone, Default)]
pub struct TransactionUpdate {
    pub nonce: Option<u64>,
    pub call: Option<UnsignedCall>,
    /// Sent attempt on `Queued -> Sent`; the rejected attempt on a failed
    /// send.
    pub attempt: Option<TransactionAttempt>,
    pub available_at: Option<u64>,
    pub send_error: Option<String>,
    pub receipt: Option<ChainReceipt>,
    pub failure: Option<FailureReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionFilter {
    /// Records in `status`, oldest index score first.
    ByStatus {
        status: TransactionStatus,
        offset: usize,
        limit: usize,
    },
    /// Queued records whose `available_at` has passed.
    DueQueued { now: u64, limit: usize },
    /// Sent records whose latest broadcast is at or before `sent_before`.
    StalledSent { sent_before: u64, limit: usize },
    /// Sent records with a pending cancellation request, oldest request
    /// first.
    CancelRequested { limit: usize },
    /// Sent records after `after` in index order (score, then id). Used to
    /// sweep the sent set page by page while it changes underneath.
    SentAfter {
        after: Option<SentCursor>,
        limit: usize,
    },
}

/// Position in the sent index: a record's index score and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SentCursor {
    pub score: u64,
    pub id: Uuid,
}

impl SentCursor {
    pub fn of(record: &QueuedTransaction) -> Self {
        Self {
            score: record.index_score(),
            id: record.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    pub id: Uuid,
    /// False when an idempotency key matched an existing transaction.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    /// Never broadcast; cancelled in place.
    CancelledImmediately,
    /// In flight; a replacement at the same nonce will be sent.
    CancellationPending,
    #[serde(rename_all = "camelCase")]
    CannotCancel { status: TransactionStatus },
}

/// Durable home of every transaction and its attempts.
///
/// `transition` and `append_attempt` are compare-and-set: they fail with a
/// conflict error instead of overwriting a record another worker has
/// already moved.
pub trait TransactionStore: Send + Sync + 'static {
    /// Accept a new intent. An idempotency key bound to a live or completed
    /// transaction returns that transaction instead. A key bound to an
    /// errored or pruned transaction is rebound to a new one.
    fn enqueue(
        &self,
        intent: TransactionIntent,
    ) -> impl Future<Output = Result<EnqueueOutcome, StoreError>> + Send;

    fn get(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<QueuedTransaction>, StoreError>> + Send;

    fn query(
        &self,
        filter: TransactionFilter,
    ) -> impl Future<Output = Result<Vec<QueuedTransaction>, StoreError>> + Send;

    /// Lease a queued record to `worker_id`. An expired lease held by
    /// another worker can be taken over.
    fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<QueuedTransaction, StoreError>> + Send;

    /// Persist a signed attempt under the caller's claim, ahead of broadcast.
    fn prepare(
        &self,
        id: Uuid,
        worker_id: &str,
        prepared: PreparedAttempt,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn transition(
        &self,
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        update: TransactionUpdate,
    ) -> impl Future<Output = Result<QueuedTransaction, StoreError>> + Send;

    /// Add an attempt to a sent record that currently has exactly
    /// `expected_attempts` attempts.
    fn append_attempt(
        &self,
        id: Uuid,
        expected_attempts: usize,
        attempt: TransactionAttempt,
    ) -> impl Future<Output = Result<QueuedTransaction, StoreError>> + Send;

    /// Settle a pending attempt of a sent record, found by hash. Attempts
    /// that already have an outcome are left alone.
    fn set_attempt_outcome(
        &self,
        id: Uuid,
        transaction_hash: B256,
        outcome: AttemptOutcome,
    ) -> impl Future<Output = Result<QueuedTransaction, StoreError>> + Send;

    fn request_cancel(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<CancelOutcome, StoreError>> + Send;

    /// Drop the oldest terminal records until at most `max_transactions`
    /// remain. Non-terminal records are never removed. Returns how many were
    /// dropped.
    fn prune(
        &self,
        max_transactions: usize,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    fn count(&self) -> impl Future<Output = Result<usize, StoreError>> + Send;
}
