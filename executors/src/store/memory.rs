use std::time::Duration;

use alloy::primitives::B256;
use dashmap::{DashMap, mapref::entry::Entry};
use relayer_core::intent::TransactionIntent;
use uuid::Uuid;

use crate::store::{
    AttemptOutcome, CancelOutcome, EnqueueOutcome, PreparedAttempt, QueuedTransaction, SentCursor,
    StoreError, TransactionAttempt, TransactionFilter, TransactionStatus, TransactionStore,
    TransactionUpdate, mutation, now_millis,
};

/// Process-local store. Used by tests and single-node development setups.
#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    records: DashMap<Uuid, QueuedTransaction>,
    idempotency: DashMap<String, Uuid>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-modify-write under the record's shard lock. The closure sees a
    /// copy, so a failed mutation leaves the stored record untouched.
    fn mutate<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut QueuedTransaction) -> Result<T, StoreError>,
    ) -> Result<(QueuedTransaction, T), StoreError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(StoreError::NotFound { transaction_id: id })?;

        let mut next = entry.clone();
        let output = f(&mut next)?;
        *entry = next.clone();
        Ok((next, output))
    }

    fn sorted(&self, predicate: impl Fn(&QueuedTransaction) -> bool) -> Vec<QueuedTransaction> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| (record.index_score(), record.queued_at));
        records
    }
}

impl TransactionStore for InMemoryTransactionStore {
    async fn enqueue(&self, intent: TransactionIntent) -> Result<EnqueueOutcome, StoreError> {
        let record = QueuedTransaction::new(intent, now_millis());
        let id = record.id;

        let Some(key) = record.intent.idempotency_key.clone() else {
            self.records.insert(id, record);
            return Ok(EnqueueOutcome { id, created: true });
        };

        match self.idempotency.entry(key) {
            Entry::Occupied(mut existing) => {
                let bound = *existing.get();
                let reusable = self
                    .records
                    .get(&bound)
                    .is_some_and(|tx| tx.status != TransactionStatus::Errored);
                if reusable {
                    return Ok(EnqueueOutcome {
                        id: bound,
                        created: false,
                    });
                }
                self.records.insert(id, record);
                existing.insert(id);
            }
            Entry::Vacant(vacant) => {
                self.records.insert(id, record);
                vacant.insert(id);
            }
        }

        Ok(EnqueueOutcome { id, created: true })
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueuedTransaction>, StoreError> {
        Ok(self.records.get(&id).map(|entry| entry.value().clone()))
    }

    async fn query(&self, filter: TransactionFilter) -> Result<Vec<QueuedTransaction>, StoreError> {
        let records = match filter {
            TransactionFilter::ByStatus {
                status,
                offset,
                limit,
            } => self
                .sorted(|tx| tx.status == status)
                .into_iter()
                .skip(offset)
                .take(limit)
                .collect(),
            TransactionFilter::DueQueued { now, limit } => self
                .sorted(|tx| tx.status == TransactionStatus::Queued && tx.available_at <= now)
                .into_iter()
                .take(limit)
                .collect(),
            TransactionFilter::StalledSent { sent_before, limit } => self
                .sorted(|tx| {
                    tx.status == TransactionStatus::Sent && tx.index_score() <= sent_before
                })
                .into_iter()
                .take(limit)
                .collect(),
            TransactionFilter::CancelRequested { limit } => {
                let mut pending =
                    self.sorted(|tx| tx.status == TransactionStatus::Sent && tx.cancel_requested);
                pending.sort_by_key(|tx| (tx.cancel_requested_at.unwrap_or(0), tx.id));
                pending.truncate(limit);
                pending
            }
            TransactionFilter::SentAfter { after, limit } => {
                let mut page = self.sorted(|tx| {
                    tx.status == TransactionStatus::Sent
                        && after.is_none_or(|cursor| SentCursor::of(tx) > cursor)
                });
                page.sort_by_key(SentCursor::of);
                page.truncate(limit);
                page
            }
        };
        Ok(records)
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<QueuedTransaction, StoreError> {
        let now = now_millis();
        self.mutate(id, |record| {
            mutation::apply_claim(record, worker_id, lease, now)
        })
        .map(|(record, _)| record)
    }

    async fn prepare(
        &self,
        id: Uuid,
        worker_id: &str,
        prepared: PreparedAttempt,
    ) -> Result<(), StoreError> {
        self.mutate(id, |record| {
            mutation::apply_prepare(record, worker_id, prepared)
        })
        .map(|_| ())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        update: TransactionUpdate,
    ) -> Result<QueuedTransaction, StoreError> {
        let now = now_millis();
        self.mutate(id, |record| {
            mutation::apply_transition(record, from, to, update, now)
        })
        .map(|(record, _)| record)
    }

    async fn append_attempt(
        &self,
        id: Uuid,
        expected_attempts: usize,
        attempt: TransactionAttempt,
    ) -> Result<QueuedTransaction, StoreError> {
        self.mutate(id, |record| {
            mutation::apply_append_attempt(record, expected_attempts, attempt)
        })
        .map(|(record, _)| record)
    }

    async fn set_attempt_outcome(
        &self,
        id: Uuid,
        transaction_hash: B256,
        outcome: AttemptOutcome,
    ) -> Result<QueuedTransaction, StoreError> {
        self.mutate(id, |record| {
            mutation::apply_attempt_outcome(record, transaction_hash, outcome)
        })
        .map(|(record, _)| record)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let now = now_millis();
        self.mutate(id, |record| mutation::apply_cancel_request(record, now))
            .map(|(_, outcome)| outcome)
    }

    async fn prune(&self, max_transactions: usize) -> Result<usize, StoreError> {
        let total = self.records.len();
        if total <= max_transactions {
            return Ok(0);
        }

        let excess = total - max_transactions;
        let victims: Vec<QueuedTransaction> = self
            .sorted(|tx| tx.status.is_terminal())
            .into_iter()
            .take(excess)
            .collect();

        let mut removed = 0;
        for victim in victims {
            if self.records.remove(&victim.id).is_some() {
                removed += 1;
            }
            if let Some(key) = &victim.intent.idempotency_key {
                self.idempotency.remove_if(key, |_, bound| *bound == victim.id);
            }
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.len())
    }
}
