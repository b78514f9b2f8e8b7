use std::time::Duration;

use alloy::primitives::B256;
use rand::Rng;
use redis::{AsyncCommands, aio::ConnectionManager};
use relayer_core::intent::TransactionIntent;
use uuid::Uuid;

use crate::store::{
    AttemptOutcome, CancelOutcome, EnqueueOutcome, PreparedAttempt, QueuedTransaction, SentCursor,
    StoreError, TransactionAttempt, TransactionFilter, TransactionStatus, TransactionStore,
    TransactionUpdate, mutation, now_millis,
};

const MAX_RETRIES: u32 = 10;
const RETRY_BASE_DELAY_MS: u64 = 10;

/// Exponential backoff with up to one base delay of jitter.
fn retry_delay_ms(retry_count: u32) -> u64 {
    let base = RETRY_BASE_DELAY_MS * (1 << retry_count.saturating_sub(1).min(6));
    base + rand::rng().random_range(0..=RETRY_BASE_DELAY_MS)
}

/// Swaps a record only if it still holds the exact JSON the caller read,
/// and moves it between the status indexes in the same step.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local data_key = KEYS[1]
local old_index = KEYS[2]
local new_index = KEYS[3]
local terminal_index = KEYS[4]
local cancel_set = KEYS[5]

local expected = ARGV[1]
local replacement = ARGV[2]
local id = ARGV[3]
local score = ARGV[4]
local is_terminal = ARGV[5]
local cancel_score = ARGV[6]

local current = redis.call('GET', data_key)
if not current then
    return -1
end
if current ~= expected then
    return 0
end

redis.call('SET', data_key, replacement)
redis.call('ZREM', old_index, id)
redis.call('ZADD', new_index, score, id)
if is_terminal == '1' then
    redis.call('ZADD', terminal_index, score, id)
end
if cancel_score ~= '' then
    redis.call('ZADD', cancel_set, cancel_score, id)
else
    redis.call('ZREM', cancel_set, id)
end
return 1
"#;

/// Binds an idempotency key to a new record, provided the key still points
/// where the caller last saw it.
const ENQUEUE_SCRIPT: &str = r#"
local idempotency_key = KEYS[1]
local data_key = KEYS[2]
local queued_index = KEYS[3]

local expected_binding = ARGV[1]
local id = ARGV[2]
local record = ARGV[3]
local score = ARGV[4]

local current = redis.call('GET', idempotency_key)
if expected_binding == '' then
    if current then
        return 0
    end
elseif current ~= expected_binding then
    return 0
end

redis.call('SET', data_key, record)
redis.call('ZADD', queued_index, score, id)
redis.call('SET', idempotency_key, id)
return 1
"#;

const RELEASE_IDEMPOTENCY_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed transaction store.
///
/// Layout, under an optional namespace:
/// - `relayer:tx:{id}` record JSON, attempts included
/// - `relayer:status:{status}` sorted set of ids, scored by
///   [`QueuedTransaction::index_score`]
/// - `relayer:terminal` sorted set of completed ids by completion time
/// - `relayer:cancel_requested` sorted set of sent ids awaiting
///   cancellation, scored by request time
/// - `relayer:idempotency:{key}` id bound to an idempotency key
#[derive(Clone)]
pub struct RedisTransactionStore {
    redis: ConnectionManager,
    namespace: Option<String>,
    compare_and_swap: redis::Script,
    enqueue_script: redis::Script,
    release_idempotency: redis::Script,
}

impl RedisTransactionStore {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self {
            redis,
            namespace,
            compare_and_swap: redis::Script::new(COMPARE_AND_SWAP_SCRIPT),
            enqueue_script: redis::Script::new(ENQUEUE_SCRIPT),
            release_idempotency: redis::Script::new(RELEASE_IDEMPOTENCY_SCRIPT),
        }
    }

    fn key(&self, suffix: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:relayer:{suffix}"),
            None => format!("relayer:{suffix}"),
        }
    }

    pub fn tx_data_key_name(&self, id: Uuid) -> String {
        self.key(&format!("tx:{id}"))
    }

    pub fn status_index_key_name(&self, status: TransactionStatus) -> String {
        self.key(&format!("status:{}", status.as_str()))
    }

    pub fn terminal_index_key_name(&self) -> String {
        self.key("terminal")
    }

    pub fn cancel_requested_key_name(&self) -> String {
        self.key("cancel_requested")
    }

    pub fn idempotency_key_name(&self, key: &str) -> String {
        self.key(&format!("idempotency:{key}"))
    }

    async fn load_raw(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.tx_data_key_name(id)).await?;
        Ok(raw)
    }

    async fn load_many(&self, ids: &[String]) -> Result<Vec<QueuedTransaction>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .filter_map(|id| id.parse::<Uuid>().ok())
            .map(|id| self.tx_data_key_name(id))
            .collect();

        let mut conn = self.redis.clone();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            match serde_json::from_str::<QueuedTransaction>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable transaction record"),
            }
        }
        Ok(records)
    }

    /// Optimistic read-modify-write of a single record. Retries with
    /// exponential backoff while other writers keep changing the record.
    async fn mutate<T, F>(
        &self,
        id: Uuid,
        operation: &str,
        mut f: F,
    ) -> Result<(QueuedTransaction, T), StoreError>
    where
        F: FnMut(&mut QueuedTransaction) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let mut conn = self.redis.clone();
        let mut retry_count = 0;

        loop {
            if retry_count >= MAX_RETRIES {
                return Err(StoreError::InternalError {
                    message: format!(
                        "Exceeded max retries ({MAX_RETRIES}) for {operation} on transaction {id}"
                    ),
                });
            }

            if retry_count > 0 {
                let delay_ms = retry_delay_ms(retry_count);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                tracing::debug!(
                    retry_count,
                    delay_ms,
                    transaction_id = %id,
                    operation,
                    "Retrying record update"
                );
            }

            let current = self
                .load_raw(id)
                .await?
                .ok_or(StoreError::NotFound { transaction_id: id })?;
            let before: QueuedTransaction = serde_json::from_str(&current)?;

            let mut after = before.clone();
            let output = f(&mut after)?;
            let replacement = serde_json::to_string(&after)?;

            let cancel_score = match after.status {
                TransactionStatus::Sent if after.cancel_requested => after
                    .cancel_requested_at
                    .unwrap_or(after.queued_at)
                    .to_string(),
                _ => String::new(),
            };

            let swapped: i64 = self
                .compare_and_swap
                .key(self.tx_data_key_name(id))
                .key(self.status_index_key_name(before.status))
                .key(self.status_index_key_name(after.status))
                .key(self.terminal_index_key_name())
                .key(self.cancel_requested_key_name())
                .arg(&current)
                .arg(&replacement)
                .arg(id.to_string())
                .arg(after.index_score())
                .arg(if after.status.is_terminal() { "1" } else { "0" })
                .arg(cancel_score)
                .invoke_async(&mut conn)
                .await?;

            match swapped {
                1 => return Ok((after, output)),
                -1 => return Err(StoreError::NotFound { transaction_id: id }),
                _ => retry_count += 1,
            }
        }
    }

    async fn enqueue_with_key(
        &self,
        record: QueuedTransaction,
        idempotency_key: &str,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let key_name = self.idempotency_key_name(idempotency_key);
        let record_json = serde_json::to_string(&record)?;

        for retry_count in 0..MAX_RETRIES {
            if retry_count > 0 {
                let delay_ms = retry_delay_ms(retry_count);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let bound: Option<String> = conn.get(&key_name).await?;
            if let Some(bound_id) = bound.as_deref().and_then(|id| id.parse::<Uuid>().ok()) {
                if let Some(existing) = self.get(bound_id).await? {
                    if existing.status != TransactionStatus::Errored {
                        return Ok(EnqueueOutcome {
                            id: existing.id,
                            created: false,
                        });
                    }
                }
            }

            let inserted: i64 = self
                .enqueue_script
                .key(&key_name)
                .key(self.tx_data_key_name(record.id))
                .key(self.status_index_key_name(TransactionStatus::Queued))
                .arg(bound.unwrap_or_default())
                .arg(record.id.to_string())
                .arg(&record_json)
                .arg(record.index_score())
                .invoke_async(&mut conn)
                .await?;

            if inserted == 1 {
                return Ok(EnqueueOutcome {
                    id: record.id,
                    created: true,
                });
            }
        }

        Err(StoreError::InternalError {
            message: format!(
                "Exceeded max retries ({MAX_RETRIES}) binding idempotency key {idempotency_key}"
            ),
        })
    }

    /// Ids in the sent index strictly after `after`. Equal scores are
    /// ordered by member, and hyphenated uuids sort as strings the same way
    /// [`Uuid`] sorts, so ties are skipped by comparing ids.
    async fn sent_ids_after(
        &self,
        after: Option<SentCursor>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let key = self.status_index_key_name(TransactionStatus::Sent);
        let min = after
            .map(|cursor| cursor.score.to_string())
            .unwrap_or_else(|| "-inf".to_string());

        let mut ids = Vec::with_capacity(limit);
        let mut offset = 0;
        loop {
            let batch: Vec<(String, f64)> = conn
                .zrangebyscore_limit_withscores(&key, &min, "+inf", offset, limit as isize)
                .await?;
            let exhausted = batch.len() < limit;
            offset += batch.len() as isize;

            for (member, score) in batch {
                let past = match (after, member.parse::<Uuid>()) {
                    (None, _) => true,
                    (Some(cursor), Ok(id)) => (score as u64, id) > (cursor.score, cursor.id),
                    (Some(_), Err(_)) => false,
                };
                if past && ids.len() < limit {
                    ids.push(member);
                }
            }

            if exhausted || ids.len() >= limit {
                return Ok(ids);
            }
        }
    }

    async fn remove_terminal(&self, record: &QueuedTransaction) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let id = record.id.to_string();

        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline.del(self.tx_data_key_name(record.id));
        for status in TransactionStatus::ALL {
            pipeline.zrem(self.status_index_key_name(status), &id);
        }
        pipeline.zrem(self.terminal_index_key_name(), &id);
        pipeline.zrem(self.cancel_requested_key_name(), &id);
        let _: () = pipeline.query_async(&mut conn).await?;

        if let Some(key) = &record.intent.idempotency_key {
            let _: i64 = self
                .release_idempotency
                .key(self.idempotency_key_name(key))
                .arg(&id)
                .invoke_async(&mut conn)
                .await?;
        }
        Ok(())
    }
}

impl TransactionStore for RedisTransactionStore {
    async fn enqueue(&self, intent: TransactionIntent) -> Result<EnqueueOutcome, StoreError> {
        let record = QueuedTransaction::new(intent, now_millis());

        if let Some(key) = record.intent.idempotency_key.clone() {
            return self.enqueue_with_key(record, &key).await;
        }

        let mut conn = self.redis.clone();
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline.set(
            self.tx_data_key_name(record.id),
            serde_json::to_string(&record)?,
        );
        pipeline.zadd(
            self.status_index_key_name(TransactionStatus::Queued),
            record.id.to_string(),
            record.index_score(),
        );
        let _: () = pipeline.query_async(&mut conn).await?;

        Ok(EnqueueOutcome {
            id: record.id,
            created: true,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueuedTransaction>, StoreError> {
        match self.load_raw(id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, filter: TransactionFilter) -> Result<Vec<QueuedTransaction>, StoreError> {
        let mut conn = self.redis.clone();

        let ids: Vec<String> = match filter {
            TransactionFilter::ByStatus {
                status,
                offset,
                limit,
            } => {
                if limit == 0 {
                    return Ok(Vec::new());
                }
                conn.zrange(
                    self.status_index_key_name(status),
                    offset as isize,
                    (offset + limit - 1) as isize,
                )
                .await?
            }
            TransactionFilter::DueQueued { now, limit } => {
                conn.zrangebyscore_limit(
                    self.status_index_key_name(TransactionStatus::Queued),
                    "-inf",
                    now,
                    0,
                    limit as isize,
                )
                .await?
            }
            TransactionFilter::StalledSent { sent_before, limit } => {
                conn.zrangebyscore_limit(
                    self.status_index_key_name(TransactionStatus::Sent),
                    "-inf",
                    sent_before,
                    0,
                    limit as isize,
                )
                .await?
            }
            TransactionFilter::CancelRequested { limit } => {
                if limit == 0 {
                    return Ok(Vec::new());
                }
                let ids: Vec<String> = conn
                    .zrange(self.cancel_requested_key_name(), 0, limit as isize - 1)
                    .await?;
                let mut records = self.load_many(&ids).await?;
                records.sort_by_key(|tx| (tx.cancel_requested_at.unwrap_or(0), tx.id));
                return Ok(records);
            }
            TransactionFilter::SentAfter { after, limit } => {
                let ids = self.sent_ids_after(after, limit).await?;
                let mut records = self.load_many(&ids).await?;
                records.sort_by_key(SentCursor::of);
                return Ok(records);
            }
        };

        let mut records = self.load_many(&ids).await?;
        records.sort_by_key(|record| (record.index_score(), record.queued_at));
        Ok(records)
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<QueuedTransaction, StoreError> {
        self.mutate(id, "claim", |record| {
            mutation::apply_claim(record, worker_id, lease, now_millis())
        })
        .await
        .map(|(record, _)| record)
    }

    async fn prepare(
        &self,
        id: Uuid,
        worker_id: &str,
        prepared: PreparedAttempt,
    ) -> Result<(), StoreError> {
        self.mutate(id, "prepare", |record| {
            mutation::apply_prepare(record, worker_id, prepared.clone())
        })
        .await
        .map(|_| ())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        update: TransactionUpdate,
    ) -> Result<QueuedTransaction, StoreError> {
        self.mutate(id, "transition", |record| {
            mutation::apply_transition(record, from, to, update.clone(), now_millis())
        })
        .await
        .map(|(record, _)| record)
    }

    async fn append_attempt(
        &self,
        id: Uuid,
        expected_attempts: usize,
        attempt: TransactionAttempt,
    ) -> Result<QueuedTransaction, StoreError> {
        self.mutate(id, "append_attempt", |record| {
            mutation::apply_append_attempt(record, expected_attempts, attempt.clone())
        })
        .await
        .map(|(record, _)| record)
    }

    async fn set_attempt_outcome(
        &self,
        id: Uuid,
        transaction_hash: B256,
        outcome: AttemptOutcome,
    ) -> Result<QueuedTransaction, StoreError> {
        self.mutate(id, "set_attempt_outcome", |record| {
            mutation::apply_attempt_outcome(record, transaction_hash, outcome)
        })
        .await
        .map(|(record, _)| record)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        self.mutate(id, "request_cancel", |record| {
            mutation::apply_cancel_request(record, now_millis())
        })
        .await
        .map(|(_, outcome)| outcome)
    }

    async fn prune(&self, max_transactions: usize) -> Result<usize, StoreError> {
        let total = self.count().await?;
        if total <= max_transactions {
            return Ok(0);
        }

        let excess = total - max_transactions;
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrange(self.terminal_index_key_name(), 0, excess as isize - 1)
            .await?;

        let victims = self.load_many(&ids).await?;
        let mut removed = 0;
        for victim in victims.iter().filter(|tx| tx.status.is_terminal()) {
            self.remove_terminal(victim).await?;
            removed += 1;
        }

        // Index entries whose record is already gone.
        if victims.len() < ids.len() {
            let mut pipeline = redis::pipe();
            for id in &ids {
                pipeline.zrem(self.terminal_index_key_name(), id);
                for status in TransactionStatus::ALL.iter().filter(|s| s.is_terminal()) {
                    pipeline.zrem(self.status_index_key_name(*status), id);
                }
            }
            let _: () = pipeline.query_async(&mut conn).await?;
        }

        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let mut pipeline = redis::pipe();
        for status in TransactionStatus::ALL {
            pipeline.zcard(self.status_index_key_name(status));
        }
        let counts: Vec<usize> = pipeline.query_async(&mut conn).await?;
        Ok(counts.into_iter().sum())
    }
}
