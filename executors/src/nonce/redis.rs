use std::{collections::HashMap, time::Duration};

use alloy::primitives::Address;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::{
    nonce::{AllocateOutcome, NonceError, NonceRecord, NonceStore, ReconcileReport},
    store::now_millis,
};

const ALLOCATE_SCRIPT: &str = r#"
local state_key = KEYS[1]
local recyclable_key = KEYS[2]

local now = tonumber(ARGV[1])
local max_age = tonumber(ARGV[2])

local next_nonce = redis.call('HGET', state_key, 'next_nonce')
if not next_nonce then
    return {0, '0'}
end
if redis.call('HGET', state_key, 'needs_reconcile') == '1' then
    return {0, '0'}
end

local reconciled_at = tonumber(redis.call('HGET', state_key, 'reconciled_at') or '0')
if max_age > 0 and now - reconciled_at > max_age then
    return {0, '0'}
end

local recycled = redis.call('ZPOPMIN', recyclable_key)
if #recycled > 0 then
    return {1, recycled[1]}
end

redis.call('HINCRBY', state_key, 'next_nonce', 1)
return {1, next_nonce}
"#;

const RECONCILE_SCRIPT: &str = r#"
local state_key = KEYS[1]
local released_key = KEYS[2]
local recyclable_key = KEYS[3]

local observed = tonumber(ARGV[1])
local now = ARGV[2]

local initialised = redis.call('HEXISTS', state_key, 'reconciled_at') == 1
local stored_chain = tonumber(redis.call('HGET', state_key, 'chain_nonce') or '0')
local chain_nonce = math.max(observed, stored_chain)
local next_nonce = tonumber(redis.call('HGET', state_key, 'next_nonce') or '0')

local chain_ahead = 0
if chain_nonce > next_nonce then
    if initialised then
        chain_ahead = 1
    end
    next_nonce = chain_nonce
end

-- anything below the chain count has been consumed
redis.call('ZREMRANGEBYSCORE', released_key, '-inf', '(' .. chain_nonce)
redis.call('ZREMRANGEBYSCORE', recyclable_key, '-inf', '(' .. chain_nonce)

local recovered = redis.call('ZCARD', released_key)
if recovered > 0 then
    redis.call('ZUNIONSTORE', recyclable_key, 2, recyclable_key, released_key, 'AGGREGATE', 'MAX')
    redis.call('DEL', released_key)
end
redis.call('ZREMRANGEBYSCORE', recyclable_key, next_nonce, '+inf')

local rewound = 0
local outstanding = next_nonce - chain_nonce
if outstanding > 0 and redis.call('ZCARD', recyclable_key) == outstanding then
    next_nonce = chain_nonce
    redis.call('DEL', recyclable_key)
    rewound = 1
end

redis.call('HSET', state_key,
    'next_nonce', string.format('%d', next_nonce),
    'chain_nonce', string.format('%d', chain_nonce),
    'reconciled_at', now,
    'needs_reconcile', '0')

return {chain_nonce, next_nonce, chain_ahead, recovered, rewound}
"#;

/// Redis-backed nonce state. Each pair is a hash plus two sorted sets of
/// released and recyclable nonces, all mutated by Lua scripts so allocation
/// is atomic across processes.
#[derive(Clone)]
pub struct RedisNonceStore {
    redis: ConnectionManager,
    namespace: Option<String>,
    allocate_script: redis::Script,
    reconcile_script: redis::Script,
}

impl RedisNonceStore {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self {
            redis,
            namespace,
            allocate_script: redis::Script::new(ALLOCATE_SCRIPT),
            reconcile_script: redis::Script::new(RECONCILE_SCRIPT),
        }
    }

    pub fn state_key_name(&self, chain_id: u64, address: Address) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:relayer:nonce:{chain_id}:{address}"),
            None => format!("relayer:nonce:{chain_id}:{address}"),
        }
    }

    pub fn released_key_name(&self, chain_id: u64, address: Address) -> String {
        format!("{}:released", self.state_key_name(chain_id, address))
    }

    pub fn recyclable_key_name(&self, chain_id: u64, address: Address) -> String {
        format!("{}:recyclable", self.state_key_name(chain_id, address))
    }
}

impl NonceStore for RedisNonceStore {
    async fn load(&self, chain_id: u64, address: Address) -> Result<Option<NonceRecord>, NonceError> {
        let mut conn = self.redis.clone();

        let state: HashMap<String, String> =
            conn.hgetall(self.state_key_name(chain_id, address)).await?;
        if !state.contains_key("next_nonce") {
            return Ok(None);
        }

        let field = |name: &str| -> Result<u64, NonceError> {
            state
                .get(name)
                .map(|value| value.parse::<u64>())
                .transpose()
                .map(|value| value.unwrap_or_default())
                .map_err(|e| NonceError::CorruptedState {
                    chain_id,
                    address,
                    message: format!("field {name}: {e}"),
                })
        };

        let released: Vec<u64> = conn
            .zrange(self.released_key_name(chain_id, address), 0, -1)
            .await?;
        let recyclable: Vec<u64> = conn
            .zrange(self.recyclable_key_name(chain_id, address), 0, -1)
            .await?;

        Ok(Some(NonceRecord {
            next_nonce: field("next_nonce")?,
            chain_nonce: field("chain_nonce")?,
            reconciled_at: field("reconciled_at")?,
            needs_reconcile: state.get("needs_reconcile").map(String::as_str) == Some("1"),
            released: released.into_iter().collect(),
            recyclable: recyclable.into_iter().collect(),
        }))
    }

    async fn try_allocate(
        &self,
        chain_id: u64,
        address: Address,
        max_age: Duration,
    ) -> Result<AllocateOutcome, NonceError> {
        let (allocated, nonce): (i64, String) = self
            .allocate_script
            .key(self.state_key_name(chain_id, address))
            .key(self.recyclable_key_name(chain_id, address))
            .arg(now_millis())
            .arg(max_age.as_millis() as u64)
            .invoke_async(&mut self.redis.clone())
            .await?;

        if allocated == 0 {
            return Ok(AllocateOutcome::NeedsReconcile);
        }

        nonce
            .parse::<u64>()
            .map(AllocateOutcome::Allocated)
            .map_err(|e| NonceError::CorruptedState {
                chain_id,
                address,
                message: format!("allocated nonce {nonce:?}: {e}"),
            })
    }

    async fn release(&self, chain_id: u64, address: Address, nonce: u64) -> Result<(), NonceError> {
        let mut conn = self.redis.clone();
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline.zadd(self.released_key_name(chain_id, address), nonce, nonce);
        pipeline.hset(self.state_key_name(chain_id, address), "needs_reconcile", "1");
        let _: () = pipeline.query_async(&mut conn).await?;
        Ok(())
    }

    async fn flag_reconcile(&self, chain_id: u64, address: Address) -> Result<(), NonceError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(self.state_key_name(chain_id, address), "needs_reconcile", "1")
            .await?;
        Ok(())
    }

    async fn apply_reconcile(
        &self,
        chain_id: u64,
        address: Address,
        observed: u64,
    ) -> Result<ReconcileReport, NonceError> {
        let (chain_nonce, next_nonce, chain_ahead, recovered, rewound): (u64, u64, i64, usize, i64) =
            self.reconcile_script
                .key(self.state_key_name(chain_id, address))
                .key(self.released_key_name(chain_id, address))
                .key(self.recyclable_key_name(chain_id, address))
                .arg(observed)
                .arg(now_millis())
                .invoke_async(&mut self.redis.clone())
                .await?;

        Ok(ReconcileReport {
            chain_nonce,
            next_nonce,
            chain_ahead: chain_ahead == 1,
            recovered,
            rewound: rewound == 1,
        })
    }
}
