use std::{collections::BTreeSet, future::Future, sync::Arc, time::Duration};

use alloy::primitives::Address;
use relayer_core::{chain::ChainClient, error::RelayerError};
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod redis;

pub use memory::InMemoryNonceStore;
pub use redis::RedisNonceStore;

/// Allocation attempts before giving up on a pair whose state keeps being
/// invalidated underneath us.
const MAX_ALLOCATE_ROUNDS: usize = 3;

#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum NonceError {
    #[error("Failed to read transaction count for {address} on chain {chain_id}: {inner}")]
    ChainUnavailable {
        chain_id: u64,
        address: Address,
        inner: RelayerError,
    },

    #[error("Nonce state for {address} on chain {chain_id} kept changing during allocation")]
    AllocationContention { chain_id: u64, address: Address },

    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error("Corrupted nonce state for {address} on chain {chain_id}: {message}")]
    CorruptedState {
        chain_id: u64,
        address: Address,
        message: String,
    },
}

impl From<::redis::RedisError> for NonceError {
    fn from(error: ::redis::RedisError) -> Self {
        NonceError::RedisError {
            message: error.to_string(),
        }
    }
}

/// Per (chain, sender) allocation state.
///
/// `next_nonce` is one past the highest nonce ever handed out and never
/// falls below `chain_nonce`, the last transaction count observed on chain.
/// Released nonces were allocated but provably never broadcast; they become
/// recyclable at the next reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    pub next_nonce: u64,
    pub chain_nonce: u64,
    pub reconciled_at: u64,
    pub needs_reconcile: bool,
    pub released: BTreeSet<u64>,
    pub recyclable: BTreeSet<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateOutcome {
    Allocated(u64),
    /// The pair is uninitialised, flagged or past its reconcile interval.
    NeedsReconcile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub chain_nonce: u64,
    pub next_nonce: u64,
    /// The chain had consumed nonces we never allocated.
    pub chain_ahead: bool,
    /// Released nonces moved to the recyclable set.
    pub recovered: usize,
    /// Every outstanding nonce had been released, so `next_nonce` fell back
    /// to the chain's count.
    pub rewound: bool,
}

impl NonceRecord {
    pub fn last_allocated(&self) -> Option<u64> {
        self.next_nonce.checked_sub(1)
    }

    pub fn try_allocate(&mut self, now: u64, max_age: Duration) -> AllocateOutcome {
        if self.needs_reconcile || is_stale(self.reconciled_at, now, max_age) {
            return AllocateOutcome::NeedsReconcile;
        }

        if let Some(nonce) = self.recyclable.pop_first() {
            return AllocateOutcome::Allocated(nonce);
        }

        let nonce = self.next_nonce;
        self.next_nonce += 1;
        AllocateOutcome::Allocated(nonce)
    }

    pub fn release(&mut self, nonce: u64) {
        self.released.insert(nonce);
        self.needs_reconcile = true;
    }

    /// Fold an observed transaction count into the record. The stored chain
    /// count never moves backwards, so a lagging node cannot rewind it.
    pub fn apply_reconcile(&mut self, observed: u64, now: u64) -> ReconcileReport {
        let chain_nonce = observed.max(self.chain_nonce);

        // A first reconcile seeds the record, so a count above zero is
        // expected rather than an anomaly.
        let initialised = self.reconciled_at > 0;
        let chain_ahead = initialised && chain_nonce > self.next_nonce;
        if chain_nonce > self.next_nonce {
            self.next_nonce = chain_nonce;
        }

        self.released.retain(|nonce| *nonce >= chain_nonce);
        self.recyclable.retain(|nonce| *nonce >= chain_nonce);

        let recovered = self.released.len();
        self.recyclable.append(&mut self.released);
        let next_nonce = self.next_nonce;
        self.recyclable.retain(|nonce| *nonce < next_nonce);

        let outstanding = self.next_nonce - chain_nonce;
        let rewound = outstanding > 0 && self.recyclable.len() as u64 == outstanding;
        if rewound {
            self.next_nonce = chain_nonce;
            self.recyclable.clear();
        }

        self.chain_nonce = chain_nonce;
        self.reconciled_at = now;
        self.needs_reconcile = false;

        ReconcileReport {
            chain_nonce,
            next_nonce: self.next_nonce,
            chain_ahead,
            recovered,
            rewound,
        }
    }
}

pub(crate) fn is_stale(reconciled_at: u64, now: u64, max_age: Duration) -> bool {
    !max_age.is_zero() && now.saturating_sub(reconciled_at) > max_age.as_millis() as u64
}

/// Persistence for nonce records. Every operation is atomic for its pair.
pub trait NonceStore: Send + Sync + 'static {
    fn load(
        &self,
        chain_id: u64,
        address: Address,
    ) -> impl Future<Output = Result<Option<NonceRecord>, NonceError>> + Send;

    /// Hand out the lowest recyclable nonce, else the next fresh one. An
    /// uninitialised pair always needs a reconcile first.
    fn try_allocate(
        &self,
        chain_id: u64,
        address: Address,
        max_age: Duration,
    ) -> impl Future<Output = Result<AllocateOutcome, NonceError>> + Send;

    fn release(
        &self,
        chain_id: u64,
        address: Address,
        nonce: u64,
    ) -> impl Future<Output = Result<(), NonceError>> + Send;

    fn flag_reconcile(
        &self,
        chain_id: u64,
        address: Address,
    ) -> impl Future<Output = Result<(), NonceError>> + Send;

    fn apply_reconcile(
        &self,
        chain_id: u64,
        address: Address,
        observed: u64,
    ) -> impl Future<Output = Result<ReconcileReport, NonceError>> + Send;
}

/// Allocates, releases and reconciles nonces per (chain, sender).
///
/// The chain is only queried outside the store's atomic sections, so a slow
/// node never blocks allocation for other pairs.
pub struct NonceManager<N> {
    store: Arc<N>,
}

impl<N> Clone for NonceManager<N> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<N: NonceStore> NonceManager<N> {
    pub fn new(store: Arc<N>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<N> {
        &self.store
    }

    pub async fn allocate<C: ChainClient>(
        &self,
        chain: &C,
        address: Address,
        reconcile_interval: Duration,
    ) -> Result<u64, NonceError> {
        let chain_id = chain.chain_id();

        for _ in 0..MAX_ALLOCATE_ROUNDS {
            match self
                .store
                .try_allocate(chain_id, address, reconcile_interval)
                .await?
            {
                AllocateOutcome::Allocated(nonce) => {
                    tracing::debug!(chain_id, %address, nonce, "Allocated nonce");
                    return Ok(nonce);
                }
                AllocateOutcome::NeedsReconcile => {
                    self.reconcile(chain, address).await?;
                }
            }
        }

        Err(NonceError::AllocationContention { chain_id, address })
    }

    /// Return a nonce whose transaction was provably never broadcast.
    pub async fn release(&self, chain_id: u64, address: Address, nonce: u64) -> Result<(), NonceError> {
        tracing::debug!(chain_id, %address, nonce, "Releasing nonce");
        self.store.release(chain_id, address, nonce).await
    }

    /// Force the next allocation for the pair to reconcile first.
    pub async fn request_reconcile(&self, chain_id: u64, address: Address) -> Result<(), NonceError> {
        self.store.flag_reconcile(chain_id, address).await
    }

    pub async fn reconcile<C: ChainClient>(
        &self,
        chain: &C,
        address: Address,
    ) -> Result<ReconcileReport, NonceError> {
        let chain_id = chain.chain_id();
        let observed = chain
            .get_transaction_count(address)
            .await
            .map_err(|inner| NonceError::ChainUnavailable {
                chain_id,
                address,
                inner,
            })?;

        let report = self.store.apply_reconcile(chain_id, address, observed).await?;

        if report.chain_ahead {
            tracing::warn!(
                chain_id,
                %address,
                chain_nonce = report.chain_nonce,
                "Chain consumed nonces that were never allocated here, skipping ahead"
            );
        }
        if report.rewound {
            tracing::info!(
                chain_id,
                %address,
                next_nonce = report.next_nonce,
                "All outstanding nonces were released, rewound to chain count"
            );
        }
        tracing::debug!(
            chain_id,
            %address,
            chain_nonce = report.chain_nonce,
            next_nonce = report.next_nonce,
            recovered = report.recovered,
            "Reconciled nonce state"
        );

        Ok(report)
    }

    pub async fn snapshot(&self, chain_id: u64, address: Address) -> Result<Option<NonceRecord>, NonceError> {
        self.store.load(chain_id, address).await
    }
}
