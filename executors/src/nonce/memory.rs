use std::time::Duration;

use alloy::primitives::Address;
use dashmap::DashMap;

use crate::{
    nonce::{AllocateOutcome, NonceError, NonceRecord, NonceStore, ReconcileReport},
    store::now_millis,
};

#[derive(Debug, Default)]
pub struct InMemoryNonceStore {
    records: DashMap<(u64, Address), NonceRecord>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NonceStore for InMemoryNonceStore {
    async fn load(&self, chain_id: u64, address: Address) -> Result<Option<NonceRecord>, NonceError> {
        Ok(self
            .records
            .get(&(chain_id, address))
            .map(|record| record.clone()))
    }

    async fn try_allocate(
        &self,
        chain_id: u64,
        address: Address,
        max_age: Duration,
    ) -> Result<AllocateOutcome, NonceError> {
        let Some(mut record) = self.records.get_mut(&(chain_id, address)) else {
            return Ok(AllocateOutcome::NeedsReconcile);
        };
        Ok(record.try_allocate(now_millis(), max_age))
    }

    async fn release(&self, chain_id: u64, address: Address, nonce: u64) -> Result<(), NonceError> {
        self.records
            .entry((chain_id, address))
            .or_default()
            .release(nonce);
        Ok(())
    }

    async fn flag_reconcile(&self, chain_id: u64, address: Address) -> Result<(), NonceError> {
        if let Some(mut record) = self.records.get_mut(&(chain_id, address)) {
            record.needs_reconcile = true;
        }
        Ok(())
    }

    async fn apply_reconcile(
        &self,
        chain_id: u64,
        address: Address,
        observed: u64,
    ) -> Result<ReconcileReport, NonceError> {
        Ok(self
            .records
            .entry((chain_id, address))
            .or_default()
            .apply_reconcile(observed, now_millis()))
    }
}
