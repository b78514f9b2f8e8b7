#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use alloy::{
    consensus::{Signed, Transaction, TxEnvelope, TypedTransaction},
    eips::eip2718::Decodable2718,
    primitives::{Address, B256, Bytes, U256, address},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use relayer_core::{
    chain::{ChainClient, ChainReceipt, ChainService, GasPricing},
    config::ConfigSnapshot,
    credentials::SigningCredential,
    error::{RelayerError, RpcErrorKind, RpcErrorResponse},
    intent::{GasOverrides, Sender, TransactionIntent, UnsignedCall},
    signer::{SigningGateway, WalletRecord, WalletRegistry, WalletSigningGateway},
};
use relayer_executors::{
    nonce::{InMemoryNonceStore, NonceManager},
    propagator::{ConfigPropagator, InMemoryConfigSource, LiveConfig, PropagatorOptions},
    store::InMemoryTransactionStore,
    worker::{
        ConfirmationWorker, HistoryPruner, PipelineContext, RetryScheduler, SendWorker,
        SendWorkerOptions,
    },
};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

// Redis connection URL for tests
pub const REDIS_URL: &str = "redis://127.0.0.1:6379/";

pub const TEST_CHAIN_ID: u64 = 5;
pub const RECIPIENT: Address = address!("0x00000000000000000000000000000000000000aa");

// Setup tracing for tests
pub fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relayer_executors=debug,relayer_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

// Helper to clean up Redis keys under a test namespace
pub async fn cleanup_redis_keys(conn_manager: &ConnectionManager, namespace: &str) {
    let mut conn = conn_manager.clone();
    let keys_pattern = format!("{namespace}:*");

    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(&keys_pattern)
        .query_async(&mut conn)
        .await
        .unwrap_or_default();
    if !keys.is_empty() {
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut conn)
            .await
            .unwrap_or_default();
    }
    tracing::info!("Cleaned up keys for pattern: {}", keys_pattern);
}

pub async fn redis_connection() -> ConnectionManager {
    let client = redis::Client::open(REDIS_URL).unwrap();
    ConnectionManager::new(client).await.unwrap()
}

/// Config tuned so every stage acts on the first tick: no send backoff and
/// no pending timeout.
pub fn test_config() -> ConfigSnapshot {
    let mut config = ConfigSnapshot::default();
    config.send.backoff_base_ms = 0;
    config.retry.pending_timeout_secs = 0;
    config
}

pub fn node_error(message: &str) -> RelayerError {
    RelayerError::RpcError {
        chain_id: TEST_CHAIN_ID,
        rpc_url: "mock://chain".to_string(),
        message: message.to_string(),
        kind: RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: -32000,
            message: message.to_string(),
            data: None,
        }),
    }
}

pub fn transport_error() -> RelayerError {
    RelayerError::RpcError {
        chain_id: TEST_CHAIN_ID,
        rpc_url: "mock://chain".to_string(),
        message: "connection reset by peer".to_string(),
        kind: RpcErrorKind::OtherTransportError {
            message: "connection reset by peer".to_string(),
        },
    }
}

// --- Mock chain ---

#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    pub hash: B256,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
}

struct MockChainState {
    chain_id: u64,
    counts: DashMap<Address, u64>,
    receipts: DashMap<B256, ChainReceipt>,
    broadcasts: Mutex<Vec<BroadcastRecord>>,
    broadcast_failures: Mutex<VecDeque<RelayerError>>,
    estimate_failure: Mutex<Option<RelayerError>>,
    pricing: Mutex<GasPricing>,
    gate: Arc<RwLock<()>>,
}

/// An in-process chain. Broadcasts are decoded and recorded, and mining is
/// driven by the test.
#[derive(Clone)]
pub struct MockChain {
    state: Arc<MockChainState>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            state: Arc::new(MockChainState {
                chain_id,
                counts: DashMap::new(),
                receipts: DashMap::new(),
                broadcasts: Mutex::new(Vec::new()),
                broadcast_failures: Mutex::new(VecDeque::new()),
                estimate_failure: Mutex::new(None),
                pricing: Mutex::new(GasPricing::Eip1559 {
                    max_fee_per_gas: 100_000_000_000,
                    max_priority_fee_per_gas: 2_000_000_000,
                }),
                gate: Arc::new(RwLock::new(())),
            }),
        }
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.state.counts.insert(address, count);
    }

    pub fn transaction_count(&self, address: Address) -> u64 {
        self.state.counts.get(&address).map(|c| *c).unwrap_or(0)
    }

    pub fn set_pricing(&self, pricing: GasPricing) {
        *self.state.pricing.lock().unwrap() = pricing;
    }

    /// The next broadcast fails with `error` without being recorded.
    pub fn fail_next_broadcast(&self, error: RelayerError) {
        self.state.broadcast_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_estimates(&self, error: RelayerError) {
        *self.state.estimate_failure.lock().unwrap() = Some(error);
    }

    pub fn broadcasts(&self) -> Vec<BroadcastRecord> {
        self.state.broadcasts.lock().unwrap().clone()
    }

    /// Hold every broadcast until the returned guard is dropped.
    pub async fn pause_broadcasts(&self) -> OwnedRwLockWriteGuard<()> {
        self.state.gate.clone().write_owned().await
    }

    /// Include a broadcast transaction in a block, consuming its nonce.
    pub fn mine(&self, sender: Address, hash: B256, success: bool) {
        let nonce = self
            .broadcasts()
            .into_iter()
            .find(|record| record.hash == hash)
            .map(|record| record.nonce)
            .expect("mined hash was never broadcast");

        self.state.receipts.insert(
            hash,
            ChainReceipt {
                transaction_hash: hash,
                block_number: Some(1),
                block_hash: Some(B256::repeat_byte(0x11)),
                status: success,
                gas_used: 21_000,
            },
        );
        self.consume_nonce(sender, nonce);
    }

    /// Some other party used `sender`'s nonce.
    pub fn consume_nonce(&self, sender: Address, nonce: u64) {
        let mut count = self.state.counts.entry(sender).or_insert(0);
        *count = (*count).max(nonce + 1);
    }
}

impl ChainClient for MockChain {
    fn chain_id(&self) -> u64 {
        self.state.chain_id
    }

    fn rpc_url(&self) -> String {
        "mock://chain".to_string()
    }

    async fn broadcast(&self, raw: Bytes) -> Result<B256, RelayerError> {
        drop(self.state.gate.read().await);

        if let Some(error) = self.state.broadcast_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref()).map_err(|e| {
            RelayerError::InternalError {
                message: format!("undecodable transaction: {e}"),
            }
        })?;
        let record = BroadcastRecord {
            hash: *envelope.tx_hash(),
            nonce: envelope.nonce(),
            to: envelope.to(),
            value: envelope.value(),
            gas_limit: envelope.gas_limit(),
            max_fee_per_gas: envelope.max_fee_per_gas(),
        };
        self.state.broadcasts.lock().unwrap().push(record.clone());

        Ok(record.hash)
    }

    async fn get_receipt(&self, hash: B256) -> Result<Option<ChainReceipt>, RelayerError> {
        Ok(self.state.receipts.get(&hash).map(|r| r.clone()))
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, RelayerError> {
        Ok(self.transaction_count(address))
    }

    async fn estimate_gas(&self, _request: TransactionRequest) -> Result<u64, RelayerError> {
        match self.state.estimate_failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(50_000),
        }
    }

    async fn estimate_fees(&self) -> Result<GasPricing, RelayerError> {
        Ok(*self.state.pricing.lock().unwrap())
    }

    async fn revert_reason(&self, hash: B256, _block_number: Option<u64>) -> Option<String> {
        self.state
            .receipts
            .get(&hash)
            .filter(|receipt| !receipt.status)
            .map(|_| "execution reverted: insufficient balance".to_string())
    }
}

pub struct MockChainService {
    chains: HashMap<u64, MockChain>,
}

impl MockChainService {
    pub fn new(chains: impl IntoIterator<Item = MockChain>) -> Self {
        Self {
            chains: chains
                .into_iter()
                .map(|chain| (chain.chain_id(), chain))
                .collect(),
        }
    }
}

impl ChainService for MockChainService {
    type Chain = MockChain;

    fn get_chain(&self, chain_id: u64) -> Result<MockChain, RelayerError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or(RelayerError::UnsupportedChain { chain_id })
    }
}

// --- Wallets ---

/// Local-key backend wallets generated per test.
pub struct TestWallets {
    records: HashMap<Address, WalletRecord>,
}

impl TestWallets {
    pub fn generate(count: usize) -> (Self, Vec<Address>) {
        let mut records = HashMap::new();
        let mut addresses = Vec::with_capacity(count);

        for _ in 0..count {
            let signer = PrivateKeySigner::random();
            let address = signer.address();
            records.insert(
                address,
                WalletRecord {
                    address,
                    credential: SigningCredential::Local {
                        private_key: signer.to_bytes().to_string(),
                    },
                },
            );
            addresses.push(address);
        }

        (Self { records }, addresses)
    }
}

impl WalletRegistry for TestWallets {
    async fn get_wallet(&self, address: Address) -> Result<Option<WalletRecord>, RelayerError> {
        Ok(self.records.get(&address).cloned())
    }
}

/// Signs through the wallet gateway unless a failure is queued.
pub struct FlakySigner<G> {
    inner: G,
    failures: Mutex<VecDeque<RelayerError>>,
}

impl<G> FlakySigner<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// The next signature request fails with `error`.
    pub fn fail_next_signature(&self, error: RelayerError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

impl<G: SigningGateway> SigningGateway for FlakySigner<G> {
    fn prepare_call(&self, sender: &Sender, call: UnsignedCall) -> Result<UnsignedCall, RelayerError> {
        self.inner.prepare_call(sender, call)
    }

    async fn sign_transaction(
        &self,
        chain_id: u64,
        sender: &Sender,
        transaction: TypedTransaction,
    ) -> Result<Signed<TypedTransaction>, RelayerError> {
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        self.inner.sign_transaction(chain_id, sender, transaction).await
    }
}

// --- Pipeline harness ---

pub type TestSigner = FlakySigner<WalletSigningGateway<TestWallets>>;

pub type TestContext =
    PipelineContext<InMemoryTransactionStore, InMemoryNonceStore, TestSigner, MockChainService>;

pub struct Harness {
    pub ctx: TestContext,
    pub chain: MockChain,
    pub senders: Vec<Address>,
    pub config_source: Arc<InMemoryConfigSource>,
    pub propagator: Arc<ConfigPropagator<InMemoryConfigSource>>,
}

impl Harness {
    pub fn new(wallets: usize, config: ConfigSnapshot) -> Self {
        setup_tracing();

        let chain = MockChain::new(TEST_CHAIN_ID);
        let (registry, senders) = TestWallets::generate(wallets);
        let live = LiveConfig::new(config);
        let config_source = Arc::new(InMemoryConfigSource::new());

        let ctx = PipelineContext {
            store: Arc::new(InMemoryTransactionStore::new()),
            nonces: NonceManager::new(Arc::new(InMemoryNonceStore::new())),
            signer: Arc::new(FlakySigner::new(WalletSigningGateway::new(Arc::new(
                registry,
            )))),
            chains: Arc::new(MockChainService::new([chain.clone()])),
            config: live.clone(),
        };

        let propagator = Arc::new(ConfigPropagator::new(
            config_source.clone(),
            live,
            PropagatorOptions::default(),
        ));

        Self {
            ctx,
            chain,
            senders,
            config_source,
            propagator,
        }
    }

    pub fn sender(&self, index: usize) -> Address {
        self.senders[index]
    }

    pub fn intent(&self, sender_index: usize) -> TransactionIntent {
        TransactionIntent {
            chain_id: TEST_CHAIN_ID,
            to: RECIPIENT,
            data: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
            value: U256::ZERO,
            sender: Sender::eoa(self.sender(sender_index)),
            gas_overrides: GasOverrides::default(),
            idempotency_key: None,
        }
    }

    pub fn send_worker(
        &self,
    ) -> SendWorker<
        InMemoryTransactionStore,
        InMemoryNonceStore,
        TestSigner,
        MockChainService,
    > {
        SendWorker::new(
            self.ctx.clone(),
            SendWorkerOptions {
                worker_id: "test-send".to_string(),
                ..Default::default()
            },
        )
    }

    pub fn confirmation_worker(
        &self,
    ) -> ConfirmationWorker<
        InMemoryTransactionStore,
        InMemoryNonceStore,
        TestSigner,
        MockChainService,
    > {
        ConfirmationWorker::new(self.ctx.clone())
    }

    pub fn retry_scheduler(
        &self,
    ) -> RetryScheduler<
        InMemoryTransactionStore,
        InMemoryNonceStore,
        TestSigner,
        MockChainService,
    > {
        RetryScheduler::new(self.ctx.clone())
    }

    pub fn history_pruner(
        &self,
    ) -> HistoryPruner<
        InMemoryTransactionStore,
        InMemoryNonceStore,
        TestSigner,
        MockChainService,
    > {
        HistoryPruner::new(self.ctx.clone())
    }
}
