use std::future::Future;

use alloy::{
    consensus::Transaction as ConsensusTransaction,
    eips::BlockId,
    network::{ReceiptResponse, TransactionResponse},
    primitives::{Address, B256, Bytes},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::TransactionRequest,
    transports::http::reqwest::Url,
};
use serde::{Deserialize, Serialize};

use crate::error::{AlloyRpcErrorToRelayerError, RelayerError, RpcErrorKind};

/// Fee parameters for a single attempt. Legacy chains price gas with one
/// number, EIP-1559 chains with a cap and a tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GasPricing {
    #[serde(rename_all = "camelCase")]
    Legacy { gas_price: u128 },
    #[serde(rename_all = "camelCase")]
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl GasPricing {
    /// The price a node compares when deciding whether a replacement is
    /// worth accepting.
    pub fn effective_price(&self) -> u128 {
        match self {
            GasPricing::Legacy { gas_price } => *gas_price,
            GasPricing::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub status: bool,
    pub gas_used: u64,
}

/// Read and write access to a single chain's node.
///
/// Every method is a suspension point for the pipeline; callers never hold a
/// lock across them.
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;
    fn rpc_url(&self) -> String;

    /// Submit raw EIP-2718 encoded bytes. Returns the hash the node reports.
    fn broadcast(&self, raw: Bytes)
    -> impl Future<Output = Result<B256, RelayerError>> + Send;

    fn get_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<ChainReceipt>, RelayerError>> + Send;

    /// Number of transactions the chain has accepted from `address` at the
    /// latest block. This is the next nonce the chain expects.
    fn get_transaction_count(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<u64, RelayerError>> + Send;

    fn estimate_gas(
        &self,
        request: TransactionRequest,
    ) -> impl Future<Output = Result<u64, RelayerError>> + Send;

    fn estimate_fees(&self) -> impl Future<Output = Result<GasPricing, RelayerError>> + Send;

    /// Best-effort revert reason for a mined transaction, obtained by
    /// replaying it at its block.
    fn revert_reason(
        &self,
        hash: B256,
        block_number: Option<u64>,
    ) -> impl Future<Output = Option<String>> + Send;
}

pub trait ChainService: Send + Sync {
    type Chain: ChainClient + Clone + 'static;

    fn get_chain(&self, chain_id: u64) -> Result<Self::Chain, RelayerError>;
}

/// A chain reached through a plain JSON-RPC HTTP endpoint.
#[derive(Clone, Debug)]
pub struct RpcChain {
    chain_id: u64,
    rpc_url: Url,
    provider: RootProvider,
}

impl RpcChain {
    pub fn new(chain_id: u64, rpc_url: &str) -> Result<Self, RelayerError> {
        let rpc_url = Url::parse(rpc_url).map_err(|e| RelayerError::RpcConfigError {
            message: format!("Failed to parse RPC URL for chain {chain_id}: {e}"),
        })?;

        Ok(Self {
            chain_id,
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url.clone()),
            rpc_url,
        })
    }

    pub fn provider(&self) -> &RootProvider {
        &self.provider
    }
}

impl ChainClient for RpcChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn rpc_url(&self) -> String {
        self.rpc_url.to_string()
    }

    async fn broadcast(&self, raw: Bytes) -> Result<B256, RelayerError> {
        let pending = self
            .provider
            .send_raw_transaction(&raw)
            .await
            .map_err(|e| e.to_relayer_error(self))?;
        Ok(*pending.tx_hash())
    }

    async fn get_receipt(&self, hash: B256) -> Result<Option<ChainReceipt>, RelayerError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| e.to_relayer_error(self))?;

        Ok(receipt.map(|receipt| ChainReceipt {
            transaction_hash: receipt.transaction_hash(),
            block_number: receipt.block_number(),
            block_hash: receipt.block_hash(),
            status: receipt.status(),
            gas_used: receipt.gas_used(),
        }))
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, RelayerError> {
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(|e| e.to_relayer_error(self))
    }

    async fn estimate_gas(&self, request: TransactionRequest) -> Result<u64, RelayerError> {
        self.provider
            .estimate_gas(request)
            .await
            .map_err(|e| e.to_relayer_error(self))
    }

    async fn estimate_fees(&self) -> Result<GasPricing, RelayerError> {
        match self.provider.estimate_eip1559_fees().await {
            Ok(fees) => Ok(GasPricing::Eip1559 {
                max_fee_per_gas: fees.max_fee_per_gas,
                max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            }),
            Err(err) => {
                tracing::debug!(
                    chain_id = self.chain_id,
                    error = %err,
                    "EIP-1559 fee estimation failed, falling back to legacy gas price"
                );
                let gas_price = self
                    .provider
                    .get_gas_price()
                    .await
                    .map_err(|e| e.to_relayer_error(self))?;
                Ok(GasPricing::Legacy { gas_price })
            }
        }
    }

    async fn revert_reason(&self, hash: B256, block_number: Option<u64>) -> Option<String> {
        let transaction = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .ok()
            .flatten()?;

        let request = TransactionRequest::default()
            .from(TransactionResponse::from(&transaction))
            .input(ConsensusTransaction::input(&transaction).clone().into())
            .value(ConsensusTransaction::value(&transaction));
        let request = match ConsensusTransaction::to(&transaction) {
            Some(to) => request.to(to),
            None => request,
        };

        let block = block_number
            .map(BlockId::number)
            .unwrap_or_else(BlockId::latest);

        match self.provider.call(request).block(block).await {
            Ok(_) => None,
            Err(err) => match err.to_relayer_error(self).rpc_kind() {
                Some(RpcErrorKind::ErrorResp(resp)) => Some(resp.message.clone()),
                _ => None,
            },
        }
    }
}
