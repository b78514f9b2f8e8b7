use std::collections::HashMap;

use relayer_core::{
    chain::{ChainService, RpcChain},
    error::RelayerError,
};

use crate::config::ChainConfig;

/// Chains the relayer may send on, each reached through its configured RPC
/// endpoint.
pub struct RpcChainService {
    chains: HashMap<u64, RpcChain>,
}

impl RpcChainService {
    pub fn from_config(chains: &[ChainConfig]) -> Result<Self, RelayerError> {
        let chains = chains
            .iter()
            .map(|chain| Ok((chain.chain_id, RpcChain::new(chain.chain_id, &chain.rpc_url)?)))
            .collect::<Result<HashMap<_, _>, RelayerError>>()?;

        Ok(Self { chains })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl ChainService for RpcChainService {
    type Chain = RpcChain;

    fn get_chain(&self, chain_id: u64) -> Result<RpcChain, RelayerError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or(RelayerError::UnsupportedChain { chain_id })
    }
}
