use std::collections::HashMap;

use alloy::primitives::Address;
use relayer_core::{
    error::RelayerError,
    signer::{WalletRecord, WalletRegistry},
};

use crate::config::WalletConfig;

/// Backend wallets loaded from configuration at startup.
pub struct ConfigWalletRegistry {
    wallets: HashMap<Address, WalletRecord>,
}

impl ConfigWalletRegistry {
    pub fn from_config(wallets: Vec<WalletConfig>) -> Self {
        let wallets = wallets
            .into_iter()
            .map(|wallet| (wallet.address, WalletRecord::from(wallet)))
            .collect();

        Self { wallets }
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

impl WalletRegistry for ConfigWalletRegistry {
    async fn get_wallet(&self, address: Address) -> Result<Option<WalletRecord>, RelayerError> {
        Ok(self.wallets.get(&address).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalletCredentialConfig;

    #[tokio::test]
    async fn looks_up_wallets_by_address() {
        let address = Address::repeat_byte(0x01);
        let registry = ConfigWalletRegistry::from_config(vec![WalletConfig {
            address,
            credential: WalletCredentialConfig::Local {
                private_key: "0x01".to_string(),
            },
        }]);

        assert_eq!(registry.len(), 1);
        assert!(registry.get_wallet(address).await.unwrap().is_some());
        assert!(
            registry
                .get_wallet(Address::repeat_byte(0x02))
                .await
                .unwrap()
                .is_none()
        );
    }
}
