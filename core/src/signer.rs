use std::{future::Future, ops::Deref, sync::Arc, time::Duration};

use alloy::{
    consensus::{SignableTransaction, Signed, TypedTransaction},
    network::TxSigner,
    primitives::{Address, Signature},
    signers::{Signer, local::PrivateKeySigner},
};
use alloy_signer_aws::{AwsSigner, AwsSignerError};
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::{
    credentials::SigningCredential,
    error::RelayerError,
    intent::{Sender, UnsignedCall},
};

pub const SIGNER_CACHE_CAPACITY: u64 = 2048;

/// Capability to turn an unsigned transaction into a broadcastable one for a
/// given sender. Implementations only ever fail with
/// [`RelayerError::SigningUnavailable`] or [`RelayerError::SigningRejected`].
///
/// Uses the impl Future pattern so gateways can be stacked as decorators
/// without boxing.
pub trait SigningGateway: Send + Sync {
    /// Rewrite the call before it is estimated and signed. Plain wallets sign
    /// the call as given.
    fn prepare_call(&self, _sender: &Sender, call: UnsignedCall) -> Result<UnsignedCall, RelayerError> {
        Ok(call)
    }

    fn sign_transaction(
        &self,
        chain_id: u64,
        sender: &Sender,
        transaction: TypedTransaction,
    ) -> impl Future<Output = Result<Signed<TypedTransaction>, RelayerError>> + Send;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    pub address: Address,
    pub credential: SigningCredential,
}

/// Source of backend wallet records.
pub trait WalletRegistry: Send + Sync {
    fn get_wallet(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<Option<WalletRecord>, RelayerError>> + Send;
}

/// A resolved signing backend.
#[derive(Debug)]
pub enum BackendSigner {
    Local(PrivateKeySigner),
    AwsKms(AwsSigner),
}

impl BackendSigner {
    pub fn address(&self) -> Address {
        match self {
            BackendSigner::Local(signer) => signer.address(),
            BackendSigner::AwsKms(signer) => Signer::address(signer),
        }
    }

    async fn sign(&self, transaction: &mut TypedTransaction) -> Result<Signature, RelayerError> {
        let result = match self {
            BackendSigner::Local(signer) => signer.sign_transaction(transaction).await,
            BackendSigner::AwsKms(signer) => signer.sign_transaction(transaction).await,
        };

        result.map_err(|err| match err {
            alloy::signers::Error::Other(inner) => match inner.downcast::<AwsSignerError>() {
                Ok(aws_error) => RelayerError::from(*aws_error).into_signing_error(),
                Err(other) => RelayerError::SigningUnavailable {
                    message: other.to_string(),
                },
            },
            other => RelayerError::SigningRejected {
                message: other.to_string(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct SignerCacheKey {
    pub chain_id: u64,
    pub wallet: Address,
    pub account: Option<Address>,
}

/// Signs with backend wallets resolved from a [`WalletRegistry`].
///
/// Resolved signers are memoised in a bounded cache keyed by
/// (chain, wallet, account). Rotating a wallet's credential requires an
/// explicit [`WalletSigningGateway::invalidate`].
pub struct WalletSigningGateway<R> {
    registry: Arc<R>,
    cache: Cache<SignerCacheKey, Arc<BackendSigner>>,
}

impl<R> Clone for WalletSigningGateway<R> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<R: WalletRegistry> WalletSigningGateway<R> {
    pub fn new(registry: Arc<R>) -> Self {
        let cache = Cache::builder()
            .max_capacity(SIGNER_CACHE_CAPACITY)
            .time_to_idle(Duration::from_secs(60 * 60))
            .support_invalidation_closures()
            .build();

        Self { registry, cache }
    }

    /// Drops every cached signer for `wallet`, on all chains and accounts.
    pub fn invalidate(&self, wallet: Address) -> Result<(), RelayerError> {
        self.cache
            .invalidate_entries_if(move |key, _| key.wallet == wallet)
            .map(|_| ())
            .map_err(|e| RelayerError::InternalError {
                message: format!("Failed to invalidate signer cache: {e}"),
            })
    }

    pub fn cached_signers(&self) -> u64 {
        self.cache.entry_count()
    }

    async fn resolve(&self, chain_id: u64, sender: &Sender) -> Result<Arc<BackendSigner>, RelayerError> {
        let key = SignerCacheKey {
            chain_id,
            wallet: sender.address,
            account: sender.account_address,
        };

        self.cache
            .try_get_with(key, self.load_signer(chain_id, sender.address))
            .await
            .map_err(|e| e.deref().clone())
    }

    async fn load_signer(
        &self,
        chain_id: u64,
        wallet: Address,
    ) -> Result<Arc<BackendSigner>, RelayerError> {
        let record = self
            .registry
            .get_wallet(wallet)
            .await
            .map_err(RelayerError::into_signing_error)?
            .ok_or_else(|| RelayerError::SigningUnavailable {
                message: format!("No backend wallet configured for {wallet}"),
            })?;

        let signer = match &record.credential {
            SigningCredential::Local { private_key } => BackendSigner::Local(
                SigningCredential::local_signer(private_key)?.with_chain_id(Some(chain_id)),
            ),
            SigningCredential::AwsKms(credential) => BackendSigner::AwsKms(
                credential
                    .get_signer(Some(chain_id))
                    .await
                    .map_err(RelayerError::into_signing_error)?,
            ),
        };

        if signer.address() != wallet {
            return Err(RelayerError::SigningRejected {
                message: format!(
                    "Credential for {wallet} resolves to a different address ({})",
                    signer.address()
                ),
            });
        }

        tracing::debug!(%wallet, chain_id, "Resolved backend signer");
        Ok(Arc::new(signer))
    }
}

impl<R: WalletRegistry> SigningGateway for WalletSigningGateway<R> {
    async fn sign_transaction(
        &self,
        chain_id: u64,
        sender: &Sender,
        mut transaction: TypedTransaction,
    ) -> Result<Signed<TypedTransaction>, RelayerError> {
        let signer = self.resolve(chain_id, sender).await?;
        let signature = signer.sign(&mut transaction).await?;
        Ok(transaction.into_signed(signature))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use alloy::{
        consensus::TxLegacy,
        primitives::{TxKind, U256},
    };

    use super::*;

    struct StaticRegistry {
        wallets: HashMap<Address, WalletRecord>,
    }

    impl WalletRegistry for StaticRegistry {
        async fn get_wallet(&self, address: Address) -> Result<Option<WalletRecord>, RelayerError> {
            Ok(self.wallets.get(&address).cloned())
        }
    }

    fn gateway_with(signer: &PrivateKeySigner) -> WalletSigningGateway<StaticRegistry> {
        let record = WalletRecord {
            address: signer.address(),
            credential: SigningCredential::Local {
                private_key: alloy::hex::encode(signer.to_bytes()),
            },
        };
        WalletSigningGateway::new(Arc::new(StaticRegistry {
            wallets: HashMap::from([(signer.address(), record)]),
        }))
    }

    fn legacy_tx(nonce: u64) -> TypedTransaction {
        TypedTransaction::Legacy(TxLegacy {
            chain_id: Some(5),
            nonce,
            gas_price: 1_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(Address::ZERO),
            value: U256::ZERO,
            input: Default::default(),
        })
    }

    #[tokio::test]
    async fn signs_with_local_key_and_recovers_sender() {
        let signer = PrivateKeySigner::random();
        let gateway = gateway_with(&signer);

        let signed = gateway
            .sign_transaction(5, &Sender::eoa(signer.address()), legacy_tx(3))
            .await
            .unwrap();

        let recovered = signed
            .signature()
            .recover_address_from_prehash(&signed.signature_hash())
            .unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[tokio::test]
    async fn unknown_wallet_is_unavailable() {
        let signer = PrivateKeySigner::random();
        let gateway = gateway_with(&signer);

        let err = gateway
            .sign_transaction(5, &Sender::eoa(Address::repeat_byte(7)), legacy_tx(0))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::SigningUnavailable { .. }));
    }

    #[tokio::test]
    async fn invalidation_drops_cached_signers() {
        let signer = PrivateKeySigner::random();
        let gateway = gateway_with(&signer);
        let sender = Sender::eoa(signer.address());

        gateway.sign_transaction(5, &sender, legacy_tx(0)).await.unwrap();
        gateway.sign_transaction(10, &sender, legacy_tx(0)).await.unwrap();
        gateway.cache.run_pending_tasks().await;
        assert_eq!(gateway.cached_signers(), 2);

        gateway.invalidate(signer.address()).unwrap();
        gateway.cache.run_pending_tasks().await;
        assert_eq!(gateway.cached_signers(), 0);
    }
}
