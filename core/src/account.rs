use alloy::{
    consensus::{Signed, TypedTransaction},
    primitives::U256,
    sol,
    sol_types::SolCall,
};

use crate::{
    error::RelayerError,
    intent::{Sender, UnsignedCall},
    signer::SigningGateway,
};

sol! {
    function execute(address _target, uint256 _value, bytes _calldata);
}

/// Routes calls for smart-account senders through the account's `execute`
/// entrypoint, signed by the admin wallet. Senders without an account pass
/// straight through to the wrapped gateway.
#[derive(Clone)]
pub struct SmartAccountGateway<G> {
    inner: G,
}

impl<G> SmartAccountGateway<G> {
    pub fn new(inner: G) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

impl<G: SigningGateway> SigningGateway for SmartAccountGateway<G> {
    fn prepare_call(&self, sender: &Sender, call: UnsignedCall) -> Result<UnsignedCall, RelayerError> {
        let call = self.inner.prepare_call(sender, call)?;

        let Some(account) = sender.account_address else {
            return Ok(call);
        };

        let data = executeCall {
            _target: call.to,
            _value: call.value,
            _calldata: call.data,
        }
        .abi_encode();

        Ok(UnsignedCall {
            from: sender.address,
            to: account,
            data: data.into(),
            value: U256::ZERO,
        })
    }

    async fn sign_transaction(
        &self,
        chain_id: u64,
        sender: &Sender,
        transaction: TypedTransaction,
    ) -> Result<Signed<TypedTransaction>, RelayerError> {
        self.inner
            .sign_transaction(chain_id, sender, transaction)
            .await
    }
}
