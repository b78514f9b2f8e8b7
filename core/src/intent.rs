use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::{chain::GasPricing, error::RelayerError};

/// Who a transaction is sent on behalf of.
///
/// `address` is always the key that signs and whose nonce is consumed. When
/// `account_address` is set, that key acts as admin signer for a smart
/// account and the call is routed through the account contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_address: Option<Address>,
}

impl Sender {
    pub fn eoa(address: Address) -> Self {
        Self {
            address,
            account_address: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<u128>,
}

impl GasOverrides {
    /// Fee overrides, if the caller supplied a complete set.
    pub fn pricing(&self) -> Option<GasPricing> {
        match (
            self.gas_price,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
        ) {
            (Some(gas_price), None, None) => Some(GasPricing::Legacy { gas_price }),
            (None, Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) => {
                Some(GasPricing::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                })
            }
            _ => None,
        }
    }
}

/// A caller-supplied unsigned call. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionIntent {
    pub chain_id: u64,
    pub to: Address,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub value: U256,
    pub sender: Sender,
    #[serde(default)]
    pub gas_overrides: GasOverrides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl TransactionIntent {
    pub fn validate(&self) -> Result<(), RelayerError> {
        let overrides = &self.gas_overrides;
        let has_legacy = overrides.gas_price.is_some();
        let has_1559 =
            overrides.max_fee_per_gas.is_some() || overrides.max_priority_fee_per_gas.is_some();

        if has_legacy && has_1559 {
            return Err(RelayerError::ValidationError {
                message: "gasPrice cannot be combined with maxFeePerGas/maxPriorityFeePerGas"
                    .to_string(),
            });
        }

        if has_1559 && overrides.pricing().is_none() {
            return Err(RelayerError::ValidationError {
                message: "maxFeePerGas and maxPriorityFeePerGas must be provided together"
                    .to_string(),
            });
        }

        if let (Some(max_fee), Some(priority)) = (
            overrides.max_fee_per_gas,
            overrides.max_priority_fee_per_gas,
        ) {
            if priority > max_fee {
                return Err(RelayerError::ValidationError {
                    message: "maxPriorityFeePerGas cannot exceed maxFeePerGas".to_string(),
                });
            }
        }

        if matches!(&self.idempotency_key, Some(key) if key.is_empty()) {
            return Err(RelayerError::ValidationError {
                message: "idempotencyKey cannot be empty".to_string(),
            });
        }

        Ok(())
    }

    pub fn call(&self) -> UnsignedCall {
        UnsignedCall {
            from: self.sender.address,
            to: self.to,
            data: self.data.clone(),
            value: self.value,
        }
    }
}

/// The call that is actually signed, after any account wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedCall {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn intent() -> TransactionIntent {
        TransactionIntent {
            chain_id: 1,
            to: address!("0x00000000000000000000000000000000000000aa"),
            data: Bytes::new(),
            value: U256::ZERO,
            sender: Sender::eoa(address!("0x00000000000000000000000000000000000000bb")),
            gas_overrides: GasOverrides::default(),
            idempotency_key: None,
        }
    }

    #[test]
    fn mixed_fee_overrides_are_rejected() {
        let mut intent = intent();
        intent.gas_overrides.gas_price = Some(1);
        intent.gas_overrides.max_fee_per_gas = Some(2);
        assert!(intent.validate().is_err());
    }

    #[test]
    fn partial_1559_overrides_are_rejected() {
        let mut intent = intent();
        intent.gas_overrides.max_fee_per_gas = Some(2);
        assert!(intent.validate().is_err());
    }

    #[test]
    fn complete_overrides_produce_pricing() {
        let mut intent = intent();
        intent.gas_overrides.max_fee_per_gas = Some(20);
        intent.gas_overrides.max_priority_fee_per_gas = Some(2);
        assert!(intent.validate().is_ok());
        assert_eq!(
            intent.gas_overrides.pricing(),
            Some(GasPricing::Eip1559 {
                max_fee_per_gas: 20,
                max_priority_fee_per_gas: 2
            })
        );
    }

    #[test]
    fn intent_deserializes_from_camel_case() {
        let json = serde_json::json!({
            "chainId": 5,
            "to": "0x00000000000000000000000000000000000000aa",
            "sender": { "address": "0x00000000000000000000000000000000000000bb" },
            "idempotencyKey": "order-1"
        });
        let intent: TransactionIntent = serde_json::from_value(json).unwrap();
        assert_eq!(intent.chain_id, 5);
        assert_eq!(intent.idempotency_key.as_deref(), Some("order-1"));
        assert!(intent.data.is_empty());
    }
}
