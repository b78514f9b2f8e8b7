use alloy::{
    consensus::{Signed, TxEip1559, TxEnvelope, TxLegacy, TypedTransaction},
    eips::eip2718::Encodable2718,
    primitives::{Address, B256, Bytes, TxKind, U256},
    rpc::types::TransactionRequest,
};
use relayer_core::{chain::GasPricing, intent::UnsignedCall};

/// Gas for a plain value transfer, which is all a cancellation needs.
pub const NOOP_GAS_LIMIT: u64 = 21_000;

/// Headroom added on top of the node's gas estimate.
pub const GAS_LIMIT_BUFFER_PERCENT: u64 = 10;

pub fn estimation_request(call: &UnsignedCall) -> TransactionRequest {
    TransactionRequest::default()
        .from(call.from)
        .to(call.to)
        .input(call.data.clone().into())
        .value(call.value)
}

pub fn buffered_gas_limit(estimate: u64) -> u64 {
    estimate.saturating_mul(100 + GAS_LIMIT_BUFFER_PERCENT) / 100
}

pub fn typed_transaction(
    chain_id: u64,
    call: &UnsignedCall,
    nonce: u64,
    gas_limit: u64,
    pricing: GasPricing,
) -> TypedTransaction {
    match pricing {
        GasPricing::Legacy { gas_price } => TypedTransaction::Legacy(TxLegacy {
            chain_id: Some(chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(call.to),
            value: call.value,
            input: call.data.clone(),
        }),
        GasPricing::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => TypedTransaction::Eip1559(TxEip1559 {
            chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            to: TxKind::Call(call.to),
            value: call.value,
            access_list: Default::default(),
            input: call.data.clone(),
        }),
    }
}

/// Hash and EIP-2718 bytes of a signed transaction, ready for
/// `eth_sendRawTransaction`.
pub fn encode_signed(signed: Signed<TypedTransaction>) -> (B256, Bytes) {
    let envelope: TxEnvelope = signed.into();
    let hash = *envelope.tx_hash();
    (hash, envelope.encoded_2718().into())
}

/// A zero-value transfer to self. Mining it at a stuck nonce replaces
/// whatever was pending there.
pub fn noop_call(address: Address) -> UnsignedCall {
    UnsignedCall {
        from: address,
        to: address,
        data: Bytes::new(),
        value: U256::ZERO,
    }
}

fn bump(value: u128, percent: u32) -> u128 {
    let multiplier = 100 + percent as u128;
    (value.saturating_mul(multiplier) / 100).max(value.saturating_add(1))
}

/// Pricing for a replacement attempt: every fee raised by `percent`, and
/// always strictly above the previous attempt. Returns `None` when `cap`
/// leaves no room for a strictly higher price.
pub fn bump_pricing(pricing: GasPricing, percent: u32, cap: Option<u128>) -> Option<GasPricing> {
    let capped = |value: u128| cap.map_or(value, |cap| value.min(cap));

    match pricing {
        GasPricing::Legacy { gas_price } => {
            let bumped = capped(bump(gas_price, percent));
            (bumped > gas_price).then_some(GasPricing::Legacy { gas_price: bumped })
        }
        GasPricing::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let max_fee = capped(bump(max_fee_per_gas, percent));
            if max_fee <= max_fee_per_gas {
                return None;
            }
            let priority = bump(max_priority_fee_per_gas, percent).min(max_fee);
            Some(GasPricing::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumps_by_percent() {
        assert_eq!(
            bump_pricing(GasPricing::Legacy { gas_price: 100 }, 20, None),
            Some(GasPricing::Legacy { gas_price: 120 })
        );
        assert_eq!(
            bump_pricing(
                GasPricing::Eip1559 {
                    max_fee_per_gas: 1_000,
                    max_priority_fee_per_gas: 100
                },
                10,
                None
            ),
            Some(GasPricing::Eip1559 {
                max_fee_per_gas: 1_100,
                max_priority_fee_per_gas: 110
            })
        );
    }

    #[test]
    fn tiny_prices_still_increase() {
        assert_eq!(
            bump_pricing(GasPricing::Legacy { gas_price: 1 }, 20, None),
            Some(GasPricing::Legacy { gas_price: 2 })
        );
    }

    #[test]
    fn cap_limits_and_then_blocks_bumps() {
        assert_eq!(
            bump_pricing(GasPricing::Legacy { gas_price: 100 }, 50, Some(130)),
            Some(GasPricing::Legacy { gas_price: 130 })
        );
        assert_eq!(
            bump_pricing(GasPricing::Legacy { gas_price: 130 }, 50, Some(130)),
            None
        );
    }

    #[test]
    fn priority_fee_never_exceeds_max_fee() {
        let bumped = bump_pricing(
            GasPricing::Eip1559 {
                max_fee_per_gas: 100,
                max_priority_fee_per_gas: 100,
            },
            50,
            Some(120),
        );
        assert_eq!(
            bumped,
            Some(GasPricing::Eip1559 {
                max_fee_per_gas: 120,
                max_priority_fee_per_gas: 120
            })
        );
    }
}
