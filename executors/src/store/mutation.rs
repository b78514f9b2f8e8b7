//! Record mutations shared by every store backend. Each function checks the
//! record against the caller's expectations and edits it in place; the
//! backend is responsible for making read, mutate and write atomic.

use std::time::Duration;

use alloy::primitives::B256;
use relayer_core::chain::ChainReceipt;

use crate::store::{
    AttemptOutcome, CancelOutcome, Claim, FailureReason, PreparedAttempt, QueuedTransaction,
    StoreError, TransactionAttempt, TransactionStatus, TransactionUpdate,
};

pub fn apply_claim(
    record: &mut QueuedTransaction,
    worker_id: &str,
    lease: Duration,
    now: u64,
) -> Result<(), StoreError> {
    expect_status(record, TransactionStatus::Queued)?;

    if let Some(claim) = &record.claim {
        if claim.worker_id != worker_id && claim.expires_at > now {
            return Err(StoreError::ClaimConflict {
                transaction_id: record.id,
                worker_id: claim.worker_id.clone(),
            });
        }
    }

    record.claim = Some(Claim {
        worker_id: worker_id.to_string(),
        expires_at: now.saturating_add(lease.as_millis() as u64),
    });
    Ok(())
}

pub fn apply_prepare(
    record: &mut QueuedTransaction,
    worker_id: &str,
    prepared: PreparedAttempt,
) -> Result<(), StoreError> {
    expect_status(record, TransactionStatus::Queued)?;

    match &record.claim {
        Some(claim) if claim.worker_id == worker_id => {}
        Some(claim) => {
            return Err(StoreError::ClaimConflict {
                transaction_id: record.id,
                worker_id: claim.worker_id.clone(),
            });
        }
        None => {
            return Err(StoreError::MissingField {
                transaction_id: record.id,
                field: "claim".to_string(),
            });
        }
    }

    record.prepared = Some(prepared);
    Ok(())
}

pub fn apply_transition(
    record: &mut QueuedTransaction,
    from: TransactionStatus,
    to: TransactionStatus,
    update: TransactionUpdate,
    now: u64,
) -> Result<(), StoreError> {
    if !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            transaction_id: record.id,
            from,
            to,
        });
    }
    expect_status(record, from)?;

    if let Some(message) = update.send_error {
        record.send_failures += 1;
        record.last_send_error = Some(message);
    }

    match to {
        TransactionStatus::Sent => {
            let nonce = update.nonce.ok_or_else(|| missing(record, "nonce"))?;
            let attempt = update.attempt.ok_or_else(|| missing(record, "attempt"))?;
            let call = update.call.ok_or_else(|| missing(record, "call"))?;

            if record.nonce.is_some_and(|existing| existing != nonce) || attempt.nonce != nonce {
                return Err(StoreError::NonceMismatch {
                    transaction_id: record.id,
                    expected: record.nonce,
                    actual: attempt.nonce,
                });
            }

            record.nonce = Some(nonce);
            record.call = Some(call);
            record.attempts.push(attempt);
            record.sent_at = Some(now);
        }
        TransactionStatus::Queued => {
            record.attempts.extend(update.attempt);
            record.available_at = update.available_at.unwrap_or(now);
        }
        _ => {
            record.attempts.extend(update.attempt);
            if let Some(receipt) = &update.receipt {
                settle_attempts(record, Some(receipt));
            } else if matches!(update.failure, Some(FailureReason::Dropped { .. })) {
                settle_attempts(record, None);
            }

            if let Some(receipt) = update.receipt {
                record.receipt = Some(receipt);
            }
            if let Some(failure) = update.failure {
                record.failure = Some(failure);
            }
            record.completed_at = Some(now);
        }
    }

    record.status = to;
    record.claim = None;
    record.prepared = None;
    Ok(())
}

pub fn apply_append_attempt(
    record: &mut QueuedTransaction,
    expected_attempts: usize,
    attempt: TransactionAttempt,
) -> Result<(), StoreError> {
    expect_status(record, TransactionStatus::Sent)?;

    if record.attempts.len() != expected_attempts {
        return Err(StoreError::AttemptConflict {
            transaction_id: record.id,
            expected: expected_attempts,
            actual: record.attempts.len(),
        });
    }

    if record.nonce != Some(attempt.nonce) {
        return Err(StoreError::NonceMismatch {
            transaction_id: record.id,
            expected: record.nonce,
            actual: attempt.nonce,
        });
    }

    record.attempts.push(attempt);
    Ok(())
}

pub fn apply_attempt_outcome(
    record: &mut QueuedTransaction,
    transaction_hash: B256,
    outcome: AttemptOutcome,
) -> Result<(), StoreError> {
    expect_status(record, TransactionStatus::Sent)?;

    let transaction_id = record.id;
    let attempt = record
        .attempts
        .iter_mut()
        .rev()
        .find(|attempt| attempt.transaction_hash == transaction_hash)
        .ok_or_else(|| StoreError::MissingField {
            transaction_id,
            field: format!("attempt {transaction_hash}"),
        })?;

    if attempt.outcome == AttemptOutcome::Pending {
        attempt.outcome = outcome;
    }
    Ok(())
}

/// Give every attempt the node accepted its final outcome. The attempt
/// matching `receipt` mined or reverted; the rest were replaced. Without a
/// receipt the nonce went to a transaction we do not know, so all were
/// replaced. A resend of rejected bytes has the rejected attempt's hash,
/// so rejected attempts are never matched.
fn settle_attempts(record: &mut QueuedTransaction, receipt: Option<&ChainReceipt>) {
    for attempt in record
        .attempts
        .iter_mut()
        .filter(|attempt| attempt.outcome != AttemptOutcome::Rejected)
    {
        attempt.outcome = match receipt {
            Some(receipt) if receipt.transaction_hash == attempt.transaction_hash => {
                if receipt.status {
                    AttemptOutcome::Mined
                } else {
                    AttemptOutcome::Reverted
                }
            }
            _ => AttemptOutcome::Replaced,
        };
    }
}

pub fn apply_cancel_request(
    record: &mut QueuedTransaction,
    now: u64,
) -> Result<CancelOutcome, StoreError> {
    match record.status {
        // A live claim means a send worker may be mid-broadcast; let it finish
        // and pick the request up from the flag.
        TransactionStatus::Queued if !record.has_live_claim(now) => {
            record.status = TransactionStatus::Cancelled;
            record.completed_at = Some(now);
            record.claim = None;
            record.prepared = None;
            Ok(CancelOutcome::CancelledImmediately)
        }
        TransactionStatus::Queued | TransactionStatus::Sent => {
            record.cancel_requested = true;
            record.cancel_requested_at.get_or_insert(now);
            Ok(CancelOutcome::CancellationPending)
        }
        status => Ok(CancelOutcome::CannotCancel { status }),
    }
}

fn expect_status(record: &QueuedTransaction, expected: TransactionStatus) -> Result<(), StoreError> {
    if record.status != expected {
        return Err(StoreError::StaleState {
            transaction_id: record.id,
            expected,
            actual: record.status,
        });
    }
    Ok(())
}

fn missing(record: &QueuedTransaction, field: &str) -> StoreError {
    StoreError::MissingField {
        transaction_id: record.id,
        field: field.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, Bytes, U256};
    use relayer_core::{
        chain::GasPricing,
        intent::{GasOverrides, Sender, TransactionIntent, UnsignedCall},
    };

    use super::*;
    use crate::store::AttemptKind;

    fn receipt(hash: B256, status: bool) -> ChainReceipt {
        ChainReceipt {
            transaction_hash: hash,
            block_number: Some(1),
            block_hash: Some(B256::repeat_byte(0x11)),
            status,
            gas_used: 21_000,
        }
    }

    fn record() -> QueuedTransaction {
        QueuedTransaction::new(
            TransactionIntent {
                chain_id: 5,
                to: Address::repeat_byte(2),
                data: Bytes::new(),
                value: U256::ZERO,
                sender: Sender::eoa(Address::repeat_byte(1)),
                gas_overrides: GasOverrides::default(),
                idempotency_key: None,
            },
            1_000,
        )
    }

    fn attempt(nonce: u64) -> TransactionAttempt {
        TransactionAttempt {
            kind: AttemptKind::Original,
            transaction_hash: B256::repeat_byte(9),
            nonce,
            gas_limit: 21_000,
            pricing: GasPricing::Legacy { gas_price: 10 },
            broadcast_at: 2_000,
            outcome: AttemptOutcome::Pending,
        }
    }

    fn sent_record() -> QueuedTransaction {
        let mut record = record();
        apply_transition(
            &mut record,
            TransactionStatus::Queued,
            TransactionStatus::Sent,
            sent_update(10),
            3_000,
        )
        .unwrap();
        record
    }

    fn sent_update(nonce: u64) -> TransactionUpdate {
        TransactionUpdate {
            nonce: Some(nonce),
            call: Some(UnsignedCall {
                from: Address::repeat_byte(1),
                to: Address::repeat_byte(2),
                data: Bytes::new(),
                value: U256::ZERO,
            }),
            attempt: Some(attempt(nonce)),
            ..Default::default()
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [
            TransactionStatus::Mined,
            TransactionStatus::Errored,
            TransactionStatus::Cancelled,
        ] {
            for to in TransactionStatus::ALL {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn stale_from_state_is_rejected() {
        let mut record = record();
        let err = apply_transition(
            &mut record,
            TransactionStatus::Sent,
            TransactionStatus::Mined,
            TransactionUpdate::default(),
            3_000,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::StaleState { .. }));
        assert_eq!(record.status, TransactionStatus::Queued);
    }

    #[test]
    fn sending_assigns_nonce_once() {
        let mut record = record();
        apply_transition(
            &mut record,
            TransactionStatus::Queued,
            TransactionStatus::Sent,
            sent_update(10),
            3_000,
        )
        .unwrap();
        assert_eq!(record.nonce, Some(10));
        assert_eq!(record.attempts.len(), 1);

        let err = apply_append_attempt(&mut record, 1, attempt(11)).unwrap_err();
        assert!(matches!(err, StoreError::NonceMismatch { .. }));

        let err = apply_append_attempt(&mut record, 0, attempt(10)).unwrap_err();
        assert!(matches!(err, StoreError::AttemptConflict { .. }));

        apply_append_attempt(&mut record, 1, attempt(10)).unwrap();
        assert_eq!(record.attempts.len(), 2);
    }

    #[test]
    fn live_claims_block_other_workers() {
        let mut record = record();
        apply_claim(&mut record, "a", Duration::from_secs(30), 1_000).unwrap();

        let err = apply_claim(&mut record, "b", Duration::from_secs(30), 2_000).unwrap_err();
        assert!(matches!(err, StoreError::ClaimConflict { .. }));

        apply_claim(&mut record, "b", Duration::from_secs(30), 40_000).unwrap();
        assert_eq!(record.claim.as_ref().unwrap().worker_id, "b");
    }

    #[test]
    fn cancelling_a_claimed_record_defers_to_the_worker() {
        let mut record = record();
        apply_claim(&mut record, "a", Duration::from_secs(30), 1_000).unwrap();
        assert_eq!(
            apply_cancel_request(&mut record, 2_000).unwrap(),
            CancelOutcome::CancellationPending
        );
        assert_eq!(record.status, TransactionStatus::Queued);
        assert!(record.cancel_requested);
    }

    #[test]
    fn cancel_request_time_is_kept_from_the_first_request() {
        let mut record = sent_record();
        apply_cancel_request(&mut record, 4_000).unwrap();
        apply_cancel_request(&mut record, 5_000).unwrap();
        assert_eq!(record.cancel_requested_at, Some(4_000));
    }

    #[test]
    fn rejected_send_is_recorded_on_requeue() {
        let mut record = record();
        let mut rejected = attempt(10);
        rejected.outcome = AttemptOutcome::Rejected;

        apply_transition(
            &mut record,
            TransactionStatus::Queued,
            TransactionStatus::Queued,
            TransactionUpdate {
                attempt: Some(rejected),
                send_error: Some("insufficient funds".to_string()),
                ..Default::default()
            },
            3_000,
        )
        .unwrap();

        assert_eq!(record.nonce, None);
        assert_eq!(record.send_failures, 1);
        assert_eq!(record.attempts.len(), 1);
        assert_eq!(record.attempts[0].outcome, AttemptOutcome::Rejected);
        assert_eq!(record.live_attempts().count(), 0);
        assert_eq!(record.sent_attempts(), 0);
    }

    #[test]
    fn receipt_settles_every_attempt() {
        let mut record = sent_record();
        let mut bump = attempt(10);
        bump.kind = AttemptKind::GasBump;
        bump.transaction_hash = B256::repeat_byte(0xaa);
        apply_append_attempt(&mut record, 1, bump.clone()).unwrap();

        let mut rejected = attempt(10);
        rejected.transaction_hash = B256::repeat_byte(0xbb);
        apply_append_attempt(&mut record, 2, rejected.clone()).unwrap();
        apply_attempt_outcome(&mut record, rejected.transaction_hash, AttemptOutcome::Rejected)
            .unwrap();

        apply_transition(
            &mut record,
            TransactionStatus::Sent,
            TransactionStatus::Mined,
            TransactionUpdate {
                receipt: Some(receipt(bump.transaction_hash, true)),
                ..Default::default()
            },
            4_000,
        )
        .unwrap();

        let outcomes: Vec<_> = record.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            [
                AttemptOutcome::Replaced,
                AttemptOutcome::Mined,
                AttemptOutcome::Rejected
            ]
        );
    }

    #[test]
    fn settled_outcomes_are_not_overwritten() {
        let mut record = sent_record();
        let hash = record.attempts[0].transaction_hash;
        apply_attempt_outcome(&mut record, hash, AttemptOutcome::Rejected).unwrap();
        apply_attempt_outcome(&mut record, hash, AttemptOutcome::Replaced).unwrap();
        assert_eq!(record.attempts[0].outcome, AttemptOutcome::Rejected);

        let err = apply_attempt_outcome(&mut record, B256::repeat_byte(0x77), AttemptOutcome::Rejected)
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingField { .. }));
    }
}
