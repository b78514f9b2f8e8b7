use relayer_core::error::{RelayerError, RpcErrorKind};
use serde::{Deserialize, Serialize};

use crate::{nonce::NonceError, store::StoreError};

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum WorkerError {
    #[error("Chain service error for chainId {chain_id}: {message}")]
    ChainServiceError { chain_id: u64, message: String },

    #[error("Store error: {message}")]
    StoreError {
        message: String,
        inner_error: StoreError,
    },

    #[error("Nonce error: {message}")]
    NonceError {
        message: String,
        inner_error: NonceError,
    },

    #[error("Call preparation failed: {message}")]
    PreparationFailed {
        message: String,
        inner_error: RelayerError,
    },

    #[error("Transaction simulation failed: {message}")]
    TransactionSimulationFailed {
        message: String,
        inner_error: RelayerError,
    },

    #[error("Transaction build failed: {message}")]
    TransactionBuildFailed { message: String },

    #[error("RPC error encountered during generic operation: {message}")]
    RpcError {
        message: String,
        inner_error: RelayerError,
    },

    #[error("Transaction signing failed: {message}")]
    SigningError {
        message: String,
        inner_error: RelayerError,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl From<StoreError> for WorkerError {
    fn from(error: StoreError) -> Self {
        WorkerError::StoreError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<NonceError> for WorkerError {
    fn from(error: NonceError) -> Self {
        WorkerError::NonceError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl WorkerError {
    pub fn is_lost_race(&self) -> bool {
        matches!(self, WorkerError::StoreError { inner_error, .. } if inner_error.is_lost_race())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorClassification {
    /// "nonce too low", "already known" and friends: the node may hold it.
    PossiblySent,
    /// Rejected before reaching the mempool; safe to retry later.
    DeterministicFailure,
    /// Rejected before reaching the mempool, and retrying cannot help.
    DeterministicFailureNonRetryable,
}

#[tracing::instrument(skip_all, fields(error = %error))]
pub fn classify_send_error(error: &RelayerError) -> SendErrorClassification {
    let Some(RpcErrorKind::ErrorResp(response)) = error.rpc_kind() else {
        return SendErrorClassification::DeterministicFailure;
    };

    let error_str = response.message.to_lowercase();

    if error_str.contains("invalid signature")
        || error_str.contains("malformed transaction")
        || error_str.contains("insufficient funds")
        || error_str.contains("invalid transaction format")
        || error_str.contains("nonce too high")
    {
        return SendErrorClassification::DeterministicFailure;
    }

    if error_str.contains("nonce too low")
        || error_str.contains("already known")
        || error_str.contains("replacement transaction underpriced")
        || error_str.contains("transaction already imported")
    {
        return SendErrorClassification::PossiblySent;
    }

    if error_str.contains("malformed")
        || error_str.contains("gas limit")
        || error_str.contains("intrinsic gas too low")
    {
        return SendErrorClassification::DeterministicFailure;
    }

    if error_str.contains("oversized") {
        return SendErrorClassification::DeterministicFailureNonRetryable;
    }

    tracing::warn!(
        "Unknown send error: {}. Treating as possibly sent",
        error_str
    );

    // Assume the worst: a replacement at the same nonce is safe, a reused
    // nonce is not.
    SendErrorClassification::PossiblySent
}

pub fn should_trigger_nonce_reset(error: &RelayerError) -> bool {
    matches!(
        error.rpc_kind(),
        Some(RpcErrorKind::ErrorResp(response)) if response.message.to_lowercase().contains("nonce too high")
    )
}

pub fn is_retryable_rpc_error(kind: &RpcErrorKind) -> bool {
    match kind {
        RpcErrorKind::TransportHttpError { status, .. } if *status >= 400 && *status < 500 => {
            *status == 429
        }
        RpcErrorKind::UnsupportedFeature { .. } => false,
        RpcErrorKind::ErrorResp(resp) => {
            let message = resp.message.to_lowercase();
            !(message.contains("invalid chain") || message.contains("invalid opcode"))
        }
        _ => true,
    }
}

pub fn is_retryable_preparation_error(error: &WorkerError) -> bool {
    match error {
        WorkerError::RpcError { inner_error, .. } => match inner_error.rpc_kind() {
            Some(kind) => is_retryable_rpc_error(kind),
            None => false,
        },
        WorkerError::ChainServiceError { .. } => true,
        WorkerError::StoreError { inner_error, .. } => {
            matches!(inner_error, StoreError::RedisError { .. })
        }
        WorkerError::NonceError { inner_error, .. } => !matches!(
            inner_error,
            NonceError::CorruptedState { .. }
        ),
        // Both signing failures are retried within the send budget.
        WorkerError::SigningError { inner_error, .. } => matches!(
            inner_error,
            RelayerError::SigningUnavailable { .. } | RelayerError::SigningRejected { .. }
        ),
        WorkerError::PreparationFailed { .. }
        | WorkerError::TransactionSimulationFailed { .. }
        | WorkerError::TransactionBuildFailed { .. }
        | WorkerError::InternalError { .. } => false,
    }
}

/// Splits a gas estimation failure into "the call reverts" and "the node
/// could not answer".
pub fn classify_estimation_error(error: RelayerError) -> WorkerError {
    if let Some(RpcErrorKind::ErrorResp(response)) = error.rpc_kind() {
        let message = response.message.to_lowercase();
        if let Some(revert_data) = response.data.as_deref().filter(|data| data.len() > 4) {
            return WorkerError::TransactionSimulationFailed {
                message: format!(
                    "Transaction reverted during gas estimation: {} (revert: {revert_data})",
                    response.message
                ),
                inner_error: error,
            };
        }
        if message.contains("revert") {
            return WorkerError::TransactionSimulationFailed {
                message: format!(
                    "Transaction reverted during gas estimation: {}",
                    response.message
                ),
                inner_error: error,
            };
        }
        if message.contains("oversized") {
            return WorkerError::TransactionSimulationFailed {
                message: format!(
                    "Transaction data is oversized during gas estimation: {}",
                    response.message
                ),
                inner_error: error,
            };
        }
    }

    WorkerError::RpcError {
        message: format!("Gas estimation failed: {error}"),
        inner_error: error,
    }
}

#[cfg(test)]
mod tests {
    use relayer_core::error::RpcErrorResponse;

    use super::*;

    fn error_resp(message: &str) -> RelayerError {
        RelayerError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            message: message.to_string(),
            kind: RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: -32000,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    #[test]
    fn known_mempool_responses_count_as_possibly_sent() {
        for message in [
            "nonce too low",
            "already known",
            "replacement transaction underpriced",
            "Transaction already imported",
        ] {
            assert_eq!(
                classify_send_error(&error_resp(message)),
                SendErrorClassification::PossiblySent,
                "{message}"
            );
        }
    }

    #[test]
    fn rejections_are_deterministic() {
        assert_eq!(
            classify_send_error(&error_resp("insufficient funds for gas * price + value")),
            SendErrorClassification::DeterministicFailure
        );
        assert_eq!(
            classify_send_error(&error_resp("oversized data")),
            SendErrorClassification::DeterministicFailureNonRetryable
        );
    }

    #[test]
    fn transport_failures_never_reached_the_node() {
        let error = RelayerError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            message: "connection refused".to_string(),
            kind: RpcErrorKind::OtherTransportError {
                message: "connection refused".to_string(),
            },
        };
        assert_eq!(
            classify_send_error(&error),
            SendErrorClassification::DeterministicFailure
        );
    }

    #[test]
    fn estimation_reverts_are_not_retryable() {
        let error = classify_estimation_error(error_resp("execution reverted: not owner"));
        assert!(matches!(error, WorkerError::TransactionSimulationFailed { .. }));
        assert!(!is_retryable_preparation_error(&error));

        let error = classify_estimation_error(error_resp("header not found"));
        assert!(matches!(error, WorkerError::RpcError { .. }));
        assert!(is_retryable_preparation_error(&error));
    }

    #[test]
    fn signing_failures_are_retryable() {
        for inner_error in [
            RelayerError::SigningUnavailable {
                message: "kms timeout".to_string(),
            },
            RelayerError::SigningRejected {
                message: "policy".to_string(),
            },
        ] {
            let error = WorkerError::SigningError {
                message: inner_error.to_string(),
                inner_error,
            };
            assert!(is_retryable_preparation_error(&error), "{error}");
        }
    }
}
