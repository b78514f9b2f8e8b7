use relayer_core::error::RelayerError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::TransactionStatus;

#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum StoreError {
    #[error("Transaction {transaction_id} not found")]
    NotFound { transaction_id: Uuid },

    #[error("Transaction {transaction_id} is {actual:?}, expected {expected:?}")]
    StaleState {
        transaction_id: Uuid,
        expected: TransactionStatus,
        actual: TransactionStatus,
    },

    #[error("Transition {from:?} -> {to:?} is not allowed for transaction {transaction_id}")]
    InvalidTransition {
        transaction_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error(
        "Transaction {transaction_id} has {actual} attempts, expected {expected} when appending"
    )]
    AttemptConflict {
        transaction_id: Uuid,
        expected: usize,
        actual: usize,
    },

    #[error("Transaction {transaction_id} is claimed by another worker ({worker_id})")]
    ClaimConflict {
        transaction_id: Uuid,
        worker_id: String,
    },

    #[error("Transaction {transaction_id} is missing {field} for this operation")]
    MissingField {
        transaction_id: Uuid,
        field: String,
    },

    #[error("Nonce mismatch for transaction {transaction_id}: record has {expected:?}, got {actual}")]
    NonceMismatch {
        transaction_id: Uuid,
        expected: Option<u64>,
        actual: u64,
    },

    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl StoreError {
    /// Errors that mean another worker got to the record first. The caller
    /// skips the record instead of retrying.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            StoreError::StaleState { .. }
                | StoreError::AttemptConflict { .. }
                | StoreError::ClaimConflict { .. }
        )
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        StoreError::RedisError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::SerializationError {
            message: error.to_string(),
        }
    }
}

impl From<StoreError> for RelayerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { transaction_id } => RelayerError::TransactionNotFound {
                transaction_id: transaction_id.to_string(),
            },
            StoreError::StaleState { .. }
            | StoreError::InvalidTransition { .. }
            | StoreError::AttemptConflict { .. }
            | StoreError::ClaimConflict { .. } => RelayerError::Conflict {
                message: error.to_string(),
            },
            _ => RelayerError::InternalError {
                message: error.to_string(),
            },
        }
    }
}
