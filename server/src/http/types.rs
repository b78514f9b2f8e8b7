use relayer_core::error::RelayerError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse<T> {
    pub result: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(result: T) -> Self {
        Self { result }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse<E = RelayerError> {
    pub error: ErrorResponseInner<E>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponseInner<E = RelayerError> {
    pub message: String,
    pub details: E,
}
