use axum::{Json, http::StatusCode, response::IntoResponse};
use relayer_core::error::{RelayerError, RpcErrorKind};
use serde_json::json;

/// HTTP wrapper around [`RelayerError`].
#[derive(Debug)]
pub struct ApiRelayerError(pub RelayerError);

impl From<RelayerError> for ApiRelayerError {
    fn from(error: RelayerError) -> Self {
        ApiRelayerError(error)
    }
}

impl IntoResponse for ApiRelayerError {
    fn into_response(self) -> axum::response::Response {
        let code = self.status_code();

        self.with_status(code)
    }
}

impl ApiRelayerError {
    fn with_status(self, status: StatusCode) -> axum::response::Response {
        (
            status,
            Json(json!({
                "error": {
                    "message": self.0.to_string(),
                    "details": self.0
                }
            })),
        )
            .into_response()
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            RelayerError::RpcError { kind, .. } => match kind {
                RpcErrorKind::ErrorResp(_) | RpcErrorKind::NullResp => StatusCode::BAD_GATEWAY,
                RpcErrorKind::UnsupportedFeature { .. } => StatusCode::NOT_IMPLEMENTED,
                RpcErrorKind::TransportHttpError { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            RelayerError::RpcConfigError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayerError::UnsupportedChain { .. } => StatusCode::BAD_REQUEST,
            RelayerError::SigningUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayerError::SigningRejected { .. } => StatusCode::BAD_GATEWAY,
            RelayerError::AwsKmsSignerError { .. } => StatusCode::BAD_GATEWAY,
            RelayerError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
            RelayerError::Conflict { .. } => StatusCode::CONFLICT,
            RelayerError::ValidationError { .. } => StatusCode::BAD_REQUEST,
            RelayerError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub trait RelayerResult<T, E> {
    fn api_error(self) -> Result<T, ApiRelayerError>;
}

impl<T, E: Into<RelayerError>> RelayerResult<T, E> for Result<T, E> {
    fn api_error(self) -> Result<T, ApiRelayerError> {
        self.map_err(|e| ApiRelayerError(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (
                RelayerError::TransactionNotFound {
                    transaction_id: "x".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                RelayerError::ValidationError {
                    message: "bad".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                RelayerError::Conflict {
                    message: "stale".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                RelayerError::InternalError {
                    message: "boom".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(ApiRelayerError(error).status_code(), expected);
        }
    }
}
