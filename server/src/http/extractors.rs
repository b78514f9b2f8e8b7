use axum::{Json, extract::rejection::JsonRejection};
use relayer_core::error::RelayerError;

use crate::http::error::ApiRelayerError;

/// Custom JSON extractor that converts serde errors to ApiRelayerError
pub struct RelayerJson<T>(pub T);

impl<T, S> axum::extract::FromRequest<S> for RelayerJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiRelayerError;

    async fn from_request(req: axum::extract::Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(data)) => Ok(RelayerJson(data)),
            Err(rejection) => {
                let message = match rejection {
                    JsonRejection::JsonDataError(err) => format!("Invalid JSON data: {}", err),
                    JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
                    JsonRejection::MissingJsonContentType(_) => {
                        "Missing or invalid Content-Type header. Expected application/json"
                            .to_string()
                    }
                    JsonRejection::BytesRejection(err) => {
                        format!("Failed to read request body: {}", err)
                    }
                    _ => "Invalid JSON request".to_string(),
                };

                Err(ApiRelayerError(RelayerError::ValidationError { message }))
            }
        }
    }
}
