use std::fmt::Debug;

use alloy::transports::{RpcError as AlloyRpcError, TransportErrorKind};
use alloy_signer_aws::AwsSignerError;
use aws_sdk_kms::error::SdkError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ChainClient;

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// Server returned an error response.
    #[error("server returned an error response: {0}")]
    ErrorResp(RpcErrorResponse),

    /// Server returned a null response when a non-null response was expected.
    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    /// Rpc server returned an unsupported feature.
    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// Returned when a local pre-processing step fails.
    #[error("local usage error: {message}")]
    InternalError { message: String },

    #[error("serialization error: {message}")]
    SerError { message: String },

    #[error("deserialization error: {message}, text: {text}")]
    DeserError { message: String, text: String },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("Other transport error: {message}")]
    OtherTransportError { message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcErrorResponse {
    /// The error code.
    pub code: i64,
    /// The error message (if any).
    pub message: String,
    /// The error data (if any).
    pub data: Option<String>,
}

impl std::fmt::Display for RpcErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, ", data: {data}")?;
        }
        Ok(())
    }
}

impl RpcErrorKind {
    /// True when the node answered with a JSON-RPC error, as opposed to the
    /// request failing somewhere on the way.
    pub fn is_error_resp(&self) -> bool {
        matches!(self, RpcErrorKind::ErrorResp(_))
    }
}

#[derive(Error, Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum RelayerError {
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },

    #[error("Unsupported chain: {chain_id}")]
    UnsupportedChain { chain_id: u64 },

    #[error("Signing backend unavailable: {message}")]
    #[serde(rename_all = "camelCase")]
    SigningUnavailable { message: String },

    #[error("Signing rejected: {message}")]
    #[serde(rename_all = "camelCase")]
    SigningRejected { message: String },

    #[error(transparent)]
    #[serde(rename_all = "camelCase")]
    AwsKmsSignerError {
        error: SerialisableAwsSignerError,
    },

    #[error("Transaction not found: {transaction_id}")]
    #[serde(rename_all = "camelCase")]
    TransactionNotFound { transaction_id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

#[derive(thiserror::Error, Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum SerialisableAwsSdkError {
    /// The request failed during construction. It was not dispatched over the network.
    #[error("Construction failure: {message}")]
    ConstructionFailure { message: String },

    /// The request failed due to a timeout. The request MAY have been sent and received.
    #[error("Timeout error: {message}")]
    TimeoutError { message: String },

    /// The request failed during dispatch. An HTTP response was not received.
    #[error("Dispatch failure: {message}")]
    DispatchFailure { message: String },

    #[error("Response error: {message}")]
    ResponseError { message: String },

    /// An error response was received from the service
    #[error("Service error: {message}")]
    ServiceError { message: String },

    #[error("Other error: {message}")]
    Other { message: String },
}

impl SerialisableAwsSdkError {
    /// Construction failures and service errors are answers from KMS itself;
    /// everything else means the backend could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            SerialisableAwsSdkError::TimeoutError { .. }
                | SerialisableAwsSdkError::DispatchFailure { .. }
                | SerialisableAwsSdkError::ResponseError { .. }
        )
    }
}

#[derive(Error, Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum SerialisableAwsSignerError {
    /// Thrown when the AWS KMS API returns a signing error.
    #[error(transparent)]
    Sign {
        aws_sdk_error: SerialisableAwsSdkError,
    },

    /// Thrown when the AWS KMS API returns an error.
    #[error(transparent)]
    GetPublicKey {
        aws_sdk_error: SerialisableAwsSdkError,
    },

    #[error("ECDSA error: {message}")]
    K256 { message: String },

    #[error("SPKI error: {message}")]
    Spki { message: String },

    #[error("Hex error: {message}")]
    Hex { message: String },

    #[error("signature not found in response")]
    SignatureNotFound,

    #[error("public key not found in response")]
    PublicKeyNotFound,

    #[error("Unknown error: {message}")]
    Unknown { message: String },

    #[error("Signature recovery failed")]
    SignatureRecoveryFailed,
}

impl<T: Debug> From<SdkError<T>> for SerialisableAwsSdkError {
    fn from(err: SdkError<T>) -> Self {
        match err {
            SdkError::ConstructionFailure(err) => SerialisableAwsSdkError::ConstructionFailure {
                message: format!("{err:?}"),
            },
            SdkError::TimeoutError(err) => SerialisableAwsSdkError::TimeoutError {
                message: format!("{err:?}"),
            },
            SdkError::DispatchFailure(err) => SerialisableAwsSdkError::DispatchFailure {
                message: format!("{err:?}"),
            },
            SdkError::ResponseError(err) => SerialisableAwsSdkError::ResponseError {
                message: format!("{err:?}"),
            },
            SdkError::ServiceError(err) => SerialisableAwsSdkError::ServiceError {
                message: format!("{err:?}"),
            },
            _ => SerialisableAwsSdkError::Other {
                message: format!("{err:?}"),
            },
        }
    }
}

impl From<AwsSignerError> for RelayerError {
    fn from(err: AwsSignerError) -> Self {
        let error = match err {
            AwsSignerError::Sign(err) => SerialisableAwsSignerError::Sign {
                aws_sdk_error: err.into(),
            },
            AwsSignerError::GetPublicKey(err) => SerialisableAwsSignerError::GetPublicKey {
                aws_sdk_error: err.into(),
            },
            AwsSignerError::K256(err) => SerialisableAwsSignerError::K256 {
                message: err.to_string(),
            },
            AwsSignerError::Spki(err) => SerialisableAwsSignerError::Spki {
                message: err.to_string(),
            },
            AwsSignerError::Hex(err) => SerialisableAwsSignerError::Hex {
                message: err.to_string(),
            },
            AwsSignerError::SignatureNotFound => SerialisableAwsSignerError::SignatureNotFound,
            AwsSignerError::PublicKeyNotFound => SerialisableAwsSignerError::PublicKeyNotFound,
            AwsSignerError::SignatureRecoveryFailed => {
                SerialisableAwsSignerError::SignatureRecoveryFailed
            }
        };
        RelayerError::AwsKmsSignerError { error }
    }
}

impl RelayerError {
    /// Collapses any signing-related failure into the two outcomes the
    /// pipeline distinguishes. KMS transport failures are "unavailable",
    /// anything KMS actually answered is "rejected".
    pub fn into_signing_error(self) -> RelayerError {
        match self {
            RelayerError::SigningUnavailable { .. } | RelayerError::SigningRejected { .. } => self,
            RelayerError::AwsKmsSignerError { error } => match &error {
                SerialisableAwsSignerError::Sign { aws_sdk_error }
                | SerialisableAwsSignerError::GetPublicKey { aws_sdk_error }
                    if aws_sdk_error.is_unreachable() =>
                {
                    RelayerError::SigningUnavailable {
                        message: error.to_string(),
                    }
                }
                _ => RelayerError::SigningRejected {
                    message: error.to_string(),
                },
            },
            other => RelayerError::SigningUnavailable {
                message: other.to_string(),
            },
        }
    }

    pub fn rpc_kind(&self) -> Option<&RpcErrorKind> {
        match self {
            RelayerError::RpcError { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

pub fn to_relayer_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
            message: feature.to_string(),
        },
        AlloyRpcError::LocalUsageError(err) => RpcErrorKind::InternalError {
            message: err.to_string(),
        },
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(err) => match err {
            TransportErrorKind::HttpError(err) => RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            },
            _ => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
        },
    }
}

pub trait AlloyRpcErrorToRelayerError {
    fn to_relayer_error(&self, chain: &impl ChainClient) -> RelayerError;
}

impl AlloyRpcErrorToRelayerError for AlloyRpcError<TransportErrorKind> {
    fn to_relayer_error(&self, chain: &impl ChainClient) -> RelayerError {
        RelayerError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url(),
            message: self.to_string(),
            kind: to_relayer_rpc_error_kind(self),
        }
    }
}

impl From<serde_json::Error> for RelayerError {
    fn from(error: serde_json::Error) -> Self {
        RelayerError::InternalError {
            message: format!("Serialization error: {error}"),
        }
    }
}
