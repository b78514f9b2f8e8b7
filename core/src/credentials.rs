use alloy::{primitives::ChainId, signers::local::PrivateKeySigner};
use alloy_signer_aws::AwsSigner;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_kms::config::{Credentials, ProvideCredentials};
use serde::{Deserialize, Serialize};

use crate::error::RelayerError;

/// How a backend wallet's key is reached. Selected by the wallet record type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SigningCredential {
    #[serde(rename_all = "camelCase")]
    Local { private_key: String },
    AwsKms(AwsKmsCredential),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsKmsCredential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub key_id: String,
    pub region: String,
}

impl ProvideCredentials for AwsKmsCredential {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        let credentials = Credentials::new(
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            None,
            None,
            "relayer-core",
        );
        ProvideCredentialsFuture::ready(Ok(credentials))
    }
}

impl AwsKmsCredential {
    pub async fn get_signer(&self, chain_id: Option<ChainId>) -> Result<AwsSigner, RelayerError> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(self.clone())
            .region(aws_config::Region::new(self.region.clone()))
            .load()
            .await;
        let client = aws_sdk_kms::Client::new(&config);

        let signer = AwsSigner::new(client, self.key_id.clone(), chain_id).await?;
        Ok(signer)
    }
}

impl SigningCredential {
    pub fn local_signer(private_key: &str) -> Result<PrivateKeySigner, RelayerError> {
        private_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| RelayerError::SigningRejected {
                message: format!("Invalid local private key: {e}"),
            })
    }
}
