use std::env;

use alloy::primitives::Address;
use config::{Config, File};
use relayer_core::{config::ConfigSnapshot, credentials::SigningCredential, signer::WalletRecord};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerServerConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub wallets: Vec<WalletConfig>,
    /// Pipeline settings published on first start. Ignored once a snapshot
    /// is stored.
    #[serde(default)]
    pub relayer: ConfigSnapshot,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix for every key and channel this deployment writes.
    pub namespace: Option<String>,
    pub send_polling_interval_ms: u64,
    pub confirm_polling_interval_ms: u64,
    pub retry_polling_interval_ms: u64,
    pub prune_polling_interval_ms: u64,
    pub claim_lease_secs: u64,
    /// Hard ceiling on in-flight sends in this process.
    pub max_send_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub address: Address,
    #[serde(flatten)]
    pub credential: WalletCredentialConfig,
}

/// Key material as written in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletCredentialConfig {
    Local {
        private_key: String,
    },
    AwsKms {
        access_key_id: String,
        secret_access_key: String,
        key_id: String,
        region: String,
    },
}

impl From<WalletConfig> for WalletRecord {
    fn from(wallet: WalletConfig) -> Self {
        let credential = match wallet.credential {
            WalletCredentialConfig::Local { private_key } => SigningCredential::Local { private_key },
            WalletCredentialConfig::AwsKms {
                access_key_id,
                secret_access_key,
                key_id,
                region,
            } => SigningCredential::AwsKms(relayer_core::credentials::AwsKmsCredential {
                access_key_id,
                secret_access_key,
                key_id,
                region,
            }),
        };

        WalletRecord {
            address: wallet.address,
            credential,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".into(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            send_polling_interval_ms: 100,
            confirm_polling_interval_ms: 1_000,
            retry_polling_interval_ms: 1_000,
            prune_polling_interval_ms: 60_000,
            claim_lease_secs: 60,
            max_send_concurrency: 1_000,
        }
    }
}

pub fn get_config() -> RelayerServerConfig {
    let base_path = env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join("configuration");

    // Detect the running environment
    let environment: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT");

    let environment_filename = format!("server_{}.yaml", environment.as_str());

    let config = Config::builder()
        .add_source(File::from(configuration_directory.join("server_base.yaml")))
        .add_source(File::from(configuration_directory.join(environment_filename)).required(false))
        .add_source(config::Environment::with_prefix("app").separator("__"))
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Configuration error: {}", e);
            panic!("Failed to build configuration");
        });

    config
        .try_deserialize::<RelayerServerConfig>()
        .unwrap_or_else(|e| {
            eprintln!("Configuration error: {}", e);
            eprintln!("Make sure all required fields are set correctly in your configuration files or environment variables.");
            panic!("Failed to deserialize configuration");
        })
}

/// The possible runtime environment for our application.
pub enum Environment {
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local`, `development`, or `production`.",
                other
            )),
        }
    }
}
