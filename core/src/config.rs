use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RelayerError;

/// Process-wide pipeline settings. Replaced as a whole, never field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigSnapshot {
    /// Monotonic version. A snapshot only replaces one with a lower version.
    pub version: u64,
    pub send: SendConfig,
    pub confirm: ConfirmConfig,
    pub retry: RetryConfig,
    pub history: HistoryConfig,
    pub nonce: NonceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendConfig {
    pub concurrency: usize,
    /// Send tries before a transaction that never reached the mempool is
    /// marked errored.
    pub max_send_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfirmConfig {
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub concurrency: usize,
    pub pending_timeout_secs: u64,
    /// Total attempts, including the original broadcast.
    pub max_attempts: u32,
    pub gas_bump_percent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_gas_price_wei: Option<u128>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryConfig {
    pub max_transactions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NonceConfig {
    pub reconcile_interval_secs: u64,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            send: SendConfig::default(),
            confirm: ConfirmConfig::default(),
            retry: RetryConfig::default(),
            history: HistoryConfig::default(),
            nonce: NonceConfig::default(),
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            concurrency: 200,
            max_send_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self { concurrency: 200 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            pending_timeout_secs: 60,
            max_attempts: 5,
            gas_bump_percent: 20,
            max_gas_price_wei: None,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_transactions: 100_000,
        }
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 300,
        }
    }
}

impl SendConfig {
    /// Exponential backoff for the n-th failed send (1-based), capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(1 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl RetryConfig {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}

impl NonceConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl ConfigSnapshot {
    pub fn validate(&self) -> Result<(), RelayerError> {
        let invalid = |message: &str| {
            Err(RelayerError::ValidationError {
                message: message.to_string(),
            })
        };

        if self.send.concurrency == 0 || self.confirm.concurrency == 0 || self.retry.concurrency == 0
        {
            return invalid("concurrency limits must be greater than zero");
        }
        if self.send.max_send_attempts == 0 {
            return invalid("send.maxSendAttempts must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.maxAttempts must be greater than zero");
        }
        if self.retry.gas_bump_percent == 0 {
            return invalid("retry.gasBumpPercent must be greater than zero");
        }
        if self.history.max_transactions == 0 {
            return invalid("history.maxTransactions must be greater than zero");
        }
        Ok(())
    }
}
