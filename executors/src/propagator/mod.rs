use std::{future::Future, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use futures::{StreamExt, stream::BoxStream};
use relayer_core::{config::ConfigSnapshot, error::RelayerError};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::shutdown::{NamedWorker, WorkerHandle};

pub mod memory;
pub mod redis;

pub use memory::InMemoryConfigSource;
pub use redis::RedisConfigSource;

#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum PropagatorError {
    #[error("Config version {version} is not newer than stored version {stored}")]
    VersionConflict { version: u64, stored: u64 },

    #[error("Invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

impl From<::redis::RedisError> for PropagatorError {
    fn from(error: ::redis::RedisError) -> Self {
        PropagatorError::RedisError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for PropagatorError {
    fn from(error: serde_json::Error) -> Self {
        PropagatorError::SerializationError {
            message: error.to_string(),
        }
    }
}

impl From<PropagatorError> for RelayerError {
    fn from(error: PropagatorError) -> Self {
        match error {
            PropagatorError::VersionConflict { .. } => RelayerError::Conflict {
                message: error.to_string(),
            },
            PropagatorError::InvalidConfig { message } => RelayerError::ValidationError { message },
            _ => RelayerError::InternalError {
                message: error.to_string(),
            },
        }
    }
}

/// The process's current config. Readers get an immutable snapshot and
/// never observe a partially applied update.
#[derive(Clone)]
pub struct LiveConfig {
    inner: Arc<ArcSwap<ConfigSnapshot>>,
}

impl LiveConfig {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    pub fn version(&self) -> u64 {
        self.inner.load().version
    }

    /// Swap in `snapshot` if it is newer than the current one. Returns
    /// whether it was applied.
    pub fn apply(&self, snapshot: ConfigSnapshot) -> bool {
        let candidate = Arc::new(snapshot);
        let previous = self.inner.rcu(|current| {
            if candidate.version > current.version {
                candidate.clone()
            } else {
                current.clone()
            }
        });
        previous.version < candidate.version
    }
}

/// Shared, durable home of the authoritative snapshot plus a best-effort
/// change feed. Notifications can be lost; the stored snapshot cannot.
pub trait ConfigSource: Send + Sync + 'static {
    fn load(&self) -> impl Future<Output = Result<Option<ConfigSnapshot>, PropagatorError>> + Send;

    /// Store `snapshot` and notify subscribers. Rejected unless its version
    /// is above the stored one.
    fn publish(
        &self,
        snapshot: &ConfigSnapshot,
    ) -> impl Future<Output = Result<(), PropagatorError>> + Send;

    /// Stream of published versions. Ends when the subscription is lost.
    fn subscribe(
        &self,
    ) -> impl Future<Output = Result<BoxStream<'static, u64>, PropagatorError>> + Send;
}

#[derive(Debug, Clone)]
pub struct PropagatorOptions {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for PropagatorOptions {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Keeps a [`LiveConfig`] in step with a [`ConfigSource`].
///
/// Every (re)subscription is followed by an unconditional reload, so a
/// notification missed while disconnected is recovered from the stored
/// snapshot.
pub struct ConfigPropagator<S> {
    source: Arc<S>,
    live: LiveConfig,
    options: PropagatorOptions,
}

impl<S: ConfigSource> ConfigPropagator<S> {
    pub fn new(source: Arc<S>, live: LiveConfig, options: PropagatorOptions) -> Self {
        Self {
            source,
            live,
            options,
        }
    }

    pub fn live(&self) -> &LiveConfig {
        &self.live
    }

    pub async fn reload(&self) -> Result<bool, PropagatorError> {
        let Some(snapshot) = self.source.load().await? else {
            return Ok(false);
        };

        let version = snapshot.version;
        let applied = self.live.apply(snapshot);
        if applied {
            tracing::info!(version, "Applied config snapshot");
        }
        Ok(applied)
    }

    /// Publish `snapshot` as the next version after the stored one, then
    /// apply it locally. Other processes pick it up from the change feed or
    /// their next resync.
    pub async fn publish_next(&self, mut snapshot: ConfigSnapshot) -> Result<ConfigSnapshot, PropagatorError> {
        snapshot
            .validate()
            .map_err(|e| PropagatorError::InvalidConfig {
                message: e.to_string(),
            })?;

        let stored = self.source.load().await?.map(|s| s.version).unwrap_or(0);
        snapshot.version = stored.max(self.live.version()) + 1;

        self.source.publish(&snapshot).await?;
        self.live.apply(snapshot.clone());

        tracing::info!(version = snapshot.version, "Published config snapshot");
        Ok(snapshot)
    }

    pub fn spawn(self: Arc<Self>) -> WorkerHandle<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let propagator = self.clone();

        let join_handle = tokio::spawn(
            async move { propagator.run(shutdown_rx).await }
                .instrument(tracing::info_span!("config_propagator")),
        );

        WorkerHandle {
            join_handle,
            shutdown_tx,
            worker: self,
        }
    }

    async fn run(&self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), RelayerError> {
        let mut failures: u32 = 0;

        loop {
            match self.follow(&mut shutdown_rx).await {
                FollowOutcome::Shutdown => break,
                FollowOutcome::Disconnected => {
                    failures = 0;
                    tracing::warn!("Config subscription lost, resubscribing");
                }
                FollowOutcome::Failed(error) => {
                    failures = failures.saturating_add(1);
                    tracing::error!(error = %error, failures, "Config subscription failed");
                }
            }

            let delay = self.reconnect_delay(failures);
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Config propagator shut down");
        Ok(())
    }

    async fn follow(&self, shutdown_rx: &mut oneshot::Receiver<()>) -> FollowOutcome {
        let mut notifications = match self.source.subscribe().await {
            Ok(stream) => stream,
            Err(e) => return FollowOutcome::Failed(e),
        };

        if let Err(e) = self.reload().await {
            return FollowOutcome::Failed(e);
        }

        loop {
            tokio::select! {
                _ = &mut *shutdown_rx => return FollowOutcome::Shutdown,
                notification = notifications.next() => match notification {
                    Some(version) => {
                        tracing::debug!(version, "Config change notification");
                        if let Err(e) = self.reload().await {
                            tracing::error!(error = %e, "Failed to reload config after notification");
                        }
                    }
                    None => return FollowOutcome::Disconnected,
                },
            }
        }
    }

    fn reconnect_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(6);
        self.options
            .reconnect_base_delay
            .saturating_mul(1 << exponent)
            .min(self.options.reconnect_max_delay)
    }
}

impl<S: ConfigSource> NamedWorker for ConfigPropagator<S> {
    fn name(&self) -> &str {
        "config_propagator"
    }
}

enum FollowOutcome {
    Shutdown,
    Disconnected,
    Failed(PropagatorError),
}
