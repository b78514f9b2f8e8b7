use futures::{StreamExt, stream::BoxStream};
use redis::{AsyncCommands, aio::ConnectionManager};
use relayer_core::config::ConfigSnapshot;

use crate::propagator::{ConfigSource, PropagatorError};

/// Stores the snapshot and announces its version in one step, refusing
/// anything that is not newer than what is stored.
const PUBLISH_SCRIPT: &str = r#"
local snapshot_key = KEYS[1]

local snapshot = ARGV[1]
local version = tonumber(ARGV[2])
local channel = ARGV[3]

local current = redis.call('GET', snapshot_key)
if current then
    local stored = tonumber(cjson.decode(current).version) or 0
    if stored >= version then
        return {0, stored}
    end
end

redis.call('SET', snapshot_key, snapshot)
redis.call('PUBLISH', channel, ARGV[2])
return {1, version}
"#;

/// Config source backed by a Redis key plus a pub/sub channel carrying the
/// published version.
#[derive(Clone)]
pub struct RedisConfigSource {
    client: redis::Client,
    redis: ConnectionManager,
    namespace: Option<String>,
    publish_script: redis::Script,
}

impl RedisConfigSource {
    pub fn new(client: redis::Client, redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self {
            client,
            redis,
            namespace,
            publish_script: redis::Script::new(PUBLISH_SCRIPT),
        }
    }

    pub fn snapshot_key_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:relayer:config"),
            None => "relayer:config".to_string(),
        }
    }

    pub fn channel_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:relayer:config:changes"),
            None => "relayer:config:changes".to_string(),
        }
    }
}

impl ConfigSource for RedisConfigSource {
    async fn load(&self) -> Result<Option<ConfigSnapshot>, PropagatorError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.snapshot_key_name()).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn publish(&self, snapshot: &ConfigSnapshot) -> Result<(), PropagatorError> {
        let (published, stored): (i64, u64) = self
            .publish_script
            .key(self.snapshot_key_name())
            .arg(serde_json::to_string(snapshot)?)
            .arg(snapshot.version)
            .arg(self.channel_name())
            .invoke_async(&mut self.redis.clone())
            .await?;

        if published == 0 {
            return Err(PropagatorError::VersionConflict {
                version: snapshot.version,
                stored,
            });
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, u64>, PropagatorError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel_name()).await?;

        tracing::debug!(channel = self.channel_name(), "Subscribed to config changes");

        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<u64>().unwrap_or_default())
            .boxed())
    }
}
