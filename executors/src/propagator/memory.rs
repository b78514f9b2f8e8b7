use arc_swap::{ArcSwap, ArcSwapOption};
use futures::{StreamExt, stream::BoxStream};
use relayer_core::config::ConfigSnapshot;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::propagator::{ConfigSource, PropagatorError};

const CHANNEL_CAPACITY: usize = 64;

/// Process-local config source. Notifications go over a broadcast channel
/// that tests can sever to simulate a lost subscription.
pub struct InMemoryConfigSource {
    stored: ArcSwapOption<ConfigSnapshot>,
    notifier: ArcSwap<broadcast::Sender<u64>>,
}

impl Default for InMemoryConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            stored: ArcSwapOption::empty(),
            notifier: ArcSwap::from_pointee(sender),
        }
    }

    /// End every open subscription. Subscribers see their stream close and
    /// must resubscribe.
    pub fn disconnect_subscribers(&self) {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.notifier.store(std::sync::Arc::new(sender));
    }

    pub fn subscriber_count(&self) -> usize {
        self.notifier.load().receiver_count()
    }
}

impl ConfigSource for InMemoryConfigSource {
    async fn load(&self) -> Result<Option<ConfigSnapshot>, PropagatorError> {
        Ok(self.stored.load_full().map(|snapshot| (*snapshot).clone()))
    }

    async fn publish(&self, snapshot: &ConfigSnapshot) -> Result<(), PropagatorError> {
        let candidate = std::sync::Arc::new(snapshot.clone());
        let previous = self.stored.rcu(|current| match current {
            Some(existing) if existing.version >= candidate.version => Some(existing.clone()),
            _ => Some(candidate.clone()),
        });

        if let Some(existing) = previous {
            if existing.version >= snapshot.version {
                return Err(PropagatorError::VersionConflict {
                    version: snapshot.version,
                    stored: existing.version,
                });
            }
        }

        // No receivers is not an error; late subscribers resync on connect.
        let _ = self.notifier.load().send(snapshot.version);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, u64>, PropagatorError> {
        let receiver = self.notifier.load().subscribe();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(version) => Some((version, receiver)),
                // Missed notifications still warrant a reload.
                Err(RecvError::Lagged(_)) => Some((0, receiver)),
                Err(RecvError::Closed) => None,
            }
        });

        Ok(stream.boxed())
    }
}
