// Background eviction of idle sessions

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::proxy::session::SessionRegistry;

/// Periodic sweep task. One tick enumerates the registry and deletes every
/// session idle past the configured timeout. The task has no caller waiting
/// on it; a failing tick is logged and the loop keeps running.
pub struct SessionSweeper {
    registry: Arc<SessionRegistry>,
    cleanup_interval: u64,
}

impl SessionSweeper {
    pub fn new(registry: Arc<SessionRegistry>, cleanup_interval: u64) -> Self {
        Self {
            registry,
            cleanup_interval,
        }
    }

    /// Run one sweep against the given timestamp. Split out from the timer
    /// loop so tests can drive it synchronously with an injected clock.
    pub async fn sweep_once(&self, now: i64) -> usize {
        let evicted = self.registry.sweep_expired(now).await;
        if evicted > 0 {
            tracing::info!(
                "Sweep evicted {} expired session(s), {} remaining",
                evicted,
                self.registry.len()
            );
        }
        evicted
    }

    /// Spawn the timer loop. Runs until the handle is aborted at shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.cleanup_interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of tokio's interval fires immediately
            ticker.tick().await;

            tracing::info!(
                "Session sweeper started (interval {}s)",
                self.cleanup_interval
            );

            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp();
                self.sweep_once(now).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_once_with_injected_clock() {
        let registry = Arc::new(SessionRegistry::new(600, false));
        let id = registry
            .create("127.0.0.1".into(), None, Default::default())
            .await;

        let sweeper = SessionSweeper::new(registry.clone(), 300);

        let now = chrono::Utc::now().timestamp();
        // Just inside the timeout: survives
        assert_eq!(sweeper.sweep_once(now + 600).await, 0);
        assert!(registry.get_info(&id).await.is_ok());

        // Past the timeout: evicted
        assert_eq!(sweeper.sweep_once(now + 601).await, 1);
        assert!(registry.get_info(&id).await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_on_empty_registry_is_noop() {
        let registry = Arc::new(SessionRegistry::new(600, false));
        let sweeper = SessionSweeper::new(registry, 300);
        let now = chrono::Utc::now().timestamp();
        assert_eq!(sweeper.sweep_once(now).await, 0);
    }
}
