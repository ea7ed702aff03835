//! Periodic idle sweep

use crate::registry::TunnelRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run [`TunnelRegistry::sweep_idle`] every `sweep_interval` until `shutdown`
/// is cancelled
pub fn spawn_sweeper(registry: Arc<TunnelRegistry>, shutdown: CancellationToken) -> JoinHandle<()> {
    let period = registry.config().sweep_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Idle sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = registry.sweep_idle();
                    if !report.is_empty() {
                        info!(
                            "Idle sweep reaped {} sessions and {} connections",
                            report.sessions,
                            report.connections
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use burrow_auth::{StaticAuthenticator, UserEntry};
    use burrow_proto::TunnelService;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweeper_reaps_idle_session() {
        let config = RegistryConfig {
            session_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
            ..RegistryConfig::default()
        };
        let auth = StaticAuthenticator::new(vec![UserEntry::with_password("alice", "pw")]);
        let registry = Arc::new(TunnelRegistry::new(config, Arc::new(auth)));
        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(registry.clone(), shutdown.clone());

        registry.login("alice", "pw").await.unwrap();
        assert_eq!(registry.session_count(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(registry.session_count(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
