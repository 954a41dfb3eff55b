//! Periodic cluster ping to the backend

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, ClusterPing, PingRequest};

/// Default interval between pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Sends a liveness ping on a fixed interval until cancelled
pub struct Pinger {
    backend: Arc<dyn BackendClient>,
    cluster_id: i64,
    request: PingRequest,
    interval: Duration,
}

impl Pinger {
    /// Create a pinger for `cluster_id`
    pub fn new(
        backend: Arc<dyn BackendClient>,
        cluster_id: i64,
        cluster: ClusterPing,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            cluster_id,
            request: PingRequest { cluster },
            interval,
        }
    }

    /// Ping immediately, then once per interval. Failures are logged.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(cluster_id = self.cluster_id, interval = ?self.interval, "pinger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.backend.ping(self.cluster_id, &self.request).await {
                        Ok(()) => debug!(cluster_id = self.cluster_id, "ping ok"),
                        Err(e) => warn!(cluster_id = self.cluster_id, error = %e, "ping failed"),
                    }
                }
            }
        }
        info!("pinger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackendClient;
    use crate::error::StreamError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_ping_is_immediate_and_failures_continue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut backend = MockBackendClient::new();
        backend
            .expect_ping()
            .withf(|id, req| *id == 42 && req.cluster.region == "eu-west-1")
            .returning(move |_, _| {
                // every other ping fails; the loop must keep going
                if c.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    Err(StreamError::Backend("503".to_string()))
                } else {
                    Ok(())
                }
            });

        let pinger = Pinger::new(
            Arc::new(backend),
            42,
            ClusterPing {
                region: "eu-west-1".to_string(),
                ..Default::default()
            },
            Duration::from_millis(40),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pinger.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(calls.load(Ordering::SeqCst) >= 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_pinger_exits() {
        let mut backend = MockBackendClient::new();
        backend.expect_ping().returning(|_, _| Ok(()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        Pinger::new(
            Arc::new(backend),
            1,
            ClusterPing::default(),
            DEFAULT_PING_INTERVAL,
        )
        .run(cancel)
        .await;
    }
}
