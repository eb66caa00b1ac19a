//! Expiry sweeper
//!
//! Periodically reclaims instances whose lease has ended. An instance is gone
//! from the router at most one sweep interval after its `expires_at`.

use crate::registry::InstanceStatus;
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids fully reclaimed
    pub reclaimed: Vec<String>,
    /// Ids whose teardown reported an error, retried next sweep if still present
    pub failed: Vec<String>,
}

pub struct Sweeper {
    supervisor: Arc<Supervisor>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(supervisor: Arc<Supervisor>, interval: Duration) -> Self {
        Self { supervisor, interval }
    }

    /// Reclaim every instance whose lease ended at or before `now`
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let registry = self.supervisor.registry();
        let mut report = SweepReport::default();

        for id in registry.scan_expired(now) {
            // Earlier teardowns may have taken a while, so the lease is
            // checked again against the current record
            let due = match registry.get(&id).map(|r| r.status) {
                Some(InstanceStatus::Live) => match registry.expire_if_due(&id, now) {
                    Ok(due) => due,
                    Err(e) => {
                        debug!(app_id = %id, error = %e, "Instance changed state during sweep");
                        false
                    }
                },
                Some(InstanceStatus::Expired | InstanceStatus::Failed) => true,
                Some(InstanceStatus::Creating) | None => false,
            };
            if !due {
                debug!(app_id = %id, "Instance no longer due for reclaim, skipped");
                continue;
            }

            match self.supervisor.stop(&id).await {
                Ok(()) => report.reclaimed.push(id),
                Err(e) => {
                    warn!(app_id = %id, error = %e, "Failed to reclaim expired instance");
                    report.failed.push(id);
                }
            }
        }

        if !report.reclaimed.is_empty() || !report.failed.is_empty() {
            info!(
                reclaimed = report.reclaimed.len(),
                failed = report.failed.len(),
                remaining = registry.len(),
                "Expiry sweep finished"
            );
        }

        report
    }

    /// Sweep every interval until shutdown
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Expiry sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once(Utc::now()).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::ports::PortAllocator;
    use crate::registry::Registry;
    use crate::site::AppContent;

    fn create_test_supervisor() -> Arc<Supervisor> {
        create_test_supervisor_with_grace(1)
    }

    fn create_test_supervisor_with_grace(drain_grace_secs: u64) -> Arc<Supervisor> {
        let start = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = InstanceConfig {
            drain_grace_secs,
            ..InstanceConfig::default()
        };
        Supervisor::new(
            Arc::new(Registry::new()),
            Arc::new(PortAllocator::new(start, 4)),
            config,
            3,
        )
    }

    fn hello() -> AppContent {
        AppContent {
            markup: "<h1>Hi</h1>".to_string(),
            ..AppContent::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_only() {
        let supervisor = create_test_supervisor();
        let soon = Utc::now() + chrono::Duration::seconds(2);
        let port = supervisor
            .create_with_expiry("short", &hello(), Some(soon))
            .await
            .unwrap();
        supervisor.create("long", &hello()).await.unwrap();

        let sweeper = Sweeper::new(Arc::clone(&supervisor), Duration::from_secs(60));

        let report = sweeper.sweep_once(Utc::now()).await;
        assert!(report.reclaimed.is_empty());
        assert_eq!(supervisor.registry().len(), 2);

        let report = sweeper.sweep_once(soon + chrono::Duration::seconds(1)).await;
        assert_eq!(report.reclaimed, vec!["short"]);
        assert!(report.failed.is_empty());
        assert!(supervisor.registry().get("short").is_none());
        assert!(supervisor.ports().lessee(port).is_none());
        assert!(supervisor.registry().get("long").is_some());

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_lease_extended_during_sweep_is_kept() {
        use tokio::io::AsyncWriteExt;

        let supervisor = create_test_supervisor_with_grace(2);
        let soon = Utc::now() + chrono::Duration::seconds(2);
        let port_a = supervisor
            .create_with_expiry("a", &hello(), Some(soon))
            .await
            .unwrap();
        supervisor
            .create_with_expiry("b", &hello(), Some(soon))
            .await
            .unwrap();

        // A half-sent request keeps the drain of `a` busy
        let mut held = tokio::net::TcpStream::connect(("127.0.0.1", port_a)).await.unwrap();
        held.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sweeper = Sweeper::new(Arc::clone(&supervisor), Duration::from_secs(60));
        let sweep = tokio::spawn(async move { sweeper.sweep_once(soon + chrono::Duration::seconds(1)).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!sweep.is_finished());
        let until = Utc::now() + chrono::Duration::hours(1);
        supervisor.extend("b", Some(until)).unwrap();

        let report = sweep.await.unwrap();
        assert_eq!(report.reclaimed, vec!["a"]);
        let record = supervisor.registry().get("b").unwrap();
        assert_eq!(record.status, InstanceStatus::Live);
        assert_eq!(record.expires_at, until);
        assert!(supervisor.registry().get("a").is_none());

        drop(held);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_sweep_removes_failed_records() {
        let supervisor = create_test_supervisor();
        let now = Utc::now();
        supervisor
            .registry()
            .reserve("broken", now, now + chrono::Duration::seconds(1), 5)
            .unwrap();
        supervisor
            .registry()
            .update_status("broken", InstanceStatus::Failed)
            .unwrap();

        let sweeper = Sweeper::new(Arc::clone(&supervisor), Duration::from_secs(60));
        let report = sweeper.sweep_once(now + chrono::Duration::seconds(5)).await;

        assert_eq!(report.reclaimed, vec!["broken"]);
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_leaves_creating_records() {
        let supervisor = create_test_supervisor();
        let now = Utc::now();
        supervisor
            .registry()
            .reserve("pending", now, now + chrono::Duration::seconds(1), 5)
            .unwrap();

        let sweeper = Sweeper::new(Arc::clone(&supervisor), Duration::from_secs(60));
        let report = sweeper.sweep_once(now + chrono::Duration::seconds(5)).await;

        assert_eq!(report, SweepReport::default());
        assert!(supervisor.registry().contains("pending"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let supervisor = create_test_supervisor();
        let sweeper = Sweeper::new(supervisor, Duration::from_secs(3600));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(sweeper.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_sweeps_on_interval() {
        let supervisor = create_test_supervisor();
        let now = Utc::now();
        supervisor
            .registry()
            .reserve("old", now - chrono::Duration::minutes(2), now - chrono::Duration::minutes(1), 5)
            .unwrap();
        supervisor
            .registry()
            .update_status("old", InstanceStatus::Failed)
            .unwrap();

        let sweeper = Sweeper::new(Arc::clone(&supervisor), Duration::from_millis(50));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sweeper.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(supervisor.registry().is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
