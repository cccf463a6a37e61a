// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker probing plugins and tracking their liveness.
//!
//! Every tick publishes a `_status` probe on the `admin` fanout key, which
//! every admin queue is bound to. Plugins answer by sending a heartbeat,
//! recorded on their instance. The sweep that follows demotes `RUNNING`
//! instances whose heartbeat is older than the timeout to `UNRESPONSIVE`,
//! and promotes instances with a fresh heartbeat back to `RUNNING`.
//!
//! Probes expire after one interval so a stalled broker does not pile them
//! up. An unroutable probe only means no plugin is connected; it is logged
//! and does not change any status.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use relay_model::InstanceStatus;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::broker::gateway::STATUS_COMMAND;
use crate::broker::routing::ADMIN_PREFIX;
use crate::broker::{BrokerError, BrokerGateway};
use crate::catalog::{Catalog, SystemFilter};
use crate::error::Result;
use crate::runner::set_instance_status;

/// Configuration for the heartbeat monitor.
///
/// The timeout should span several intervals, otherwise a single delayed
/// heartbeat flips a healthy plugin to `UNRESPONSIVE`.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitorConfig {
    /// How often to probe and sweep.
    pub interval: Duration,
    /// Heartbeat age at which a running instance is unresponsive.
    pub timeout: Duration,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Status changes made by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instance ids demoted to `UNRESPONSIVE`.
    pub demoted: Vec<String>,
    /// Instance ids promoted to `RUNNING`.
    pub promoted: Vec<String>,
}

/// Background worker that probes plugins and sweeps instance statuses.
pub struct HeartbeatMonitor {
    catalog: Arc<dyn Catalog>,
    gateway: Arc<BrokerGateway>,
    config: HeartbeatMonitorConfig,
    stopped: AtomicBool,
    shutdown: Arc<Notify>,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        gateway: Arc<BrokerGateway>,
        config: HeartbeatMonitorConfig,
    ) -> Self {
        Self {
            catalog,
            gateway,
            config,
            stopped: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Stop the loop. A tick in progress skips whatever work remains.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run the monitor loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Heartbeat monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if self.is_stopped() {
                        break;
                    }
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Status sweep failed");
                    }
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }

    /// One probe and sweep.
    pub async fn tick(&self) -> Result<SweepReport> {
        if self.is_stopped() {
            return Ok(SweepReport::default());
        }
        self.probe().await;
        self.sweep().await
    }

    async fn probe(&self) {
        match self
            .gateway
            .publish_admin(STATUS_COMMAND, ADMIN_PREFIX, None, Some(self.config.interval))
            .await
        {
            Ok(()) => debug!("Status probe published"),
            Err(BrokerError::Unroutable { .. }) => {
                debug!("Status probe unroutable, no plugin admin queues bound")
            }
            Err(e) => warn!(error = %e, "Failed to publish status probe"),
        }
    }

    /// Demote stale `RUNNING` instances and promote fresh ones.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let mut report = SweepReport::default();

        for system in self.catalog.list_systems(&SystemFilter::default()).await? {
            for instance in &system.instances {
                if self.is_stopped() {
                    return Ok(report);
                }
                let (Some(id), Some(heartbeat)) =
                    (instance.id.as_deref(), instance.status_info.heartbeat)
                else {
                    continue;
                };

                let stale = now - heartbeat >= timeout;
                let next = match instance.status {
                    InstanceStatus::Running if stale => InstanceStatus::Unresponsive,
                    InstanceStatus::Unresponsive
                    | InstanceStatus::Starting
                    | InstanceStatus::Initializing
                    | InstanceStatus::Unknown
                        if !stale =>
                    {
                        InstanceStatus::Running
                    }
                    _ => continue,
                };

                match set_instance_status(self.catalog.as_ref(), id, next).await {
                    Ok(_) => {
                        info!(
                            system = %system.display_key(),
                            instance = %instance.name,
                            from = %instance.status,
                            to = %next,
                            "Instance status changed by heartbeat"
                        );
                        if next == InstanceStatus::Running {
                            report.promoted.push(id.to_string());
                        } else {
                            report.demoted.push(id.to_string());
                        }
                    }
                    // Usually a concurrent stop; the stop wins.
                    Err(e) => debug!(instance_id = id, error = %e, "Status change skipped"),
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{GatewayConfig, MemoryBroker};
    use crate::catalog::MemoryCatalog;
    use crate::catalog::tests::echo_system;
    use crate::runner::instance_status;

    async fn setup() -> (Arc<MemoryCatalog>, Arc<MemoryBroker>, HeartbeatMonitor, String) {
        let catalog = Arc::new(MemoryCatalog::new());
        let broker = Arc::new(MemoryBroker::new());
        let gateway = Arc::new(BrokerGateway::new(
            broker.clone(),
            catalog.clone(),
            GatewayConfig::default(),
        ));
        gateway.declare_exchange().await.unwrap();
        let system = catalog.create_system(echo_system()).await.unwrap();
        let id = system.instances[0].id.clone().unwrap();
        let monitor = HeartbeatMonitor::new(
            catalog.clone(),
            gateway,
            HeartbeatMonitorConfig {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(30),
            },
        );
        (catalog, broker, monitor, id)
    }

    #[tokio::test]
    async fn test_demote_then_promote() {
        let (catalog, _broker, monitor, id) = setup().await;
        catalog
            .set_instance_status(&id, InstanceStatus::Running)
            .await
            .unwrap();
        catalog
            .record_heartbeat(&id, Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.demoted, vec![id.clone()]);
        assert_eq!(
            instance_status(catalog.as_ref(), &id).await.unwrap(),
            InstanceStatus::Unresponsive
        );

        catalog.record_heartbeat(&id, Utc::now()).await.unwrap();
        let report = monitor.tick().await.unwrap();
        assert_eq!(report.promoted, vec![id.clone()]);
        assert_eq!(
            instance_status(catalog.as_ref(), &id).await.unwrap(),
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_no_heartbeat_is_left_alone() {
        let (catalog, _broker, monitor, id) = setup().await;
        catalog
            .set_instance_status(&id, InstanceStatus::Running)
            .await
            .unwrap();
        assert_eq!(monitor.tick().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn test_stopping_instance_not_promoted() {
        let (catalog, _broker, monitor, id) = setup().await;
        catalog
            .set_instance_status(&id, InstanceStatus::Stopping)
            .await
            .unwrap();
        catalog.record_heartbeat(&id, Utc::now()).await.unwrap();
        assert_eq!(monitor.tick().await.unwrap(), SweepReport::default());
        assert_eq!(
            instance_status(catalog.as_ref(), &id).await.unwrap(),
            InstanceStatus::Stopping
        );
    }

    #[tokio::test]
    async fn test_probe_reaches_admin_queues_with_expiry() {
        let (catalog, broker, monitor, id) = setup().await;
        let system = catalog.find_instance_system(&id).await.unwrap().unwrap();
        let queues = monitor
            .gateway
            .setup_instance_queues(&system, &system.instances[0])
            .await
            .unwrap();

        monitor.tick().await.unwrap();
        let admin = queues.admin.unwrap().name;
        let probes = broker.peek(&admin);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].routing_key, "admin");
        assert_eq!(probes[0].message.expiration, Some(Duration::from_secs(10)));
        assert!(broker.peek(&queues.request.unwrap().name).is_empty());
    }

    #[tokio::test]
    async fn test_stop_short_circuits() {
        let (catalog, broker, monitor, id) = setup().await;
        catalog
            .set_instance_status(&id, InstanceStatus::Running)
            .await
            .unwrap();
        catalog
            .record_heartbeat(&id, Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        let system = catalog.find_instance_system(&id).await.unwrap().unwrap();
        let queues = monitor
            .gateway
            .setup_instance_queues(&system, &system.instances[0])
            .await
            .unwrap();

        monitor.stop();
        assert_eq!(monitor.tick().await.unwrap(), SweepReport::default());
        assert!(broker.peek(&queues.admin.unwrap().name).is_empty());
        assert_eq!(
            instance_status(catalog.as_ref(), &id).await.unwrap(),
            InstanceStatus::Running
        );
        // The loop exits on the stored notification.
        tokio::time::timeout(Duration::from_secs(1), monitor.run())
            .await
            .unwrap();
    }
}
