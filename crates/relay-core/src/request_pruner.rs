// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker deleting old completed requests.
//!
//! Each command type has its own retention. Completed `INFO` and `ACTION`
//! requests created before `now - ttl` are deleted with their children. A
//! type without a TTL is kept forever. `EPHEMERAL` requests are never stored
//! so there is nothing to prune.

use std::sync::Arc;

use chrono::Utc;
use relay_model::CommandType;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::catalog::Catalog;
use crate::config::PruneConfig;
use crate::error::Result;

/// Background worker that prunes completed requests.
pub struct RequestPruner {
    catalog: Arc<dyn Catalog>,
    config: PruneConfig,
    shutdown: Arc<Notify>,
}

impl RequestPruner {
    /// Create a new pruner.
    pub fn new(catalog: Arc<dyn Catalog>, config: PruneConfig) -> Self {
        Self {
            catalog,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn retention(&self) -> [(CommandType, Option<std::time::Duration>); 2] {
        [
            (CommandType::Info, self.config.info_ttl),
            (CommandType::Action, self.config.action_ttl),
        ]
    }

    /// Run the pruner loop until the shutdown signal is received.
    pub async fn run(&self) {
        if self.retention().iter().all(|(_, ttl)| ttl.is_none()) {
            info!("Request pruner disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            info_ttl_mins = self.config.info_ttl.map(|t| t.as_secs() / 60),
            action_ttl_mins = self.config.action_ttl.map(|t| t.as_secs() / 60),
            "Request pruner started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Request pruner received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.prune().await {
                        error!(error = %e, "Failed to prune requests");
                    }
                }
            }
        }

        info!("Request pruner stopped");
    }

    /// Delete expired requests of every retained type. Returns rows removed.
    pub async fn prune(&self) -> Result<u64> {
        let mut total = 0;
        for (command_type, ttl) in self.retention() {
            let Some(ttl) = ttl else {
                continue;
            };
            let Ok(ttl) = chrono::Duration::from_std(ttl) else {
                continue;
            };
            let removed = self
                .catalog
                .prune_requests(command_type, Utc::now() - ttl)
                .await?;
            if removed > 0 {
                debug!(%command_type, removed, "Pruned requests");
            }
            total += removed;
        }
        if total > 0 {
            info!(removed = total, "Request prune pass complete");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use relay_model::{Request, RequestStatus};
    use std::time::Duration;

    async fn stored(
        catalog: &MemoryCatalog,
        command_type: CommandType,
        status: RequestStatus,
        age: chrono::Duration,
    ) -> String {
        let mut request = Request::new("echo", "1.0.0", "default", "say");
        request.command_type = Some(command_type);
        request.status = status;
        request.created_at = Some(Utc::now() - age);
        catalog
            .create_request(request)
            .await
            .unwrap()
            .id
            .unwrap()
    }

    #[tokio::test]
    async fn test_prunes_by_type_ttl() {
        let catalog = Arc::new(MemoryCatalog::new());
        let hour = chrono::Duration::hours(1);
        let old_info = stored(&catalog, CommandType::Info, RequestStatus::Success, hour).await;
        let running_info =
            stored(&catalog, CommandType::Info, RequestStatus::InProgress, hour).await;
        let fresh_info =
            stored(&catalog, CommandType::Info, RequestStatus::Success, chrono::Duration::zero())
                .await;
        let old_action = stored(&catalog, CommandType::Action, RequestStatus::Error, hour).await;

        let pruner = RequestPruner::new(
            catalog.clone(),
            PruneConfig {
                info_ttl: Some(Duration::from_secs(15 * 60)),
                action_ttl: None,
                interval: Duration::from_secs(60),
            },
        );
        assert_eq!(pruner.prune().await.unwrap(), 1);

        assert!(catalog.get_request(&old_info).await.unwrap().is_none());
        for kept in [running_info, fresh_info, old_action] {
            assert!(catalog.get_request(&kept).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_disabled_pruner_returns_immediately() {
        let pruner = RequestPruner::new(
            Arc::new(MemoryCatalog::new()),
            PruneConfig {
                info_ttl: None,
                action_ttl: None,
                interval: Duration::from_secs(3600),
            },
        );
        tokio::time::timeout(Duration::from_secs(1), pruner.run())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let pruner = Arc::new(RequestPruner::new(
            Arc::new(MemoryCatalog::new()),
            PruneConfig::default(),
        ));
        let handle = pruner.shutdown_handle();
        let task = tokio::spawn({
            let pruner = pruner.clone();
            async move { pruner.run().await }
        });
        handle.notify_one();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
