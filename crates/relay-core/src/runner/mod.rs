// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - plugin process supervision.

pub mod mock;
pub mod process;
mod traits;

pub use mock::{MockBehavior, MockRunner, MockRunnerFactory};
pub use process::{LocalRunner, LocalRunnerFactory};
pub use traits::*;

use std::time::Duration;

use relay_model::{Instance, InstanceStatus};
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::Error;

const STATUS_WRITE_ATTEMPTS: u32 = 3;

/// Current status of an instance, read from the catalog.
pub async fn instance_status(
    catalog: &dyn Catalog,
    instance_id: &str,
) -> crate::Result<InstanceStatus> {
    catalog
        .get_instance(instance_id)
        .await?
        .map(|instance| instance.status)
        .ok_or_else(|| Error::not_found("instance", instance_id))
}

/// Write an instance status, retrying transient catalog failures.
pub async fn set_instance_status(
    catalog: &dyn Catalog,
    instance_id: &str,
    status: InstanceStatus,
) -> crate::Result<Instance> {
    let mut attempt = 1;
    loop {
        match catalog.set_instance_status(instance_id, status).await {
            Ok(instance) => return Ok(instance),
            Err(e) if e.is_transient() && attempt < STATUS_WRITE_ATTEMPTS => {
                debug!(instance_id, %status, attempt, error = %e, "Retrying status write");
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::catalog::tests::echo_system;

    #[tokio::test]
    async fn test_status_round_trip() {
        let catalog = MemoryCatalog::new();
        let system = catalog.create_system(echo_system()).await.unwrap();
        let id = system.instances[0].id.clone().unwrap();

        assert_eq!(
            instance_status(&catalog, &id).await.unwrap(),
            InstanceStatus::Initializing
        );
        set_instance_status(&catalog, &id, InstanceStatus::Running)
            .await
            .unwrap();
        assert_eq!(
            instance_status(&catalog, &id).await.unwrap(),
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_missing_instance() {
        let catalog = MemoryCatalog::new();
        let err = instance_status(&catalog, "nope").await.unwrap_err();
        assert_eq!(err.kind(), "NOT_FOUND");
    }
}
