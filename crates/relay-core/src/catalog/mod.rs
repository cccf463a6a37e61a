// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog interfaces and backends.
//!
//! The catalog is the source of truth for systems, instances and requests.
//! Records reference each other by id only: a system lists the ids of its
//! instances, an instance names its system, a request names its parent.
//! Backends resolve those references on read.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryCatalog;
pub use self::sqlite::SqliteCatalog;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_model::{
    CommandType, Instance, InstanceStatus, ModelError, QueueInfo, Request, RequestStatus,
    RequestUpdate, System, UpdateOutcome,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Catalog errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// Record does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Record kind.
        kind: &'static str,
        /// Id that was looked up.
        id: String,
    },

    /// Unique constraint violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A model rule rejected the write.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failure.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Stored document could not be (de)serialised.
    #[error("document error: {0}")]
    Document(#[from] serde_json::Error),
}

impl CatalogError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether a retry could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            )
        )
    }
}

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// System query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemFilter {
    /// Exact name.
    #[serde(default)]
    pub name: Option<String>,
    /// Exact version.
    #[serde(default)]
    pub version: Option<String>,
    /// Local plugins only, or remote only.
    #[serde(default)]
    pub local: Option<bool>,
}

impl SystemFilter {
    /// Whether `system` passes the filter.
    pub fn matches(&self, system: &System) -> bool {
        self.name.as_ref().is_none_or(|n| *n == system.name)
            && self.version.as_ref().is_none_or(|v| *v == system.version)
            && self.local.is_none_or(|l| l == system.local)
    }
}

/// Request query. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestFilter {
    /// Target system name.
    #[serde(default)]
    pub system: Option<String>,
    /// Target system version.
    #[serde(default)]
    pub system_version: Option<String>,
    /// Target instance.
    #[serde(default)]
    pub instance_name: Option<String>,
    /// Command name.
    #[serde(default)]
    pub command: Option<String>,
    /// Status.
    #[serde(default)]
    pub status: Option<RequestStatus>,
    /// Top-level requests only, or children only.
    #[serde(default)]
    pub has_parent: Option<bool>,
    /// Maximum rows.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RequestFilter {
    /// Whether `request` passes the filter (ignores `limit`).
    pub fn matches(&self, request: &Request) -> bool {
        self.system.as_ref().is_none_or(|s| *s == request.system)
            && self
                .system_version
                .as_ref()
                .is_none_or(|v| *v == request.system_version)
            && self
                .instance_name
                .as_ref()
                .is_none_or(|i| *i == request.instance_name)
            && self.command.as_ref().is_none_or(|c| *c == request.command)
            && self.status.is_none_or(|s| s == request.status)
            && self.has_parent.is_none_or(|p| p == request.has_parent)
    }
}

/// Catalog abstraction.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Cheap connectivity probe.
    async fn is_alive(&self) -> bool;

    // ========================================================================
    // Systems
    // ========================================================================

    /// Stores a new system, assigning ids. Fails with `Conflict` when
    /// `(name, version)` is taken.
    async fn create_system(&self, system: System) -> Result<System>;

    /// Replaces an existing system and its instances.
    ///
    /// Instances already stored keep their status, heartbeat and queue
    /// coordinates; those only change through the dedicated instance
    /// operations.
    async fn save_system(&self, system: &System) -> Result<()>;

    /// System by id.
    async fn get_system(&self, id: &str) -> Result<Option<System>>;

    /// System by `(name, version)`.
    async fn find_system(&self, name: &str, version: &str) -> Result<Option<System>>;

    /// Systems passing `filter`, ordered by name then version.
    async fn list_systems(&self, filter: &SystemFilter) -> Result<Vec<System>>;

    /// Deletes a system and its instances. Returns false if absent.
    async fn delete_system(&self, id: &str) -> Result<bool>;

    // ========================================================================
    // Instances
    // ========================================================================

    /// Instance by id.
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>>;

    /// System owning the instance.
    async fn find_instance_system(&self, instance_id: &str) -> Result<Option<System>>;

    /// Sets the status, enforcing the instance state machine.
    async fn set_instance_status(&self, id: &str, status: InstanceStatus) -> Result<Instance>;

    /// Records a heartbeat. Older timestamps never replace newer ones.
    async fn record_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<Instance>;

    /// Stores broker coordinates for the instance.
    async fn set_instance_queue_info(
        &self,
        id: &str,
        queue_type: &str,
        info: QueueInfo,
    ) -> Result<Instance>;

    // ========================================================================
    // Requests
    // ========================================================================

    /// Stores a new request, assigning an id and timestamps when absent.
    async fn create_request(&self, request: Request) -> Result<Request>;

    /// Replaces a stored request that is not yet completed.
    async fn save_request(&self, request: &Request) -> Result<()>;

    /// Request by id.
    async fn get_request(&self, id: &str) -> Result<Option<Request>>;

    /// Requests passing `filter`.
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>>;

    /// Direct children of a request, oldest first.
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Request>>;

    /// Applies a completion update atomically.
    async fn update_request(
        &self,
        id: &str,
        update: &RequestUpdate,
    ) -> Result<(Request, UpdateOutcome)>;

    /// Deletes completed requests of `command_type` created before
    /// `older_than`, along with their children. Returns rows removed.
    async fn prune_requests(
        &self,
        command_type: CommandType,
        older_than: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Opens the catalog named by a `RELAY_CATALOG_URL` value.
pub async fn connect(url: &str) -> Result<Arc<dyn Catalog>> {
    if url == "memory" {
        return Ok(Arc::new(MemoryCatalog::new()));
    }
    Ok(Arc::new(SqliteCatalog::connect(url).await?))
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Gives the system and every instance an id if they lack one.
pub(crate) fn assign_ids(system: &mut System) {
    if system.id.is_none() {
        system.id = Some(new_id());
    }
    for instance in &mut system.instances {
        if instance.id.is_none() {
            instance.id = Some(new_id());
        }
    }
}

/// Fills in id and timestamps of a request about to be stored.
pub(crate) fn stamp_request(request: &mut Request) {
    let now = Utc::now();
    if request.id.is_none() {
        request.id = Some(new_id());
    }
    request.created_at.get_or_insert(now);
    request.updated_at.get_or_insert(now);
    request.has_parent = request.parent.is_some();
}

/// Applies a status change to a loaded instance.
pub(crate) fn transition(instance: &mut Instance, status: InstanceStatus) -> Result<()> {
    if !instance.status.can_transition_to(status) {
        return Err(ModelError::InvalidInstanceTransition {
            from: instance.status,
            to: status,
        }
        .into());
    }
    instance.status = status;
    Ok(())
}

/// Carries the runtime state of a stored instance over an incoming copy.
pub(crate) fn keep_instance_state(stored: &Instance, incoming: &mut Instance) {
    incoming.status = stored.status;
    incoming.status_info = stored.status_info.clone();
    incoming.queue_type = stored.queue_type.clone();
    incoming.queue_info = stored.queue_info.clone();
}

/// Keeps the newest heartbeat.
pub(crate) fn bump_heartbeat(instance: &mut Instance, at: DateTime<Utc>) {
    let heartbeat = &mut instance.status_info.heartbeat;
    if heartbeat.is_none_or(|current| at > current) {
        *heartbeat = Some(at);
    }
}
