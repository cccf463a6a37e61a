// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC operation handlers.
//!
//! One async function per operation over a shared [`CoreHandlerState`].
//! [`handle_call`] routes a decoded [`RpcRequest`] to its handler and
//! returns the JSON result carried in the response frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use relay_model::{
    Command, Instance, InstanceStatus, ModelError, Request, RequestUpdate, System,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::broker::BrokerGateway;
use crate::catalog::{Catalog, SystemFilter};
use crate::dispatch::RequestDispatcher;
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleManager, StartReport};
use crate::plugin_log::{PluginLogConfig, PluginLogManager};
use crate::runner::set_instance_status;
use crate::validator::cache_choice_details;

/// Shared state for RPC handlers.
pub struct CoreHandlerState {
    /// System and request store.
    pub catalog: Arc<dyn Catalog>,
    /// Queue provisioning and publishing.
    pub gateway: Arc<BrokerGateway>,
    /// Request submission and completion.
    pub dispatcher: Arc<RequestDispatcher>,
    /// Plugin and instance lifecycle.
    pub lifecycle: Arc<LifecycleManager>,
    /// Plugin logging document.
    pub plugin_log: Arc<PluginLogManager>,
    /// When the server started (for uptime calculation).
    pub start_time: Instant,
    /// Server version string.
    pub version: String,
}

impl CoreHandlerState {
    /// Create handler state.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        gateway: Arc<BrokerGateway>,
        dispatcher: Arc<RequestDispatcher>,
        lifecycle: Arc<LifecycleManager>,
        plugin_log: Arc<PluginLogManager>,
    ) -> Self {
        Self {
            catalog,
            gateway,
            dispatcher,
            lifecycle,
            plugin_log,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get the server uptime in milliseconds.
    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// A call, tagged by method name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum RpcRequest {
    /// Publish a stored request, or submit a new one.
    ProcessRequest(ProcessRequestParams),
    /// Provision queues and send the start command.
    InitializeInstance {
        /// Target instance.
        instance_id: String,
    },
    /// Start an instance.
    StartInstance {
        /// Target instance.
        instance_id: String,
    },
    /// Stop an instance.
    StopInstance {
        /// Target instance.
        instance_id: String,
    },
    /// Stop an instance and remove it from its system.
    RemoveInstance {
        /// Target instance.
        instance_id: String,
    },
    /// Set an instance status, subject to the instance state machine.
    UpdateInstanceStatus {
        /// Target instance.
        instance_id: String,
        /// New status.
        status: InstanceStatus,
    },
    /// Record a heartbeat sent by a plugin.
    InstanceHeartbeat {
        /// Reporting instance.
        instance_id: String,
    },
    /// Re-read a local system from disk.
    ReloadSystem {
        /// Target system.
        system_id: String,
    },
    /// Tear down and delete a system.
    RemoveSystem {
        /// Target system.
        system_id: String,
    },
    /// Register a system.
    CreateSystem {
        /// System document.
        system: System,
    },
    /// Patch a system.
    UpdateSystem {
        /// Target system.
        system_id: String,
        /// Changes.
        patch: SystemPatch,
    },
    /// List systems.
    QuerySystems(SystemQuery),
    /// Load and start plugins added to the plugin directory.
    RescanSystemDirectory,
    /// Drain a queue, cancelling the requests in it.
    ClearQueue {
        /// Queue name.
        queue_name: String,
    },
    /// Drain every instance request queue.
    ClearAllQueues,
    /// Depth of one queue.
    GetQueueMessageCount {
        /// Queue name.
        queue_name: String,
    },
    /// Depth of every instance request queue.
    GetAllQueueInfo,
    /// Logging document for a system's plugins.
    GetPluginLogConfig {
        /// System name.
        system_name: String,
    },
    /// Re-read the plugin logging document.
    ReloadPluginLogConfig,
    /// Server version.
    GetVersion,
    /// Apply a completion update to a request.
    UpdateRequest {
        /// Target request.
        request_id: String,
        /// Changes.
        update: RequestUpdate,
    },
    /// Cancel a request that has not completed.
    CancelRequest {
        /// Target request.
        request_id: String,
    },
}

/// Parameters of `processRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessRequestParams {
    /// Publish a request that is already stored.
    Existing {
        /// Stored request.
        request_id: String,
    },
    /// Validate, store and publish a new request.
    New {
        /// Request document.
        request: Box<Request>,
        /// Wait for completion.
        #[serde(default)]
        blocking: bool,
        /// Upper bound on the wait; unbounded when absent.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// Changes applied by `updateSystem`. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemPatch {
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New label.
    #[serde(default)]
    pub display_name: Option<String>,
    /// New icon.
    #[serde(default)]
    pub icon_name: Option<String>,
    /// Keys merged into the metadata; a null value removes the key.
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    /// Replacement command list.
    #[serde(default)]
    pub commands: Option<Vec<Command>>,
    /// New instance limit.
    #[serde(default)]
    pub max_instances: Option<usize>,
    /// Name of an instance to add.
    #[serde(default)]
    pub add_instance: Option<String>,
}

/// Parameters of `querySystems`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemQuery {
    /// Exact-match filters.
    #[serde(flatten)]
    pub filter: SystemFilter,
    /// `name` or `version`, `-` prefixed for descending.
    #[serde(default)]
    pub order_by: Option<String>,
    /// Top-level fields to return; everything when empty. `id` is always
    /// included.
    #[serde(default)]
    pub include_fields: Vec<String>,
}

/// Depth of one instance request queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    /// System name.
    pub system: String,
    /// System version.
    pub system_version: String,
    /// Instance name.
    pub instance_name: String,
    /// Queue name.
    pub name: String,
    /// Messages waiting.
    pub size: u32,
}

/// `getVersion` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Core version.
    pub relay_core: String,
    /// Server uptime in milliseconds.
    pub uptime_ms: u64,
}

// ============================================================================
// Routing
// ============================================================================

fn reply<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Run one call and encode its result.
pub async fn handle_call(state: &CoreHandlerState, request: RpcRequest) -> Result<Value> {
    match request {
        RpcRequest::ProcessRequest(params) => reply(handle_process_request(state, params).await?),
        RpcRequest::InitializeInstance { instance_id } => {
            reply(state.lifecycle.initialize_instance(&instance_id).await?)
        }
        RpcRequest::StartInstance { instance_id } => {
            info!(instance_id = %instance_id, "Start instance request received");
            reply(state.lifecycle.start_instance(&instance_id).await?)
        }
        RpcRequest::StopInstance { instance_id } => {
            info!(instance_id = %instance_id, "Stop instance request received");
            reply(state.lifecycle.stop_instance(&instance_id).await?)
        }
        RpcRequest::RemoveInstance { instance_id } => {
            info!(instance_id = %instance_id, "Remove instance request received");
            state.lifecycle.remove_instance(&instance_id).await?;
            Ok(Value::Null)
        }
        RpcRequest::UpdateInstanceStatus {
            instance_id,
            status,
        } => reply(set_instance_status(state.catalog.as_ref(), &instance_id, status).await?),
        RpcRequest::InstanceHeartbeat { instance_id } => {
            reply(handle_instance_heartbeat(state, &instance_id).await?)
        }
        RpcRequest::ReloadSystem { system_id } => {
            reply(handle_reload_system(state, &system_id).await?)
        }
        RpcRequest::RemoveSystem { system_id } => {
            info!(system_id = %system_id, "Remove system request received");
            state.lifecycle.remove_system(&system_id).await?;
            Ok(Value::Null)
        }
        RpcRequest::CreateSystem { system } => reply(handle_create_system(state, system).await?),
        RpcRequest::UpdateSystem { system_id, patch } => {
            reply(handle_update_system(state, &system_id, patch).await?)
        }
        RpcRequest::QuerySystems(query) => reply(handle_query_systems(state, query).await?),
        RpcRequest::RescanSystemDirectory => reply(handle_rescan(state).await),
        RpcRequest::ClearQueue { queue_name } => {
            reply(state.gateway.clear_queue(&queue_name).await?)
        }
        RpcRequest::ClearAllQueues => reply(handle_clear_all_queues(state).await?),
        RpcRequest::GetQueueMessageCount { queue_name } => {
            let count = state
                .gateway
                .queue_message_count(&queue_name)
                .await?
                .ok_or_else(|| Error::not_found("queue", queue_name))?;
            reply(count)
        }
        RpcRequest::GetAllQueueInfo => reply(handle_get_all_queue_info(state).await?),
        RpcRequest::GetPluginLogConfig { system_name } => {
            reply(handle_get_plugin_log_config(state, &system_name))
        }
        RpcRequest::ReloadPluginLogConfig => reply(state.plugin_log.reload()?),
        RpcRequest::GetVersion => reply(VersionInfo {
            relay_core: state.version.clone(),
            uptime_ms: state.uptime_ms(),
        }),
        RpcRequest::UpdateRequest { request_id, update } => {
            reply(state.dispatcher.update_request(&request_id, &update).await?)
        }
        RpcRequest::CancelRequest { request_id } => {
            info!(request_id = %request_id, "Cancel request received");
            reply(state.dispatcher.cancel_request(&request_id).await?)
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Handle `processRequest`.
pub async fn handle_process_request(
    state: &CoreHandlerState,
    params: ProcessRequestParams,
) -> Result<Request> {
    match params {
        ProcessRequestParams::Existing { request_id } => {
            debug!(request_id = %request_id, "Process existing request");
            state.dispatcher.process_existing(&request_id).await
        }
        ProcessRequestParams::New {
            request,
            blocking,
            timeout_ms,
        } => {
            state
                .dispatcher
                .process_request(*request, blocking, timeout_ms.map(Duration::from_millis))
                .await
        }
    }
}

// ============================================================================
// Instances
// ============================================================================

/// Handle `instanceHeartbeat`.
pub async fn handle_instance_heartbeat(
    state: &CoreHandlerState,
    instance_id: &str,
) -> Result<Instance> {
    state
        .catalog
        .record_heartbeat(instance_id, Utc::now())
        .await
        .map_err(Into::into)
}

// ============================================================================
// Systems
// ============================================================================

async fn get_system(state: &CoreHandlerState, system_id: &str) -> Result<System> {
    state
        .catalog
        .get_system(system_id)
        .await?
        .ok_or_else(|| Error::not_found("system", system_id))
}

fn cache_commands(commands: &mut [Command]) -> Result<()> {
    for command in commands {
        cache_choice_details(command).map_err(|reason| ModelError::MalformedChoices {
            key: command.name.clone(),
            reason,
        })?;
    }
    Ok(())
}

/// Handle `createSystem`. Dynamic choices are parsed once here.
pub async fn handle_create_system(state: &CoreHandlerState, mut system: System) -> Result<System> {
    cache_commands(&mut system.commands)?;
    let system = state.catalog.create_system(system).await?;
    info!(system = %system.display_key(), "System created");
    Ok(system)
}

/// Handle `updateSystem`.
pub async fn handle_update_system(
    state: &CoreHandlerState,
    system_id: &str,
    patch: SystemPatch,
) -> Result<System> {
    let mut system = get_system(state, system_id).await?;

    if let Some(description) = patch.description {
        system.description = Some(description);
    }
    if let Some(display_name) = patch.display_name {
        system.display_name = Some(display_name);
    }
    if let Some(icon_name) = patch.icon_name {
        system.icon_name = Some(icon_name);
    }
    if let Some(metadata) = patch.metadata {
        for (key, value) in metadata {
            if value.is_null() {
                system.metadata.remove(&key);
            } else {
                system.metadata.insert(key, value);
            }
        }
    }
    if let Some(mut commands) = patch.commands {
        cache_commands(&mut commands)?;
        system.commands = commands;
    }
    if let Some(max_instances) = patch.max_instances {
        system.max_instances = max_instances;
    }
    if let Some(name) = patch.add_instance {
        system.instances.push(Instance::new(name));
    }

    state.catalog.save_system(&system).await?;
    info!(system = %system.display_key(), "System updated");
    get_system(state, system_id).await
}

/// Handle `reloadSystem`. The reloaded plugins are registered but not
/// started.
pub async fn handle_reload_system(state: &CoreHandlerState, system_id: &str) -> Result<System> {
    let system = get_system(state, system_id).await?;
    info!(system = %system.display_key(), "Reload system request received");
    state
        .lifecycle
        .reload_system(&system.name, &system.version)
        .await?;
    state
        .catalog
        .find_system(&system.name, &system.version)
        .await?
        .ok_or_else(|| Error::not_found("system", system.display_key()))
}

/// Handle `querySystems`.
pub async fn handle_query_systems(
    state: &CoreHandlerState,
    query: SystemQuery,
) -> Result<Vec<Value>> {
    let mut systems = state.catalog.list_systems(&query.filter).await?;

    if let Some(order_by) = query.order_by.as_deref() {
        let (field, descending) = match order_by.strip_prefix('-') {
            Some(field) => (field, true),
            None => (order_by, false),
        };
        match field {
            "name" => systems.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version))),
            "version" => {
                systems.sort_by(|a, b| a.version.cmp(&b.version).then(a.name.cmp(&b.name)))
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "cannot order systems by '{other}'"
                )));
            }
        }
        if descending {
            systems.reverse();
        }
    }

    systems
        .into_iter()
        .map(|system| -> Result<Value> {
            let mut value = serde_json::to_value(system)?;
            if !query.include_fields.is_empty()
                && let Value::Object(fields) = &mut value
            {
                fields.retain(|key, _| key == "id" || query.include_fields.contains(key));
            }
            Ok(value)
        })
        .collect()
}

/// Handle `rescanSystemDirectory`.
pub async fn handle_rescan(state: &CoreHandlerState) -> StartReport {
    info!("Rescan of plugin directory requested");
    state.lifecycle.scan_path().await
}

// ============================================================================
// Queues
// ============================================================================

async fn request_queues(state: &CoreHandlerState) -> Result<Vec<(System, Instance, String)>> {
    let mut queues = Vec::new();
    for system in state.catalog.list_systems(&SystemFilter::default()).await? {
        for instance in &system.instances {
            if let Some(queue) = &instance.queue_info.request {
                queues.push((system.clone(), instance.clone(), queue.name.clone()));
            }
        }
    }
    Ok(queues)
}

/// Handle `clearAllQueues`. A queue that fails to clear is logged and
/// skipped. Returns messages removed.
pub async fn handle_clear_all_queues(state: &CoreHandlerState) -> Result<u32> {
    let mut removed = 0;
    for (_, _, queue) in request_queues(state).await? {
        match state.gateway.clear_queue(&queue).await {
            Ok(count) => removed += count,
            Err(e) => warn!(queue = %queue, error = %e, "Failed to clear queue"),
        }
    }
    Ok(removed)
}

/// Handle `getAllQueueInfo`. Missing queues report zero.
pub async fn handle_get_all_queue_info(state: &CoreHandlerState) -> Result<Vec<QueueSummary>> {
    let mut summaries = Vec::new();
    for (system, instance, queue) in request_queues(state).await? {
        let size = state
            .gateway
            .queue_message_count(&queue)
            .await?
            .unwrap_or(0);
        summaries.push(QueueSummary {
            system: system.name,
            system_version: system.version,
            instance_name: instance.name,
            name: queue,
            size,
        });
    }
    Ok(summaries)
}

// ============================================================================
// Plugin logging
// ============================================================================

/// Handle `getPluginLogConfig`.
pub fn handle_get_plugin_log_config(state: &CoreHandlerState, system_name: &str) -> PluginLogConfig {
    state
        .plugin_log
        .config_for(system_name, state.lifecycle.registry())
}
