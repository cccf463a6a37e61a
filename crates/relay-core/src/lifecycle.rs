// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin lifecycle orchestration.
//!
//! The [`LifecycleManager`] is the only writer of the [`PluginRegistry`]. It
//! starts local plugins in dependency order, stops them with a kill fallback,
//! reloads systems from disk, and carries the instance operations exposed
//! over RPC for both local and remote plugins.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use relay_model::{Instance, InstanceStatus, System};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerGateway;
use crate::broker::gateway::{START_COMMAND, STOP_COMMAND};
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::loader::{PluginLoader, read_manifest};
use crate::registry::PluginRegistry;
use crate::runner::{Runner, instance_status, set_instance_status};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeouts applied to local plugins.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    /// How long a launched plugin has to report `RUNNING` before dependents
    /// are started anyway.
    pub startup: Duration,
    /// How long a stopping plugin has to exit before it is killed.
    pub shutdown: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(5),
            shutdown: Duration::from_secs(10),
        }
    }
}

/// Outcome of [`LifecycleManager::start_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartReport {
    /// Unique names started (or already running), in order.
    pub started: Vec<String>,
    /// Unique names that could not be started.
    pub failed: Vec<String>,
}

/// Starts, stops and reloads plugins.
pub struct LifecycleManager {
    registry: Arc<PluginRegistry>,
    gateway: Arc<BrokerGateway>,
    loader: Arc<PluginLoader>,
    catalog: Arc<dyn Catalog>,
    timeouts: LifecycleTimeouts,
}

impl LifecycleManager {
    /// Create a manager.
    pub fn new(
        registry: Arc<PluginRegistry>,
        gateway: Arc<BrokerGateway>,
        loader: Arc<PluginLoader>,
        catalog: Arc<dyn Catalog>,
        timeouts: LifecycleTimeouts,
    ) -> Self {
        Self {
            registry,
            gateway,
            loader,
            catalog,
            timeouts,
        }
    }

    /// The registry this manager writes.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The loader used for scans and reloads.
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    // ========================================================================
    // Single plugin
    // ========================================================================

    /// Start a plugin. Returns true once it is running or starting.
    ///
    /// A `DEAD` or `STOPPED` plugin is relaunched through a fresh runner
    /// built from the same options, which replaces the old one in the
    /// registry.
    pub async fn start(&self, runner: &Arc<dyn Runner>) -> Result<bool> {
        let status = instance_status(self.catalog.as_ref(), runner.instance_id()).await?;
        match status {
            InstanceStatus::Running | InstanceStatus::Starting => Ok(true),
            InstanceStatus::Initializing if runner.is_alive() => Ok(true),
            InstanceStatus::Initializing => self.launch(runner.clone()).await,
            InstanceStatus::Dead | InstanceStatus::Stopped => {
                let fresh = self.loader.factory().create(runner.options().clone());
                self.registry.replace(fresh.clone());
                set_instance_status(
                    self.catalog.as_ref(),
                    fresh.instance_id(),
                    InstanceStatus::Starting,
                )
                .await?;
                self.launch(fresh).await
            }
            status => Err(Error::PluginStartup {
                unique_name: runner.unique_name(),
                status,
            }),
        }
    }

    async fn launch(&self, runner: Arc<dyn Runner>) -> Result<bool> {
        info!(plugin = %runner.unique_name(), "Starting plugin");
        if let Err(e) = runner.start().await {
            error!(plugin = %runner.unique_name(), error = %e, "Plugin failed to start");
            self.mark_dead(runner.as_ref()).await;
            return Err(e.into());
        }

        match self.await_running(runner.as_ref()).await? {
            InstanceStatus::Running => {
                debug!(plugin = %runner.unique_name(), "Plugin reported running");
                Ok(true)
            }
            InstanceStatus::Dead => Err(Error::PluginStartup {
                unique_name: runner.unique_name(),
                status: InstanceStatus::Dead,
            }),
            status => {
                warn!(
                    plugin = %runner.unique_name(),
                    %status,
                    timeout = ?self.timeouts.startup,
                    "Plugin has not reported running yet"
                );
                Ok(true)
            }
        }
    }

    /// Poll the catalog until the instance is `RUNNING`, `DEAD`, or the
    /// startup timeout passes. Returns the last status seen.
    async fn await_running(&self, runner: &dyn Runner) -> Result<InstanceStatus> {
        let deadline = tokio::time::Instant::now() + self.timeouts.startup;
        loop {
            let status = instance_status(self.catalog.as_ref(), runner.instance_id()).await?;
            if matches!(status, InstanceStatus::Running | InstanceStatus::Dead)
                || tokio::time::Instant::now() >= deadline
            {
                return Ok(status);
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    async fn mark_dead(&self, runner: &dyn Runner) {
        if let Err(e) =
            set_instance_status(self.catalog.as_ref(), runner.instance_id(), InstanceStatus::Dead)
                .await
        {
            warn!(plugin = %runner.unique_name(), error = %e, "Could not mark plugin dead");
        }
    }

    /// Stop a plugin. Idempotent.
    ///
    /// Marks it `STOPPING`, asks the runner to stop, publishes the stop
    /// command and waits for the exit. A plugin still alive after the
    /// shutdown timeout is killed and marked `DEAD`; a plugin that exits
    /// without recording `STOPPED` is marked `DEAD` too.
    pub async fn stop(&self, runner: &Arc<dyn Runner>) -> Result<()> {
        let status = instance_status(self.catalog.as_ref(), runner.instance_id()).await?;
        if status.is_terminal() {
            debug!(plugin = %runner.unique_name(), %status, "Plugin already stopped");
            return Ok(());
        }

        info!(plugin = %runner.unique_name(), "Stopping plugin");
        set_instance_status(
            self.catalog.as_ref(),
            runner.instance_id(),
            InstanceStatus::Stopping,
        )
        .await?;
        runner.stop().await;

        if let Some(system) = self
            .catalog
            .find_instance_system(runner.instance_id())
            .await?
            && let Some(instance) = system.instance_by_id(runner.instance_id())
            && let Err(e) = self
                .gateway
                .publish_admin(
                    STOP_COMMAND,
                    &BrokerGateway::admin_key(&system, instance),
                    Some((&system, instance)),
                    None,
                )
                .await
        {
            debug!(plugin = %runner.unique_name(), error = %e, "Stop message not delivered");
        }

        if !runner.join(self.timeouts.shutdown).await {
            warn!(
                plugin = %runner.unique_name(),
                timeout = ?self.timeouts.shutdown,
                "Plugin did not stop in time, killing"
            );
            if let Err(e) = runner.kill().await {
                error!(plugin = %runner.unique_name(), error = %e, "Kill failed");
            }
            self.mark_dead(runner.as_ref()).await;
            return Ok(());
        }

        if instance_status(self.catalog.as_ref(), runner.instance_id()).await?
            != InstanceStatus::Stopped
        {
            self.mark_dead(runner.as_ref()).await;
        }
        info!(plugin = %runner.unique_name(), "Plugin stopped");
        Ok(())
    }

    // ========================================================================
    // Bulk
    // ========================================================================

    /// Start `runners` (every registered runner when `None`) so that each
    /// plugin starts only after the systems it requires.
    ///
    /// A plugin requiring an unknown or failed system is marked `DEAD`.
    /// Plugins whose requirements stay unmet after a full pass without
    /// progress fail as well.
    pub async fn start_all(&self, runners: Option<Vec<Arc<dyn Runner>>>) -> StartReport {
        let known = self.registry.system_names();
        let mut queue: VecDeque<Arc<dyn Runner>> =
            runners.unwrap_or_else(|| self.registry.all()).into();
        let pending: BTreeSet<&str> = queue
            .iter()
            .map(|r| r.options().system_name.as_str())
            .collect();

        let mut started = BTreeSet::new();
        let mut dead = BTreeSet::new();
        for runner in self.registry.all() {
            match instance_status(self.catalog.as_ref(), runner.instance_id()).await {
                Ok(InstanceStatus::Running) => {
                    started.insert(runner.options().system_name.clone());
                }
                Ok(InstanceStatus::Dead) => {
                    dead.insert(runner.options().system_name.clone());
                }
                _ => {}
            }
        }
        // Dead systems this pass will not retry count as failed requirements.
        let mut failed: BTreeSet<String> = dead
            .into_iter()
            .filter(|s| !started.contains(s) && !pending.contains(s.as_str()))
            .collect();

        let mut report = StartReport::default();
        let mut stalled = 0;

        while let Some(runner) = queue.pop_front() {
            let system = runner.options().system_name.clone();
            let requirements = &runner.options().requirements;

            let unmet = requirements
                .iter()
                .find(|r| !known.contains(*r) || failed.contains(*r));
            if let Some(requirement) = unmet {
                warn!(
                    plugin = %runner.unique_name(),
                    requirement = %requirement,
                    "Requirement unknown or failed, not starting"
                );
                self.mark_dead(runner.as_ref()).await;
                failed.insert(system);
                report.failed.push(runner.unique_name());
                stalled = 0;
                continue;
            }

            if requirements.iter().any(|r| !started.contains(r)) {
                stalled += 1;
                if stalled <= queue.len() + 1 {
                    queue.push_back(runner);
                    continue;
                }
                warn!(
                    plugin = %runner.unique_name(),
                    requirements = ?requirements,
                    "Requirements never started, not starting"
                );
                self.mark_dead(runner.as_ref()).await;
                failed.insert(system);
                report.failed.push(runner.unique_name());
                stalled = 0;
                continue;
            }

            stalled = 0;
            match self.start(&runner).await {
                Ok(_) => {
                    started.insert(system);
                    report.started.push(runner.unique_name());
                }
                Err(e) => {
                    warn!(plugin = %runner.unique_name(), error = %e, "Plugin not started");
                    failed.insert(system);
                    report.failed.push(runner.unique_name());
                }
            }
        }

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Plugin start pass complete"
        );
        report
    }

    /// Stop every registered plugin, logging failures.
    pub async fn stop_all(&self) {
        for runner in self.registry.all().into_iter().rev() {
            if let Err(e) = self.stop(&runner).await {
                warn!(plugin = %runner.unique_name(), error = %e, "Failed to stop plugin");
            }
        }
    }

    /// Load plugin directories that appeared since the last scan and start
    /// them.
    pub async fn scan_path(&self) -> StartReport {
        let known = self.registry.known_paths();
        let fresh: Vec<_> = self
            .loader
            .scan_plugin_path(None)
            .into_iter()
            .filter(|path| !known.contains(path))
            .collect();
        if fresh.is_empty() {
            debug!("No new plugin directories");
            return StartReport::default();
        }

        let loaded = self.loader.load_plugins(&fresh).await;
        for runner in &loaded {
            self.registry.register(runner.clone());
        }
        self.start_all(Some(loaded)).await
    }

    /// Load a set of runners into the registry without starting them.
    pub fn register_all(&self, runners: &[Arc<dyn Runner>]) {
        for runner in runners {
            if !self.registry.register(runner.clone()) {
                debug!(plugin = %runner.unique_name(), "Plugin already registered");
            }
        }
    }

    /// Re-read a system's plugin directory and replace its runners.
    ///
    /// Fails when no runner belongs to the system, when the directory no
    /// longer validates, or when any instance is `RUNNING`. The registry is
    /// untouched on failure. The reloaded runners are not started.
    pub async fn reload_system(&self, name: &str, version: &str) -> Result<Vec<Arc<dyn Runner>>> {
        let runners = self.registry.by_system(name, version);
        let Some(first) = runners.first() else {
            return Err(Error::not_found("system", format!("{name}-{version}")));
        };
        let path = first.options().plugin_path.clone();
        read_manifest(&path)?;

        for runner in &runners {
            if instance_status(self.catalog.as_ref(), runner.instance_id()).await?
                == InstanceStatus::Running
            {
                return Err(Error::BusyInstances {
                    system: format!("{name}-{version}"),
                });
            }
        }

        // Build the replacements before touching the registry so a failed
        // load leaves the current runners registered.
        let loaded = self.loader.load_plugin(&path).await.inspect_err(|e| {
            warn!(
                system = %format!("{name}-{version}"),
                error = %e,
                "Reload failed, keeping current runners"
            );
        })?;
        for runner in &runners {
            self.registry.remove(&runner.unique_name());
        }
        self.register_all(&loaded);
        info!(system = %format!("{name}-{version}"), path = %path.display(), "System reloaded");
        Ok(loaded)
    }

    // ========================================================================
    // Instance operations
    // ========================================================================

    async fn locate(&self, instance_id: &str) -> Result<(System, Instance)> {
        let system = self
            .catalog
            .find_instance_system(instance_id)
            .await?
            .ok_or_else(|| Error::not_found("instance", instance_id))?;
        let instance = system
            .instance_by_id(instance_id)
            .cloned()
            .ok_or_else(|| Error::not_found("instance", instance_id))?;
        Ok((system, instance))
    }

    /// Prepare an instance for work: provision its queues, record them and a
    /// first heartbeat, then tell it to start.
    pub async fn initialize_instance(&self, instance_id: &str) -> Result<Instance> {
        let (system, instance) = self.locate(instance_id).await?;
        info!(system = %system.display_key(), instance = %instance.name, "Initializing instance");

        set_instance_status(self.catalog.as_ref(), instance_id, InstanceStatus::Initializing)
            .await?;
        let queues = self.gateway.setup_instance_queues(&system, &instance).await?;
        self.catalog
            .set_instance_queue_info(instance_id, self.gateway.broker().kind(), queues)
            .await?;
        let instance = self
            .catalog
            .record_heartbeat(instance_id, chrono::Utc::now())
            .await?;

        self.gateway
            .publish_admin(
                START_COMMAND,
                &BrokerGateway::admin_key(&system, &instance),
                Some((&system, &instance)),
                None,
            )
            .await?;
        Ok(instance)
    }

    /// Start an instance: local plugins through their runner, remote ones
    /// with a start command.
    pub async fn start_instance(&self, instance_id: &str) -> Result<Instance> {
        if let Some(runner) = self.registry.by_instance_id(instance_id) {
            self.start(&runner).await?;
        } else {
            let (system, instance) = self.locate(instance_id).await?;
            set_instance_status(self.catalog.as_ref(), instance_id, InstanceStatus::Starting)
                .await?;
            self.gateway
                .publish_admin(
                    START_COMMAND,
                    &BrokerGateway::admin_key(&system, &instance),
                    Some((&system, &instance)),
                    None,
                )
                .await?;
        }
        self.locate(instance_id).await.map(|(_, instance)| instance)
    }

    /// Stop an instance: local plugins through their runner, remote ones
    /// with a stop command.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<Instance> {
        if let Some(runner) = self.registry.by_instance_id(instance_id) {
            self.stop(&runner).await?;
        } else {
            let (system, instance) = self.locate(instance_id).await?;
            if !instance.status.is_terminal() {
                set_instance_status(self.catalog.as_ref(), instance_id, InstanceStatus::Stopping)
                    .await?;
                self.gateway
                    .publish_admin(
                        STOP_COMMAND,
                        &BrokerGateway::admin_key(&system, &instance),
                        Some((&system, &instance)),
                        None,
                    )
                    .await?;
            }
        }
        self.locate(instance_id).await.map(|(_, instance)| instance)
    }

    async fn teardown(&self, system: &System, instance: &Instance) {
        if let Some(runner) = instance
            .id
            .as_deref()
            .and_then(|id| self.registry.by_instance_id(id))
        {
            if let Err(e) = self.stop(&runner).await {
                warn!(plugin = %runner.unique_name(), error = %e, "Stop before removal failed");
            }
            self.registry.remove(&runner.unique_name());
        } else if !instance.status.is_terminal()
            && let Err(e) = self
                .gateway
                .publish_admin(
                    STOP_COMMAND,
                    &BrokerGateway::admin_key(system, instance),
                    Some((system, instance)),
                    None,
                )
                .await
        {
            debug!(instance = %instance.name, error = %e, "Stop message not delivered");
        }

        for queue in [&instance.queue_info.request, &instance.queue_info.admin]
            .into_iter()
            .flatten()
        {
            self.gateway.destroy_queue(&queue.name, true).await;
        }
    }

    /// Stop an instance, tear down its queues and drop it from its system.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<()> {
        let (mut system, instance) = self.locate(instance_id).await?;
        self.teardown(&system, &instance).await;
        system
            .instances
            .retain(|i| i.id.as_deref() != Some(instance_id));
        self.catalog.save_system(&system).await?;
        info!(system = %system.display_key(), instance = %instance.name, "Instance removed");
        Ok(())
    }

    /// Stop every instance of a system, tear down its queues and delete it.
    pub async fn remove_system(&self, system_id: &str) -> Result<()> {
        let system = self
            .catalog
            .get_system(system_id)
            .await?
            .ok_or_else(|| Error::not_found("system", system_id))?;
        for instance in &system.instances {
            self.teardown(&system, instance).await;
        }
        self.catalog.delete_system(system_id).await?;
        info!(system = %system.display_key(), "System removed");
        Ok(())
    }
}
