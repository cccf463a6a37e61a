// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Simulates a plugin without spawning a process. A started mock reports
//! itself `RUNNING` the way a real plugin does after its `_start` handler,
//! and a cleanly stopping mock records `STOPPED`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relay_model::InstanceStatus;
use tokio::sync::{Mutex, watch};
use tracing::warn;

use super::traits::*;
use crate::catalog::Catalog;

/// How a mock plugin behaves.
#[derive(Debug, Clone, Copy)]
pub struct MockBehavior {
    /// `start` fails.
    pub fail_start: bool,
    /// Report `RUNNING` once started.
    pub report_running: bool,
    /// Exit on `stop` and record `STOPPED`.
    pub clean_shutdown: bool,
    /// Keep running after `stop`, until killed.
    pub ignore_stop: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_start: false,
            report_running: true,
            clean_shutdown: true,
            ignore_stop: false,
        }
    }
}

/// Mock runner for testing.
pub struct MockRunner {
    options: LaunchOptions,
    catalog: Arc<dyn Catalog>,
    behavior: MockBehavior,
    started_log: Arc<Mutex<Vec<String>>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    killed: AtomicBool,
    running: watch::Sender<bool>,
}

impl MockRunner {
    /// Create a new mock runner.
    pub fn new(options: LaunchOptions, catalog: Arc<dyn Catalog>, behavior: MockBehavior) -> Self {
        Self::with_log(options, catalog, behavior, Arc::new(Mutex::new(Vec::new())))
    }

    fn with_log(
        options: LaunchOptions,
        catalog: Arc<dyn Catalog>,
        behavior: MockBehavior,
        started_log: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            options,
            catalog,
            behavior,
            started_log,
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            running,
        }
    }

    /// Whether `kill` reached a live process.
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Simulate the process crashing.
    pub fn crash(&self) {
        self.running.send_replace(false);
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    fn options(&self) -> &LaunchOptions {
        &self.options
    }

    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyStarted(self.unique_name()));
        }
        if self.behavior.fail_start {
            return Err(RunnerError::StartFailed(format!(
                "{} refused to start",
                self.unique_name()
            )));
        }

        self.running.send_replace(true);
        self.started_log.lock().await.push(self.unique_name());
        if self.behavior.report_running
            && let Err(e) = super::set_instance_status(
                self.catalog.as_ref(),
                self.instance_id(),
                InstanceStatus::Running,
            )
            .await
        {
            warn!(plugin = %self.unique_name(), error = %e, "Mock could not report running");
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.behavior.ignore_stop || !*self.running.borrow() {
            return;
        }
        if self.behavior.clean_shutdown
            && let Err(e) = super::set_instance_status(
                self.catalog.as_ref(),
                self.instance_id(),
                InstanceStatus::Stopped,
            )
            .await
        {
            warn!(plugin = %self.unique_name(), error = %e, "Mock could not report stopped");
        }
        self.running.send_replace(false);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    async fn kill(&self) -> Result<()> {
        if *self.running.borrow() {
            self.killed.store(true, Ordering::SeqCst);
        }
        self.running.send_replace(false);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        *self.running.borrow()
    }

    async fn join(&self, timeout: Duration) -> bool {
        let mut running = self.running.subscribe();
        tokio::time::timeout(timeout, running.wait_for(|alive| !*alive))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

/// Builds [`MockRunner`]s sharing one start-order log.
pub struct MockRunnerFactory {
    catalog: Arc<dyn Catalog>,
    default_behavior: MockBehavior,
    behaviors: std::sync::Mutex<HashMap<String, MockBehavior>>,
    started_log: Arc<Mutex<Vec<String>>>,
    created: std::sync::Mutex<Vec<Arc<MockRunner>>>,
}

impl MockRunnerFactory {
    /// Factory with default behaviour.
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            default_behavior: MockBehavior::default(),
            behaviors: std::sync::Mutex::new(HashMap::new()),
            started_log: Arc::new(Mutex::new(Vec::new())),
            created: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Override behaviour for every instance of `system`.
    pub fn set_behavior(&self, system: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(system.to_string(), behavior);
    }

    /// Unique names in the order they started.
    pub async fn start_order(&self) -> Vec<String> {
        self.started_log.lock().await.clone()
    }

    /// Every runner built so far, oldest first.
    pub fn created(&self) -> Vec<Arc<MockRunner>> {
        self.created
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl RunnerFactory for MockRunnerFactory {
    fn create(&self, options: LaunchOptions) -> Arc<dyn Runner> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&options.system_name)
            .copied()
            .unwrap_or(self.default_behavior);
        let runner = Arc::new(MockRunner::with_log(
            options,
            self.catalog.clone(),
            behavior,
            self.started_log.clone(),
        ));
        self.created
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(runner.clone());
        runner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::catalog::tests::echo_system;
    use crate::runner::instance_status;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    async fn setup() -> (Arc<MemoryCatalog>, LaunchOptions) {
        let catalog = Arc::new(MemoryCatalog::new());
        let system = catalog.create_system(echo_system()).await.unwrap();
        let options = LaunchOptions {
            system_name: "echo".into(),
            system_version: "1.0.0".into(),
            instance_name: "default".into(),
            instance_id: system.instances[0].id.clone().unwrap(),
            plugin_path: PathBuf::from("/plugins/echo"),
            entry_point: EntryPoint::File("main.py".into()),
            args: vec![],
            env: BTreeMap::new(),
            requirements: vec![],
            log_level: "INFO".into(),
            log_dir: None,
            interpreter: None,
        };
        (catalog, options)
    }

    #[tokio::test]
    async fn test_start_reports_running_and_stop_reports_stopped() {
        let (catalog, options) = setup().await;
        let id = options.instance_id.clone();
        let factory = MockRunnerFactory::new(catalog.clone());
        let runner = factory.create(options);

        runner.start().await.unwrap();
        assert!(runner.is_alive());
        assert_eq!(
            instance_status(catalog.as_ref(), &id).await.unwrap(),
            InstanceStatus::Running
        );
        assert_eq!(factory.start_order().await, vec!["echo[default]-1.0.0"]);

        runner.stop().await;
        assert!(runner.join(Duration::from_millis(10)).await);
        assert_eq!(
            instance_status(catalog.as_ref(), &id).await.unwrap(),
            InstanceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_ignore_stop_needs_kill() {
        let (catalog, options) = setup().await;
        let runner = MockRunner::new(
            options,
            catalog,
            MockBehavior {
                ignore_stop: true,
                ..Default::default()
            },
        );
        runner.start().await.unwrap();
        runner.stop().await;
        assert!(!runner.join(Duration::from_millis(10)).await);
        runner.kill().await.unwrap();
        assert!(runner.was_killed());
        assert!(!runner.is_alive());
    }

    #[tokio::test]
    async fn test_fail_start() {
        let (catalog, options) = setup().await;
        let factory = MockRunnerFactory::new(catalog);
        factory.set_behavior(
            "echo",
            MockBehavior {
                fail_start: true,
                ..Default::default()
            },
        );
        let runner = factory.create(options);
        assert!(runner.start().await.is_err());
        assert!(factory.start_order().await.is_empty());
    }
}
