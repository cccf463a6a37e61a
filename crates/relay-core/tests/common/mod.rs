// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for relay-core integration tests.
//!
//! Provides a TestContext running a full [`CoreRuntime`] on the in-memory
//! catalog and broker, with mock plugin runners and an RPC client.

#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relay_core::broker::MemoryBroker;
use relay_core::catalog::{Catalog, MemoryCatalog};
use relay_core::config::{PluginConfig, PruneConfig, RpcConfig};
use relay_core::rpc::{ClientError, RpcClient, RpcRequest};
use relay_core::runner::MockRunnerFactory;
use relay_core::runtime::CoreRuntime;
use relay_model::{Command, Instance, Parameter, ParameterType, System};
use serde_json::Value;
use tempfile::TempDir;

/// Test context owning a running core and a client connected to it.
pub struct TestContext {
    pub plugin_dir: TempDir,
    pub catalog: Arc<MemoryCatalog>,
    pub broker: Arc<MemoryBroker>,
    pub factory: Arc<MockRunnerFactory>,
    pub runtime: CoreRuntime,
    pub client: RpcClient,
}

impl TestContext {
    /// Start a core with an empty plugin directory.
    pub async fn new() -> Self {
        Self::with_plugins(|_| {}).await
    }

    /// Start a core after `setup` has populated the plugin directory.
    pub async fn with_plugins(setup: impl FnOnce(&Path)) -> Self {
        let plugin_dir = tempfile::tempdir().unwrap();
        setup(plugin_dir.path());

        let catalog = Arc::new(MemoryCatalog::new());
        let broker = Arc::new(MemoryBroker::new());
        let factory = Arc::new(MockRunnerFactory::new(catalog.clone()));

        let runtime = CoreRuntime::builder()
            .catalog(catalog.clone())
            .broker(broker.clone())
            .runner_factory(factory.clone())
            .plugin(PluginConfig {
                directory: plugin_dir.path().to_path_buf(),
                startup_timeout: Duration::from_secs(2),
                shutdown_timeout: Duration::from_secs(2),
                ..Default::default()
            })
            .pruning(PruneConfig {
                info_ttl: None,
                action_ttl: None,
                ..Default::default()
            })
            .rpc(RpcConfig {
                addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                max_workers: 4,
            })
            .build()
            .start()
            .await
            .expect("runtime starts");

        let client = RpcClient::connect(runtime.rpc_addr(), Duration::from_secs(5))
            .await
            .expect("client connects");

        Self {
            plugin_dir,
            catalog,
            broker,
            factory,
            runtime,
            client,
        }
    }

    /// Issue a call, returning the raw result.
    pub async fn call(&self, request: RpcRequest) -> Result<Value, ClientError> {
        self.client.call(&request).await
    }

    /// Store `system` and provision its first instance's queues.
    pub async fn register(&self, system: System) -> System {
        let system = self.catalog.create_system(system).await.unwrap();
        let instance_id = system.instances[0].id.clone().unwrap();
        self.call(RpcRequest::InitializeInstance { instance_id })
            .await
            .unwrap();
        self.catalog
            .get_system(system.id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap()
    }

    /// Shut the core down.
    pub async fn shutdown(self) {
        self.runtime.shutdown().await.unwrap();
    }
}

/// Write a local plugin directory with a `plugin.toml`.
pub fn write_plugin(root: &Path, name: &str, requires: &[&str]) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("main.py"), "").unwrap();
    let requires = requires
        .iter()
        .map(|r| format!("\"{r}\""))
        .collect::<Vec<_>>()
        .join(", ");
    fs::write(
        dir.join("plugin.toml"),
        format!(
            "NAME = \"{name}\"\nVERSION = \"1.0.0\"\nPLUGIN_ENTRY = \"main.py\"\nREQUIRES = [{requires}]\n"
        ),
    )
    .unwrap();
}

/// `echo/1.0.0` with instance `default` and the given commands.
pub fn echo_system(commands: Vec<Command>) -> System {
    let mut system = System::new("echo", "1.0.0");
    system.commands = commands;
    system.instances.push(Instance::new("default"));
    system
}

/// Command with the given parameters.
pub fn command(name: &str, parameters: Vec<Parameter>) -> Command {
    Command {
        name: name.to_string(),
        parameters,
        ..Default::default()
    }
}

/// Required parameter of `parameter_type`.
pub fn parameter(key: &str, parameter_type: ParameterType) -> Parameter {
    Parameter {
        key: key.to_string(),
        parameter_type,
        ..Default::default()
    }
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
