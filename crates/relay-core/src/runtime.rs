// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for relay-core.
//!
//! [`CoreRuntime`] wires the catalog, the broker gateway, the plugin
//! lifecycle and the request dispatcher together, then runs the heartbeat
//! monitor, the request pruner and the RPC server as background tasks.
//!
//! ```rust,ignore
//! use relay_core::config::Config;
//! use relay_core::runtime::CoreRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let runtime = CoreRuntime::builder()
//!         .config(&config)?
//!         .build()
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Startup retries catalog and broker connectivity with exponential backoff
//! (1 s doubling up to 30 s) until it succeeds or the [`StopFlag`] is raised.

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{AmqpBroker, Broker, BrokerGateway, GatewayConfig, MemoryBroker};
use crate::catalog::{self, Catalog};
use crate::config::{BrokerKind, Config, PluginConfig, PruneConfig, RpcConfig, WebConfig};
use crate::dispatch::RequestDispatcher;
use crate::error::Error;
use crate::heartbeat_monitor::{HeartbeatMonitor, HeartbeatMonitorConfig};
use crate::lifecycle::{LifecycleManager, LifecycleTimeouts};
use crate::loader::PluginLoader;
use crate::plugin_log::PluginLogManager;
use crate::registry::PluginRegistry;
use crate::request_pruner::RequestPruner;
use crate::rpc::{CoreHandlerState, RpcServer};
use crate::runner::{LocalRunnerFactory, RunnerFactory};
use crate::validator::RequestValidator;
use crate::wait_map::BlockingWaitMap;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Cooperative stop signal shared by startup and the running tasks.
#[derive(Clone)]
pub struct StopFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }
}

impl StopFlag {
    /// Raise the flag. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the flag is raised.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // Only fails if the sender is gone, which `self` rules out.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Retry `attempt` with exponential backoff until it succeeds or `stop` is
/// raised.
pub async fn with_backoff<T, E, F, Fut>(
    what: &str,
    stop: &StopFlag,
    mut attempt: F,
) -> crate::Result<T>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut delay = INITIAL_BACKOFF;
    loop {
        if stop.is_stopped() {
            return Err(Error::Shutdown);
        }
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => warn!(
                target_service = what,
                error = %e,
                retry_in_secs = delay.as_secs(),
                "Connection attempt failed"
            ),
        }
        tokio::select! {
            biased;

            _ = stop.stopped() => return Err(Error::Shutdown),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_BACKOFF);
    }
}

/// Builder for creating a [`CoreRuntime`].
pub struct CoreRuntimeBuilder {
    catalog: Option<Arc<dyn Catalog>>,
    catalog_url: String,
    broker: Option<Arc<dyn Broker>>,
    runner_factory: Option<Arc<dyn RunnerFactory>>,
    gateway: GatewayConfig,
    web: WebConfig,
    plugin: PluginConfig,
    pruning: PruneConfig,
    rpc: RpcConfig,
    stop: StopFlag,
}

impl Default for CoreRuntimeBuilder {
    fn default() -> Self {
        Self {
            catalog: None,
            catalog_url: "memory".to_string(),
            broker: None,
            runner_factory: None,
            gateway: GatewayConfig::default(),
            web: WebConfig::default(),
            plugin: PluginConfig::default(),
            pruning: PruneConfig::default(),
            rpc: RpcConfig::default(),
            stop: StopFlag::default(),
        }
    }
}

impl CoreRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a loaded [`Config`]. Picks the broker implementation and
    /// catalog URL it names.
    pub fn config(mut self, config: &Config) -> Result<Self> {
        let broker: Arc<dyn Broker> = match config.broker.kind {
            BrokerKind::Amqp => Arc::new(AmqpBroker::new(config.broker.clone())?),
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        };
        self.broker = Some(broker);
        self.catalog_url = config.catalog_url.clone();
        self.gateway = GatewayConfig {
            exchange: config.broker.exchange.clone(),
            publish_timeout: config.broker.publish_timeout,
            admin_expiry: config.broker.admin_expiry,
            plugin_user: config
                .plugin
                .username
                .clone()
                .unwrap_or_else(|| config.broker.user.clone()),
            plugin_password: config
                .plugin
                .password
                .clone()
                .unwrap_or_else(|| config.broker.password.clone()),
            ..GatewayConfig::default()
        };
        self.web = config.web.clone();
        self.plugin = config.plugin.clone();
        self.pruning = config.pruning.clone();
        self.rpc = config.rpc.clone();
        Ok(self)
    }

    /// Use an already opened catalog instead of connecting to the URL.
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Catalog URL, `memory` or a `sqlite:` URL.
    ///
    /// Default: `memory`
    pub fn catalog_url(mut self, url: impl Into<String>) -> Self {
        self.catalog_url = url.into();
        self
    }

    /// Set the broker transport.
    ///
    /// Default: an in-process [`MemoryBroker`]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the factory building plugin runners.
    ///
    /// Default: [`LocalRunnerFactory`] spawning child processes
    pub fn runner_factory(mut self, factory: Arc<dyn RunnerFactory>) -> Self {
        self.runner_factory = Some(factory);
        self
    }

    /// Set the gateway settings.
    pub fn gateway(mut self, config: GatewayConfig) -> Self {
        self.gateway = config;
        self
    }

    /// Set the local plugin settings.
    pub fn plugin(mut self, config: PluginConfig) -> Self {
        self.plugin = config;
        self
    }

    /// Set request retention.
    pub fn pruning(mut self, config: PruneConfig) -> Self {
        self.pruning = config;
        self
    }

    /// Set the RPC listen address and worker count.
    pub fn rpc(mut self, config: RpcConfig) -> Self {
        self.rpc = config;
        self
    }

    /// The flag that aborts startup retries and stops the running tasks.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Build the runtime configuration.
    pub fn build(self) -> CoreRuntimeConfig {
        CoreRuntimeConfig { builder: self }
    }
}

/// Configuration for a [`CoreRuntime`].
pub struct CoreRuntimeConfig {
    builder: CoreRuntimeBuilder,
}

impl CoreRuntimeConfig {
    /// Connect, load and start local plugins, then spawn the background
    /// tasks.
    pub async fn start(self) -> Result<CoreRuntime> {
        let b = self.builder;
        let stop = b.stop.clone();

        let catalog = match b.catalog {
            Some(catalog) => catalog,
            None => {
                let url = b.catalog_url.clone();
                with_backoff("catalog", &stop, || catalog::connect(&url)).await?
            }
        };
        let probe = &catalog;
        with_backoff("catalog", &stop, || async move {
            if probe.is_alive().await {
                Ok(())
            } else {
                Err("catalog not reachable")
            }
        })
        .await?;
        info!("Catalog connected");

        let broker = b
            .broker
            .unwrap_or_else(|| Arc::new(MemoryBroker::new()) as Arc<dyn Broker>);
        let wait_map = Arc::new(BlockingWaitMap::new());
        let gateway = Arc::new(
            BrokerGateway::new(broker, catalog.clone(), b.gateway).with_wait_map(wait_map.clone()),
        );
        with_backoff("broker", &stop, || gateway.declare_exchange()).await?;

        let factory = b
            .runner_factory
            .unwrap_or_else(|| Arc::new(LocalRunnerFactory::new(catalog.clone())));
        let plugin_log = Arc::new(PluginLogManager::new(
            b.plugin.log_level.clone(),
            b.plugin.log_config_file.clone(),
        ));
        if b.plugin.log_config_file.is_some()
            && let Err(e) = plugin_log.reload()
        {
            warn!(error = %e, "Failed to read plugin log config, using defaults");
        }

        let timeouts = LifecycleTimeouts {
            startup: b.plugin.startup_timeout,
            shutdown: b.plugin.shutdown_timeout,
        };
        let monitor_config = HeartbeatMonitorConfig {
            interval: b.plugin.status_heartbeat,
            timeout: b.plugin.status_timeout,
        };
        let loader = Arc::new(PluginLoader::new(
            catalog.clone(),
            factory,
            b.web,
            b.plugin,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(PluginRegistry::new()),
            gateway.clone(),
            loader,
            catalog.clone(),
            timeouts,
        ));
        let dispatcher = Arc::new(RequestDispatcher::new(
            catalog.clone(),
            gateway.clone(),
            Arc::new(RequestValidator::new(catalog.clone())),
            wait_map,
        ));

        let report = lifecycle.scan_path().await;
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Local plugins started"
        );
        if !report.failed.is_empty() {
            warn!(plugins = ?report.failed, "Some local plugins failed to start");
        }

        let state = Arc::new(CoreHandlerState::new(
            catalog.clone(),
            gateway.clone(),
            dispatcher,
            lifecycle,
            plugin_log,
        ));

        let monitor = Arc::new(HeartbeatMonitor::new(
            catalog.clone(),
            gateway,
            monitor_config,
        ));
        let monitor_handle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run().await }
        });

        let pruner = RequestPruner::new(catalog, b.pruning);
        let pruner_shutdown = pruner.shutdown_handle();
        let pruner_handle = tokio::spawn(async move { pruner.run().await });

        let server = RpcServer::bind(b.rpc.addr, b.rpc.max_workers).await?;
        let rpc_addr = server.local_addr()?;
        let server_handle = tokio::spawn(server.run(state.clone(), stop.subscribe()));

        info!(rpc_addr = %rpc_addr, "CoreRuntime started");

        Ok(CoreRuntime {
            server_handle,
            monitor_handle,
            pruner_handle,
            monitor,
            pruner_shutdown,
            state,
            rpc_addr,
            stop,
        })
    }
}

/// A running relay core.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CoreRuntime {
    server_handle: JoinHandle<std::result::Result<(), crate::rpc::ServerError>>,
    monitor_handle: JoinHandle<()>,
    pruner_handle: JoinHandle<()>,
    monitor: Arc<HeartbeatMonitor>,
    pruner_shutdown: Arc<Notify>,
    state: Arc<CoreHandlerState>,
    rpc_addr: SocketAddr,
    stop: StopFlag,
}

impl CoreRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CoreRuntimeBuilder {
        CoreRuntimeBuilder::new()
    }

    /// Address the RPC server listens on.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Shared handler state.
    pub fn state(&self) -> &Arc<CoreHandlerState> {
        &self.state
    }

    /// The runtime's stop flag.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Check if the runtime is still running.
    ///
    /// The pruner exits at once when no retention is configured, so only the
    /// server and the monitor count.
    pub fn is_running(&self) -> bool {
        !self.stop.is_stopped()
            && !self.server_handle.is_finished()
            && !self.monitor_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// New requests are refused from here on. The monitor, pruner and RPC
    /// server are stopped, then every local plugin.
    pub async fn shutdown(self) -> Result<()> {
        info!("CoreRuntime shutting down...");

        self.stop.stop();
        self.state.dispatcher.begin_shutdown();
        self.monitor.stop();
        self.pruner_shutdown.notify_one();

        if let Err(e) = self.monitor_handle.await {
            error!("Heartbeat monitor task panicked: {}", e);
        }
        if let Err(e) = self.pruner_handle.await {
            error!("Request pruner task panicked: {}", e);
        }

        self.state.lifecycle.stop_all().await;

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("CoreRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("RPC server error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("RPC server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_until_success() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let started = tokio::time::Instant::now();
        let value = with_backoff("test", &StopFlag::default(), || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err("down")
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 1 + 2 + 4 seconds of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let started = tokio::time::Instant::now();
        with_backoff("test", &StopFlag::default(), || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 7 {
                Err("down")
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        // 1 + 2 + 4 + 8 + 16 + 30 + 30
        assert_eq!(started.elapsed(), Duration::from_secs(91));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_honours_stop() {
        let stop = StopFlag::default();
        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.stop();
        });
        let result: crate::Result<()> =
            with_backoff("test", &stop, || async { Err::<(), _>("down") }).await;
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_stop_flag() {
        let stop = StopFlag::default();
        assert!(!stop.is_stopped());
        stop.stop();
        stop.stop();
        assert!(stop.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), stop.stopped())
            .await
            .unwrap();
    }
}
