// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay Core - command dispatch server
//!
//! Serves:
//! - Plugin lifecycle (scan, load, start, stop, reload)
//! - Request dispatch to plugin queues over AMQP
//! - Instance health (status probes and heartbeat sweeps)
//! - The RPC surface consumed by the REST layer

use tracing::{info, warn};

use relay_core::config::Config;
use relay_core::runtime::CoreRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        rpc_addr = %config.rpc.addr,
        broker_host = %config.broker.host,
        plugin_dir = %config.plugin.directory.display(),
        "Starting Relay Core"
    );

    let builder = CoreRuntime::builder().config(&config)?;

    // Ctrl-C aborts connection retries during startup as well.
    let stop = builder.stop_flag();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown signal received");
                    stop.stop();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        }
    });

    let runtime = builder.build().start().await?;
    info!(addr = %runtime.rpc_addr(), "Relay Core ready");

    stop.stopped().await;
    runtime.shutdown().await?;

    info!("Relay Core shut down");

    Ok(())
}
