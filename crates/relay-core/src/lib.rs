// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay Core - Command Dispatch Execution Core
//!
//! This crate owns the plugin catalog, provisions broker queues for every
//! plugin instance, supervises local plugin processes, validates and
//! publishes command requests, and tracks instance health.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         REST layer / CLI                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ RPC (JSON frames over TCP)
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        relay-core (This Crate)                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Request    │  │  Lifecycle  │  │  Heartbeat  │  │   Request   │     │
//! │  │ Dispatcher  │  │  Manager    │  │  Monitor    │  │   Pruner    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                 │ spawn                         │
//!           │                 ▼                               │
//!           │       ┌───────────────────┐                     │
//!           │       │  Plugin processes │◄──── AMQP ────┐     │
//!           │       └───────────────────┘               │     │
//!           ▼                                           │     ▼
//! ┌──────────────────────┐                    ┌──────────────────────┐
//! │  Catalog (SQLite)    │                    │  Broker (RabbitMQ)   │
//! └──────────────────────┘                    └──────────────────────┘
//! ```
//!
//! # Instance Status
//!
//! ```text
//!   INITIALIZING ──► STARTING ──► RUNNING ◄──► UNRESPONSIVE
//!                                  │   ▲
//!                         pause    │   │ unpause
//!                                  ▼   │
//!                                  PAUSED
//!
//!   any ──► STOPPING ──► STOPPED          any ──► DEAD
//! ```
//!
//! Requests move `CREATED → IN_PROGRESS → SUCCESS | ERROR | CANCELED`.
//! Completed requests are immutable.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_CATALOG_URL` | `sqlite:.data/relay.db?mode=rwc` | Catalog store, or `memory` |
//! | `RELAY_BROKER_KIND` | `amqp` | `amqp` or `memory` |
//! | `RELAY_BROKER_HOST` | `localhost` | Broker host |
//! | `RELAY_BROKER_PORT` | `5672` | AMQP port |
//! | `RELAY_BROKER_ADMIN_PORT` | `15672` | Management API port |
//! | `RELAY_BROKER_USER` / `RELAY_BROKER_PASSWORD` | `guest` | Broker credentials |
//! | `RELAY_BROKER_VHOST` | `/` | Virtual host |
//! | `RELAY_BROKER_EXCHANGE` | `relay` | Topic exchange name |
//! | `RELAY_BROKER_HEARTBEAT_SECS` | `3600` | AMQP heartbeat |
//! | `RELAY_BROKER_TLS` / `RELAY_BROKER_CA_CERT` | `false` / - | Broker TLS |
//! | `RELAY_BROKER_ADMIN_EXPIRY_MS` | `3600000` | Admin queue expiry |
//! | `RELAY_BROKER_PUBLISH_TIMEOUT_MS` | `5000` | Publish confirm timeout |
//! | `RELAY_PRUNE_INFO_TTL_MINS` | `15` | INFO request retention, `-1` keeps forever |
//! | `RELAY_PRUNE_ACTION_TTL_MINS` | `-1` | ACTION request retention |
//! | `RELAY_PRUNE_INTERVAL_SECS` | `60` | Pruner period |
//! | `RELAY_WEB_HOST` / `RELAY_WEB_PORT` | `localhost` / `2337` | REST layer handed to plugins |
//! | `RELAY_WEB_SSL_ENABLED` / `RELAY_WEB_URL_PREFIX` | `false` / `/` | REST layer URL |
//! | `RELAY_WEB_CA_VERIFY` / `RELAY_WEB_CA_CERT` | `true` / - | REST layer TLS |
//! | `RELAY_RPC_HOST` / `RELAY_RPC_PORT` | `0.0.0.0` / `9090` | RPC listen address |
//! | `RELAY_RPC_MAX_WORKERS` | `50` | Concurrent RPC calls |
//! | `RELAY_PLUGIN_DIR` | `plugins` | Local plugin directory |
//! | `RELAY_PLUGIN_LOG_DIR` | - | Plugin stdout/stderr directory |
//! | `RELAY_PLUGIN_STATUS_HEARTBEAT_SECS` | `10` | Status probe interval |
//! | `RELAY_PLUGIN_STATUS_TIMEOUT_SECS` | `30` | Heartbeat deadline |
//! | `RELAY_PLUGIN_STARTUP_TIMEOUT_SECS` | `5` | Wait for RUNNING |
//! | `RELAY_PLUGIN_SHUTDOWN_TIMEOUT_SECS` | `10` | Wait for STOPPED |
//! | `RELAY_PLUGIN_USERNAME` / `RELAY_PLUGIN_PASSWORD` | broker credentials | Handed to plugins |
//! | `RELAY_PLUGIN_LOG_LEVEL` | `INFO` | Default plugin log level |
//! | `RELAY_PLUGIN_LOG_CONFIG_FILE` | - | Plugin logging document |
//! | `RELAY_PLUGIN_INTERPRETER` | `python3` | Entry point interpreter, `none` to exec directly |
//!
//! # Modules
//!
//! - [`broker`]: Broker transports and the queue gateway
//! - [`catalog`]: System, instance and request storage
//! - [`dispatch`]: Request submission and completion
//! - [`lifecycle`]: Plugin and instance lifecycle
//! - [`rpc`]: RPC server, client and handlers
//! - [`runtime`]: Embeddable runtime wiring everything together
//! - [`validator`]: Parameter and choice validation

#![warn(missing_docs)]

/// Broker transports (AMQP, in-memory) and the queue gateway.
pub mod broker;

/// Persistence for systems, instances and requests.
pub mod catalog;

/// Configuration loaded from environment variables.
pub mod config;

/// Request submission, updates and cancellation.
pub mod dispatch;

/// Error types for core operations.
pub mod error;

/// Background worker probing plugins and sweeping overdue instances.
pub mod heartbeat_monitor;

/// Plugin and instance lifecycle orchestration.
pub mod lifecycle;

/// Plugin manifest discovery and runner construction.
pub mod loader;

/// Logging document handed to plugins.
pub mod plugin_log;

/// In-process registry of local plugin runners.
pub mod registry;

/// Background worker deleting expired requests.
pub mod request_pruner;

/// RPC surface consumed by the REST layer.
pub mod rpc;

/// Plugin process runners.
pub mod runner;

/// Embeddable runtime.
pub mod runtime;

/// Request validation against command definitions.
pub mod validator;

/// Blocking request rendezvous.
pub mod wait_map;

pub use error::{Error, Result};
pub use runtime::{CoreRuntime, CoreRuntimeBuilder, StopFlag};
