// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! A runner supervises exactly one plugin instance. Runners do not own the
//! instance status: it lives in the catalog and is read and written through
//! [`super::instance_status`] and [`super::set_instance_status`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The process could not be launched.
    #[error("Plugin start failed: {0}")]
    StartFailed(String),

    /// `start` was called on a runner that already ran.
    #[error("Plugin {0} was already started")]
    AlreadyStarted(String),

    /// Signalling the process failed.
    #[error("Failed to signal plugin: {0}")]
    Signal(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// How the plugin process is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    /// Script path relative to the plugin directory.
    File(PathBuf),
    /// `-m module`.
    Module(String),
}

/// Everything needed to (re)launch one plugin instance.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// System name.
    pub system_name: String,
    /// System version.
    pub system_version: String,
    /// Instance name.
    pub instance_name: String,
    /// Catalog id of the instance.
    pub instance_id: String,
    /// Plugin directory, also the working directory.
    pub plugin_path: PathBuf,
    /// Entry point.
    pub entry_point: EntryPoint,
    /// Extra arguments.
    pub args: Vec<String>,
    /// Environment additions, `BG_*` included.
    pub env: BTreeMap<String, String>,
    /// Systems that must be running first.
    pub requirements: Vec<String>,
    /// Plugin log level.
    pub log_level: String,
    /// Directory for per-plugin log files.
    pub log_dir: Option<PathBuf>,
    /// Interpreter prepended to the entry point.
    pub interpreter: Option<String>,
}

impl LaunchOptions {
    /// `system[instance]-version`, the registry key.
    pub fn unique_name(&self) -> String {
        format!(
            "{}[{}]-{}",
            self.system_name, self.instance_name, self.system_version
        )
    }

    /// Full command line: interpreter, entry point, arguments.
    pub fn executable(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(interpreter) = &self.interpreter {
            argv.push(interpreter.clone());
        }
        match &self.entry_point {
            EntryPoint::File(path) => argv.push(path.to_string_lossy().into_owned()),
            EntryPoint::Module(module) => {
                argv.push("-m".to_string());
                argv.push(module.clone());
            }
        }
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Supervisor of one plugin instance.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runner type identifier (e.g. "local", "mock").
    fn runner_type(&self) -> &'static str;

    /// Launch configuration.
    fn options(&self) -> &LaunchOptions;

    /// Registry key.
    fn unique_name(&self) -> String {
        self.options().unique_name()
    }

    /// Catalog id of the instance.
    fn instance_id(&self) -> &str {
        &self.options().instance_id
    }

    /// Launch the process. A runner starts at most once.
    async fn start(&self) -> Result<()>;

    /// Ask the runner to stop cooperatively. Does not wait.
    async fn stop(&self);

    /// Whether `stop` has been called.
    fn stop_requested(&self) -> bool;

    /// Kill the process outright.
    async fn kill(&self) -> Result<()>;

    /// Whether the process is running.
    fn is_alive(&self) -> bool;

    /// Wait up to `timeout` for the process to exit. True when it has.
    async fn join(&self, timeout: Duration) -> bool;
}

/// Builds runners, so the lifecycle manager can replace a dead runner with
/// a fresh one of the same configuration.
pub trait RunnerFactory: Send + Sync {
    /// New, unstarted runner.
    fn create(&self, options: LaunchOptions) -> Arc<dyn Runner>;
}
