// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local subprocess runner.
//!
//! The child runs in its own process group, so an interrupt delivered to the
//! core's group does not reach it; the lifecycle manager decides when it
//! stops. Stdout and stderr are drained line by line and re-emitted through
//! `tracing` under the `relay_core::plugin` target.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use relay_model::InstanceStatus;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::traits::*;
use crate::catalog::Catalog;

static LEVEL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL)\b").expect("valid regex")
});

/// Log level token found in a plugin output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub(crate) fn line_level(line: &str) -> Option<LineLevel> {
    let token = LEVEL_TOKEN.captures(line)?;
    Some(match &token[1] {
        "DEBUG" => LineLevel::Debug,
        "INFO" => LineLevel::Info,
        "WARN" | "WARNING" => LineLevel::Warn,
        _ => LineLevel::Error,
    })
}

/// Re-emit one plugin output line. Lines carrying their own level token are
/// passed through as-is; anything else is logged at INFO with the plugin
/// name attached.
fn emit_line(plugin: &str, line: &str) {
    match line_level(line) {
        Some(LineLevel::Debug) => debug!(target: "relay_core::plugin", "{line}"),
        Some(LineLevel::Info) => info!(target: "relay_core::plugin", "{line}"),
        Some(LineLevel::Warn) => warn!(target: "relay_core::plugin", "{line}"),
        Some(LineLevel::Error) => error!(target: "relay_core::plugin", "{line}"),
        None => info!(target: "relay_core::plugin", plugin, "{line}"),
    }
}

type LogFile = Arc<Mutex<File>>;

async fn drain<R>(plugin: String, stream: R, log_file: Option<LogFile>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                emit_line(&plugin, &line);
                if let Some(file) = &log_file {
                    let mut file = file.lock().await;
                    if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                        warn!(plugin = %plugin, error = %e, "Failed to write plugin log file");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "Plugin output reader failed");
                break;
            }
        }
    }
}

/// Runs one plugin instance as a child process.
pub struct LocalRunner {
    options: LaunchOptions,
    catalog: Arc<dyn Catalog>,
    started: AtomicBool,
    stop_requested: Arc<AtomicBool>,
    pid: AtomicI32,
    exited: Arc<watch::Sender<bool>>,
}

impl LocalRunner {
    /// Unstarted runner.
    pub fn new(options: LaunchOptions, catalog: Arc<dyn Catalog>) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            options,
            catalog,
            started: AtomicBool::new(false),
            stop_requested: Arc::new(AtomicBool::new(false)),
            pid: AtomicI32::new(0),
            exited: Arc::new(exited),
        }
    }

    async fn open_log_file(&self) -> Option<LogFile> {
        let dir = self.options.log_dir.as_ref()?;
        let path: PathBuf = dir.join(format!("{}.log", self.unique_name()));
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(path = %dir.display(), error = %e, "Failed to create plugin log directory");
            return None;
        }
        match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(file) => Some(Arc::new(Mutex::new(file))),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open plugin log file");
                None
            }
        }
    }
}

#[async_trait]
impl Runner for LocalRunner {
    fn runner_type(&self) -> &'static str {
        "local"
    }

    fn options(&self) -> &LaunchOptions {
        &self.options
    }

    async fn start(&self) -> Result<()> {
        let unique_name = self.unique_name();
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyStarted(unique_name));
        }

        let argv = self.options.executable();
        let Some((program, args)) = argv.split_first() else {
            return Err(RunnerError::StartFailed(format!(
                "{unique_name} has an empty command line"
            )));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.options.plugin_path)
            .envs(&self.options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            self.exited.send_replace(true);
            RunnerError::StartFailed(format!("{unique_name}: {e}"))
        })?;
        if let Some(pid) = child.id() {
            self.pid.store(pid as i32, Ordering::SeqCst);
        }
        info!(plugin = %unique_name, command = ?argv, pid = child.id(), "Plugin process started");

        let log_file = self.open_log_file().await;
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain(
                unique_name.clone(),
                stdout,
                log_file.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain(unique_name.clone(), stderr, log_file)));
        }

        let stop_requested = self.stop_requested.clone();
        let exited = self.exited.clone();
        let catalog = self.catalog.clone();
        let instance_id = self.options.instance_id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            for reader in readers {
                if let Err(e) = reader.await {
                    warn!(plugin = %unique_name, error = %e, "Plugin output reader panicked");
                }
            }
            exited.send_replace(true);

            if stop_requested.load(Ordering::SeqCst) {
                debug!(plugin = %unique_name, status = ?status, "Plugin process exited");
                return;
            }
            error!(plugin = %unique_name, status = ?status, "Plugin terminated unexpectedly");
            if let Err(e) =
                super::set_instance_status(catalog.as_ref(), &instance_id, InstanceStatus::Dead)
                    .await
            {
                warn!(plugin = %unique_name, error = %e, "Failed to mark plugin dead");
            }
        });

        Ok(())
    }

    async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    async fn kill(&self) -> Result<()> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 || !self.is_alive() {
            return Ok(());
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        match signal::killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {
                warn!(plugin = %self.unique_name(), pid, "Plugin killed");
                Ok(())
            }
            Err(e) => Err(RunnerError::Signal(e.to_string())),
        }
    }

    fn is_alive(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !*self.exited.borrow()
    }

    async fn join(&self, timeout: Duration) -> bool {
        if !self.started.load(Ordering::SeqCst) {
            return true;
        }
        let mut exited = self.exited.subscribe();
        tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

/// Builds [`LocalRunner`]s.
pub struct LocalRunnerFactory {
    catalog: Arc<dyn Catalog>,
}

impl LocalRunnerFactory {
    /// Factory whose runners record status in `catalog`.
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

impl RunnerFactory for LocalRunnerFactory {
    fn create(&self, options: LaunchOptions) -> Arc<dyn Runner> {
        Arc::new(LocalRunner::new(options, self.catalog.clone()))
    }
}
