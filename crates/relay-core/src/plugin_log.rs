// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Logging configuration handed to plugins.
//!
//! Plugins fetch this document at startup and configure their own logging
//! from it. The core keeps one document, optionally read from a JSON file,
//! and overrides its level per system with the level a local plugin
//! declared.

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::error::Result;
use crate::registry::PluginRegistry;

const DEFAULT_FORMAT: &str = "%(asctime)s - %(name)s - %(levelname)s - %(message)s";

/// Logging document for plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLogConfig {
    /// Root level.
    pub level: String,
    /// Line format.
    #[serde(default = "default_format")]
    pub format: String,
    /// Handler definitions, passed through untouched.
    #[serde(default = "default_handlers")]
    pub handlers: Map<String, Value>,
}

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

fn default_handlers() -> Map<String, Value> {
    let mut handlers = Map::new();
    handlers.insert(
        "stdout".to_string(),
        json!({"class": "logging.StreamHandler", "stream": "ext://sys.stdout"}),
    );
    handlers
}

impl PluginLogConfig {
    /// Document with the default format and a stdout handler.
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: default_format(),
            handlers: default_handlers(),
        }
    }
}

/// Holds the current plugin logging document.
pub struct PluginLogManager {
    default_level: String,
    file: Option<PathBuf>,
    current: RwLock<PluginLogConfig>,
}

impl PluginLogManager {
    /// Manager starting from the default document at `default_level`. Call
    /// [`reload`](Self::reload) to read `file`.
    pub fn new(default_level: impl Into<String>, file: Option<PathBuf>) -> Self {
        let default_level = default_level.into();
        Self {
            current: RwLock::new(PluginLogConfig::with_level(&default_level)),
            default_level,
            file,
        }
    }

    /// The document for one system. A local plugin's declared level wins.
    pub fn config_for(&self, system_name: &str, registry: &PluginRegistry) -> PluginLogConfig {
        let mut config = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(runner) = registry
            .all()
            .into_iter()
            .find(|r| r.options().system_name == system_name)
        {
            config.level = runner.options().log_level.clone();
        }
        config
    }

    /// Re-read the configured file. Without a file the default document is
    /// restored. On error the current document is kept.
    pub fn reload(&self) -> Result<PluginLogConfig> {
        let config = match &self.file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                let mut config: PluginLogConfig = serde_json::from_str(&raw)?;
                config.level = config.level.to_uppercase();
                config
            }
            None => PluginLogConfig::with_level(&self.default_level),
        };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        info!(level = %config.level, file = ?self.file, "Plugin log config reloaded");
        Ok(config)
    }
}
