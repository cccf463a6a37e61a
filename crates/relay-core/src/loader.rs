// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local plugin discovery and loading.
//!
//! Every subdirectory of the plugin directory holding a `plugin.toml` is a
//! plugin. Loading one validates the file, creates or refreshes its system
//! in the catalog, and builds one runner per declared instance.
//!
//! ```toml
//! NAME = "echo"
//! VERSION = "1.0.0"
//! PLUGIN_ENTRY = "main.py"          # or "-m echo"
//! INSTANCES = ["a", "b"]            # default ["default"]
//! PLUGIN_ARGS = { a = ["--fast"] }  # or a list shared by every instance
//! REQUIRES = ["other-system"]
//! LOG_LEVEL = "DEBUG"
//!
//! [ENVIRONMENT]
//! DATA_DIR = "$BG_PLUGIN_PATH/data"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_model::{Instance, System};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::{PluginConfig, WebConfig};
use crate::runner::{EntryPoint, LaunchOptions, Runner, RunnerFactory};

/// Name of the configuration file inside a plugin directory.
pub const PLUGIN_CONFIG_FILE_NAME: &str = "plugin.toml";

/// Variables the core hands to every plugin. A plugin may redefine these
/// but may not declare any other `BG_` variable.
pub const PLUGIN_ENV_KEYS: [&str; 10] = [
    "BG_NAME",
    "BG_VERSION",
    "BG_INSTANCE_NAME",
    "BG_PLUGIN_PATH",
    "BG_WEB_HOST",
    "BG_WEB_PORT",
    "BG_SSL_ENABLED",
    "BG_URL_PREFIX",
    "BG_CA_VERIFY",
    "BG_CA_CERT",
];

const LOG_LEVELS: [&str; 6] = ["DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL"];

/// A plugin directory was rejected.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginValidationError {
    /// No configuration file.
    #[error("{path}: no {PLUGIN_CONFIG_FILE_NAME}")]
    MissingConfig {
        /// Plugin directory.
        path: PathBuf,
    },

    /// The configuration file is not valid TOML or has unknown keys.
    #[error("{path}: cannot parse {PLUGIN_CONFIG_FILE_NAME}: {reason}")]
    Parse {
        /// Plugin directory.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A required key is absent or empty.
    #[error("{path}: {field} is required")]
    MissingField {
        /// Plugin directory.
        path: PathBuf,
        /// Key name.
        field: &'static str,
    },

    /// A key has an unusable value.
    #[error("{path}: invalid {field}: {reason}")]
    Invalid {
        /// Plugin directory.
        path: PathBuf,
        /// Key name.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },
}

/// Arguments for the plugin process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PluginArgs {
    /// Same arguments for every instance.
    Shared(Vec<String>),
    /// Arguments keyed by instance name.
    PerInstance(BTreeMap<String, Vec<String>>),
}

impl Default for PluginArgs {
    fn default() -> Self {
        Self::Shared(Vec::new())
    }
}

impl PluginArgs {
    /// Arguments for one instance.
    pub fn for_instance(&self, instance: &str) -> Vec<String> {
        match self {
            Self::Shared(args) => args.clone(),
            Self::PerInstance(map) => map.get(instance).cloned().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    plugin_entry: Option<String>,
    instances: Option<Vec<String>>,
    #[serde(default)]
    plugin_args: PluginArgs,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    description: Option<String>,
    icon_name: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    log_level: Option<String>,
    max_instances: Option<usize>,
}

/// A validated `plugin.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    /// Plugin directory.
    pub path: PathBuf,
    /// System name.
    pub name: String,
    /// System version.
    pub version: String,
    /// How to start the process.
    pub entry_point: EntryPoint,
    /// Instance names, in declaration order.
    pub instances: Vec<String>,
    /// Process arguments.
    pub args: PluginArgs,
    /// Systems that must be running first.
    pub requires: Vec<String>,
    /// Extra environment, before expansion.
    pub environment: BTreeMap<String, String>,
    /// System description.
    pub description: Option<String>,
    /// System icon.
    pub icon_name: Option<String>,
    /// System display name.
    pub display_name: Option<String>,
    /// Opaque system metadata.
    pub metadata: Map<String, Value>,
    /// Plugin log level, upper case.
    pub log_level: Option<String>,
    /// Instance cap; defaults to the number of instances.
    pub max_instances: Option<usize>,
}

fn required(
    path: &Path,
    field: &'static str,
    value: Option<String>,
) -> Result<String, PluginValidationError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(PluginValidationError::MissingField {
            path: path.to_path_buf(),
            field,
        }),
    }
}

fn invalid(path: &Path, field: &'static str, reason: impl Into<String>) -> PluginValidationError {
    PluginValidationError::Invalid {
        path: path.to_path_buf(),
        field,
        reason: reason.into(),
    }
}

fn entry_point(path: &Path, raw: &str) -> Result<EntryPoint, PluginValidationError> {
    if let Some(module) = raw.strip_prefix("-m") {
        let module = module.trim();
        if module.is_empty() {
            return Err(invalid(path, "PLUGIN_ENTRY", "'-m' needs a module name"));
        }
        let package = path.join(module.replace('.', "/"));
        for file in ["__init__.py", "__main__.py"] {
            if !package.join(file).is_file() {
                return Err(invalid(
                    path,
                    "PLUGIN_ENTRY",
                    format!("module '{module}' has no {file}"),
                ));
            }
        }
        return Ok(EntryPoint::Module(module.to_string()));
    }

    let relative = Path::new(raw);
    if relative.is_absolute()
        || relative
            .components()
            .any(|part| matches!(part, std::path::Component::ParentDir))
    {
        return Err(invalid(path, "PLUGIN_ENTRY", format!("'{raw}' escapes the plugin directory")));
    }
    if !path.join(relative).is_file() {
        return Err(invalid(path, "PLUGIN_ENTRY", format!("'{raw}' does not exist")));
    }
    Ok(EntryPoint::File(relative.to_path_buf()))
}

/// Read and validate the configuration of the plugin in `dir`.
pub fn read_manifest(dir: &Path) -> Result<PluginManifest, PluginValidationError> {
    let file = dir.join(PLUGIN_CONFIG_FILE_NAME);
    let raw = std::fs::read_to_string(&file).map_err(|_| PluginValidationError::MissingConfig {
        path: dir.to_path_buf(),
    })?;
    let raw: RawManifest = toml::from_str(&raw).map_err(|e| PluginValidationError::Parse {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    validate_manifest(dir, raw)
}

fn validate_manifest(dir: &Path, raw: RawManifest) -> Result<PluginManifest, PluginValidationError> {
    let name = required(dir, "NAME", raw.name)?;
    let version = required(dir, "VERSION", raw.version)?;
    let entry = required(dir, "PLUGIN_ENTRY", raw.plugin_entry)?;
    let entry_point = entry_point(dir, &entry)?;

    let instances = raw.instances.unwrap_or_else(|| vec!["default".to_string()]);
    if instances.is_empty() {
        return Err(invalid(dir, "INSTANCES", "must name at least one instance"));
    }
    let mut seen = HashSet::new();
    for instance in &instances {
        if instance.trim().is_empty() {
            return Err(invalid(dir, "INSTANCES", "instance names cannot be empty"));
        }
        if !seen.insert(instance.as_str()) {
            return Err(invalid(dir, "INSTANCES", format!("duplicate instance '{instance}'")));
        }
    }

    if let PluginArgs::PerInstance(map) = &raw.plugin_args
        && let Some(unknown) = map.keys().find(|k| !seen.contains(k.as_str()))
    {
        return Err(invalid(
            dir,
            "PLUGIN_ARGS",
            format!("'{unknown}' is not a declared instance"),
        ));
    }

    if let Some(key) = raw
        .environment
        .keys()
        .find(|k| k.starts_with("BG_") && !PLUGIN_ENV_KEYS.contains(&k.as_str()))
    {
        return Err(invalid(
            dir,
            "ENVIRONMENT",
            format!("'{key}' uses the reserved BG_ prefix"),
        ));
    }

    let log_level = match raw.log_level {
        Some(level) => {
            let level = level.to_uppercase();
            if !LOG_LEVELS.contains(&level.as_str()) {
                return Err(invalid(dir, "LOG_LEVEL", format!("unknown level '{level}'")));
            }
            Some(level)
        }
        None => None,
    };

    if let Some(max) = raw.max_instances
        && max < instances.len()
    {
        return Err(invalid(
            dir,
            "MAX_INSTANCES",
            format!("{max} is fewer than the {} declared instances", instances.len()),
        ));
    }

    Ok(PluginManifest {
        path: dir.to_path_buf(),
        name,
        version,
        entry_point,
        instances,
        args: raw.plugin_args,
        requires: raw.requires,
        environment: raw.environment,
        description: raw.description,
        icon_name: raw.icon_name,
        display_name: raw.display_name,
        metadata: raw.metadata,
        log_level,
        max_instances: raw.max_instances,
    })
}

/// Expand `$VAR` and `${VAR}` against `vars`. `\$` is a literal dollar;
/// unknown variables are left as written.
pub fn expand_env(value: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' => {
                let braced = chars.peek() == Some(&'{');
                if braced {
                    chars.next();
                }
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let closed = !braced || chars.peek() == Some(&'}');
                if braced && closed {
                    chars.next();
                }
                match vars.get(&name) {
                    Some(v) if !name.is_empty() && closed => out.push_str(v),
                    _ => {
                        out.push('$');
                        if braced {
                            out.push('{');
                        }
                        out.push_str(&name);
                        if braced && closed {
                            out.push('}');
                        }
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Loads plugin directories into the catalog and builds their runners.
pub struct PluginLoader {
    catalog: Arc<dyn Catalog>,
    factory: Arc<dyn RunnerFactory>,
    web: WebConfig,
    plugin: PluginConfig,
}

impl PluginLoader {
    /// Create a loader.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        factory: Arc<dyn RunnerFactory>,
        web: WebConfig,
        plugin: PluginConfig,
    ) -> Self {
        Self {
            catalog,
            factory,
            web,
            plugin,
        }
    }

    /// Factory used for new runners.
    pub fn factory(&self) -> &Arc<dyn RunnerFactory> {
        &self.factory
    }

    /// Configured plugin directory.
    pub fn plugin_directory(&self) -> &Path {
        &self.plugin.directory
    }

    /// Plugin subdirectories of `path` (the configured directory when
    /// `None`), sorted.
    pub fn scan_plugin_path(&self, path: Option<&Path>) -> Vec<PathBuf> {
        let root = path.unwrap_or(&self.plugin.directory);
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %root.display(), error = %e, "Cannot read plugin directory");
                return Vec::new();
            }
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_dir() && p.join(PLUGIN_CONFIG_FILE_NAME).is_file())
            .collect();
        dirs.sort();
        dirs
    }

    /// Load every directory, logging and skipping the ones that fail.
    pub async fn load_plugins(&self, paths: &[PathBuf]) -> Vec<Arc<dyn Runner>> {
        let mut runners = Vec::new();
        for path in paths {
            match self.load_plugin(path).await {
                Ok(loaded) => runners.extend(loaded),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping plugin"),
            }
        }
        runners
    }

    /// Validate one plugin directory, register its system and build a runner
    /// per instance.
    pub async fn load_plugin(&self, path: &Path) -> crate::Result<Vec<Arc<dyn Runner>>> {
        let manifest = read_manifest(path)?;
        let system = self.register_system(&manifest).await?;

        let mut runners = Vec::with_capacity(manifest.instances.len());
        for name in &manifest.instances {
            let Some(instance_id) = system.instance(name).and_then(|i| i.id.clone()) else {
                continue;
            };
            runners.push(self.factory.create(self.launch_options(&manifest, name, instance_id)));
        }
        info!(
            system = %system.display_key(),
            instances = runners.len(),
            path = %path.display(),
            "Plugin loaded"
        );
        Ok(runners)
    }

    async fn register_system(&self, manifest: &PluginManifest) -> crate::Result<System> {
        let max_instances = manifest
            .max_instances
            .unwrap_or(manifest.instances.len())
            .max(1);

        match self
            .catalog
            .find_system(&manifest.name, &manifest.version)
            .await?
        {
            Some(mut system) => {
                system.description = manifest.description.clone().or(system.description);
                system.icon_name = manifest.icon_name.clone().or(system.icon_name);
                system.display_name = manifest.display_name.clone().or(system.display_name);
                if !manifest.metadata.is_empty() {
                    system.metadata = manifest.metadata.clone();
                }
                system.max_instances = max_instances;
                system.local = true;
                let mut instances = Vec::with_capacity(manifest.instances.len());
                for name in &manifest.instances {
                    match system.instance(name) {
                        Some(existing) => instances.push(existing.clone()),
                        None => instances.push(Instance::new(name)),
                    }
                }
                system.instances = instances;
                system.validate()?;
                self.catalog.save_system(&system).await?;
                debug!(system = %system.display_key(), "Refreshed existing system");
                self.catalog
                    .find_system(&manifest.name, &manifest.version)
                    .await?
                    .ok_or_else(|| crate::Error::not_found("system", system.display_key()))
            }
            None => {
                let mut system = System::new(&manifest.name, &manifest.version);
                system.description = manifest.description.clone();
                system.icon_name = manifest.icon_name.clone();
                system.display_name = manifest.display_name.clone();
                system.metadata = manifest.metadata.clone();
                system.max_instances = max_instances;
                system.local = true;
                system.instances = manifest.instances.iter().map(Instance::new).collect();
                system.validate()?;
                Ok(self.catalog.create_system(system).await?)
            }
        }
    }

    /// Variables every instance receives before its own `ENVIRONMENT`.
    fn base_env(&self, manifest: &PluginManifest, instance: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("BG_NAME".to_string(), manifest.name.clone()),
            ("BG_VERSION".to_string(), manifest.version.clone()),
            ("BG_INSTANCE_NAME".to_string(), instance.to_string()),
            (
                "BG_PLUGIN_PATH".to_string(),
                manifest.path.to_string_lossy().into_owned(),
            ),
            ("BG_WEB_HOST".to_string(), self.web.host.clone()),
            ("BG_WEB_PORT".to_string(), self.web.port.to_string()),
            ("BG_SSL_ENABLED".to_string(), self.web.ssl_enabled.to_string()),
            ("BG_URL_PREFIX".to_string(), self.web.url_prefix.clone()),
            ("BG_CA_VERIFY".to_string(), self.web.ca_verify.to_string()),
        ]);
        if let Some(ca_cert) = &self.web.ca_cert {
            env.insert(
                "BG_CA_CERT".to_string(),
                ca_cert.to_string_lossy().into_owned(),
            );
        }
        env
    }

    fn launch_options(
        &self,
        manifest: &PluginManifest,
        instance: &str,
        instance_id: String,
    ) -> LaunchOptions {
        let base = self.base_env(manifest, instance);
        let mut env = base.clone();
        for (key, value) in &manifest.environment {
            env.insert(key.clone(), expand_env(value, &base));
        }

        let log_level = manifest
            .log_level
            .clone()
            .unwrap_or_else(|| self.plugin.log_level.clone());
        env.insert("BG_LOG_LEVEL".to_string(), log_level.clone());
        if let Some(username) = &self.plugin.username {
            env.insert("BG_USERNAME".to_string(), username.clone());
        }
        if let Some(password) = &self.plugin.password {
            env.insert("BG_PASSWORD".to_string(), password.clone());
        }

        LaunchOptions {
            system_name: manifest.name.clone(),
            system_version: manifest.version.clone(),
            instance_name: instance.to_string(),
            instance_id,
            plugin_path: manifest.path.clone(),
            entry_point: manifest.entry_point.clone(),
            args: manifest.args.for_instance(instance),
            env,
            requirements: manifest.requires.clone(),
            log_level,
            log_dir: self.plugin.log_dir.clone(),
            interpreter: self.plugin.interpreter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::runner::MockRunnerFactory;
    use std::fs;

    fn write_plugin(root: &Path, dir: &str, config: &str) -> PathBuf {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("main.py"), "print('hi')\n").unwrap();
        fs::write(path.join(PLUGIN_CONFIG_FILE_NAME), config).unwrap();
        path
    }

    fn rejected(root: &Path, config: &str) -> PluginValidationError {
        let path = write_plugin(root, "bad", config);
        read_manifest(&path).unwrap_err()
    }

    #[test]
    fn test_minimal_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_plugin(
            tmp.path(),
            "echo",
            "NAME = \"echo\"\nVERSION = \"1.0.0\"\nPLUGIN_ENTRY = \"main.py\"\n",
        );
        let manifest = read_manifest(&path).unwrap();
        assert_eq!(manifest.instances, vec!["default"]);
        assert_eq!(manifest.entry_point, EntryPoint::File("main.py".into()));
        assert_eq!(manifest.args, PluginArgs::Shared(vec![]));
    }

    #[test]
    fn test_module_entry_point() {
        let tmp = tempfile::tempdir().unwrap();
        let config = "NAME = \"echo\"\nVERSION = \"1\"\nPLUGIN_ENTRY = \"-m echo_pkg\"\n";
        let path = write_plugin(tmp.path(), "echo", config);
        assert!(matches!(
            read_manifest(&path),
            Err(PluginValidationError::Invalid {
                field: "PLUGIN_ENTRY",
                ..
            })
        ));

        fs::create_dir_all(path.join("echo_pkg")).unwrap();
        fs::write(path.join("echo_pkg/__init__.py"), "").unwrap();
        fs::write(path.join("echo_pkg/__main__.py"), "").unwrap();
        assert_eq!(
            read_manifest(&path).unwrap().entry_point,
            EntryPoint::Module("echo_pkg".into())
        );
    }

    #[test]
    fn test_rejections() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            rejected(tmp.path(), "VERSION = \"1\"\nPLUGIN_ENTRY = \"main.py\"\n"),
            PluginValidationError::MissingField { field: "NAME", .. }
        ));
        assert!(matches!(
            rejected(
                tmp.path(),
                "NAME = \"a\"\nVERSION = \"1\"\nPLUGIN_ENTRY = \"missing.py\"\n"
            ),
            PluginValidationError::Invalid {
                field: "PLUGIN_ENTRY",
                ..
            }
        ));
        assert!(matches!(
            rejected(
                tmp.path(),
                "NAME = \"a\"\nVERSION = \"1\"\nPLUGIN_ENTRY = \"main.py\"\n[ENVIRONMENT]\nBG_SECRET = \"x\"\n"
            ),
            PluginValidationError::Invalid {
                field: "ENVIRONMENT",
                ..
            }
        ));
        assert!(matches!(
            rejected(
                tmp.path(),
                "NAME = \"a\"\nVERSION = \"1\"\nPLUGIN_ENTRY = \"main.py\"\nLOG_LEVEL = \"LOUD\"\n"
            ),
            PluginValidationError::Invalid {
                field: "LOG_LEVEL",
                ..
            }
        ));
        assert!(matches!(
            rejected(
                tmp.path(),
                "NAME = \"a\"\nVERSION = \"1\"\nPLUGIN_ENTRY = \"main.py\"\nINSTANCES = [\"x\"]\nPLUGIN_ARGS = { y = [\"--z\"] }\n"
            ),
            PluginValidationError::Invalid {
                field: "PLUGIN_ARGS",
                ..
            }
        ));
        assert!(matches!(
            rejected(
                tmp.path(),
                "NAME = \"a\"\nVERSION = \"1\"\nPLUGIN_ENTRY = \"main.py\"\nBOGUS = 1\n"
            ),
            PluginValidationError::Parse { .. }
        ));
        assert!(matches!(
            read_manifest(tmp.path()),
            Err(PluginValidationError::MissingConfig { .. })
        ));
    }

    #[test]
    fn test_expand_env() {
        let vars = BTreeMap::from([
            ("BG_NAME".to_string(), "echo".to_string()),
            ("BG_PLUGIN_PATH".to_string(), "/p".to_string()),
        ]);
        assert_eq!(expand_env("$BG_NAME-x", &vars), "echo-x");
        assert_eq!(expand_env("${BG_PLUGIN_PATH}/data", &vars), "/p/data");
        assert_eq!(expand_env("\\$BG_NAME", &vars), "$BG_NAME");
        assert_eq!(expand_env("$HOME/x", &vars), "$HOME/x");
        assert_eq!(expand_env("cost $5", &vars), "cost $5");
        assert_eq!(expand_env("${BG_NAME", &vars), "${BG_NAME");
    }

    #[tokio::test]
    async fn test_load_plugin_registers_system_and_runners() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "echo",
            r#"
NAME = "echo"
VERSION = "1.0.0"
PLUGIN_ENTRY = "main.py"
INSTANCES = ["a", "b"]
PLUGIN_ARGS = { a = ["--fast"] }
REQUIRES = ["base"]
LOG_LEVEL = "debug"

[ENVIRONMENT]
DATA = "$BG_INSTANCE_NAME-data"
"#,
        );
        fs::create_dir_all(tmp.path().join("not-a-plugin")).unwrap();

        let catalog = Arc::new(MemoryCatalog::new());
        let factory = Arc::new(MockRunnerFactory::new(catalog.clone()));
        let loader = PluginLoader::new(
            catalog.clone(),
            factory,
            WebConfig::default(),
            PluginConfig {
                directory: tmp.path().to_path_buf(),
                ..Default::default()
            },
        );

        let paths = loader.scan_plugin_path(None);
        assert_eq!(paths, vec![tmp.path().join("echo")]);

        let runners = loader.load_plugins(&paths).await;
        assert_eq!(runners.len(), 2);
        let a = runners[0].options();
        assert_eq!(a.unique_name(), "echo[a]-1.0.0");
        assert_eq!(a.args, vec!["--fast"]);
        assert_eq!(a.env["DATA"], "a-data");
        assert_eq!(a.env["BG_WEB_PORT"], "2337");
        assert_eq!(a.env["BG_LOG_LEVEL"], "DEBUG");
        assert_eq!(a.requirements, vec!["base"]);
        assert!(runners[1].options().args.is_empty());

        let system = catalog.find_system("echo", "1.0.0").await.unwrap().unwrap();
        assert!(system.local);
        assert_eq!(system.instance_names(), vec!["a", "b"]);
        assert_eq!(system.max_instances, 2);

        // Reloading keeps instance ids.
        let again = loader.load_plugin(&paths[0]).await.unwrap();
        assert_eq!(again[0].instance_id(), runners[0].instance_id());
    }
}
