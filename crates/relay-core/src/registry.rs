// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry of local plugin runners, keyed by unique name.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::runner::Runner;

/// Runners for local plugins, in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    runners: RwLock<Vec<Arc<dyn Runner>>>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Runner>>> {
        self.runners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Runner>>> {
        self.runners.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a runner. A runner whose unique name is already registered is
    /// ignored and `false` returned.
    pub fn register(&self, runner: Arc<dyn Runner>) -> bool {
        let name = runner.unique_name();
        let mut runners = self.write();
        if runners.iter().any(|r| r.unique_name() == name) {
            return false;
        }
        runners.push(runner);
        true
    }

    /// Remove by unique name.
    pub fn remove(&self, unique_name: &str) -> Option<Arc<dyn Runner>> {
        let mut runners = self.write();
        let index = runners.iter().position(|r| r.unique_name() == unique_name)?;
        Some(runners.remove(index))
    }

    /// Swap in a new runner for the same unique name, keeping its position.
    /// Registers it when absent.
    pub fn replace(&self, runner: Arc<dyn Runner>) {
        let name = runner.unique_name();
        let mut runners = self.write();
        match runners.iter_mut().find(|r| r.unique_name() == name) {
            Some(slot) => *slot = runner,
            None => runners.push(runner),
        }
    }

    /// Runner by unique name.
    pub fn get(&self, unique_name: &str) -> Option<Arc<dyn Runner>> {
        self.read()
            .iter()
            .find(|r| r.unique_name() == unique_name)
            .cloned()
    }

    /// Runner supervising the given instance.
    pub fn by_instance_id(&self, instance_id: &str) -> Option<Arc<dyn Runner>> {
        self.read()
            .iter()
            .find(|r| r.instance_id() == instance_id)
            .cloned()
    }

    /// Runners of one system version.
    pub fn by_system(&self, name: &str, version: &str) -> Vec<Arc<dyn Runner>> {
        self.read()
            .iter()
            .filter(|r| {
                let o = r.options();
                o.system_name == name && o.system_version == version
            })
            .cloned()
            .collect()
    }

    /// Every runner.
    pub fn all(&self) -> Vec<Arc<dyn Runner>> {
        self.read().clone()
    }

    /// Distinct system names with a registered runner.
    pub fn system_names(&self) -> BTreeSet<String> {
        self.read()
            .iter()
            .map(|r| r.options().system_name.clone())
            .collect()
    }

    /// Plugin directories already loaded.
    pub fn known_paths(&self) -> BTreeSet<PathBuf> {
        self.read()
            .iter()
            .map(|r| r.options().plugin_path.clone())
            .collect()
    }

    /// Number of runners.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::runner::{EntryPoint, LaunchOptions, MockRunnerFactory, RunnerFactory};
    use std::collections::BTreeMap;

    fn options(system: &str, instance: &str) -> LaunchOptions {
        LaunchOptions {
            system_name: system.into(),
            system_version: "1.0.0".into(),
            instance_name: instance.into(),
            instance_id: format!("{system}-{instance}"),
            plugin_path: PathBuf::from(format!("/plugins/{system}")),
            entry_point: EntryPoint::File("main.py".into()),
            args: vec![],
            env: BTreeMap::new(),
            requirements: vec![],
            log_level: "INFO".into(),
            log_dir: None,
            interpreter: None,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let factory = MockRunnerFactory::new(Arc::new(MemoryCatalog::new()));
        let registry = PluginRegistry::new();

        assert!(registry.register(factory.create(options("echo", "a"))));
        assert!(registry.register(factory.create(options("echo", "b"))));
        assert!(registry.register(factory.create(options("math", "default"))));
        assert!(!registry.register(factory.create(options("echo", "a"))));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.by_system("echo", "1.0.0").len(), 2);
        assert!(registry.by_system("echo", "2.0.0").is_empty());
        assert_eq!(
            registry.by_instance_id("math-default").unwrap().unique_name(),
            "math[default]-1.0.0"
        );
        assert_eq!(
            registry.system_names().into_iter().collect::<Vec<_>>(),
            vec!["echo", "math"]
        );
        assert!(registry.known_paths().contains(&PathBuf::from("/plugins/math")));
    }

    #[test]
    fn test_replace_keeps_position() {
        let factory = MockRunnerFactory::new(Arc::new(MemoryCatalog::new()));
        let registry = PluginRegistry::new();
        let first = factory.create(options("echo", "a"));
        registry.register(first.clone());
        registry.register(factory.create(options("echo", "b")));

        let fresh = factory.create(options("echo", "a"));
        registry.replace(fresh.clone());
        let all = registry.all();
        assert_eq!(all.len(), 2);
        assert!(Arc::ptr_eq(&all[0], &fresh));
        assert!(!Arc::ptr_eq(&all[0], &first));

        assert!(registry.remove("echo[a]-1.0.0").is_some());
        assert!(registry.remove("echo[a]-1.0.0").is_none());
        assert_eq!(registry.len(), 1);
    }
}
