// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process catalog.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_model::{
    CommandType, Instance, InstanceStatus, QueueInfo, Request, RequestUpdate, System,
    UpdateOutcome,
};
use tokio::sync::RwLock;

use super::{
    Catalog, CatalogError, RequestFilter, Result, SystemFilter, assign_ids, bump_heartbeat,
    keep_instance_state, stamp_request, transition,
};

/// System row: the system without instances plus the ids of its instances.
#[derive(Debug, Clone)]
struct SystemRecord {
    system: System,
    instance_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct Tables {
    systems: HashMap<String, SystemRecord>,
    instances: HashMap<String, (String, Instance)>,
    requests: HashMap<String, Request>,
}

impl Tables {
    fn assemble(&self, record: &SystemRecord) -> System {
        let mut system = record.system.clone();
        system.instances = record
            .instance_ids
            .iter()
            .filter_map(|id| self.instances.get(id).map(|(_, i)| i.clone()))
            .collect();
        system
    }

    fn store(&mut self, system: &System) -> Result<()> {
        let system_id = system
            .id
            .clone()
            .ok_or_else(|| CatalogError::not_found("system", "<unsaved>"))?;

        let mut record = SystemRecord {
            system: System {
                instances: Vec::new(),
                ..system.clone()
            },
            instance_ids: Vec::new(),
        };

        if let Some(previous) = self.systems.get(&system_id) {
            for stale in &previous.instance_ids {
                if system.instance_by_id(stale).is_none() {
                    self.instances.remove(stale);
                }
            }
        }

        for instance in &system.instances {
            let id = instance
                .id
                .clone()
                .ok_or_else(|| CatalogError::not_found("instance", &instance.name))?;
            let mut instance = instance.clone();
            if let Some((_, stored)) = self.instances.get(&id) {
                keep_instance_state(stored, &mut instance);
            }
            self.instances.insert(id.clone(), (system_id.clone(), instance));
            record.instance_ids.push(id);
        }

        self.systems.insert(system_id, record);
        Ok(())
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut Instance> {
        self.instances
            .get_mut(id)
            .map(|(_, i)| i)
            .ok_or_else(|| CatalogError::not_found("instance", id))
    }
}

/// Catalog held in process memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
}

impl MemoryCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn is_alive(&self) -> bool {
        true
    }

    async fn create_system(&self, mut system: System) -> Result<System> {
        let mut tables = self.tables.write().await;
        let taken = tables
            .systems
            .values()
            .any(|r| r.system.name == system.name && r.system.version == system.version);
        if taken {
            return Err(CatalogError::Conflict(format!(
                "system {} already exists",
                system.display_key()
            )));
        }
        system.validate()?;
        assign_ids(&mut system);
        tables.store(&system)?;
        Ok(system)
    }

    async fn save_system(&self, system: &System) -> Result<()> {
        let mut system = system.clone();
        let mut tables = self.tables.write().await;
        let id = system
            .id
            .clone()
            .ok_or_else(|| CatalogError::not_found("system", "<unsaved>"))?;
        if !tables.systems.contains_key(&id) {
            return Err(CatalogError::not_found("system", id));
        }
        system.validate()?;
        assign_ids(&mut system);
        tables.store(&system)
    }

    async fn get_system(&self, id: &str) -> Result<Option<System>> {
        let tables = self.tables.read().await;
        Ok(tables.systems.get(id).map(|r| tables.assemble(r)))
    }

    async fn find_system(&self, name: &str, version: &str) -> Result<Option<System>> {
        let tables = self.tables.read().await;
        Ok(tables
            .systems
            .values()
            .find(|r| r.system.name == name && r.system.version == version)
            .map(|r| tables.assemble(r)))
    }

    async fn list_systems(&self, filter: &SystemFilter) -> Result<Vec<System>> {
        let tables = self.tables.read().await;
        let mut systems: Vec<System> = tables
            .systems
            .values()
            .filter(|r| filter.matches(&r.system))
            .map(|r| tables.assemble(r))
            .collect();
        systems.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(systems)
    }

    async fn delete_system(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables.systems.remove(id) else {
            return Ok(false);
        };
        for instance_id in record.instance_ids {
            tables.instances.remove(&instance_id);
        }
        Ok(true)
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let tables = self.tables.read().await;
        Ok(tables.instances.get(id).map(|(_, i)| i.clone()))
    }

    async fn find_instance_system(&self, instance_id: &str) -> Result<Option<System>> {
        let tables = self.tables.read().await;
        Ok(tables
            .instances
            .get(instance_id)
            .and_then(|(system_id, _)| tables.systems.get(system_id))
            .map(|r| tables.assemble(r)))
    }

    async fn set_instance_status(&self, id: &str, status: InstanceStatus) -> Result<Instance> {
        let mut tables = self.tables.write().await;
        let instance = tables.instance_mut(id)?;
        transition(instance, status)?;
        Ok(instance.clone())
    }

    async fn record_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<Instance> {
        let mut tables = self.tables.write().await;
        let instance = tables.instance_mut(id)?;
        bump_heartbeat(instance, at);
        Ok(instance.clone())
    }

    async fn set_instance_queue_info(
        &self,
        id: &str,
        queue_type: &str,
        info: QueueInfo,
    ) -> Result<Instance> {
        let mut tables = self.tables.write().await;
        let instance = tables.instance_mut(id)?;
        instance.queue_type = Some(queue_type.to_string());
        instance.queue_info = info;
        Ok(instance.clone())
    }

    async fn create_request(&self, mut request: Request) -> Result<Request> {
        stamp_request(&mut request);
        request.validate()?;
        let id = request.id.clone().unwrap_or_default();
        let mut tables = self.tables.write().await;
        if tables.requests.contains_key(&id) {
            return Err(CatalogError::Conflict(format!("request {id} already exists")));
        }
        tables.requests.insert(id, request.clone());
        Ok(request)
    }

    async fn save_request(&self, request: &Request) -> Result<()> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CatalogError::not_found("request", "<unsaved>"))?;
        request.validate()?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .requests
            .get_mut(&id)
            .ok_or_else(|| CatalogError::not_found("request", &id))?;
        if stored.is_completed() {
            return Err(relay_model::ModelError::AlreadyCompleted {
                status: stored.status,
            }
            .into());
        }
        *stored = request.clone();
        stored.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn get_request(&self, id: &str) -> Result<Option<Request>> {
        Ok(self.tables.read().await.requests.get(id).cloned())
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        let tables = self.tables.read().await;
        let mut requests: Vec<Request> = tables
            .requests
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            requests.truncate(limit);
        }
        Ok(requests)
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Request>> {
        let tables = self.tables.read().await;
        let mut children: Vec<Request> = tables
            .requests
            .values()
            .filter(|r| r.parent.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(children)
    }

    async fn update_request(
        &self,
        id: &str,
        update: &RequestUpdate,
    ) -> Result<(Request, UpdateOutcome)> {
        let mut tables = self.tables.write().await;
        let request = tables
            .requests
            .get_mut(id)
            .ok_or_else(|| CatalogError::not_found("request", id))?;
        let outcome = request.apply_update(update, Utc::now())?;
        Ok((request.clone(), outcome))
    }

    async fn prune_requests(
        &self,
        command_type: CommandType,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let expired: Vec<String> = tables
            .requests
            .values()
            .filter(|r| {
                r.effective_command_type() == command_type
                    && r.is_completed()
                    && r.created_at.is_some_and(|c| c < older_than)
            })
            .filter_map(|r| r.id.clone())
            .collect();

        let before = tables.requests.len();
        tables.requests.retain(|id, r| {
            !expired.contains(id) && !r.parent.as_ref().is_some_and(|p| expired.contains(p))
        });
        Ok((before - tables.requests.len()) as u64)
    }
}
