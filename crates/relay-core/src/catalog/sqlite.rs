// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed catalog.
//!
//! Systems, instances and requests live in separate tables. A system row
//! stores its document without instances plus a JSON list of instance ids;
//! saving a system is two-phase inside one transaction: write the system
//! row with an empty id list, write the instance rows, then patch the id
//! list. Rows of instances that already exist keep their stored status,
//! heartbeat and queue coordinates. Every write transaction starts with
//! `BEGIN IMMEDIATE`.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_model::{
    CommandType, Instance, InstanceStatus, ModelError, QueueInfo, Request, RequestUpdate, System,
    UpdateOutcome,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{
    Catalog, CatalogError, RequestFilter, Result, SystemFilter, assign_ids, bump_heartbeat,
    keep_instance_state, stamp_request, transition,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

#[derive(sqlx::FromRow)]
struct SystemRow {
    id: String,
    document: String,
    instance_ids: String,
}

/// SQLite-backed catalog.
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL and run migrations.
    ///
    /// Parent directories of a file database are created first.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.foreign_keys(true);
        let path = options.get_filename();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && path != Path::new(":memory:")
        {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialise a catalog stored at `path`.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().to_string_lossy());
        Self::connect(&url).await
    }

    /// Transaction holding the write lock from its first statement, so a
    /// read followed by a write cannot fail to upgrade under contention.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn load_system(&self, row: SystemRow) -> Result<System> {
        let mut system: System = serde_json::from_str(&row.document)?;
        system.id = Some(row.id);
        let ids: Vec<String> = serde_json::from_str(&row.instance_ids)?;
        for id in ids {
            if let Some(instance) = self.get_instance(&id).await? {
                system.instances.push(instance);
            }
        }
        Ok(system)
    }

    async fn write_system(tx: &mut Transaction<'_, Sqlite>, system: &System) -> Result<()> {
        let system_id = system
            .id
            .clone()
            .ok_or_else(|| CatalogError::not_found("system", "<unsaved>"))?;
        let document = serde_json::to_string(&System {
            instances: Vec::new(),
            ..system.clone()
        })?;

        // Phase one: system row without instance references.
        sqlx::query(
            r#"
            INSERT INTO systems (id, name, version, local, document, instance_ids)
            VALUES (?, ?, ?, ?, ?, '[]')
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                local = excluded.local,
                document = excluded.document,
                instance_ids = '[]'
            "#,
        )
        .bind(&system_id)
        .bind(&system.name)
        .bind(&system.version)
        .bind(system.local)
        .bind(&document)
        .execute(&mut **tx)
        .await
        .map_err(conflict_or_db)?;

        // Phase two: instance rows.
        let mut ids = Vec::with_capacity(system.instances.len());
        for instance in &system.instances {
            let id = instance
                .id
                .clone()
                .ok_or_else(|| CatalogError::not_found("instance", &instance.name))?;
            let stored: Option<(String,)> =
                sqlx::query_as("SELECT document FROM instances WHERE id = ?")
                    .bind(&id)
                    .fetch_optional(&mut **tx)
                    .await?;
            let mut instance = instance.clone();
            if let Some((document,)) = stored {
                keep_instance_state(&serde_json::from_str(&document)?, &mut instance);
            }
            sqlx::query(
                r#"
                INSERT INTO instances (id, system_id, name, status, document)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    system_id = excluded.system_id,
                    name = excluded.name,
                    status = excluded.status,
                    document = excluded.document
                "#,
            )
            .bind(&id)
            .bind(&system_id)
            .bind(&instance.name)
            .bind(instance.status.as_str())
            .bind(serde_json::to_string(&instance)?)
            .execute(&mut **tx)
            .await
            .map_err(conflict_or_db)?;
            ids.push(id);
        }

        let stale: Vec<(String,)> = sqlx::query_as("SELECT id FROM instances WHERE system_id = ?")
            .bind(&system_id)
            .fetch_all(&mut **tx)
            .await?;
        for (id,) in stale {
            if !ids.contains(&id) {
                sqlx::query("DELETE FROM instances WHERE id = ?")
                    .bind(&id)
                    .execute(&mut **tx)
                    .await?;
            }
        }

        // Phase three: patch the system's instance references.
        sqlx::query("UPDATE systems SET instance_ids = ? WHERE id = ?")
            .bind(serde_json::to_string(&ids)?)
            .bind(&system_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn modify_instance<F>(&self, id: &str, change: F) -> Result<Instance>
    where
        F: FnOnce(&mut Instance) -> Result<()> + Send,
    {
        let mut tx = self.begin_write().await?;
        let row: Option<(String,)> = sqlx::query_as("SELECT document FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let (document,) = row.ok_or_else(|| CatalogError::not_found("instance", id))?;
        let mut instance: Instance = serde_json::from_str(&document)?;
        change(&mut instance)?;

        sqlx::query("UPDATE instances SET status = ?, document = ? WHERE id = ?")
            .bind(instance.status.as_str())
            .bind(serde_json::to_string(&instance)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(instance)
    }

    async fn select_requests(&self, sql: &str, binds: Vec<String>) -> Result<Vec<Request>> {
        let mut query = sqlx::query_as::<_, (String,)>(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|(document,)| serde_json::from_str(&document).map_err(CatalogError::from))
            .collect()
    }
}

fn conflict_or_db(error: sqlx::Error) -> CatalogError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            CatalogError::Conflict(db.message().to_string())
        }
        _ => CatalogError::Database(error),
    }
}

fn millis(at: Option<DateTime<Utc>>) -> i64 {
    at.map(|t| t.timestamp_millis()).unwrap_or_default()
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn is_alive(&self) -> bool {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        result.is_ok()
    }

    async fn create_system(&self, mut system: System) -> Result<System> {
        if self.find_system(&system.name, &system.version).await?.is_some() {
            return Err(CatalogError::Conflict(format!(
                "system {} already exists",
                system.display_key()
            )));
        }
        system.validate()?;
        assign_ids(&mut system);

        let mut tx = self.begin_write().await?;
        Self::write_system(&mut tx, &system).await?;
        tx.commit().await?;
        Ok(system)
    }

    async fn save_system(&self, system: &System) -> Result<()> {
        let mut system = system.clone();
        let id = system
            .id
            .clone()
            .ok_or_else(|| CatalogError::not_found("system", "<unsaved>"))?;
        system.validate()?;
        assign_ids(&mut system);

        let mut tx = self.begin_write().await?;
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM systems WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(CatalogError::not_found("system", id));
        }
        Self::write_system(&mut tx, &system).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_system(&self, id: &str) -> Result<Option<System>> {
        let row = sqlx::query_as::<_, SystemRow>(
            "SELECT id, document, instance_ids FROM systems WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.load_system(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_system(&self, name: &str, version: &str) -> Result<Option<System>> {
        let row = sqlx::query_as::<_, SystemRow>(
            "SELECT id, document, instance_ids FROM systems WHERE name = ? AND version = ?",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.load_system(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_systems(&self, filter: &SystemFilter) -> Result<Vec<System>> {
        let rows = sqlx::query_as::<_, SystemRow>(
            r#"
            SELECT id, document, instance_ids FROM systems
            WHERE (?1 IS NULL OR name = ?1)
              AND (?2 IS NULL OR version = ?2)
              AND (?3 IS NULL OR local = ?3)
            ORDER BY name, version
            "#,
        )
        .bind(&filter.name)
        .bind(&filter.version)
        .bind(filter.local)
        .fetch_all(&self.pool)
        .await?;

        let mut systems = Vec::with_capacity(rows.len());
        for row in rows {
            systems.push(self.load_system(row).await?);
        }
        Ok(systems)
    }

    async fn delete_system(&self, id: &str) -> Result<bool> {
        let mut tx = self.begin_write().await?;
        sqlx::query("DELETE FROM instances WHERE system_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM systems WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT document FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(document,)| serde_json::from_str(&document).map_err(CatalogError::from))
            .transpose()
    }

    async fn find_instance_system(&self, instance_id: &str) -> Result<Option<System>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT system_id FROM instances WHERE id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((system_id,)) => self.get_system(&system_id).await,
            None => Ok(None),
        }
    }

    async fn set_instance_status(&self, id: &str, status: InstanceStatus) -> Result<Instance> {
        self.modify_instance(id, |instance| transition(instance, status))
            .await
    }

    async fn record_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<Instance> {
        self.modify_instance(id, |instance| {
            bump_heartbeat(instance, at);
            Ok(())
        })
        .await
    }

    async fn set_instance_queue_info(
        &self,
        id: &str,
        queue_type: &str,
        info: QueueInfo,
    ) -> Result<Instance> {
        let queue_type = queue_type.to_string();
        self.modify_instance(id, move |instance| {
            instance.queue_type = Some(queue_type);
            instance.queue_info = info;
            Ok(())
        })
        .await
    }

    async fn create_request(&self, mut request: Request) -> Result<Request> {
        stamp_request(&mut request);
        request.validate()?;
        sqlx::query(
            r#"
            INSERT INTO requests (id, parent_id, system, system_version, instance_name,
                                  command, command_type, status, created_at, document)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.parent)
        .bind(&request.system)
        .bind(&request.system_version)
        .bind(&request.instance_name)
        .bind(&request.command)
        .bind(request.effective_command_type().as_str())
        .bind(request.status.as_str())
        .bind(millis(request.created_at))
        .bind(serde_json::to_string(&request)?)
        .execute(&self.pool)
        .await
        .map_err(conflict_or_db)?;
        Ok(request)
    }

    async fn save_request(&self, request: &Request) -> Result<()> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CatalogError::not_found("request", "<unsaved>"))?;
        request.validate()?;

        let mut tx = self.begin_write().await?;
        let stored: Option<(String,)> = sqlx::query_as("SELECT status FROM requests WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;
        let (status,) = stored.ok_or_else(|| CatalogError::not_found("request", &id))?;
        if let Ok(status) = status.parse::<relay_model::RequestStatus>()
            && status.is_completed()
        {
            return Err(ModelError::AlreadyCompleted { status }.into());
        }

        let mut request = request.clone();
        request.updated_at = Some(Utc::now());
        sqlx::query(
            r#"
            UPDATE requests
            SET parent_id = ?, command_type = ?, status = ?, document = ?
            WHERE id = ?
            "#,
        )
        .bind(&request.parent)
        .bind(request.effective_command_type().as_str())
        .bind(request.status.as_str())
        .bind(serde_json::to_string(&request)?)
        .bind(&id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_request(&self, id: &str) -> Result<Option<Request>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT document FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(document,)| serde_json::from_str(&document).map_err(CatalogError::from))
            .transpose()
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        let mut sql = String::from("SELECT document FROM requests WHERE 1 = 1");
        let mut binds = Vec::new();
        for (column, value) in [
            ("system", &filter.system),
            ("system_version", &filter.system_version),
            ("instance_name", &filter.instance_name),
            ("command", &filter.command),
        ] {
            if let Some(value) = value {
                sql.push_str(&format!(" AND {column} = ?"));
                binds.push(value.clone());
            }
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        match filter.has_parent {
            Some(true) => sql.push_str(" AND parent_id IS NOT NULL"),
            Some(false) => sql.push_str(" AND parent_id IS NULL"),
            None => {}
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        self.select_requests(&sql, binds).await
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Request>> {
        self.select_requests(
            "SELECT document FROM requests WHERE parent_id = ? ORDER BY created_at ASC",
            vec![parent_id.to_string()],
        )
        .await
    }

    async fn update_request(
        &self,
        id: &str,
        update: &RequestUpdate,
    ) -> Result<(Request, UpdateOutcome)> {
        let mut tx = self.begin_write().await?;
        let row: Option<(String,)> = sqlx::query_as("SELECT document FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let (document,) = row.ok_or_else(|| CatalogError::not_found("request", id))?;
        let mut request: Request = serde_json::from_str(&document)?;

        let outcome = request.apply_update(update, Utc::now())?;
        if outcome.changed {
            sqlx::query("UPDATE requests SET status = ?, document = ? WHERE id = ?")
                .bind(request.status.as_str())
                .bind(serde_json::to_string(&request)?)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok((request, outcome))
    }

    async fn prune_requests(
        &self,
        command_type: CommandType,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.begin_write().await?;
        let expired = r#"
            SELECT id FROM requests
            WHERE command_type = ?
              AND status IN ('SUCCESS', 'ERROR', 'CANCELED')
              AND created_at < ?
        "#;
        let children = sqlx::query(&format!(
            "DELETE FROM requests WHERE parent_id IN ({expired})"
        ))
        .bind(command_type.as_str())
        .bind(older_than.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        let parents = sqlx::query(&format!("DELETE FROM requests WHERE id IN ({expired})"))
            .bind(command_type.as_str())
            .bind(older_than.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(children.rows_affected() + parents.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{
        echo_system, exercise_instances, exercise_requests, exercise_stale_save,
        exercise_systems,
    };
    use relay_model::RequestStatus;

    /// Create an in-memory SQLite pool for testing.
    async fn test_catalog() -> SqliteCatalog {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        SqliteCatalog::new(pool)
    }

    #[tokio::test]
    async fn test_systems() {
        exercise_systems(&test_catalog().await).await;
    }

    #[tokio::test]
    async fn test_instances() {
        exercise_instances(&test_catalog().await).await;
    }

    #[tokio::test]
    async fn test_requests() {
        exercise_requests(&test_catalog().await).await;
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SqliteCatalog::from_path(dir.path().join("relay.db"))
            .await
            .unwrap();
        let system = catalog.create_system(echo_system()).await.unwrap();
        let instance_id = system.instances[0].id.clone().unwrap();
        let request = catalog
            .create_request(Request::new("echo", "1.0.0", "default", "say"))
            .await
            .unwrap();
        let request_id = request.id.clone().unwrap();

        let base = Utc::now();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let catalog = catalog.clone();
            let instance_id = instance_id.clone();
            let request_id = request_id.clone();
            tasks.push(tokio::spawn(async move {
                let at = base + chrono::Duration::milliseconds(i);
                catalog.record_heartbeat(&instance_id, at).await?;
                let update = RequestUpdate::status(RequestStatus::InProgress);
                catalog
                    .update_request(&request_id, &update)
                    .await
                    .map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let instance = catalog.get_instance(&instance_id).await.unwrap().unwrap();
        assert_eq!(
            instance.status_info.heartbeat,
            Some(base + chrono::Duration::milliseconds(15))
        );
        let stored = catalog.get_request(&request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::InProgress);
    }

    #[tokio::test]
    async fn test_save_keeps_instance_state() {
        exercise_stale_save(&test_catalog().await).await;
    }

    #[tokio::test]
    async fn test_removed_instance_row_deleted() {
        let catalog = test_catalog().await;
        let mut system = echo_system();
        system.max_instances = 2;
        system.instances.push(Instance::new("second"));
        let mut system = catalog.create_system(system).await.unwrap();
        let removed = system.instances.pop().unwrap().id.unwrap();

        catalog.save_system(&system).await.unwrap();
        assert!(catalog.get_instance(&removed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_path_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");
        let catalog = SqliteCatalog::from_path(&path).await.unwrap();
        assert!(catalog.is_alive().await);
        assert!(path.exists());
    }
}
