//! `sqlx`-backed SQLite reference implementation of the store traits.
//!
//! Mirrors `Database::connect`/`connect_file` from the teacher's persistence
//! layer, minus the sqlite/postgres dual dispatch — this crate's scope never
//! grew a second backend, so `AnyPool` would have been unused generality.

use std::path::Path;
use std::str::FromStr;
use std::sync::Once;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, SqlitePool,
};
use uuid::Uuid;

use crate::{
    AliasRecord, AliasStore, DeadLetterRecord, DeadLetterStatus, DeadLetterStore, FunctionPatch,
    FunctionRecord, FunctionStatus, FunctionStore, FunctionTaskRecord, FunctionVersionRecord,
    InvocationRecord, InvocationStatus, InvocationStore, NewDeadLetter, NewFunction,
    NewFunctionTask, NewInvocation, ResourceLimits, RoutingEntry, StoreError, StoreResult,
    TaskStatus, TaskStore, TaskType, TriggerType, VersionStore, billed_ms, validate_routing,
    DEFAULT_SESSION_TIMEOUT_SECONDS,
};

/// Primary entry point to the SQLite-backed store. Clone is cheap — `SqlitePool`
/// is itself a handle over a connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Establishes (or creates) a connection pool for the given database URL
    /// and runs embedded migrations.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        static DRIVER: Once = Once::new();
        DRIVER.call_once(|| {
            // sqlx registers the sqlite driver lazily; nothing to do here
            // beyond matching the teacher's one-time-init idiom.
        });

        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn connect_file(path: &Path) -> anyhow::Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_function(row: &sqlx::sqlite::SqliteRow) -> StoreResult<FunctionRecord> {
    let tags: String = row.try_get("tags").map_err(to_backend)?;
    let env: String = row.try_get("env").map_err(to_backend)?;
    let http_methods: String = row.try_get("http_methods").map_err(to_backend)?;
    let status: String = row.try_get("status").map_err(to_backend)?;
    let current_task_id: Option<String> = row.try_get("current_task_id").map_err(to_backend)?;
    let id: String = row.try_get("id").map_err(to_backend)?;
    let created_at: String = row.try_get("created_at").map_err(to_backend)?;
    let updated_at: String = row.try_get("updated_at").map_err(to_backend)?;

    Ok(FunctionRecord {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Backend(e.into()))?,
        name: row.try_get("name").map_err(to_backend)?,
        runtime: row.try_get("runtime").map_err(to_backend)?,
        handler: row.try_get("handler").map_err(to_backend)?,
        description: row.try_get("description").map_err(to_backend)?,
        tags: serde_json::from_str(&tags).map_err(|e| StoreError::Backend(e.into()))?,
        code: row.try_get("code").map_err(to_backend)?,
        binary: row.try_get("binary").map_err(to_backend)?,
        code_hash: row.try_get("code_hash").map_err(to_backend)?,
        limits: ResourceLimits {
            memory_mb: row.try_get::<i64, _>("memory_mb").map_err(to_backend)? as u32,
            timeout_seconds: row.try_get::<i64, _>("timeout_seconds").map_err(to_backend)? as u32,
            max_concurrency: row.try_get::<i64, _>("max_concurrency").map_err(to_backend)? as u32,
        },
        env: serde_json::from_str(&env).map_err(|e| StoreError::Backend(e.into()))?,
        status: parse_function_status(&status)?,
        current_task_id: current_task_id
            .map(|s| Uuid::parse_str(&s).map_err(|e| StoreError::Backend(e.into())))
            .transpose()?,
        version: row.try_get::<i64, _>("version").map_err(to_backend)? as u64,
        cron_expression: row.try_get("cron_expression").map_err(to_backend)?,
        http_route: row.try_get("http_route").map_err(to_backend)?,
        http_methods: serde_json::from_str(&http_methods).map_err(|e| StoreError::Backend(e.into()))?,
        webhook_key: row.try_get("webhook_key").map_err(to_backend)?,
        session_affinity: row.try_get::<i64, _>("session_affinity").map_err(to_backend)? != 0,
        session_timeout_seconds: row
            .try_get::<i64, _>("session_timeout_seconds")
            .map_err(to_backend)? as u64,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn to_backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(e.into()))
}

fn parse_function_status(raw: &str) -> StoreResult<FunctionStatus> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Backend(e.into()))
}

fn status_str(status: FunctionStatus) -> &'static str {
    match status {
        FunctionStatus::Creating => "creating",
        FunctionStatus::Active => "active",
        FunctionStatus::Updating => "updating",
        FunctionStatus::Building => "building",
        FunctionStatus::Offline => "offline",
        FunctionStatus::Inactive => "inactive",
        FunctionStatus::Failed => "failed",
    }
}

#[async_trait]
impl FunctionStore for SqliteStore {
    async fn create(&self, input: NewFunction) -> StoreResult<FunctionRecord> {
        input.validate()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let code_hash = input.code_hash();
        let tags = serde_json::to_string(&input.tags).map_err(|e| StoreError::Backend(e.into()))?;
        let env = serde_json::to_string(&input.env).map_err(|e| StoreError::Backend(e.into()))?;
        let http_methods =
            serde_json::to_string(&input.http_methods).map_err(|e| StoreError::Backend(e.into()))?;

        let result = sqlx::query(
            "INSERT INTO functions (
                id, name, runtime, handler, description, tags, code, binary, code_hash,
                memory_mb, timeout_seconds, max_concurrency, env, status, current_task_id,
                version, cron_expression, http_route, http_methods, webhook_key,
                session_affinity, session_timeout_seconds, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&input.name)
        .bind(&input.runtime)
        .bind(&input.handler)
        .bind(&input.description)
        .bind(&tags)
        .bind(&input.code)
        .bind(&input.binary)
        .bind(&code_hash)
        .bind(input.limits.memory_mb as i64)
        .bind(input.limits.timeout_seconds as i64)
        .bind(input.limits.max_concurrency as i64)
        .bind(&env)
        .bind(status_str(FunctionStatus::Creating))
        .bind(None::<String>)
        .bind(1_i64)
        .bind(&input.cron_expression)
        .bind(&input.http_route)
        .bind(&http_methods)
        .bind(&input.webhook_key)
        .bind(input.session_affinity as i64)
        .bind(input.session_timeout_seconds.unwrap_or(DEFAULT_SESSION_TIMEOUT_SECONDS) as i64)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if db_err.code().as_deref() == Some("2067") || db_err.code().as_deref() == Some("1555") {
                return Err(StoreError::Conflict(format!(
                    "function {} already exists",
                    input.name
                )));
            }
        }
        result.map_err(to_backend)?;

        FunctionStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<FunctionRecord>> {
        let row = sqlx::query("SELECT * FROM functions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(to_backend)?;
        row.as_ref().map(row_to_function).transpose()
    }

    async fn get_by_name(&self, name: &str) -> StoreResult<Option<FunctionRecord>> {
        let row = sqlx::query("SELECT * FROM functions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_backend)?;
        row.as_ref().map(row_to_function).transpose()
    }

    async fn update(&self, id: Uuid, patch: FunctionPatch) -> StoreResult<FunctionRecord> {
        let mut current = FunctionStore::get(self, id).await?.ok_or(StoreError::NotFound)?;
        if let Some(handler) = patch.handler {
            current.handler = handler;
        }
        if let Some(description) = patch.description {
            current.description = Some(description);
        }
        if let Some(tags) = patch.tags {
            current.tags = tags;
        }
        if let Some(code) = patch.code {
            current.code = Some(code);
        }
        if let Some(binary) = patch.binary {
            current.binary = Some(binary);
        }
        if let Some(limits) = patch.limits {
            limits.validate()?;
            current.limits = limits;
        }
        if let Some(env) = patch.env {
            current.env = env;
        }
        if let Some(cron) = patch.cron_expression {
            current.cron_expression = cron;
        }
        if let Some(route) = patch.http_route {
            current.http_route = route;
        }
        if let Some(methods) = patch.http_methods {
            current.http_methods = methods;
        }
        if let Some(key) = patch.webhook_key {
            current.webhook_key = key;
        }
        if let Some(affinity) = patch.session_affinity {
            current.session_affinity = affinity;
        }
        if let Some(timeout) = patch.session_timeout_seconds {
            current.session_timeout_seconds = timeout;
        }
        current.updated_at = Utc::now();

        let tags = serde_json::to_string(&current.tags).map_err(|e| StoreError::Backend(e.into()))?;
        let env = serde_json::to_string(&current.env).map_err(|e| StoreError::Backend(e.into()))?;
        let http_methods =
            serde_json::to_string(&current.http_methods).map_err(|e| StoreError::Backend(e.into()))?;

        sqlx::query(
            "UPDATE functions SET handler = ?, description = ?, tags = ?, code = ?, binary = ?,
             memory_mb = ?, timeout_seconds = ?, max_concurrency = ?, env = ?, cron_expression = ?,
             http_route = ?, http_methods = ?, webhook_key = ?, session_affinity = ?,
             session_timeout_seconds = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&current.handler)
        .bind(&current.description)
        .bind(&tags)
        .bind(&current.code)
        .bind(&current.binary)
        .bind(current.limits.memory_mb as i64)
        .bind(current.limits.timeout_seconds as i64)
        .bind(current.limits.max_concurrency as i64)
        .bind(&env)
        .bind(&current.cron_expression)
        .bind(&current.http_route)
        .bind(&http_methods)
        .bind(&current.webhook_key)
        .bind(current.session_affinity as i64)
        .bind(current.session_timeout_seconds as i64)
        .bind(current.updated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(to_backend)?;

        Ok(current)
    }

    async fn set_status(&self, id: Uuid, status: FunctionStatus) -> StoreResult<FunctionRecord> {
        sqlx::query("UPDATE functions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status_str(status))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        FunctionStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn set_task(&self, id: Uuid, task_id: Option<Uuid>) -> StoreResult<()> {
        sqlx::query("UPDATE functions SET current_task_id = ? WHERE id = ?")
            .bind(task_id.map(|t| t.to_string()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        Ok(())
    }

    async fn bump_version(&self, id: Uuid) -> StoreResult<u64> {
        let record = FunctionStore::get(self, id).await?.ok_or(StoreError::NotFound)?;
        let next = record.version + 1;
        sqlx::query("UPDATE functions SET version = ?, updated_at = ? WHERE id = ?")
            .bind(next as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        Ok(next)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM functions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_by_status(&self, status: FunctionStatus) -> StoreResult<Vec<FunctionRecord>> {
        let rows = sqlx::query("SELECT * FROM functions WHERE status = ?")
            .bind(status_str(status))
            .fetch_all(&self.pool)
            .await
            .map_err(to_backend)?;
        rows.iter().map(row_to_function).collect()
    }

    async fn list_cron_active(&self) -> StoreResult<Vec<FunctionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM functions WHERE status = ? AND cron_expression IS NOT NULL",
        )
        .bind(status_str(FunctionStatus::Active))
        .fetch_all(&self.pool)
        .await
        .map_err(to_backend)?;
        rows.iter().map(row_to_function).collect()
    }
}

#[async_trait]
impl VersionStore for SqliteStore {
    async fn put(&self, record: FunctionVersionRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO function_versions
             (function_id, version, handler, code, binary, code_hash, description, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.function_id.to_string())
        .bind(record.version as i64)
        .bind(&record.handler)
        .bind(&record.code)
        .bind(&record.binary)
        .bind(&record.code_hash)
        .bind(&record.description)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(to_backend)?;
        Ok(())
    }

    async fn get(&self, function_id: Uuid, version: u64) -> StoreResult<Option<FunctionVersionRecord>> {
        let row = sqlx::query("SELECT * FROM function_versions WHERE function_id = ? AND version = ?")
            .bind(function_id.to_string())
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_backend)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(FunctionVersionRecord {
            function_id,
            version,
            handler: row.try_get("handler").map_err(to_backend)?,
            code: row.try_get("code").map_err(to_backend)?,
            binary: row.try_get("binary").map_err(to_backend)?,
            code_hash: row.try_get("code_hash").map_err(to_backend)?,
            description: row.try_get("description").map_err(to_backend)?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(to_backend)?)?,
        }))
    }

    async fn exists(&self, function_id: Uuid, version: u64) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) as n FROM function_versions WHERE function_id = ? AND version = ?",
        )
        .bind(function_id.to_string())
        .bind(version as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(to_backend)?;
        let n: i64 = row.try_get("n").map_err(to_backend)?;
        Ok(n > 0)
    }
}

#[async_trait]
impl AliasStore for SqliteStore {
    async fn upsert(
        &self,
        function_id: Uuid,
        name: &str,
        routing: Vec<RoutingEntry>,
    ) -> StoreResult<AliasRecord> {
        validate_routing(&routing)?;
        let now = Utc::now();
        let routing_json =
            serde_json::to_string(&routing).map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query(
            "INSERT INTO aliases (function_id, name, routing, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(function_id, name) DO UPDATE SET routing = excluded.routing, updated_at = excluded.updated_at",
        )
        .bind(function_id.to_string())
        .bind(name)
        .bind(&routing_json)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(to_backend)?;
        Ok(AliasRecord {
            function_id,
            name: name.to_string(),
            routing,
            updated_at: now,
        })
    }

    async fn get(&self, function_id: Uuid, name: &str) -> StoreResult<Option<AliasRecord>> {
        let row = sqlx::query("SELECT * FROM aliases WHERE function_id = ? AND name = ?")
            .bind(function_id.to_string())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_backend)?;
        let Some(row) = row else { return Ok(None) };
        let routing: String = row.try_get("routing").map_err(to_backend)?;
        Ok(Some(AliasRecord {
            function_id,
            name: name.to_string(),
            routing: serde_json::from_str(&routing).map_err(|e| StoreError::Backend(e.into()))?,
            updated_at: parse_ts(&row.try_get::<String, _>("updated_at").map_err(to_backend)?)?,
        }))
    }

    async fn delete(&self, function_id: Uuid, name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM aliases WHERE function_id = ? AND name = ?")
            .bind(function_id.to_string())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        Ok(())
    }

    async fn delete_all_for_function(&self, function_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM aliases WHERE function_id = ?")
            .bind(function_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        Ok(())
    }
}

fn task_type_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Create => "create",
        TaskType::Update => "update",
    }
}

fn task_status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> StoreResult<FunctionTaskRecord> {
    let id: String = row.try_get("id").map_err(to_backend)?;
    let function_id: String = row.try_get("function_id").map_err(to_backend)?;
    let task_type: String = row.try_get("task_type").map_err(to_backend)?;
    let status: String = row.try_get("status").map_err(to_backend)?;
    let input: String = row.try_get("input").map_err(to_backend)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(to_backend)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(to_backend)?;
    let created_at: String = row.try_get("created_at").map_err(to_backend)?;

    Ok(FunctionTaskRecord {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Backend(e.into()))?,
        function_id: Uuid::parse_str(&function_id).map_err(|e| StoreError::Backend(e.into()))?,
        task_type: match task_type.as_str() {
            "create" => TaskType::Create,
            _ => TaskType::Update,
        },
        status: match status.as_str() {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        },
        input: serde_json::from_str(&input).map_err(|e| StoreError::Backend(e.into()))?,
        error: row.try_get("error").map_err(to_backend)?,
        created_at: parse_ts(&created_at)?,
        started_at: started_at.map(|s| parse_ts(&s)).transpose()?,
        completed_at: completed_at.map(|s| parse_ts(&s)).transpose()?,
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create(&self, input: NewFunctionTask) -> StoreResult<FunctionTaskRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload = serde_json::to_string(&input.input).map_err(|e| StoreError::Backend(e.into()))?;
        let result = sqlx::query(
            "INSERT INTO function_tasks (id, function_id, task_type, status, input, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(input.function_id.to_string())
        .bind(task_type_str(input.task_type))
        .bind(task_status_str(TaskStatus::Pending))
        .bind(&payload)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if db_err.code().as_deref() == Some("2067") || db_err.code().as_deref() == Some("1555") {
                return Err(StoreError::Conflict(format!(
                    "function {} already has a non-terminal task",
                    input.function_id
                )));
            }
        }
        result.map_err(to_backend)?;
        TaskStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<FunctionTaskRecord>> {
        let row = sqlx::query("SELECT * FROM function_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(to_backend)?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn mark_running(&self, id: Uuid) -> StoreResult<FunctionTaskRecord> {
        sqlx::query("UPDATE function_tasks SET status = ?, started_at = ? WHERE id = ?")
            .bind(task_status_str(TaskStatus::Running))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        TaskStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn mark_completed(&self, id: Uuid) -> StoreResult<FunctionTaskRecord> {
        sqlx::query("UPDATE function_tasks SET status = ?, completed_at = ? WHERE id = ?")
            .bind(task_status_str(TaskStatus::Completed))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        TaskStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn mark_failed(&self, id: Uuid, error: String) -> StoreResult<FunctionTaskRecord> {
        sqlx::query("UPDATE function_tasks SET status = ?, error = ?, completed_at = ? WHERE id = ?")
            .bind(task_status_str(TaskStatus::Failed))
            .bind(&error)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        TaskStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn list_non_terminal(&self) -> StoreResult<Vec<FunctionTaskRecord>> {
        let rows = sqlx::query("SELECT * FROM function_tasks WHERE status IN ('pending', 'running')")
            .fetch_all(&self.pool)
            .await
            .map_err(to_backend)?;
        rows.iter().map(row_to_task).collect()
    }
}

fn trigger_str(t: TriggerType) -> &'static str {
    match t {
        TriggerType::Http => "http",
        TriggerType::Event => "event",
        TriggerType::Cron => "cron",
    }
}

fn invocation_status_str(s: InvocationStatus) -> &'static str {
    match s {
        InvocationStatus::Pending => "pending",
        InvocationStatus::Running => "running",
        InvocationStatus::Success => "success",
        InvocationStatus::Failed => "failed",
        InvocationStatus::Timeout => "timeout",
        InvocationStatus::Cancelled => "cancelled",
    }
}

fn row_to_invocation(row: &sqlx::sqlite::SqliteRow) -> StoreResult<InvocationRecord> {
    let id: String = row.try_get("id").map_err(to_backend)?;
    let function_id: String = row.try_get("function_id").map_err(to_backend)?;
    let trigger: String = row.try_get("trigger").map_err(to_backend)?;
    let input: String = row.try_get("input").map_err(to_backend)?;
    let output: Option<String> = row.try_get("output").map_err(to_backend)?;
    let status: String = row.try_get("status").map_err(to_backend)?;
    let sandbox_id: Option<String> = row.try_get("sandbox_id").map_err(to_backend)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(to_backend)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(to_backend)?;
    let created_at: String = row.try_get("created_at").map_err(to_backend)?;

    Ok(InvocationRecord {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Backend(e.into()))?,
        function_id: Uuid::parse_str(&function_id).map_err(|e| StoreError::Backend(e.into()))?,
        function_name: row.try_get("function_name").map_err(to_backend)?,
        version: row.try_get::<i64, _>("version").map_err(to_backend)? as u64,
        alias: row.try_get("alias").map_err(to_backend)?,
        session_key: row.try_get("session_key").map_err(to_backend)?,
        trigger: match trigger.as_str() {
            "http" => TriggerType::Http,
            "cron" => TriggerType::Cron,
            _ => TriggerType::Event,
        },
        input: serde_json::from_str(&input).map_err(|e| StoreError::Backend(e.into()))?,
        output: output
            .map(|o| serde_json::from_str(&o))
            .transpose()
            .map_err(|e| StoreError::Backend(e.into()))?,
        error: row.try_get("error").map_err(to_backend)?,
        status: match status.as_str() {
            "pending" => InvocationStatus::Pending,
            "running" => InvocationStatus::Running,
            "success" => InvocationStatus::Success,
            "failed" => InvocationStatus::Failed,
            "timeout" => InvocationStatus::Timeout,
            _ => InvocationStatus::Cancelled,
        },
        started_at: started_at.map(|s| parse_ts(&s)).transpose()?,
        completed_at: completed_at.map(|s| parse_ts(&s)).transpose()?,
        duration_ms: row
            .try_get::<Option<i64>, _>("duration_ms")
            .map_err(to_backend)?
            .map(|v| v as u64),
        billed_ms: row
            .try_get::<Option<i64>, _>("billed_ms")
            .map_err(to_backend)?
            .map(|v| v as u64),
        cold_start: row.try_get::<i64, _>("cold_start").map_err(to_backend)? != 0,
        memory_used_mb: row
            .try_get::<Option<i64>, _>("memory_used_mb")
            .map_err(to_backend)?
            .map(|v| v as u32),
        retry_count: row.try_get::<i64, _>("retry_count").map_err(to_backend)? as u32,
        sandbox_id: sandbox_id
            .map(|s| Uuid::parse_str(&s).map_err(|e| StoreError::Backend(e.into())))
            .transpose()?,
        created_at: parse_ts(&created_at)?,
    })
}

#[async_trait]
impl InvocationStore for SqliteStore {
    async fn create(&self, input: NewInvocation) -> StoreResult<InvocationRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload = serde_json::to_string(&input.input).map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query(
            "INSERT INTO invocations (
                id, function_id, function_name, version, alias, session_key, trigger, input,
                status, cold_start, retry_count, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?)",
        )
        .bind(id.to_string())
        .bind(input.function_id.to_string())
        .bind(&input.function_name)
        .bind(input.version as i64)
        .bind(&input.alias)
        .bind(&input.session_key)
        .bind(trigger_str(input.trigger))
        .bind(&payload)
        .bind(invocation_status_str(InvocationStatus::Pending))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(to_backend)?;
        InvocationStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<InvocationRecord>> {
        let row = sqlx::query("SELECT * FROM invocations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(to_backend)?;
        row.as_ref().map(row_to_invocation).transpose()
    }

    async fn mark_running(&self, id: Uuid, sandbox_id: Option<Uuid>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE invocations SET status = ?, started_at = ?, sandbox_id = ? WHERE id = ?",
        )
        .bind(invocation_status_str(InvocationStatus::Running))
        .bind(Utc::now().to_rfc3339())
        .bind(sandbox_id.map(|s| s.to_string()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(to_backend)?;
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        output: serde_json::Value,
        duration_ms: u64,
        cold_start: bool,
        memory_used_mb: Option<u32>,
    ) -> StoreResult<InvocationRecord> {
        let output_json = serde_json::to_string(&output).map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query(
            "UPDATE invocations SET status = ?, output = ?, duration_ms = ?, billed_ms = ?,
             cold_start = ?, memory_used_mb = ?, completed_at = ? WHERE id = ?",
        )
        .bind(invocation_status_str(InvocationStatus::Success))
        .bind(&output_json)
        .bind(duration_ms as i64)
        .bind(billed_ms(duration_ms) as i64)
        .bind(cold_start as i64)
        .bind(memory_used_mb.map(|m| m as i64))
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(to_backend)?;
        InvocationStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn fail(
        &self,
        id: Uuid,
        error: String,
        duration_ms: u64,
        cold_start: bool,
    ) -> StoreResult<InvocationRecord> {
        sqlx::query(
            "UPDATE invocations SET status = ?, error = ?, duration_ms = ?, billed_ms = ?,
             cold_start = ?, completed_at = ? WHERE id = ?",
        )
        .bind(invocation_status_str(InvocationStatus::Failed))
        .bind(&error)
        .bind(duration_ms as i64)
        .bind(billed_ms(duration_ms) as i64)
        .bind(cold_start as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(to_backend)?;
        InvocationStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn mark_timeout(&self, id: Uuid) -> StoreResult<InvocationRecord> {
        sqlx::query("UPDATE invocations SET status = ?, completed_at = ? WHERE id = ?")
            .bind(invocation_status_str(InvocationStatus::Timeout))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(to_backend)?;
        InvocationStore::get(self, id).await?.ok_or(StoreError::NotFound)
    }

    async fn count_active(&self, function_id: Uuid) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as n FROM invocations WHERE function_id = ? AND status IN ('pending', 'running')",
        )
        .bind(function_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(to_backend)?;
        Ok(row.try_get::<i64, _>("n").map_err(to_backend)? as u64)
    }
}

#[async_trait]
impl DeadLetterStore for SqliteStore {
    async fn create(&self, input: NewDeadLetter) -> StoreResult<DeadLetterRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload = serde_json::to_string(&input.payload).map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query(
            "INSERT INTO dead_letters (
                id, function_id, original_request_id, payload, error, retry_count, status,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(input.function_id.to_string())
        .bind(input.original_request_id.to_string())
        .bind(&payload)
        .bind(&input.error)
        .bind("pending")
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(to_backend)?;

        Ok(DeadLetterRecord {
            id,
            function_id: input.function_id,
            original_request_id: input.original_request_id,
            payload: input.payload,
            error: input.error,
            retry_count: 0,
            status: DeadLetterStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    async fn list_for_function(&self, function_id: Uuid) -> StoreResult<Vec<DeadLetterRecord>> {
        let rows = sqlx::query("SELECT * FROM dead_letters WHERE function_id = ?")
            .bind(function_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(to_backend)?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(to_backend)?;
                let original_request_id: String =
                    row.try_get("original_request_id").map_err(to_backend)?;
                let payload: String = row.try_get("payload").map_err(to_backend)?;
                let status: String = row.try_get("status").map_err(to_backend)?;
                let created_at: String = row.try_get("created_at").map_err(to_backend)?;
                let updated_at: String = row.try_get("updated_at").map_err(to_backend)?;
                Ok(DeadLetterRecord {
                    id: Uuid::parse_str(&id).map_err(|e| StoreError::Backend(e.into()))?,
                    function_id,
                    original_request_id: Uuid::parse_str(&original_request_id)
                        .map_err(|e| StoreError::Backend(e.into()))?,
                    payload: serde_json::from_str(&payload).map_err(|e| StoreError::Backend(e.into()))?,
                    error: row.try_get("error").map_err(to_backend)?,
                    retry_count: row.try_get::<i64, _>("retry_count").map_err(to_backend)? as u32,
                    status: match status.as_str() {
                        "retrying" => DeadLetterStatus::Retrying,
                        "resolved" => DeadLetterStatus::Resolved,
                        "discarded" => DeadLetterStatus::Discarded,
                        _ => DeadLetterStatus::Pending,
                    },
                    created_at: parse_ts(&created_at)?,
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceLimits as Limits;
    use std::collections::HashMap;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn sample(name: &str) -> NewFunction {
        NewFunction {
            name: name.to_string(),
            runtime: "python3.11".into(),
            handler: "main.handler".into(),
            description: None,
            tags: vec![],
            code: Some("print('hi')".into()),
            binary: None,
            limits: Limits::default(),
            env: HashMap::new(),
            cron_expression: None,
            http_route: None,
            http_methods: vec![],
            webhook_key: None,
            session_affinity: false,
            session_timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn create_get_update_delete_round_trip() {
        let store = memory_store().await;
        let created = store.create(sample("greeter")).await.unwrap();
        assert_eq!(created.status, FunctionStatus::Creating);

        let fetched = store.get_by_name("greeter").await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);

        let updated = store
            .set_status(created.id, FunctionStatus::Active)
            .await
            .unwrap();
        assert_eq!(updated.status, FunctionStatus::Active);

        store.delete(created.id).await.unwrap();
        assert!(store.get(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let store = memory_store().await;
        store.create(sample("dup")).await.unwrap();
        let err = store.create(sample("dup")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn invocation_lifecycle_records_billed_ms() {
        let store = memory_store().await;
        let function = store.create(sample("billable")).await.unwrap();
        let invocation = InvocationStore::create(
            &store,
            NewInvocation {
                function_id: function.id,
                function_name: function.name.clone(),
                version: 1,
                alias: None,
                session_key: None,
                trigger: TriggerType::Http,
                input: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

        store.mark_running(invocation.id, None).await.unwrap();
        let completed = store
            .complete(invocation.id, serde_json::json!({"ok": true}), 175, true, Some(256))
            .await
            .unwrap();
        assert_eq!(completed.billed_ms, Some(200));
        assert!(completed.cold_start);
    }
}
