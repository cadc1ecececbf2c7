//! In-memory implementations of the store traits, suitable for tests and
//! single-node demos. Every collection is guarded by a `parking_lot::RwLock`
//! the way `cave-kernel::CaveKernel` guards its instance table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    AliasRecord, AliasStore, DeadLetterRecord, DeadLetterStatus, DeadLetterStore, FunctionPatch,
    FunctionRecord, FunctionStatus, FunctionStore, FunctionTaskRecord, FunctionVersionRecord,
    InvocationRecord, InvocationStatus, InvocationStore, NewDeadLetter, NewFunction,
    NewFunctionTask, NewInvocation, OverflowEntry, OverflowQueue, RoutingEntry, SessionCache,
    StoreError, StoreResult, TaskStatus, TaskStore, VersionStore, billed_ms, validate_routing,
    DEFAULT_SESSION_TIMEOUT_SECONDS,
};

#[derive(Default)]
pub struct MemoryFunctionStore {
    by_id: RwLock<HashMap<Uuid, FunctionRecord>>,
    by_name: RwLock<HashMap<String, Uuid>>,
}

impl MemoryFunctionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FunctionStore for MemoryFunctionStore {
    async fn create(&self, input: NewFunction) -> StoreResult<FunctionRecord> {
        input.validate()?;
        let mut by_name = self.by_name.write();
        if by_name.contains_key(&input.name) {
            return Err(StoreError::Conflict(format!(
                "function {} already exists",
                input.name
            )));
        }
        let now = Utc::now();
        let record = FunctionRecord {
            id: Uuid::new_v4(),
            name: input.name.clone(),
            runtime: input.runtime,
            handler: input.handler,
            description: input.description,
            tags: input.tags,
            code: input.code.clone(),
            binary: input.binary.clone(),
            code_hash: input.code_hash(),
            limits: input.limits,
            env: input.env,
            status: FunctionStatus::Creating,
            current_task_id: None,
            version: 1,
            cron_expression: input.cron_expression,
            http_route: input.http_route,
            http_methods: input.http_methods,
            webhook_key: input.webhook_key,
            session_affinity: input.session_affinity,
            session_timeout_seconds: input.session_timeout_seconds.unwrap_or(DEFAULT_SESSION_TIMEOUT_SECONDS),
            created_at: now,
            updated_at: now,
        };
        by_name.insert(input.name, record.id);
        self.by_id.write().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<FunctionRecord>> {
        Ok(self.by_id.read().get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> StoreResult<Option<FunctionRecord>> {
        let Some(id) = self.by_name.read().get(name).copied() else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn update(&self, id: Uuid, patch: FunctionPatch) -> StoreResult<FunctionRecord> {
        let mut by_id = self.by_id.write();
        let record = by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(handler) = patch.handler {
            record.handler = handler;
        }
        if let Some(description) = patch.description {
            record.description = Some(description);
        }
        if let Some(tags) = patch.tags {
            record.tags = tags;
        }
        if let Some(code) = patch.code {
            record.code = Some(code);
        }
        if let Some(binary) = patch.binary {
            record.binary = Some(binary);
        }
        if let Some(limits) = patch.limits {
            limits.validate()?;
            record.limits = limits;
        }
        if let Some(env) = patch.env {
            record.env = env;
        }
        if let Some(cron) = patch.cron_expression {
            record.cron_expression = cron;
        }
        if let Some(route) = patch.http_route {
            record.http_route = route;
        }
        if let Some(methods) = patch.http_methods {
            record.http_methods = methods;
        }
        if let Some(key) = patch.webhook_key {
            record.webhook_key = key;
        }
        if let Some(affinity) = patch.session_affinity {
            record.session_affinity = affinity;
        }
        if let Some(timeout) = patch.session_timeout_seconds {
            record.session_timeout_seconds = timeout;
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn set_status(&self, id: Uuid, status: FunctionStatus) -> StoreResult<FunctionRecord> {
        let mut by_id = self.by_id.write();
        let record = by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn set_task(&self, id: Uuid, task_id: Option<Uuid>) -> StoreResult<()> {
        let mut by_id = self.by_id.write();
        let record = by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.current_task_id = task_id;
        Ok(())
    }

    async fn bump_version(&self, id: Uuid) -> StoreResult<u64> {
        let mut by_id = self.by_id.write();
        let record = by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(record.version)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let mut by_id = self.by_id.write();
        let record = by_id.remove(&id).ok_or(StoreError::NotFound)?;
        self.by_name.write().remove(&record.name);
        Ok(())
    }

    async fn list_by_status(&self, status: FunctionStatus) -> StoreResult<Vec<FunctionRecord>> {
        Ok(self
            .by_id
            .read()
            .values()
            .filter(|f| f.status == status)
            .cloned()
            .collect())
    }

    async fn list_cron_active(&self) -> StoreResult<Vec<FunctionRecord>> {
        Ok(self
            .by_id
            .read()
            .values()
            .filter(|f| f.status == FunctionStatus::Active && f.cron_expression.is_some())
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryVersionStore {
    versions: RwLock<HashMap<(Uuid, u64), FunctionVersionRecord>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn put(&self, record: FunctionVersionRecord) -> StoreResult<()> {
        self.versions
            .write()
            .insert((record.function_id, record.version), record);
        Ok(())
    }

    async fn get(&self, function_id: Uuid, version: u64) -> StoreResult<Option<FunctionVersionRecord>> {
        Ok(self.versions.read().get(&(function_id, version)).cloned())
    }

    async fn exists(&self, function_id: Uuid, version: u64) -> StoreResult<bool> {
        Ok(self.versions.read().contains_key(&(function_id, version)))
    }
}

#[derive(Default)]
pub struct MemoryAliasStore {
    aliases: RwLock<HashMap<(Uuid, String), AliasRecord>>,
}

impl MemoryAliasStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AliasStore for MemoryAliasStore {
    async fn upsert(
        &self,
        function_id: Uuid,
        name: &str,
        routing: Vec<RoutingEntry>,
    ) -> StoreResult<AliasRecord> {
        validate_routing(&routing)?;
        let record = AliasRecord {
            function_id,
            name: name.to_string(),
            routing,
            updated_at: Utc::now(),
        };
        self.aliases
            .write()
            .insert((function_id, name.to_string()), record.clone());
        Ok(record)
    }

    async fn get(&self, function_id: Uuid, name: &str) -> StoreResult<Option<AliasRecord>> {
        Ok(self
            .aliases
            .read()
            .get(&(function_id, name.to_string()))
            .cloned())
    }

    async fn delete(&self, function_id: Uuid, name: &str) -> StoreResult<()> {
        self.aliases
            .write()
            .remove(&(function_id, name.to_string()));
        Ok(())
    }

    async fn delete_all_for_function(&self, function_id: Uuid) -> StoreResult<()> {
        self.aliases.write().retain(|(fid, _), _| *fid != function_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, FunctionTaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, input: NewFunctionTask) -> StoreResult<FunctionTaskRecord> {
        let record = FunctionTaskRecord {
            id: Uuid::new_v4(),
            function_id: input.function_id,
            task_type: input.task_type,
            status: TaskStatus::Pending,
            input: input.input,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.tasks.write().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<FunctionTaskRecord>> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn mark_running(&self, id: Uuid) -> StoreResult<FunctionTaskRecord> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        Ok(task.clone())
    }

    async fn mark_completed(&self, id: Uuid) -> StoreResult<FunctionTaskRecord> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound)?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        Ok(task.clone())
    }

    async fn mark_failed(&self, id: Uuid, error: String) -> StoreResult<FunctionTaskRecord> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound)?;
        task.status = TaskStatus::Failed;
        task.error = Some(error);
        task.completed_at = Some(Utc::now());
        Ok(task.clone())
    }

    async fn list_non_terminal(&self) -> StoreResult<Vec<FunctionTaskRecord>> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryInvocationStore {
    invocations: RwLock<HashMap<Uuid, InvocationRecord>>,
}

impl MemoryInvocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvocationStore for MemoryInvocationStore {
    async fn create(&self, input: NewInvocation) -> StoreResult<InvocationRecord> {
        let record = InvocationRecord {
            id: Uuid::new_v4(),
            function_id: input.function_id,
            function_name: input.function_name,
            version: input.version,
            alias: input.alias,
            session_key: input.session_key,
            trigger: input.trigger,
            input: input.input,
            output: None,
            error: None,
            status: InvocationStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            billed_ms: None,
            cold_start: false,
            memory_used_mb: None,
            retry_count: 0,
            sandbox_id: None,
            created_at: Utc::now(),
        };
        self.invocations.write().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<InvocationRecord>> {
        Ok(self.invocations.read().get(&id).cloned())
    }

    async fn mark_running(&self, id: Uuid, sandbox_id: Option<Uuid>) -> StoreResult<()> {
        let mut invocations = self.invocations.write();
        let record = invocations.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.status = InvocationStatus::Running;
        record.started_at = Some(Utc::now());
        record.sandbox_id = sandbox_id;
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
        let mut invocations = self.invocations.write();
        let record = invocations.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.status = InvocationStatus::Success;
        record.output = Some(output);
        record.duration_ms = Some(duration_ms);
        record.billed_ms = Some(billed_ms(duration_ms));
        record.cold_start = cold_start;
        record.memory_used_mb = memory_used_mb;
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: String,
        duration_ms: u64,
        cold_start: bool,
    ) -> StoreResult<InvocationRecord> {
        let mut invocations = self.invocations.write();
        let record = invocations.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.status = InvocationStatus::Failed;
        record.error = Some(error);
        record.duration_ms = Some(duration_ms);
        record.billed_ms = Some(billed_ms(duration_ms));
        record.cold_start = cold_start;
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn mark_timeout(&self, id: Uuid) -> StoreResult<InvocationRecord> {
        let mut invocations = self.invocations.write();
        let record = invocations.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.status = InvocationStatus::Timeout;
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn count_active(&self, function_id: Uuid) -> StoreResult<u64> {
        Ok(self
            .invocations
            .read()
            .values()
            .filter(|i| {
                i.function_id == function_id
                    && matches!(i.status, InvocationStatus::Pending | InvocationStatus::Running)
            })
            .count() as u64)
    }
}

#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: RwLock<HashMap<Uuid, DeadLetterRecord>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn create(&self, input: NewDeadLetter) -> StoreResult<DeadLetterRecord> {
        let now = Utc::now();
        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            function_id: input.function_id,
            original_request_id: input.original_request_id,
            payload: input.payload,
            error: input.error,
            retry_count: 0,
            status: DeadLetterStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.entries.write().insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_for_function(&self, function_id: Uuid) -> StoreResult<Vec<DeadLetterRecord>> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.function_id == function_id)
            .cloned()
            .collect())
    }
}

struct Binding {
    sandbox_id: Uuid,
    expires_at: chrono::DateTime<Utc>,
}

/// Process-local session cache with a reverse index, standing in for the
/// shared external cache described in spec §4.4. `expires_at` emulates a
/// TTL the way a real cache backend would enforce it server-side.
#[derive(Default)]
pub struct MemorySessionCache {
    bindings: RwLock<HashMap<(Uuid, String), Binding>>,
    reverse: RwLock<HashMap<Uuid, Vec<(Uuid, String)>>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn get_binding(&self, function_id: Uuid, session_key: &str) -> StoreResult<Option<Uuid>> {
        let bindings = self.bindings.read();
        let Some(binding) = bindings.get(&(function_id, session_key.to_string())) else {
            return Ok(None);
        };
        if binding.expires_at < Utc::now() {
            return Ok(None);
        }
        Ok(Some(binding.sandbox_id))
    }

    async fn put_binding(
        &self,
        function_id: Uuid,
        session_key: &str,
        sandbox_id: Uuid,
        ttl_seconds: u64,
    ) -> StoreResult<()> {
        let key = (function_id, session_key.to_string());
        self.bindings.write().insert(
            key.clone(),
            Binding {
                sandbox_id,
                expires_at: Utc::now() + chrono::Duration::seconds(ttl_seconds as i64),
            },
        );
        self.reverse.write().entry(sandbox_id).or_default().push(key);
        Ok(())
    }

    async fn touch_binding(&self, function_id: Uuid, session_key: &str, ttl_seconds: u64) -> StoreResult<()> {
        let mut bindings = self.bindings.write();
        if let Some(binding) = bindings.get_mut(&(function_id, session_key.to_string())) {
            binding.expires_at = Utc::now() + chrono::Duration::seconds(ttl_seconds as i64);
        }
        Ok(())
    }

    async fn drop_sandbox(&self, sandbox_id: Uuid) -> StoreResult<()> {
        let Some(keys) = self.reverse.write().remove(&sandbox_id) else {
            return Ok(());
        };
        let mut bindings = self.bindings.write();
        for key in keys {
            bindings.remove(&key);
        }
        Ok(())
    }
}

/// FIFO overflow queue backed by a `Vec`, matching the teacher's preference
/// for `parking_lot::Mutex` over a channel when the data needs to be
/// inspected/drained rather than merely streamed.
#[derive(Default)]
pub struct MemoryOverflowQueue {
    entries: parking_lot::Mutex<std::collections::VecDeque<OverflowEntry>>,
}

impl MemoryOverflowQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OverflowQueue for MemoryOverflowQueue {
    async fn push(&self, entry: OverflowEntry) -> StoreResult<()> {
        self.entries.lock().push_back(entry);
        Ok(())
    }

    async fn pop(&self) -> StoreResult<Option<OverflowEntry>> {
        Ok(self.entries.lock().pop_front())
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.entries.lock().len())
    }
}

/// Convenience bundle wiring every in-memory store together, analogous to
/// how `cave-kernel::CaveKernel` holds its single `Database` handle.
pub struct MemoryStores {
    pub functions: Arc<MemoryFunctionStore>,
    pub versions: Arc<MemoryVersionStore>,
    pub aliases: Arc<MemoryAliasStore>,
    pub tasks: Arc<MemoryTaskStore>,
    pub invocations: Arc<MemoryInvocationStore>,
    pub dead_letters: Arc<MemoryDeadLetterStore>,
    pub sessions: Arc<MemorySessionCache>,
    pub overflow: Arc<MemoryOverflowQueue>,
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self {
            functions: Arc::new(MemoryFunctionStore::new()),
            versions: Arc::new(MemoryVersionStore::new()),
            aliases: Arc::new(MemoryAliasStore::new()),
            tasks: Arc::new(MemoryTaskStore::new()),
            invocations: Arc::new(MemoryInvocationStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterStore::new()),
            sessions: Arc::new(MemorySessionCache::new()),
            overflow: Arc::new(MemoryOverflowQueue::new()),
        }
    }
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceLimits;
    use std::collections::HashMap as StdHashMap;

    fn sample_new_function(name: &str) -> NewFunction {
        NewFunction {
            name: name.to_string(),
            runtime: "python3.11".into(),
            handler: "main.handler".into(),
            description: None,
            tags: vec![],
            code: Some("print('hi')".into()),
            binary: None,
            limits: ResourceLimits::default(),
            env: StdHashMap::new(),
            cron_expression: None,
            http_route: None,
            http_methods: vec![],
            webhook_key: None,
            session_affinity: false,
            session_timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_by_name() {
        let store = MemoryFunctionStore::new();
        let created = store.create(sample_new_function("hello")).await.unwrap();
        let fetched = store.get_by_name("hello").await.unwrap().unwrap();
        assert_eq!(created.id, fetched.id);
        assert_eq!(fetched.status, FunctionStatus::Creating);
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let store = MemoryFunctionStore::new();
        store.create(sample_new_function("dup")).await.unwrap();
        let err = store.create(sample_new_function("dup")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn session_binding_round_trip_and_reverse_cleanup() {
        let cache = MemorySessionCache::new();
        let function_id = Uuid::new_v4();
        let sandbox_id = Uuid::new_v4();
        cache
            .put_binding(function_id, "session-a", sandbox_id, 300)
            .await
            .unwrap();
        assert_eq!(
            cache.get_binding(function_id, "session-a").await.unwrap(),
            Some(sandbox_id)
        );
        cache.drop_sandbox(sandbox_id).await.unwrap();
        assert_eq!(cache.get_binding(function_id, "session-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn overflow_queue_is_fifo() {
        let queue = MemoryOverflowQueue::new();
        let function_id = Uuid::new_v4();
        let first = OverflowEntry {
            invocation_id: Uuid::new_v4(),
            function_id,
            version: 1,
            alias: None,
        };
        let second = OverflowEntry {
            invocation_id: Uuid::new_v4(),
            function_id,
            version: 1,
            alias: None,
        };
        let first_id = first.invocation_id;
        queue.push(first).await.unwrap();
        queue.push(second).await.unwrap();
        let popped = queue.pop().await.unwrap().unwrap();
        assert_eq!(popped.invocation_id, first_id);
    }
}
