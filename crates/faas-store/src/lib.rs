//! Persistence contracts consumed by the FaaS execution core.
//!
//! This crate deliberately does not own the "real" production store — per
//! the core's scope, the relational database and shared cache are external
//! collaborators. What lives here is the trait surface the core codes
//! against (`FunctionStore`, `VersionStore`, `AliasStore`, `TaskStore`,
//! `InvocationStore`, `DeadLetterStore`, `SessionCache`, `OverflowQueue`),
//! an in-memory implementation suitable for tests and single-node demos,
//! and (behind the `sqlite-store` feature) a `sqlx`-backed reference
//! implementation that exercises the same contracts against a real
//! database.

pub mod memory;
#[cfg(feature = "sqlite-store")]
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by any store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionStatus {
    Creating,
    Active,
    Updating,
    Building,
    Offline,
    Inactive,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub timeout_seconds: u32,
    pub max_concurrency: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            timeout_seconds: 30,
            max_concurrency: 0,
        }
    }
}

pub const MIN_MEMORY_MB: u32 = 128;
pub const MAX_MEMORY_MB: u32 = 3072;
pub const MIN_TIMEOUT_SECONDS: u32 = 1;
pub const MAX_TIMEOUT_SECONDS: u32 = 300;
pub const MAX_CODE_BYTES: usize = 512 * 1024;
pub const MAX_BINARY_BYTES: usize = 50 * 1024 * 1024;

/// Default session-affinity TTL when a function doesn't specify its own
/// (spec §4.4: "function session-timeout (default 1 h)").
pub const DEFAULT_SESSION_TIMEOUT_SECONDS: u64 = 3600;

impl ResourceLimits {
    pub fn validate(&self) -> StoreResult<()> {
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(StoreError::Validation(format!(
                "memory_mb {} out of range [{MIN_MEMORY_MB}, {MAX_MEMORY_MB}]",
                self.memory_mb
            )));
        }
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&self.timeout_seconds) {
            return Err(StoreError::Validation(format!(
                "timeout_seconds {} out of range [{MIN_TIMEOUT_SECONDS}, {MAX_TIMEOUT_SECONDS}]",
                self.timeout_seconds
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub id: Uuid,
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub code: Option<String>,
    pub binary: Option<Vec<u8>>,
    pub code_hash: String,
    pub limits: ResourceLimits,
    pub env: HashMap<String, String>,
    pub status: FunctionStatus,
    pub current_task_id: Option<Uuid>,
    pub version: u64,
    pub cron_expression: Option<String>,
    pub http_route: Option<String>,
    pub http_methods: Vec<String>,
    pub webhook_key: Option<String>,
    pub session_affinity: bool,
    pub session_timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FunctionRecord {
    pub fn is_invocable(&self) -> bool {
        self.status == FunctionStatus::Active
    }
}

/// Input payload for registering a new function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFunction {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub code: Option<String>,
    pub binary: Option<Vec<u8>>,
    pub limits: ResourceLimits,
    pub env: HashMap<String, String>,
    pub cron_expression: Option<String>,
    pub http_route: Option<String>,
    pub http_methods: Vec<String>,
    pub webhook_key: Option<String>,
    pub session_affinity: bool,
    pub session_timeout_seconds: Option<u64>,
}

impl NewFunction {
    /// Validates the invariants of spec §3 that are independent of any
    /// existing store state (name-uniqueness is checked by the store).
    pub fn validate(&self) -> StoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::Validation("name must not be empty".into()));
        }
        if self.runtime.trim().is_empty() {
            return Err(StoreError::Validation("runtime must not be empty".into()));
        }
        if self.handler.trim().is_empty() {
            return Err(StoreError::Validation("handler must not be empty".into()));
        }
        let code_len = self.code.as_deref().map(str::len).unwrap_or(0);
        if code_len == 0 && self.binary.is_none() {
            return Err(StoreError::Validation(
                "code or binary must be supplied".into(),
            ));
        }
        if code_len > MAX_CODE_BYTES {
            return Err(StoreError::Validation(format!(
                "code size {code_len} exceeds {MAX_CODE_BYTES} bytes"
            )));
        }
        if let Some(binary) = &self.binary {
            if binary.len() > MAX_BINARY_BYTES {
                return Err(StoreError::Validation(format!(
                    "binary size {} exceeds {MAX_BINARY_BYTES} bytes",
                    binary.len()
                )));
            }
        }
        self.limits.validate()?;
        Ok(())
    }

    pub fn code_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        if let Some(code) = &self.code {
            hasher.update(code.as_bytes());
        }
        if let Some(binary) = &self.binary {
            hasher.update(binary);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Patch applied by `update_function`; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionPatch {
    pub handler: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub code: Option<String>,
    pub binary: Option<Vec<u8>>,
    pub limits: Option<ResourceLimits>,
    pub env: Option<HashMap<String, String>>,
    pub cron_expression: Option<Option<String>>,
    pub http_route: Option<Option<String>>,
    pub http_methods: Option<Vec<String>>,
    pub webhook_key: Option<Option<String>>,
    pub session_affinity: Option<bool>,
    pub session_timeout_seconds: Option<u64>,
}

impl FunctionPatch {
    /// True when the code payload changes, triggering a recompile/version
    /// bump per spec §4.6.
    pub fn changes_code(&self) -> bool {
        self.code.is_some() || self.binary.is_some()
    }
}

// ---------------------------------------------------------------------
// FunctionVersion
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionVersionRecord {
    pub function_id: Uuid,
    pub version: u64,
    pub handler: String,
    pub code: Option<String>,
    pub binary: Option<Vec<u8>>,
    pub code_hash: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Alias
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub version: u64,
    pub weight: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasRecord {
    pub function_id: Uuid,
    pub name: String,
    pub routing: Vec<RoutingEntry>,
    pub updated_at: DateTime<Utc>,
}

/// Validates the weighted-routing invariant of spec §3/§4.3: weights are
/// each in [0, 100] and sum to exactly 100, versions are positive.
pub fn validate_routing(routing: &[RoutingEntry]) -> StoreResult<()> {
    if routing.is_empty() {
        return Err(StoreError::Validation(
            "alias routing must have at least one entry".into(),
        ));
    }
    let mut sum: u32 = 0;
    for entry in routing {
        if entry.version == 0 {
            return Err(StoreError::Validation(
                "alias routing version must be > 0".into(),
            ));
        }
        if entry.weight as u32 > 100 {
            return Err(StoreError::Validation(format!(
                "alias routing weight {} out of range [0, 100]",
                entry.weight
            )));
        }
        sum += entry.weight as u32;
    }
    if sum != 100 {
        return Err(StoreError::Validation(format!(
            "alias routing weights sum to {sum}, expected 100"
        )));
    }
    Ok(())
}

pub const LATEST_ALIAS: &str = "latest";

// ---------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Http,
    Event,
    Cron,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub id: Uuid,
    pub function_id: Uuid,
    pub function_name: String,
    pub version: u64,
    pub alias: Option<String>,
    pub session_key: Option<String>,
    pub trigger: TriggerType,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub status: InvocationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub billed_ms: Option<u64>,
    pub cold_start: bool,
    pub memory_used_mb: Option<u32>,
    pub retry_count: u32,
    pub sandbox_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Computes the billed-time rule of spec §3: clamp to a 100 ms floor
/// *before* rounding up to the next 100 ms boundary (spec §9 open question,
/// resolved in DESIGN.md).
pub fn billed_ms(duration_ms: u64) -> u64 {
    let clamped = duration_ms.max(1);
    let rounded = clamped.div_ceil(100) * 100;
    rounded.max(100)
}

#[derive(Debug, Clone)]
pub struct NewInvocation {
    pub function_id: Uuid,
    pub function_name: String,
    pub version: u64,
    pub alias: Option<String>,
    pub session_key: Option<String>,
    pub trigger: TriggerType,
    pub input: serde_json::Value,
}

// ---------------------------------------------------------------------
// FunctionTask
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionTaskRecord {
    pub id: Uuid,
    pub function_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewFunctionTask {
    pub function_id: Uuid,
    pub task_type: TaskType,
    pub input: serde_json::Value,
}

// ---------------------------------------------------------------------
// DeadLetterMessage
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    Resolved,
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub function_id: Uuid,
    pub original_request_id: Uuid,
    pub payload: serde_json::Value,
    pub error: String,
    pub retry_count: u32,
    pub status: DeadLetterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub function_id: Uuid,
    pub original_request_id: Uuid,
    pub payload: serde_json::Value,
    pub error: String,
}

// ---------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------

#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn create(&self, input: NewFunction) -> StoreResult<FunctionRecord>;
    async fn get(&self, id: Uuid) -> StoreResult<Option<FunctionRecord>>;
    async fn get_by_name(&self, name: &str) -> StoreResult<Option<FunctionRecord>>;
    async fn update(&self, id: Uuid, patch: FunctionPatch) -> StoreResult<FunctionRecord>;
    async fn set_status(&self, id: Uuid, status: FunctionStatus) -> StoreResult<FunctionRecord>;
    async fn set_task(&self, id: Uuid, task_id: Option<Uuid>) -> StoreResult<()>;
    async fn bump_version(&self, id: Uuid) -> StoreResult<u64>;
    async fn delete(&self, id: Uuid) -> StoreResult<()>;
    async fn list_by_status(&self, status: FunctionStatus) -> StoreResult<Vec<FunctionRecord>>;
    async fn list_cron_active(&self) -> StoreResult<Vec<FunctionRecord>>;
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn put(&self, record: FunctionVersionRecord) -> StoreResult<()>;
    async fn get(&self, function_id: Uuid, version: u64) -> StoreResult<Option<FunctionVersionRecord>>;
    async fn exists(&self, function_id: Uuid, version: u64) -> StoreResult<bool>;
}

#[async_trait]
pub trait AliasStore: Send + Sync {
    async fn upsert(
        &self,
        function_id: Uuid,
        name: &str,
        routing: Vec<RoutingEntry>,
    ) -> StoreResult<AliasRecord>;
    async fn get(&self, function_id: Uuid, name: &str) -> StoreResult<Option<AliasRecord>>;
    async fn delete(&self, function_id: Uuid, name: &str) -> StoreResult<()>;
    async fn delete_all_for_function(&self, function_id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, input: NewFunctionTask) -> StoreResult<FunctionTaskRecord>;
    async fn get(&self, id: Uuid) -> StoreResult<Option<FunctionTaskRecord>>;
    async fn mark_running(&self, id: Uuid) -> StoreResult<FunctionTaskRecord>;
    async fn mark_completed(&self, id: Uuid) -> StoreResult<FunctionTaskRecord>;
    async fn mark_failed(&self, id: Uuid, error: String) -> StoreResult<FunctionTaskRecord>;
    async fn list_non_terminal(&self) -> StoreResult<Vec<FunctionTaskRecord>>;
}

#[async_trait]
pub trait InvocationStore: Send + Sync {
    async fn create(&self, input: NewInvocation) -> StoreResult<InvocationRecord>;
    async fn get(&self, id: Uuid) -> StoreResult<Option<InvocationRecord>>;
    async fn mark_running(&self, id: Uuid, sandbox_id: Option<Uuid>) -> StoreResult<()>;
    async fn complete(
        &self,
        id: Uuid,
        output: serde_json::Value,
        duration_ms: u64,
        cold_start: bool,
        memory_used_mb: Option<u32>,
    ) -> StoreResult<InvocationRecord>;
    async fn fail(
        &self,
        id: Uuid,
        error: String,
        duration_ms: u64,
        cold_start: bool,
    ) -> StoreResult<InvocationRecord>;
    async fn mark_timeout(&self, id: Uuid) -> StoreResult<InvocationRecord>;
    async fn count_active(&self, function_id: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn create(&self, input: NewDeadLetter) -> StoreResult<DeadLetterRecord>;
    async fn list_for_function(&self, function_id: Uuid) -> StoreResult<Vec<DeadLetterRecord>>;
}

/// The shared, process-external cache of spec §3/§4.4 — session bindings
/// and their reverse index. A real deployment backs this with something
/// like Redis; the in-memory implementation here is adequate for a
/// single-node demo and for tests.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get_binding(&self, function_id: Uuid, session_key: &str) -> StoreResult<Option<Uuid>>;
    async fn put_binding(
        &self,
        function_id: Uuid,
        session_key: &str,
        sandbox_id: Uuid,
        ttl_seconds: u64,
    ) -> StoreResult<()>;
    async fn touch_binding(
        &self,
        function_id: Uuid,
        session_key: &str,
        ttl_seconds: u64,
    ) -> StoreResult<()>;
    /// Removes every binding pointing at `sandbox_id` (the reverse index
    /// `vm_sessions:{sandbox_id}` of spec §4.4).
    async fn drop_sandbox(&self, sandbox_id: Uuid) -> StoreResult<()>;
}

/// The overflow list spec §4.5.2 pushes async invocation ids onto when the
/// work queue is saturated.
#[derive(Debug, Clone)]
pub struct OverflowEntry {
    pub invocation_id: Uuid,
    pub function_id: Uuid,
    /// Version resolved at enqueue time; replayed verbatim at dequeue per
    /// the resolved open question in spec §9 / DESIGN.md.
    pub version: u64,
    pub alias: Option<String>,
}

#[async_trait]
pub trait OverflowQueue: Send + Sync {
    async fn push(&self, entry: OverflowEntry) -> StoreResult<()>;
    async fn pop(&self) -> StoreResult<Option<OverflowEntry>>;
    async fn len(&self) -> StoreResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billed_ms_floor_and_rounding() {
        assert_eq!(billed_ms(1), 100);
        assert_eq!(billed_ms(99), 100);
        assert_eq!(billed_ms(100), 100);
        assert_eq!(billed_ms(101), 200);
        assert_eq!(billed_ms(250), 300);
    }

    #[test]
    fn routing_requires_full_weight_sum() {
        assert!(validate_routing(&[RoutingEntry { version: 1, weight: 100 }]).is_ok());
        assert!(validate_routing(&[
            RoutingEntry { version: 1, weight: 70 },
            RoutingEntry { version: 2, weight: 30 },
        ])
        .is_ok());
        assert!(validate_routing(&[
            RoutingEntry { version: 1, weight: 70 },
            RoutingEntry { version: 2, weight: 20 },
        ])
        .is_err());
        assert!(validate_routing(&[]).is_err());
    }

    #[test]
    fn new_function_requires_code_or_binary() {
        let base = NewFunction {
            name: "fn".into(),
            runtime: "python3.11".into(),
            handler: "main.handler".into(),
            description: None,
            tags: vec![],
            code: None,
            binary: None,
            limits: ResourceLimits::default(),
            env: HashMap::new(),
            cron_expression: None,
            http_route: None,
            http_methods: vec![],
            webhook_key: None,
            session_affinity: false,
            session_timeout_seconds: None,
        };
        assert!(base.validate().is_err());
        let mut with_code = base.clone();
        with_code.code = Some("print('hi')".into());
        assert!(with_code.validate().is_ok());
    }
}
