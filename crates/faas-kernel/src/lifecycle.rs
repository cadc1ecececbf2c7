//! Lifecycle task engine (spec §4.6): create/update as a durable state
//! machine, recovered after a crash by re-dispatching non-terminal tasks.
//!
//! Grounded on `cave-kernel`'s create→provision→transition-status shape
//! (`create_sandbox` writes the record, `start_sandbox` transitions it
//! through `Preparing`/`Running`/`Failed` while persisting each step),
//! generalized from an in-request state machine to an explicit task record
//! dispatched onto its own `tokio::spawn`'d future, per spec §5 ("the
//! lifecycle engine uses one goroutine per task").

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use faas_store::{
    FunctionPatch, FunctionRecord, FunctionStatus, FunctionStore, FunctionVersionRecord,
    NewFunction, NewFunctionTask, TaskStore, TaskType, VersionStore,
};

const COMPILE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Output of a successful compile: the binary to store alongside the
/// function/version record. Runtimes that execute source directly (no
/// compile step) never reach this trait.
pub struct CompiledArtifact {
    pub binary: Vec<u8>,
}

/// The external "compile service" (spec §1: "out of scope (external
/// collaborators)"). The engine only needs to call it and respect its
/// bounded deadline.
#[async_trait]
pub trait CompileService: Send + Sync {
    async fn compile(&self, function: &FunctionRecord) -> anyhow::Result<CompiledArtifact>;
}

/// A `CompileService` for runtimes that ship source executed directly by the
/// sandbox guest and never need a compile step.
pub struct NoopCompileService;

#[async_trait]
impl CompileService for NoopCompileService {
    async fn compile(&self, _function: &FunctionRecord) -> anyhow::Result<CompiledArtifact> {
        Ok(CompiledArtifact { binary: Vec::new() })
    }
}

/// Runtimes whose functions must go through `CompileService` before they can
/// be marked `active`. Any other runtime tag is assumed to execute source
/// directly.
pub trait CompiledRuntimes: Send + Sync {
    fn requires_compile(&self, runtime: &str) -> bool;
}

pub struct StaticCompiledRuntimes(pub Vec<String>);

impl CompiledRuntimes for StaticCompiledRuntimes {
    fn requires_compile(&self, runtime: &str) -> bool {
        self.0.iter().any(|r| r == runtime)
    }
}

/// Lifecycle hooks (spec §6): `on_deployed` notifies any snapshot
/// subsystem, `on_updated` invalidates cached artifacts. Both collaborators
/// are external to the core's scope, so this is the seam they plug into —
/// same shape as the pool's `SandboxDeathSubscriber`.
pub trait DeploymentObserver: Send + Sync {
    fn on_deployed(&self, function: &FunctionRecord, version: u64) {
        let _ = (function, version);
    }
    fn on_updated(&self, function: &FunctionRecord) {
        let _ = function;
    }
}

#[derive(Clone)]
pub struct LifecycleEngine {
    functions: Arc<dyn FunctionStore>,
    versions: Arc<dyn VersionStore>,
    tasks: Arc<dyn TaskStore>,
    compiler: Arc<dyn CompileService>,
    compiled_runtimes: Arc<dyn CompiledRuntimes>,
    observer: Option<Arc<dyn DeploymentObserver>>,
}

impl LifecycleEngine {
    pub fn new(
        functions: Arc<dyn FunctionStore>,
        versions: Arc<dyn VersionStore>,
        tasks: Arc<dyn TaskStore>,
        compiler: Arc<dyn CompileService>,
        compiled_runtimes: Arc<dyn CompiledRuntimes>,
    ) -> Self {
        Self {
            functions,
            versions,
            tasks,
            compiler,
            compiled_runtimes,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeploymentObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Create flow (spec §4.6): writes the `Function` record (status
    /// `creating`, version 1), writes a `FunctionTask`, dispatches it
    /// asynchronously, and returns immediately with both ids attached.
    #[instrument(skip(self, input))]
    pub async fn create_function(&self, input: NewFunction) -> CoreResult<FunctionRecord> {
        input.validate()?;
        let function = self.functions.create(input.clone()).await?;
        let task = self
            .tasks
            .create(NewFunctionTask {
                function_id: function.id,
                task_type: TaskType::Create,
                input: serde_json::to_value(&input).unwrap_or(serde_json::Value::Null),
            })
            .await?;
        self.functions.set_task(function.id, Some(task.id)).await?;

        let engine = self.clone();
        let function_id = function.id;
        let task_id = task.id;
        tokio::spawn(async move {
            engine.run_create(function_id, task_id).await;
        });

        Ok(function)
    }

    /// Update flow (spec §4.6): same shape as create, and on a code change
    /// that requires recompilation, snapshots a new `FunctionVersion` on
    /// success.
    #[instrument(skip(self, patch))]
    pub async fn update_function(&self, function_id: Uuid, patch: FunctionPatch) -> CoreResult<FunctionRecord> {
        let current = self
            .functions
            .get(function_id)
            .await?
            .ok_or(CoreError::FunctionNotFound)?;
        if !matches!(
            current.status,
            FunctionStatus::Active | FunctionStatus::Failed | FunctionStatus::Offline
        ) {
            return Err(CoreError::Conflict(format!(
                "function in status {:?} cannot be updated",
                current.status
            )));
        }

        let changes_code = patch.changes_code();
        let updated = self.functions.update(function_id, patch.clone()).await?;
        self.functions
            .set_status(
                function_id,
                if changes_code {
                    FunctionStatus::Updating
                } else {
                    updated.status
                },
            )
            .await?;

        if !changes_code {
            return Ok(updated);
        }

        let task = self
            .tasks
            .create(NewFunctionTask {
                function_id,
                task_type: TaskType::Update,
                input: serde_json::to_value(&patch).unwrap_or(serde_json::Value::Null),
            })
            .await?;
        self.functions.set_task(function_id, Some(task.id)).await?;

        let engine = self.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            engine.run_update(function_id, task_id).await;
        });

        self.functions.get(function_id).await?.ok_or(CoreError::FunctionNotFound)
    }

    /// Explicit recompile operation (spec §4.5/§7: a failed function may be
    /// resubmitted for recompilation rather than auto-retried).
    #[instrument(skip(self))]
    pub async fn recompile(&self, function_id: Uuid) -> CoreResult<FunctionRecord> {
        let current = self
            .functions
            .get(function_id)
            .await?
            .ok_or(CoreError::FunctionNotFound)?;
        if !matches!(current.status, FunctionStatus::Active | FunctionStatus::Failed) {
            return Err(CoreError::Conflict(format!(
                "function in status {:?} cannot be recompiled",
                current.status
            )));
        }
        self.functions.set_status(function_id, FunctionStatus::Building).await?;

        let task = self
            .tasks
            .create(NewFunctionTask {
                function_id,
                task_type: TaskType::Update,
                input: serde_json::Value::Null,
            })
            .await?;
        self.functions.set_task(function_id, Some(task.id)).await?;

        let engine = self.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            engine.run_update(function_id, task_id).await;
        });

        self.functions.get(function_id).await?.ok_or(CoreError::FunctionNotFound)
    }

    /// Administrative status transitions guarded by spec §4.6's table.
    #[instrument(skip(self))]
    pub async fn set_status(&self, function_id: Uuid, target: FunctionStatus) -> CoreResult<FunctionRecord> {
        let current = self
            .functions
            .get(function_id)
            .await?
            .ok_or(CoreError::FunctionNotFound)?;
        let allowed = match target {
            FunctionStatus::Offline => current.status == FunctionStatus::Active,
            FunctionStatus::Active => current.status == FunctionStatus::Offline,
            FunctionStatus::Inactive => true,
            FunctionStatus::Building => {
                matches!(current.status, FunctionStatus::Active | FunctionStatus::Failed)
            }
            _ => false,
        };
        if !allowed {
            return Err(CoreError::Conflict(format!(
                "transition {:?} -> {target:?} rejected",
                current.status
            )));
        }
        Ok(self.functions.set_status(function_id, target).await?)
    }

    async fn run_create(&self, function_id: Uuid, task_id: Uuid) {
        if let Err(err) = self.tasks.mark_running(task_id).await {
            warn!(%task_id, error = %err, "failed to mark task running");
            return;
        }

        let function = match self.functions.get(function_id).await {
            Ok(Some(f)) => f,
            _ => return,
        };

        match self.compile_if_needed(&function).await {
            Ok(binary) => {
                if let Some(binary) = binary {
                    let _ = self
                        .functions
                        .update(
                            function_id,
                            FunctionPatch {
                                binary: Some(binary),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                let active = self.functions.set_status(function_id, FunctionStatus::Active).await;
                let _ = self.functions.set_task(function_id, None).await;
                let _ = self.tasks.mark_completed(task_id).await;
                if let (Ok(active), Some(observer)) = (&active, &self.observer) {
                    observer.on_deployed(active, active.version);
                }
                info!(%function_id, "function creation completed");
            }
            Err(err) => {
                let _ = self.functions.set_status(function_id, FunctionStatus::Failed).await;
                let _ = self.tasks.mark_failed(task_id, err.to_string()).await;
                error!(%function_id, error = %err, "function creation failed");
            }
        }
    }

    async fn run_update(&self, function_id: Uuid, task_id: Uuid) {
        if let Err(err) = self.tasks.mark_running(task_id).await {
            warn!(%task_id, error = %err, "failed to mark task running");
            return;
        }

        let function = match self.functions.get(function_id).await {
            Ok(Some(f)) => f,
            _ => return,
        };

        match self.compile_if_needed(&function).await {
            Ok(binary) => {
                if let Some(binary) = &binary {
                    let _ = self
                        .functions
                        .update(
                            function_id,
                            FunctionPatch {
                                binary: Some(binary.clone()),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                let version = match self.functions.bump_version(function_id).await {
                    Ok(v) => v,
                    Err(err) => {
                        let _ = self.tasks.mark_failed(task_id, err.to_string()).await;
                        let _ = self.functions.set_status(function_id, FunctionStatus::Failed).await;
                        return;
                    }
                };
                let _ = self
                    .versions
                    .put(FunctionVersionRecord {
                        function_id,
                        version,
                        handler: function.handler.clone(),
                        code: function.code.clone(),
                        binary: binary.or(function.binary.clone()),
                        code_hash: function.code_hash.clone(),
                        description: function.description.clone(),
                        created_at: chrono::Utc::now(),
                    })
                    .await;
                let active = self.functions.set_status(function_id, FunctionStatus::Active).await;
                let _ = self.functions.set_task(function_id, None).await;
                let _ = self.tasks.mark_completed(task_id).await;
                if let (Ok(active), Some(observer)) = (&active, &self.observer) {
                    observer.on_deployed(active, version);
                    observer.on_updated(active);
                }
                info!(%function_id, version, "function update completed");
            }
            Err(err) => {
                let _ = self.functions.set_status(function_id, FunctionStatus::Failed).await;
                let _ = self.tasks.mark_failed(task_id, err.to_string()).await;
                error!(%function_id, error = %err, "function update failed");
            }
        }
    }

    async fn compile_if_needed(&self, function: &FunctionRecord) -> anyhow::Result<Option<Vec<u8>>> {
        if function.binary.is_some() || !self.compiled_runtimes.requires_compile(&function.runtime) {
            return Ok(None);
        }
        let artifact = tokio::time::timeout(COMPILE_TIMEOUT, self.compiler.compile(function))
            .await
            .map_err(|_| anyhow::anyhow!("compile timed out after {:?}", COMPILE_TIMEOUT))??;
        Ok(Some(artifact.binary))
    }

    /// Recovery (spec §4.6): on startup, enumerate functions stuck in
    /// `{creating, updating, building}`, assign a new task id, and
    /// re-dispatch the appropriate flow.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> CoreResult<usize> {
        let mut recovered = 0;
        for status in [FunctionStatus::Creating, FunctionStatus::Updating, FunctionStatus::Building] {
            for function in self.functions.list_by_status(status).await? {
                // The task from before the crash is still non-terminal (the
                // process died mid-run, so nothing ever marked it completed
                // or failed). Close it out before dispatching a fresh one —
                // the store enforces at most one non-terminal task per
                // function (spec §9), so the slot must be freed first.
                if let Some(stale_task_id) = function.current_task_id {
                    let _ = self
                        .tasks
                        .mark_failed(stale_task_id, "interrupted by restart, recovering".to_string())
                        .await;
                }

                let task_type = if status == FunctionStatus::Creating {
                    TaskType::Create
                } else {
                    TaskType::Update
                };
                let task = self
                    .tasks
                    .create(NewFunctionTask {
                        function_id: function.id,
                        task_type,
                        input: serde_json::Value::Null,
                    })
                    .await?;
                self.functions.set_task(function.id, Some(task.id)).await?;

                let engine = self.clone();
                let function_id = function.id;
                let task_id = task.id;
                match task_type {
                    TaskType::Create => {
                        tokio::spawn(async move { engine.run_create(function_id, task_id).await });
                    }
                    TaskType::Update => {
                        tokio::spawn(async move { engine.run_update(function_id, task_id).await });
                    }
                }
                recovered += 1;
                info!(function_id = %function.id, ?status, "recovered non-terminal lifecycle task");
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_store::memory::{MemoryFunctionStore, MemoryTaskStore, MemoryVersionStore};
    use faas_store::ResourceLimits;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration as StdDuration};

    struct CountingCompileService(Arc<AtomicUsize>);

    #[async_trait]
    impl CompileService for CountingCompileService {
        async fn compile(&self, _function: &FunctionRecord) -> anyhow::Result<CompiledArtifact> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(CompiledArtifact { binary: vec![1, 2, 3] })
        }
    }

    fn base_function(runtime: &str) -> NewFunction {
        NewFunction {
            name: format!("fn-{}", Uuid::new_v4()),
            runtime: runtime.into(),
            handler: "main.handler".into(),
            description: None,
            tags: vec![],
            code: Some("pass".into()),
            binary: None,
            limits: ResourceLimits::default(),
            env: HashMap::new(),
            cron_expression: None,
            http_route: None,
            http_methods: vec![],
            webhook_key: None,
            session_affinity: false,
            session_timeout_seconds: None,
        }
    }

    async fn wait_until_terminal(functions: &Arc<MemoryFunctionStore>, id: Uuid) -> FunctionRecord {
        for _ in 0..100 {
            let function = functions.get(id).await.unwrap().unwrap();
            if matches!(function.status, FunctionStatus::Active | FunctionStatus::Failed) {
                return function;
            }
            sleep(StdDuration::from_millis(10)).await;
        }
        panic!("function never reached a terminal status");
    }

    #[tokio::test]
    async fn create_without_compile_goes_straight_to_active() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let versions = Arc::new(MemoryVersionStore::new());
        let tasks = Arc::new(MemoryTaskStore::new());
        let compiler = Arc::new(NoopCompileService);
        let compiled = Arc::new(StaticCompiledRuntimes(vec![]));

        let engine = LifecycleEngine::new(functions.clone(), versions, tasks, compiler, compiled);
        let created = engine.create_function(base_function("python3.11")).await.unwrap();
        assert_eq!(created.status, FunctionStatus::Creating);

        let finished = wait_until_terminal(&functions, created.id).await;
        assert_eq!(finished.status, FunctionStatus::Active);
        assert!(finished.current_task_id.is_none());
    }

    #[tokio::test]
    async fn compile_failure_marks_function_and_task_failed() {
        struct AlwaysFails;
        #[async_trait]
        impl CompileService for AlwaysFails {
            async fn compile(&self, _function: &FunctionRecord) -> anyhow::Result<CompiledArtifact> {
                Err(anyhow::anyhow!("toolchain exploded"))
            }
        }

        let functions = Arc::new(MemoryFunctionStore::new());
        let versions = Arc::new(MemoryVersionStore::new());
        let tasks = Arc::new(MemoryTaskStore::new());
        let compiler = Arc::new(AlwaysFails);
        let compiled = Arc::new(StaticCompiledRuntimes(vec!["rust".into()]));

        let engine = LifecycleEngine::new(functions.clone(), versions, tasks.clone(), compiler, compiled);
        let created = engine.create_function(base_function("rust")).await.unwrap();

        let finished = wait_until_terminal(&functions, created.id).await;
        assert_eq!(finished.status, FunctionStatus::Failed);

        let non_terminal = tasks.list_non_terminal().await.unwrap();
        assert!(non_terminal.is_empty());
    }

    #[tokio::test]
    async fn update_with_code_change_bumps_version() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let versions = Arc::new(MemoryVersionStore::new());
        let tasks = Arc::new(MemoryTaskStore::new());
        let compile_calls = Arc::new(AtomicUsize::new(0));
        let compiler = Arc::new(CountingCompileService(compile_calls.clone()));
        let compiled = Arc::new(StaticCompiledRuntimes(vec!["rust".into()]));

        let engine = LifecycleEngine::new(functions.clone(), versions.clone(), tasks, compiler, compiled);
        let created = engine.create_function(base_function("rust")).await.unwrap();
        wait_until_terminal(&functions, created.id).await;

        engine
            .update_function(
                created.id,
                FunctionPatch {
                    code: Some("new source".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let finished = wait_until_terminal(&functions, created.id).await;
        assert_eq!(finished.status, FunctionStatus::Active);
        assert_eq!(finished.version, 2);
        assert!(versions.get(created.id, 2).await.unwrap().is_some());
        assert_eq!(compile_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recover_redispatches_stuck_tasks() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let versions = Arc::new(MemoryVersionStore::new());
        let tasks = Arc::new(MemoryTaskStore::new());
        let compiler = Arc::new(NoopCompileService);
        let compiled = Arc::new(StaticCompiledRuntimes(vec![]));

        let created = functions.create(base_function("python3.11")).await.unwrap();
        // Simulate a crash mid-create: the function is stuck in `creating`
        // with no in-flight task.
        assert_eq!(created.status, FunctionStatus::Creating);

        let engine = LifecycleEngine::new(functions.clone(), versions, tasks, compiler, compiled);
        let recovered = engine.recover().await.unwrap();
        assert_eq!(recovered, 1);

        let finished = wait_until_terminal(&functions, created.id).await;
        assert_eq!(finished.status, FunctionStatus::Active);
    }
}
