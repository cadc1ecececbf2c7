//! Sandbox pool (spec §4.2): a per-runtime cache of warm sandboxes with
//! acquire/release semantics, cold-start tracking, and idle-TTL eviction.
//!
//! Grounded on `cave-kernel::CaveKernel`'s
//! `instances: Arc<RwLock<HashMap<Uuid, Arc<dyn SandboxInstance>>>>` plus its
//! per-instance `tokio::sync::Mutex` exec lock, generalized into per-runtime
//! buckets with idle/busy tracking and a `tokio::sync::Notify` waking acquire
//! waiters — the "condition variable" of spec §5.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::transport::SandboxLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Booting,
    Idle,
    Busy,
    Draining,
    Dead,
}

/// A live sandbox: its connection plus the bookkeeping the pool and session
/// router need.
pub struct Sandbox {
    pub id: Uuid,
    pub runtime_tag: String,
    pub connection: Box<dyn crate::transport::SandboxConnection>,
    state: parking_lot::Mutex<SandboxState>,
    last_used: parking_lot::Mutex<Instant>,
}

impl Sandbox {
    pub fn state(&self) -> SandboxState {
        *self.state.lock()
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn mark_dead(&self) {
        *self.state.lock() = SandboxState::Dead;
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), SandboxState::Dead)
    }
}

/// Observer notified when a sandbox is found dead, so the session router can
/// drop its bindings without the pool depending on the session router
/// directly (spec §9 "cyclic ownership" note).
#[async_trait::async_trait]
pub trait SandboxDeathSubscriber: Send + Sync {
    async fn on_sandbox_death(&self, sandbox_id: Uuid);
}

struct Bucket {
    idle: VecDeque<Arc<Sandbox>>,
    busy: HashMap<Uuid, Arc<Sandbox>>,
    max: u32,
}

impl Bucket {
    fn new(max: u32) -> Self {
        Self {
            idle: VecDeque::new(),
            busy: HashMap::new(),
            max,
        }
    }

    fn total(&self) -> u32 {
        (self.idle.len() + self.busy.len()) as u32
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_per_runtime: u32,
    pub idle_ttl: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_runtime: 8,
            idle_ttl: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-runtime warm sandbox cache. Cloneable: the inner state lives behind
/// `Arc`, matching `cave-kernel::CaveKernel`'s own `Clone` impl.
#[derive(Clone)]
pub struct SandboxPool {
    launcher: Arc<dyn SandboxLauncher>,
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
    notify: Arc<Notify>,
    config: PoolConfig,
    death_subscriber: Arc<RwLock<Option<Arc<dyn SandboxDeathSubscriber>>>>,
}

impl SandboxPool {
    pub fn new(launcher: Arc<dyn SandboxLauncher>, config: PoolConfig) -> Self {
        Self {
            launcher,
            buckets: Arc::new(RwLock::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            config,
            death_subscriber: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set_death_subscriber(&self, subscriber: Arc<dyn SandboxDeathSubscriber>) {
        *self.death_subscriber.write() = Some(subscriber);
    }

    /// Acquires a sandbox for `runtime_tag`, launching one if under capacity,
    /// otherwise blocking until one frees up or the acquire timeout fires.
    /// Returns `(sandbox, cold_start)` per spec §4.2 selection order.
    #[instrument(skip(self))]
    pub async fn acquire(&self, runtime_tag: &str) -> CoreResult<(Arc<Sandbox>, bool)> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            // Step 1/2: try to take an idle sandbox, else launch if under capacity.
            enum Attempt {
                Reused(Arc<Sandbox>),
                ShouldLaunch,
                AtCapacity,
            }
            let attempt = {
                let mut buckets = self.buckets.write();
                let bucket = buckets
                    .entry(runtime_tag.to_string())
                    .or_insert_with(|| Bucket::new(self.config.max_per_runtime));
                if let Some(sandbox) = bucket.idle.pop_back() {
                    bucket.busy.insert(sandbox.id, sandbox.clone());
                    Attempt::Reused(sandbox)
                } else if bucket.total() < bucket.max {
                    Attempt::ShouldLaunch
                } else {
                    Attempt::AtCapacity
                }
            };

            match attempt {
                Attempt::Reused(sandbox) => {
                    *sandbox.state.lock() = SandboxState::Busy;
                    sandbox.touch();
                    return Ok((sandbox, false));
                }
                Attempt::ShouldLaunch => {
                    let connection = self
                        .launcher
                        .launch(runtime_tag)
                        .await
                        .map_err(CoreError::AcquireVmFailed)?;
                    let sandbox = Arc::new(Sandbox {
                        id: Uuid::new_v4(),
                        runtime_tag: runtime_tag.to_string(),
                        connection,
                        state: parking_lot::Mutex::new(SandboxState::Busy),
                        last_used: parking_lot::Mutex::new(Instant::now()),
                    });
                    let mut buckets = self.buckets.write();
                    let bucket = buckets
                        .entry(runtime_tag.to_string())
                        .or_insert_with(|| Bucket::new(self.config.max_per_runtime));
                    bucket.busy.insert(sandbox.id, sandbox.clone());
                    return Ok((sandbox, true));
                }
                Attempt::AtCapacity => {
                    if Instant::now() >= deadline {
                        return Err(CoreError::AcquireVmFailed(anyhow::anyhow!(
                            "pool for runtime {runtime_tag} exhausted and acquire timed out"
                        )));
                    }
                    let wait = self.notify.notified();
                    tokio::select! {
                        _ = wait => {}
                        _ = tokio::time::sleep(deadline.saturating_duration_since(Instant::now())) => {}
                    }
                }
            }
        }
    }

    /// Attempts to acquire a specific, already-live sandbox by id (session
    /// affinity, spec §4.4). Returns `Ok(None)` when the sandbox is not idle
    /// (busy or gone) rather than falling back silently — the caller decides
    /// whether to wait or to bind the session to a freshly acquired one.
    #[instrument(skip(self))]
    pub fn try_acquire_pinned(&self, runtime_tag: &str, sandbox_id: Uuid) -> Option<Arc<Sandbox>> {
        let mut buckets = self.buckets.write();
        let bucket = buckets.get_mut(runtime_tag)?;
        let position = bucket.idle.iter().position(|s| s.id == sandbox_id)?;
        let sandbox = bucket.idle.remove(position)?;
        if !sandbox.is_alive() {
            return None;
        }
        *sandbox.state.lock() = SandboxState::Busy;
        sandbox.touch();
        bucket.busy.insert(sandbox.id, sandbox.clone());
        Some(sandbox)
    }

    /// Returns a sandbox to its bucket. A dead sandbox is discarded rather
    /// than recycled; any outcome wakes one acquire waiter.
    #[instrument(skip(self))]
    pub async fn release(&self, runtime_tag: &str, sandbox_id: Uuid) -> CoreResult<()> {
        let dead = {
            let mut buckets = self.buckets.write();
            let Some(bucket) = buckets.get_mut(runtime_tag) else {
                return Ok(());
            };
            let Some(sandbox) = bucket.busy.remove(&sandbox_id) else {
                return Ok(());
            };
            if sandbox.is_alive() {
                *sandbox.state.lock() = SandboxState::Idle;
                sandbox.touch();
                bucket.idle.push_back(sandbox);
                false
            } else {
                true
            }
        };
        self.notify.notify_one();
        if dead {
            if let Some(subscriber) = self.death_subscriber.read().clone() {
                subscriber.on_sandbox_death(sandbox_id).await;
            }
        }
        Ok(())
    }

    /// True iff the bucket holds a non-dead sandbox with this id (spec §4.2).
    pub fn is_alive(&self, runtime_tag: &str, sandbox_id: Uuid) -> bool {
        let buckets = self.buckets.read();
        let Some(bucket) = buckets.get(runtime_tag) else {
            return false;
        };
        bucket
            .busy
            .get(&sandbox_id)
            .or_else(|| bucket.idle.iter().find(|s| s.id == sandbox_id))
            .map(|s| s.is_alive())
            .unwrap_or(false)
    }

    /// All live sandbox ids for a runtime, used by the session router to
    /// rebuild its hash ring.
    pub fn all_ids(&self, runtime_tag: &str) -> Vec<Uuid> {
        let buckets = self.buckets.read();
        let Some(bucket) = buckets.get(runtime_tag) else {
            return Vec::new();
        };
        bucket
            .idle
            .iter()
            .chain(bucket.busy.values())
            .filter(|s| s.is_alive())
            .map(|s| s.id)
            .collect()
    }

    /// Marks a sandbox dead in place, used when a worker observes a transport
    /// failure mid-exec (spec §4.2: "any I/O failure on a busy sandbox
    /// transitions it to `dead`").
    pub fn mark_dead(&self, runtime_tag: &str, sandbox_id: Uuid) {
        let buckets = self.buckets.read();
        if let Some(bucket) = buckets.get(runtime_tag) {
            if let Some(sandbox) = bucket.busy.get(&sandbox_id) {
                sandbox.mark_dead();
            }
        }
    }

    /// Drains idle sandboxes older than `idle_ttl`, closing and removing
    /// them. Intended to run on a periodic timer alongside the scheduler.
    #[instrument(skip(self))]
    pub async fn evict_idle(&self) {
        let to_close: Vec<Arc<Sandbox>> = {
            let mut buckets = self.buckets.write();
            let mut collected = Vec::new();
            for bucket in buckets.values_mut() {
                let ttl = self.config.idle_ttl;
                let now = Instant::now();
                let mut keep = VecDeque::new();
                while let Some(sandbox) = bucket.idle.pop_front() {
                    if now.duration_since(*sandbox.last_used.lock()) >= ttl {
                        collected.push(sandbox);
                    } else {
                        keep.push_back(sandbox);
                    }
                }
                bucket.idle = keep;
            }
            collected
        };
        for sandbox in to_close {
            if let Err(err) = sandbox.connection.close().await {
                warn!(sandbox_id = %sandbox.id, error = %err, "failed to close evicted sandbox");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ExecuteResponse, InitPayload, SandboxConnection};
    use async_trait::async_trait;

    struct StubConnection;

    #[async_trait]
    impl SandboxConnection for StubConnection {
        async fn init(&self, _payload: InitPayload) -> CoreResult<()> {
            Ok(())
        }
        async fn execute(&self, _input: serde_json::Value, _timeout: Duration) -> CoreResult<ExecuteResponse> {
            Ok(ExecuteResponse {
                success: true,
                output: Some(serde_json::json!({})),
                error: None,
                duration_ms: 1,
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

    struct StubLauncher;

    #[async_trait]
    impl SandboxLauncher for StubLauncher {
        async fn launch(&self, _runtime_tag: &str) -> anyhow::Result<Box<dyn SandboxConnection>> {
            Ok(Box::new(StubConnection))
        }
    }

    fn test_pool(max: u32) -> SandboxPool {
        SandboxPool::new(
            Arc::new(StubLauncher),
            PoolConfig {
                max_per_runtime: max,
                idle_ttl: Duration::from_secs(60),
                acquire_timeout: Duration::from_millis(200),
            },
        )
    }

    #[tokio::test]
    async fn first_acquire_is_cold_second_is_warm() {
        let pool = test_pool(2);
        let (sandbox, cold) = pool.acquire("python3.11").await.unwrap();
        assert!(cold);
        pool.release("python3.11", sandbox.id).await.unwrap();

        let (sandbox2, cold2) = pool.acquire("python3.11").await.unwrap();
        assert!(!cold2);
        assert_eq!(sandbox.id, sandbox2.id);
    }

    #[tokio::test]
    async fn acquire_blocks_then_succeeds_on_release() {
        let pool = test_pool(1);
        let (sandbox, _) = pool.acquire("python3.11").await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire("python3.11").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release("python3.11", sandbox.id).await.unwrap();

        let (reused, cold) = waiter.await.unwrap().unwrap();
        assert!(!cold);
        assert_eq!(reused.id, sandbox.id);
    }

    #[tokio::test]
    async fn acquire_times_out_when_capacity_exhausted() {
        let pool = test_pool(1);
        let (_sandbox, _) = pool.acquire("python3.11").await.unwrap();
        let err = pool.acquire("python3.11").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AcquireVmFailed);
    }

    #[tokio::test]
    async fn dead_sandbox_is_not_recycled() {
        let pool = test_pool(2);
        let (sandbox, _) = pool.acquire("python3.11").await.unwrap();
        sandbox.mark_dead();
        pool.release("python3.11", sandbox.id).await.unwrap();
        assert!(!pool.is_alive("python3.11", sandbox.id));
        assert!(pool.all_ids("python3.11").is_empty());
    }
}
