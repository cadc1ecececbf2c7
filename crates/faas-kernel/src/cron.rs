//! Cron trigger (spec §4.7): a single background task servicing a registry
//! of 6-field (with-seconds) cron expressions, firing synthetic invocations
//! through the scheduler.
//!
//! New to the teacher's own domain. Expression parsing uses the `cron`
//! crate — the same crate two repos in the retrieval pack depend on for
//! scheduled triggers (`tangle-network-ai-agent-sandbox-blueprint`'s
//! `workflows.rs`, `ThirdKeyAI-Symbiont`'s optional `cron` feature) — rather
//! than hand-rolling a parser. The registry itself is a
//! `parking_lot::Mutex`-guarded map keyed by function id, matching spec
//! §5's "cron manager uses a single internal goroutine" and §4.7's note
//! that removal under contention is safe because entries are looked up by
//! function id.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::scheduler::{InvokeRequest, Scheduler};
use faas_store::{FunctionStore, TriggerType};

struct Entry {
    function_id: Uuid,
    schedule: Schedule,
}

/// Registry of active cron entries plus the single background task that
/// polls them once a tick.
pub struct CronTrigger {
    scheduler: Arc<Scheduler>,
    entries: Mutex<HashMap<Uuid, Entry>>,
    shutdown: CancellationToken,
}

impl CronTrigger {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            entries: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Parses and registers (or replaces) the entry for a function. A
    /// malformed expression is rejected without touching the registry.
    pub fn upsert(&self, function_id: Uuid, cron_expression: &str) -> anyhow::Result<()> {
        let schedule = Schedule::from_str(cron_expression)?;
        self.entries.lock().insert(function_id, Entry { function_id, schedule });
        Ok(())
    }

    /// Removes the entry for a function, if any (spec §4.7: create/update/
    /// delete/offline/online add, replace, or remove the entry).
    pub fn remove(&self, function_id: Uuid) {
        self.entries.lock().remove(&function_id);
    }

    /// On startup, enumerate all `active` functions with a non-empty cron
    /// expression and register one entry per function (spec §4.7).
    #[instrument(skip(self, functions))]
    pub async fn load_active(&self, functions: &dyn FunctionStore) -> anyhow::Result<usize> {
        let mut loaded = 0;
        for function in functions.list_cron_active().await? {
            if let Some(expr) = &function.cron_expression {
                if !expr.trim().is_empty() {
                    match self.upsert(function.id, expr) {
                        Ok(()) => loaded += 1,
                        Err(err) => warn!(function_id = %function.id, error = %err, "invalid cron expression, skipping"),
                    }
                }
            }
        }
        Ok(loaded)
    }

    /// Spawns the single internal goroutine-equivalent that services every
    /// entry, ticking once per `poll_interval`.
    pub fn start(self: &Arc<Self>, poll_interval: Duration) {
        let trigger = self.clone();
        tokio::spawn(async move {
            let mut last_fired: HashMap<Uuid, chrono::DateTime<Utc>> = HashMap::new();
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = trigger.shutdown.cancelled() => {
                        info!("cron trigger shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        trigger.tick(&mut last_fired).await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn tick(&self, last_fired: &mut HashMap<Uuid, chrono::DateTime<Utc>>) {
        let now = Utc::now();
        let due: Vec<(Uuid, String)> = {
            let entries = self.entries.lock();
            entries
                .values()
                .filter_map(|entry| {
                    let after = last_fired.get(&entry.function_id).copied().unwrap_or(now - chrono::Duration::seconds(2));
                    entry
                        .schedule
                        .after(&after)
                        .next()
                        .filter(|next| *next <= now)
                        .map(|_| (entry.function_id, entry.schedule.to_string()))
                })
                .collect()
        };

        for (function_id, expr) in due {
            last_fired.insert(function_id, now);
            let payload = json!({
                "trigger": "cron",
                "cron": expr,
                "time": now.to_rfc3339(),
            });
            if let Err(err) = self
                .scheduler
                .invoke_async(InvokeRequest {
                    function_id,
                    payload,
                    alias: None,
                    version: None,
                    session_key: None,
                    trigger: TriggerType::Cron,
                })
                .await
            {
                warn!(%function_id, error = %err, "cron-triggered invocation failed to enqueue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::pool::{PoolConfig, SandboxPool};
    use crate::router::TrafficRouter;
    use crate::scheduler::SchedulerConfig;
    use crate::session::SessionRouter;
    use crate::transport::{ExecuteResponse, InitPayload, SandboxConnection, SandboxLauncher};
    use async_trait::async_trait;
    use faas_store::memory::{
        MemoryAliasStore, MemoryDeadLetterStore, MemoryFunctionStore, MemoryInvocationStore,
        MemoryOverflowQueue, MemorySessionCache, MemoryVersionStore,
    };
    use faas_store::{FunctionStatus, NewFunction, ResourceLimits};
    use std::collections::HashMap as StdMap;
    use std::time::Duration as StdDuration;

    #[test]
    fn rejects_malformed_expression() {
        assert!(Schedule::from_str("not a cron expression").is_err());
        assert!(Schedule::from_str("0 * * * * *").is_ok());
    }

    struct EchoConnection(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait]
    impl SandboxConnection for EchoConnection {
        async fn init(&self, _payload: InitPayload) -> crate::error::CoreResult<()> {
            Ok(())
        }
        async fn execute(&self, input: serde_json::Value, _timeout: Duration) -> crate::error::CoreResult<ExecuteResponse> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ExecuteResponse {
                success: true,
                output: Some(input),
                error: None,
                duration_ms: 1,
                memory_used_mb: Some(32),
            })
        }
        async fn ping(&self) -> crate::error::CoreResult<bool> {
            Ok(true)
        }
        async fn close(&self) -> crate::error::CoreResult<()> {
            Ok(())
        }
    }

    struct EchoLauncher(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait]
    impl SandboxLauncher for EchoLauncher {
        async fn launch(&self, _runtime_tag: &str) -> anyhow::Result<Box<dyn SandboxConnection>> {
            Ok(Box::new(EchoConnection(self.0.clone())))
        }
    }

    #[tokio::test]
    async fn every_second_entry_fires_within_one_tick() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let aliases = Arc::new(MemoryAliasStore::new());
        let invocations = Arc::new(MemoryInvocationStore::new());
        let dead_letters = Arc::new(MemoryDeadLetterStore::new());
        let overflow = Arc::new(MemoryOverflowQueue::new());
        let session_cache = Arc::new(MemorySessionCache::new());

        let created = functions
            .create(NewFunction {
                name: format!("cron-fn-{}", Uuid::new_v4()),
                runtime: "python3.11".into(),
                handler: "main.handler".into(),
                description: None,
                tags: vec![],
                code: Some("pass".into()),
                binary: None,
                limits: ResourceLimits::default(),
                env: StdMap::new(),
                cron_expression: Some("* * * * * *".into()),
                http_route: None,
                http_methods: vec![],
                webhook_key: None,
                session_affinity: false,
                session_timeout_seconds: None,
            })
            .await
            .unwrap();
        functions.set_status(created.id, FunctionStatus::Active).await.unwrap();

        let exec_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let pool = Arc::new(SandboxPool::new(Arc::new(EchoLauncher(exec_count.clone())), PoolConfig::default()));
        let session_router = Arc::new(SessionRouter::new(pool.clone(), session_cache));
        let versions = Arc::new(MemoryVersionStore::new());
        let router = Arc::new(TrafficRouter::new(functions.clone(), aliases, versions));
        let metrics = Arc::new(Metrics::new());

        let scheduler = Arc::new(Scheduler::start(
            functions.clone(),
            invocations.clone(),
            dead_letters,
            overflow,
            router,
            session_router,
            pool,
            metrics,
            SchedulerConfig {
                workers: 1,
                queue_size: 8,
                default_timeout: StdDuration::from_secs(5),
            },
        ));

        let trigger = Arc::new(CronTrigger::new(scheduler));
        let loaded = trigger.load_active(functions.as_ref()).await.unwrap();
        assert_eq!(loaded, 1);

        let mut last_fired = HashMap::new();
        trigger.tick(&mut last_fired).await;

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(exec_count.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        assert_eq!(invocations.count_active(created.id).await.unwrap(), 0);
    }
}
