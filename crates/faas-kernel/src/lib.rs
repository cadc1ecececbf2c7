//! The FaaS execution core: invocation scheduling, sandbox pooling,
//! traffic/session routing, and the lifecycle task engine described in
//! spec §4. `Core` is the long-lived controller value each of these pieces
//! hangs off of (spec §9 "Singletons": no process-wide mutable statics).

pub mod cron;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod process_launcher;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};
use uuid::Uuid;

pub use error::{CoreError, CoreResult, ErrorKind};

use cron::CronTrigger;
use lifecycle::{CompileService, CompiledRuntimes, DeploymentObserver, LifecycleEngine};
use metrics::Metrics;
use pool::{PoolConfig, SandboxPool};
use router::TrafficRouter;
use scheduler::{InvokeRequest, InvokeResponse, Scheduler, SchedulerConfig, SchedulerStats};
use session::SessionRouter;
use transport::SandboxLauncher;

use faas_store::{
    AliasStore, DeadLetterStore, FunctionPatch, FunctionRecord, FunctionStore, NewFunction,
    OverflowQueue, SessionCache, TaskStore, VersionStore,
};

/// Keeps the cron registry in sync with every deploy (spec §4.7: create and
/// update add or replace a function's entry), independent of whatever
/// external `DeploymentObserver` the caller also wires in.
struct CronRegistrar {
    cron: Arc<CronTrigger>,
    downstream: Option<Arc<dyn DeploymentObserver>>,
}

impl DeploymentObserver for CronRegistrar {
    fn on_deployed(&self, function: &FunctionRecord, version: u64) {
        match &function.cron_expression {
            Some(expr) if !expr.trim().is_empty() => {
                let _ = self.cron.upsert(function.id, expr);
            }
            _ => self.cron.remove(function.id),
        }
        if let Some(downstream) = &self.downstream {
            downstream.on_deployed(function, version);
        }
    }

    fn on_updated(&self, function: &FunctionRecord) {
        if let Some(downstream) = &self.downstream {
            downstream.on_updated(function);
        }
    }
}

/// Every tunable spec §6's "Configuration" section names.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub default_timeout: Duration,
    pub max_vms_per_runtime: u32,
    pub idle_ttl: Duration,
    pub affinity_cache_ttl: Duration,
    pub default_session_ttl: Duration,
    pub alias_cache_ttl: Duration,
    pub max_frame_bytes: usize,
    pub cron_poll_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 256,
            default_timeout: Duration::from_secs(30),
            max_vms_per_runtime: 8,
            idle_ttl: Duration::from_secs(300),
            affinity_cache_ttl: Duration::from_secs(30),
            default_session_ttl: Duration::from_secs(3600),
            alias_cache_ttl: Duration::from_secs(30),
            max_frame_bytes: transport::DEFAULT_MAX_FRAME_BYTES,
            cron_poll_interval: Duration::from_secs(1),
        }
    }
}

/// The opaque store contracts the core is wired against (spec §6,
/// "Persisted state the core consumes").
pub struct CoreStores {
    pub functions: Arc<dyn FunctionStore>,
    pub versions: Arc<dyn VersionStore>,
    pub aliases: Arc<dyn AliasStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub invocations: Arc<dyn faas_store::InvocationStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub session_cache: Arc<dyn SessionCache>,
    pub overflow: Arc<dyn OverflowQueue>,
}

/// Long-lived controller wiring together every component in spec §4: pool,
/// traffic router, session router, scheduler, lifecycle engine, cron
/// trigger. Cheap to clone (everything behind it is already `Arc`-backed).
#[derive(Clone)]
pub struct Core {
    stores: Arc<CoreStores>,
    pool: Arc<SandboxPool>,
    router: Arc<TrafficRouter>,
    session_router: Arc<SessionRouter>,
    scheduler: Arc<Scheduler>,
    lifecycle: Arc<LifecycleEngine>,
    cron: Arc<CronTrigger>,
    metrics: Arc<Metrics>,
    default_session_ttl: Duration,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: CoreStores,
        launcher: Arc<dyn SandboxLauncher>,
        compiler: Arc<dyn CompileService>,
        compiled_runtimes: Arc<dyn CompiledRuntimes>,
        deployment_observer: Option<Arc<dyn DeploymentObserver>>,
        config: CoreConfig,
    ) -> Self {
        let stores = Arc::new(stores);
        let metrics = Arc::new(Metrics::new());

        let pool = Arc::new(SandboxPool::new(
            launcher,
            PoolConfig {
                max_per_runtime: config.max_vms_per_runtime,
                idle_ttl: config.idle_ttl,
                acquire_timeout: config.default_timeout,
            },
        ));

        let session_router = Arc::new(SessionRouter::new(pool.clone(), stores.session_cache.clone()));
        pool.set_death_subscriber(session_router.clone());

        let router = Arc::new(TrafficRouter::with_ttl(
            stores.functions.clone(),
            stores.aliases.clone(),
            stores.versions.clone(),
            config.alias_cache_ttl,
        ));

        let scheduler = Arc::new(Scheduler::start(
            stores.functions.clone(),
            stores.invocations.clone(),
            stores.dead_letters.clone(),
            stores.overflow.clone(),
            router.clone(),
            session_router.clone(),
            pool.clone(),
            metrics.clone(),
            SchedulerConfig {
                workers: config.workers,
                queue_size: config.queue_size,
                default_timeout: config.default_timeout,
            },
        ));

        let cron = Arc::new(CronTrigger::new(scheduler.clone()));

        let lifecycle = LifecycleEngine::new(
            stores.functions.clone(),
            stores.versions.clone(),
            stores.tasks.clone(),
            compiler,
            compiled_runtimes,
        )
        .with_observer(Arc::new(CronRegistrar {
            cron: cron.clone(),
            downstream: deployment_observer,
        }));
        let lifecycle = Arc::new(lifecycle);

        Self {
            stores,
            pool,
            router,
            session_router,
            scheduler,
            lifecycle,
            cron,
            metrics,
            default_session_ttl: config.default_session_ttl,
        }
    }

    /// Runs lifecycle recovery (spec §4.6) and cron hot-reload (spec §4.7),
    /// then starts the cron trigger's background tick. Call once at
    /// startup, after `Core::new`.
    #[instrument(skip(self))]
    pub async fn start(&self, config: &CoreConfig) -> CoreResult<()> {
        let recovered = self.lifecycle.recover().await?;
        info!(recovered, "lifecycle recovery complete");

        let loaded = self.cron.load_active(self.stores.functions.as_ref()).await?;
        info!(loaded, "cron entries loaded");
        self.cron.start(config.cron_poll_interval);

        let drained = self.scheduler.drain_overflow().await?;
        info!(drained, "overflow queue drained at startup");

        Ok(())
    }

    // ---- invocation surface (spec §6) ----

    pub async fn invoke(&self, request: InvokeRequest) -> CoreResult<InvokeResponse> {
        self.scheduler.invoke(request).await
    }

    pub async fn invoke_async(&self, request: InvokeRequest) -> CoreResult<Uuid> {
        self.scheduler.invoke_async(request).await
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    // ---- lifecycle hooks (spec §6) ----

    pub async fn create_function(&self, mut spec: NewFunction) -> CoreResult<FunctionRecord> {
        if spec.session_timeout_seconds.is_none() {
            spec.session_timeout_seconds = Some(self.default_session_ttl.as_secs());
        }
        self.lifecycle.create_function(spec).await
    }

    pub async fn update_function(&self, id: Uuid, patch: FunctionPatch) -> CoreResult<FunctionRecord> {
        let result = self.lifecycle.update_function(id, patch).await;
        self.router.invalidate_function(id);
        result
    }

    pub async fn recompile_function(&self, id: Uuid) -> CoreResult<FunctionRecord> {
        self.lifecycle.recompile(id).await
    }

    pub async fn offline_function(&self, id: Uuid) -> CoreResult<FunctionRecord> {
        self.cron.remove(id);
        self.lifecycle.set_status(id, faas_store::FunctionStatus::Offline).await
    }

    pub async fn online_function(&self, id: Uuid) -> CoreResult<FunctionRecord> {
        let function = self.lifecycle.set_status(id, faas_store::FunctionStatus::Active).await?;
        if let Some(expr) = &function.cron_expression {
            if !expr.trim().is_empty() {
                let _ = self.cron.upsert(id, expr);
            }
        }
        Ok(function)
    }

    pub async fn delete_function(&self, id: Uuid) -> CoreResult<()> {
        self.cron.remove(id);
        self.router.invalidate_function(id);
        self.stores.aliases.delete_all_for_function(id).await?;
        self.stores.functions.delete(id).await?;
        Ok(())
    }

    pub fn pool(&self) -> Arc<SandboxPool> {
        self.pool.clone()
    }

    pub fn stores(&self) -> Arc<CoreStores> {
        self.stores.clone()
    }

    /// Cancels the scheduler's shared context and the cron trigger; lets
    /// in-flight workers drain (spec §4.5.5).
    pub fn stop(&self) {
        self.scheduler.stop();
        self.cron.stop();
    }
}
