//! The daemon's ambient HTTP surface: `/healthz` and `/metrics` only (spec
//! §6.1). Everything else — function CRUD, invocation HTTP entrypoints,
//! auth, rate limiting — is the excluded API surface spec.md hands to an
//! external collaborator.
//!
//! Grounded on `cave-daemon::server::run`/`build_router`'s wiring shape:
//! load config, build the domain controller, lay `TraceLayer` over an
//! `axum::Router`, bind, serve. The rate-limit/auth layers themselves are
//! dropped along with the routes they guarded.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tower_http::trace::TraceLayer;
use tracing::info;

use faas_kernel::lifecycle::{CompileService, CompiledRuntimes, NoopCompileService, StaticCompiledRuntimes};
use faas_kernel::process_launcher::LocalProcessLauncher;
use faas_kernel::{Core, CoreStores};
use faas_store::memory::{MemoryOverflowQueue, MemorySessionCache};
use faas_store::sqlite::SqliteStore;

use crate::config::{AppConfig, StoreBackend};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;
    let core = build_core(&config).await?;
    core.start(&config.core).await.context("lifecycle/cron startup failed")?;

    let state = Arc::new(AppState { core });
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "faas-daemon listening");
    axum::serve(listener, app).await.context("HTTP server exited")?;
    Ok(())
}

async fn build_core(config: &AppConfig) -> Result<Core> {
    let launcher = Arc::new(LocalProcessLauncher::new(
        config.runtime_commands.clone(),
        config.core.max_frame_bytes,
    ));
    let compiler: Arc<dyn CompileService> = Arc::new(NoopCompileService);
    let compiled_runtimes: Arc<dyn CompiledRuntimes> =
        Arc::new(StaticCompiledRuntimes(config.compiled_runtimes.clone()));

    let stores = match &config.store {
        StoreBackend::Memory => {
            let memory = faas_store::memory::MemoryStores::new();
            CoreStores {
                functions: memory.functions,
                versions: memory.versions,
                aliases: memory.aliases,
                tasks: memory.tasks,
                invocations: memory.invocations,
                dead_letters: memory.dead_letters,
                session_cache: memory.sessions,
                overflow: memory.overflow,
            }
        }
        StoreBackend::Sqlite { url } => {
            let sqlite = Arc::new(SqliteStore::connect(url).await.context("opening sqlite store")?);
            CoreStores {
                functions: sqlite.clone(),
                versions: sqlite.clone(),
                aliases: sqlite.clone(),
                tasks: sqlite.clone(),
                invocations: sqlite.clone(),
                dead_letters: sqlite,
                session_cache: Arc::new(MemorySessionCache::new()),
                overflow: Arc::new(MemoryOverflowQueue::new()),
            }
        }
    };

    Ok(Core::new(stores, launcher, compiler, compiled_runtimes, None, config.core.clone()))
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    core: Core,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.core.metrics().registry().clone();
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&registry.gather(), &mut buf) {
        tracing::error!(%err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buf) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::error!(%err, "metrics exposition was not valid utf-8");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
