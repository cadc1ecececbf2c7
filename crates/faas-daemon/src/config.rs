//! Typed environment configuration for the daemon binary.
//!
//! Grounded on `cave-daemon::server::AppConfig::from_env`'s shape (one
//! `from_env` constructor, `env::var(...).unwrap_or_else(...)` per
//! defaulted field, a small `bool_env`/numeric-parse helper set) —
//! generalized from the sandbox-isolation knobs the teacher read to the
//! scheduler/pool/session knobs spec §6's "Configuration" section names.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use faas_kernel::process_launcher::RuntimeCommand;
use faas_kernel::CoreConfig;

#[derive(Debug, Clone)]
pub enum StoreBackend {
    Memory,
    Sqlite { url: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub core: CoreConfig,
    pub runtime_commands: HashMap<String, RuntimeCommand>,
    pub compiled_runtimes: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("FAAS_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid FAAS_API_ADDR")?;

        let store = match env::var("FAAS_STORE_BACKEND").unwrap_or_else(|_| "memory".into()).as_str() {
            "memory" => StoreBackend::Memory,
            "sqlite" => StoreBackend::Sqlite {
                url: env::var("DATABASE_URL").context("DATABASE_URL must be set for FAAS_STORE_BACKEND=sqlite")?,
            },
            other => anyhow::bail!("unknown FAAS_STORE_BACKEND '{other}' (expected memory or sqlite)"),
        };

        let defaults = CoreConfig::default();
        let core = CoreConfig {
            workers: usize_env("FAAS_WORKERS", defaults.workers),
            queue_size: usize_env("FAAS_QUEUE_SIZE", defaults.queue_size),
            default_timeout: seconds_env("FAAS_DEFAULT_TIMEOUT_SECONDS", defaults.default_timeout),
            max_vms_per_runtime: u32_env("FAAS_MAX_VMS_PER_RUNTIME", defaults.max_vms_per_runtime),
            idle_ttl: seconds_env("FAAS_IDLE_TTL_SECONDS", defaults.idle_ttl),
            affinity_cache_ttl: seconds_env("FAAS_AFFINITY_CACHE_TTL_SECONDS", defaults.affinity_cache_ttl),
            default_session_ttl: seconds_env("FAAS_DEFAULT_SESSION_TTL_SECONDS", defaults.default_session_ttl),
            alias_cache_ttl: seconds_env("FAAS_ALIAS_CACHE_TTL_SECONDS", defaults.alias_cache_ttl),
            max_frame_bytes: usize_env("FAAS_MAX_FRAME_BYTES", defaults.max_frame_bytes),
            cron_poll_interval: seconds_env("FAAS_CRON_POLL_INTERVAL_SECONDS", defaults.cron_poll_interval),
        };

        let runtime_commands = match env::var("FAAS_RUNTIME_COMMANDS") {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(&raw).context("FAAS_RUNTIME_COMMANDS must be a JSON object of runtime -> {program, args}")?
            }
            _ => HashMap::new(),
        };

        let compiled_runtimes = parse_string_list_env("FAAS_COMPILED_RUNTIMES").unwrap_or_default();

        Ok(Self {
            listen_addr,
            store,
            core,
            runtime_commands,
            compiled_runtimes,
        })
    }
}

fn usize_env(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn u32_env(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn seconds_env(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn parse_string_list_env(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}
