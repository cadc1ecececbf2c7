//! Traffic router (spec §4.3): resolves `(function_id, alias|version)` to a
//! concrete version number, with a 30 s TTL alias cache.
//!
//! New to the teacher's own domain, but grounded in the read-modify-write-
//! with-cache shape of `bkg-db`'s policy upsert path, using
//! `parking_lot::RwLock` + `std::time::Instant` TTL entries the way
//! `cave-daemon`'s (trimmed) rate limiter tracked request windows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use faas_store::{AliasStore, AliasRecord, FunctionStore, VersionStore, LATEST_ALIAS};

const DEFAULT_ALIAS_CACHE_TTL: Duration = Duration::from_secs(30);

struct CacheEntry {
    alias: AliasRecord,
    cached_at: Instant,
}

/// The version and alias an invocation actually bound to, passed through to
/// the invocation record and (for the async overflow path) snapshotted
/// verbatim at enqueue time.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub version: u64,
    pub alias: Option<String>,
}

pub struct TrafficRouter {
    functions: Arc<dyn FunctionStore>,
    aliases: Arc<dyn AliasStore>,
    versions: Arc<dyn VersionStore>,
    cache: RwLock<HashMap<(Uuid, String), CacheEntry>>,
    ttl: Duration,
}

impl TrafficRouter {
    pub fn new(
        functions: Arc<dyn FunctionStore>,
        aliases: Arc<dyn AliasStore>,
        versions: Arc<dyn VersionStore>,
    ) -> Self {
        Self::with_ttl(functions, aliases, versions, DEFAULT_ALIAS_CACHE_TTL)
    }

    pub fn with_ttl(
        functions: Arc<dyn FunctionStore>,
        aliases: Arc<dyn AliasStore>,
        versions: Arc<dyn VersionStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            functions,
            aliases,
            versions,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolves a route for an invocation. `explicit_version`, when set,
    /// short-circuits alias resolution once its existence is confirmed
    /// (spec §4.3 step 1) — either as a retained `FunctionVersion` snapshot
    /// or as the function's own current version (functions that never
    /// change code keep no snapshot history beyond version 1).
    pub async fn resolve(
        &self,
        function_id: Uuid,
        alias_name: Option<&str>,
        explicit_version: Option<u64>,
    ) -> CoreResult<ResolvedRoute> {
        if let Some(version) = explicit_version {
            let current = self
                .functions
                .get(function_id)
                .await?
                .ok_or(CoreError::FunctionNotFound)?;
            let exists = current.version == version || self.versions.exists(function_id, version).await?;
            if !exists {
                return Err(CoreError::VersionNotFound(version));
            }
            return Ok(ResolvedRoute { version, alias: None });
        }

        let alias_name = alias_name.unwrap_or(LATEST_ALIAS).to_string();
        let alias = self.load_alias(function_id, &alias_name).await?;

        let Some(alias) = alias else {
            // Alias missing (e.g. `latest` on a brand-new function): fall
            // back to the function's current version, no alias recorded.
            let function = self
                .functions
                .get(function_id)
                .await?
                .ok_or(CoreError::FunctionNotFound)?;
            return Ok(ResolvedRoute {
                version: function.version,
                alias: None,
            });
        };

        if alias.routing.len() == 1 {
            return Ok(ResolvedRoute {
                version: alias.routing[0].version,
                alias: Some(alias_name),
            });
        }

        let r: u32 = rand::thread_rng().gen_range(0..100);
        let mut cumulative = 0u32;
        for entry in &alias.routing {
            cumulative += entry.weight as u32;
            if r < cumulative {
                return Ok(ResolvedRoute {
                    version: entry.version,
                    alias: Some(alias_name),
                });
            }
        }
        // Weights are validated to sum to 100 on write; this is unreachable
        // in practice but falls back to the last entry defensively.
        Ok(ResolvedRoute {
            version: alias.routing.last().map(|e| e.version).unwrap_or(1),
            alias: Some(alias_name),
        })
    }

    async fn load_alias(&self, function_id: Uuid, alias_name: &str) -> CoreResult<Option<AliasRecord>> {
        let key = (function_id, alias_name.to_string());
        if let Some(entry) = self.cache.read().get(&key) {
            if entry.cached_at.elapsed() < self.ttl {
                return Ok(Some(entry.alias.clone()));
            }
        }
        let fetched = self.aliases.get(function_id, alias_name).await?;
        if let Some(alias) = &fetched {
            self.cache.write().insert(
                key,
                CacheEntry {
                    alias: alias.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(fetched)
    }

    /// Explicit per-alias invalidation on alias mutation.
    pub fn invalidate_alias(&self, function_id: Uuid, alias_name: &str) {
        self.cache.write().remove(&(function_id, alias_name.to_string()));
    }

    /// Prefix invalidation on function deletion.
    pub fn invalidate_function(&self, function_id: Uuid) {
        self.cache.write().retain(|(fid, _), _| *fid != function_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_store::memory::{MemoryAliasStore, MemoryFunctionStore, MemoryVersionStore};
    use faas_store::{NewFunction, ResourceLimits, RoutingEntry};

    async fn function_with_alias(
        functions: &MemoryFunctionStore,
        aliases: &MemoryAliasStore,
        routing: Vec<RoutingEntry>,
    ) -> Uuid {
        let created = functions
            .create_test_function()
            .await;
        aliases.upsert(created, LATEST_ALIAS, routing).await.unwrap();
        created
    }

    // Small helper trait kept local to tests to avoid duplicating NewFunction
    // boilerplate across this module's test cases.
    #[async_trait::async_trait]
    trait TestFunctionStoreExt {
        async fn create_test_function(&self) -> Uuid;
    }

    #[async_trait::async_trait]
    impl TestFunctionStoreExt for MemoryFunctionStore {
        async fn create_test_function(&self) -> Uuid {
            use std::collections::HashMap as StdMap;
            let record = FunctionStore::create(
                self,
                NewFunction {
                    name: format!("fn-{}", Uuid::new_v4()),
                    runtime: "python3.11".into(),
                    handler: "main.handler".into(),
                    description: None,
                    tags: vec![],
                    code: Some("pass".into()),
                    binary: None,
                    limits: ResourceLimits::default(),
                    env: StdMap::new(),
                    cron_expression: None,
                    http_route: None,
                    http_methods: vec![],
                    webhook_key: None,
                    session_affinity: false,
                    session_timeout_seconds: None,
                },
            )
            .await
            .unwrap();
            record.id
        }
    }

    #[tokio::test]
    async fn single_entry_alias_is_deterministic() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let aliases = Arc::new(MemoryAliasStore::new());
        let function_id = function_with_alias(
            &functions,
            &aliases,
            vec![RoutingEntry { version: 1, weight: 100 }],
        )
        .await;

        let versions = Arc::new(MemoryVersionStore::new());
        let router = TrafficRouter::new(functions.clone(), aliases.clone(), versions);
        for _ in 0..10 {
            let route = router.resolve(function_id, None, None).await.unwrap();
            assert_eq!(route.version, 1);
            assert_eq!(route.alias.as_deref(), Some(LATEST_ALIAS));
        }
    }

    #[tokio::test]
    async fn missing_alias_falls_back_to_function_version() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let aliases = Arc::new(MemoryAliasStore::new());
        let versions = Arc::new(MemoryVersionStore::new());
        let function_id = functions.create_test_function().await;

        let router = TrafficRouter::new(functions, aliases, versions);
        let route = router.resolve(function_id, None, None).await.unwrap();
        assert_eq!(route.version, 1);
        assert!(route.alias.is_none());
    }

    #[tokio::test]
    async fn explicit_version_bypasses_alias_when_it_exists() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let aliases = Arc::new(MemoryAliasStore::new());
        let versions = Arc::new(MemoryVersionStore::new());
        let function_id = function_with_alias(
            &functions,
            &aliases,
            vec![RoutingEntry { version: 1, weight: 100 }],
        )
        .await;
        // The explicit version must actually exist (spec §4.3 step 1); a
        // retained `FunctionVersion` snapshot is one way it can.
        versions
            .put(faas_store::FunctionVersionRecord {
                function_id,
                version: 2,
                handler: "main.handler".into(),
                code: Some("pass".into()),
                binary: None,
                code_hash: "hash".into(),
                description: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let router = TrafficRouter::new(functions, aliases, versions);
        let route = router.resolve(function_id, None, Some(2)).await.unwrap();
        assert_eq!(route.version, 2);
        assert!(route.alias.is_none());
    }

    #[tokio::test]
    async fn explicit_version_that_never_existed_is_rejected() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let aliases = Arc::new(MemoryAliasStore::new());
        let versions = Arc::new(MemoryVersionStore::new());
        let function_id = functions.create_test_function().await;

        let router = TrafficRouter::new(functions, aliases, versions);
        let err = router.resolve(function_id, None, Some(99)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn weighted_routing_is_statistically_fair() {
        let functions = Arc::new(MemoryFunctionStore::new());
        let aliases = Arc::new(MemoryAliasStore::new());
        let versions = Arc::new(MemoryVersionStore::new());
        let function_id = function_with_alias(
            &functions,
            &aliases,
            vec![
                RoutingEntry { version: 1, weight: 70 },
                RoutingEntry { version: 2, weight: 30 },
            ],
        )
        .await;

        let router = TrafficRouter::new(functions, aliases, versions);
        let mut version_one = 0u32;
        let total = 10_000;
        for _ in 0..total {
            let route = router.resolve(function_id, None, None).await.unwrap();
            if route.version == 1 {
                version_one += 1;
            }
        }
        let fraction = version_one as f64 / total as f64;
        assert!((0.68..=0.72).contains(&fraction), "fraction was {fraction}");
    }
}
