//! Context registry
//!
//! Owns the set of live contexts. Structural mutations (create, remove,
//! selection scans) serialize on one registry lock; driver calls happen
//! outside it, after the in-memory state is already consistent. The key
//! case is removal: the entry leaves the map before the driver teardown is
//! awaited, so no concurrent operation can observe a dying context.
//!
//! Capacity is enforced with slot reservations: a creation reserves its
//! slot under the lock before the first driver await, so the pool size
//! observed by any other operation never exceeds the configured maximum.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolSettings;
use crate::driver::{ContextDriver, NewContextOptions};
use crate::error::{PoolError, PoolResult};

use super::context::{ContextInfo, ContextSlot, proxy_tag};
use super::eviction::{EvictionWeights, find_eviction_candidate};
use super::rate_limiter::DomainRateLimiter;

/// File name of the storage checkpoint inside a persistent context's
/// directory. The payload itself is opaque to the pool.
pub const STATE_FILE: &str = "state.json";

struct RegistryInner {
    contexts: HashMap<Uuid, Arc<ContextSlot>>,
    /// Creation slots taken but not yet inserted.
    reserved: usize,
}

/// Live context set and its operations.
pub struct ContextRegistry {
    driver: Arc<dyn ContextDriver>,
    max_contexts: usize,
    weights: EvictionWeights,
    persistent_root: PathBuf,
    started: AtomicBool,
    inner: tokio::sync::Mutex<RegistryInner>,
}

impl ContextRegistry {
    pub fn new(settings: &PoolSettings, driver: Arc<dyn ContextDriver>) -> Self {
        Self {
            driver,
            max_contexts: settings.max_contexts,
            weights: settings.eviction_weights(),
            persistent_root: settings.persistent_contexts_path.clone(),
            started: AtomicBool::new(false),
            inner: tokio::sync::Mutex::new(RegistryInner {
                contexts: HashMap::new(),
                reserved: 0,
            }),
        }
    }

    pub(crate) fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_started(&self) -> PoolResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(PoolError::NotStarted)
        }
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn ContextDriver> {
        &self.driver
    }

    /// Number of live contexts.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.contexts.len()
    }

    /// Number of contexts not currently acquired.
    pub async fn available_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .contexts
            .values()
            .filter(|c| !c.state().in_use)
            .count()
    }

    /// Look up a context without acquiring it.
    pub async fn get_context(&self, id: Uuid) -> Option<Arc<ContextSlot>> {
        self.inner.lock().await.contexts.get(&id).cloned()
    }

    /// Snapshot every context whose tags include `required_tags`.
    pub async fn list_contexts(&self, required_tags: Option<&HashSet<String>>) -> Vec<ContextInfo> {
        let inner = self.inner.lock().await;
        let mut infos: Vec<ContextInfo> = inner
            .contexts
            .values()
            .filter(|c| match required_tags {
                Some(required) => required.is_subset(&c.state().tags),
                None => true,
            })
            .map(|c| c.info())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Create a new context. Fails when the pool is full.
    pub async fn create_context(
        &self,
        proxy: Option<String>,
        persistent: bool,
        tags: &[String],
    ) -> PoolResult<Arc<ContextSlot>> {
        self.ensure_started()?;
        {
            let mut inner = self.inner.lock().await;
            if inner.contexts.len() + inner.reserved >= self.max_contexts {
                return Err(PoolError::PoolFull(self.max_contexts));
            }
            inner.reserved += 1;
        }
        self.open_reserved(proxy, persistent, tags).await
    }

    /// Open a context against an already-taken reservation. The reservation
    /// is returned on every failure path.
    async fn open_reserved(
        &self,
        proxy: Option<String>,
        persistent: bool,
        tags: &[String],
    ) -> PoolResult<Arc<ContextSlot>> {
        let id = Uuid::new_v4();

        let mut storage_path = None;
        let mut storage_state = None;
        if persistent {
            let dir = self.persistent_root.join(id.to_string());
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!("Failed to create storage dir for context {id}: {e}");
            }
            storage_state = load_storage_state(&dir.join(STATE_FILE)).await;
            storage_path = Some(dir);
        }

        let driver_ctx = match self
            .driver
            .new_context(NewContextOptions {
                proxy: proxy.clone(),
                storage_state,
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.lock().await.reserved -= 1;
                return Err(e.into());
            }
        };

        // Best-effort: a missing CDP target URL never aborts creation.
        let cdp_target_url = self.driver.cdp_target_url(driver_ctx).await;

        let mut tag_set: HashSet<String> = tags.iter().cloned().collect();
        if let Some(ref p) = proxy {
            tag_set.insert(proxy_tag(p));
        }

        let slot = Arc::new(ContextSlot::new(
            id,
            driver_ctx,
            proxy,
            persistent,
            storage_path,
            cdp_target_url,
            tag_set,
        ));

        let mut inner = self.inner.lock().await;
        inner.reserved -= 1;
        inner.contexts.insert(id, Arc::clone(&slot));
        info!("Created context {id} (pool size {})", inner.contexts.len());
        Ok(slot)
    }

    /// Acquire a context for exclusive use.
    pub async fn acquire_context(&self, id: Uuid) -> PoolResult<Arc<ContextSlot>> {
        let inner = self.inner.lock().await;
        let ctx = inner
            .contexts
            .get(&id)
            .cloned()
            .ok_or(PoolError::ContextNotFound(id))?;
        let mut state = ctx.state();
        if state.in_use {
            return Err(PoolError::ContextNotAvailable(id));
        }
        state.in_use = true;
        drop(state);
        debug!("Acquired context {id}");
        Ok(ctx)
    }

    /// Release a context back into rotation. Persistent contexts are
    /// checkpointed first; checkpoint failures are logged and swallowed.
    pub async fn release_context(&self, id: Uuid) -> Option<Arc<ContextSlot>> {
        let ctx = self.get_context(id).await?;
        if ctx.persistent() {
            self.save_storage_state(&ctx).await;
        }
        ctx.state().in_use = false;
        debug!("Released context {id}");
        Some(ctx)
    }

    /// Remove and tear down a context. Fails when it is acquired.
    pub async fn remove_context(&self, id: Uuid) -> PoolResult<bool> {
        let ctx = {
            let mut inner = self.inner.lock().await;
            let Some(ctx) = inner.contexts.get(&id).cloned() else {
                return Ok(false);
            };
            if ctx.state().in_use {
                return Err(PoolError::ContextInUse(id));
            }
            // Deleted from the map before any await so nobody can observe
            // the context mid-teardown.
            inner.contexts.remove(&id);
            ctx
        };

        if ctx.persistent() {
            self.save_storage_state(&ctx).await;
        }
        self.driver.close_context(ctx.driver()).await;
        info!("Removed context {id}");
        Ok(true)
    }

    /// Add tags to a context.
    pub async fn add_tags(&self, id: Uuid, tags: &[String]) -> PoolResult<()> {
        let ctx = self
            .get_context(id)
            .await
            .ok_or(PoolError::ContextNotFound(id))?;
        let mut state = ctx.state();
        state.tags.extend(tags.iter().cloned());
        Ok(())
    }

    /// Remove tags from a context. The auto-maintained proxy tag survives.
    pub async fn remove_tags(&self, id: Uuid, tags: &[String]) -> PoolResult<()> {
        let ctx = self
            .get_context(id)
            .await
            .ok_or(PoolError::ContextNotFound(id))?;
        let auto = ctx.proxy().map(proxy_tag);
        let mut state = ctx.state();
        for tag in tags {
            if Some(tag) == auto.as_ref() {
                continue;
            }
            state.tags.remove(tag);
        }
        Ok(())
    }

    /// Pick the healthiest available context matching `required_tags` that
    /// may hit `domain` now. `None` when nothing qualifies.
    pub async fn select_context(
        &self,
        required_tags: Option<&HashSet<String>>,
        domain: Option<&str>,
        delay_ms: Option<u64>,
        limiter: &DomainRateLimiter,
    ) -> Option<Arc<ContextSlot>> {
        let inner = self.inner.lock().await;
        let mut best: Option<Candidate> = None;

        for ctx in inner.contexts.values() {
            {
                let state = ctx.state();
                if state.in_use || state.retiring {
                    continue;
                }
                if let Some(required) = required_tags
                    && !required.is_subset(&state.tags)
                {
                    continue;
                }
            }
            if let Some(domain) = domain
                && !limiter.can_request(ctx, domain, delay_ms)
            {
                continue;
            }

            let candidate = Candidate {
                health: ctx.health_score(),
                last_used_at: ctx.state().last_used_at,
                created_at: ctx.created_at(),
                ctx: Arc::clone(ctx),
            };
            let replace = match &best {
                None => true,
                Some(current) => candidate.beats(current),
            };
            if replace {
                best = Some(candidate);
            }
        }

        best.map(|c| c.ctx)
    }

    /// Make room for (and create) a new context.
    ///
    /// Under capacity this is a plain create. At capacity the eviction
    /// scorer picks a victim; `None` when nothing is evictable. The new
    /// context reuses the victim's slot, so the pool never exceeds
    /// `max_contexts` as observed by any other operation.
    pub async fn evict_and_replace(
        &self,
        tags: &[String],
        proxy: Option<String>,
        persistent: bool,
    ) -> PoolResult<Option<Arc<ContextSlot>>> {
        self.ensure_started()?;

        let victim = {
            let mut inner = self.inner.lock().await;
            if inner.contexts.len() + inner.reserved < self.max_contexts {
                inner.reserved += 1;
                None
            } else {
                let Some(victim) =
                    find_eviction_candidate(inner.contexts.values(), &self.weights, None)
                else {
                    return Ok(None);
                };
                inner.contexts.remove(&victim.id());
                inner.reserved += 1;
                Some(victim)
            }
        };

        if let Some(victim) = victim {
            info!("Evicting context {} to make room", victim.id());
            if victim.persistent() {
                self.save_storage_state(&victim).await;
            }
            self.driver.close_context(victim.driver()).await;
        }

        self.open_reserved(proxy, persistent, tags).await.map(Some)
    }

    /// Replace a context with a fresh one carrying the same proxy,
    /// persistence, and tags (minus the auto proxy tag, which is re-added
    /// on creation when a proxy is set).
    pub async fn recreate_context(&self, id: Uuid) -> PoolResult<Option<Arc<ContextSlot>>> {
        self.ensure_started()?;

        let victim = {
            let mut inner = self.inner.lock().await;
            let Some(victim) = inner.contexts.remove(&id) else {
                return Ok(None);
            };
            inner.reserved += 1;
            victim
        };

        let proxy = victim.proxy().map(str::to_string);
        let persistent = victim.persistent();
        let tags: Vec<String> = {
            let auto = proxy.as_deref().map(proxy_tag);
            let mut state = victim.state();
            state.in_use = false;
            state
                .tags
                .iter()
                .filter(|t| Some(t.as_str()) != auto.as_deref())
                .cloned()
                .collect()
        };

        if persistent {
            self.save_storage_state(&victim).await;
        }
        self.driver.close_context(victim.driver()).await;

        let fresh = self.open_reserved(proxy, persistent, &tags).await?;
        info!("Recreated context {id} as {}", fresh.id());
        Ok(Some(fresh))
    }

    /// Mark a context as retiring so selection and eviction skip it.
    /// Returns true only for the first caller.
    pub async fn mark_retiring(&self, id: Uuid) -> bool {
        let Some(ctx) = self.get_context(id).await else {
            return false;
        };
        let mut state = ctx.state();
        if state.retiring {
            false
        } else {
            state.retiring = true;
            true
        }
    }

    /// Tear down every context, swallowing driver errors. Used on stop.
    pub(crate) async fn remove_all(&self) {
        let drained: Vec<Arc<ContextSlot>> = {
            let mut inner = self.inner.lock().await;
            inner.contexts.drain().map(|(_, ctx)| ctx).collect()
        };
        for ctx in drained {
            if ctx.persistent() {
                self.save_storage_state(&ctx).await;
            }
            self.driver.close_context(ctx.driver()).await;
        }
    }

    /// Checkpoint a persistent context's storage. Failures are logged and
    /// swallowed; checkpointing must never fail the surrounding operation.
    async fn save_storage_state(&self, ctx: &ContextSlot) {
        let Some(dir) = ctx.storage_path() else {
            return;
        };
        let state = match self.driver.storage_state(ctx.driver()).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to snapshot storage for context {}: {e}", ctx.id());
                return;
            }
        };
        let payload = match serde_json::to_string_pretty(&state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize storage for context {}: {e}", ctx.id());
                return;
            }
        };
        if let Err(e) = tokio::fs::write(dir.join(STATE_FILE), payload).await {
            warn!("Failed to write storage state for context {}: {e}", ctx.id());
        }
    }
}

struct Candidate {
    health: f64,
    last_used_at: Option<Instant>,
    created_at: Instant,
    ctx: Arc<ContextSlot>,
}

impl Candidate {
    /// Deterministic selection order: lowest health score, then least
    /// recently used (never-used first), then oldest.
    fn beats(&self, other: &Self) -> bool {
        if self.health != other.health {
            return self.health < other.health;
        }
        match (self.last_used_at, other.last_used_at) {
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) if a != b => a < b,
            _ => self.created_at < other.created_at,
        }
    }
}

/// Read a storage checkpoint, `None` when absent or unreadable.
async fn load_storage_state(path: &std::path::Path) -> Option<serde_json::Value> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring corrupt storage state at {}: {e}", path.display());
                None
            }
        },
        Err(_) => None,
    }
}
