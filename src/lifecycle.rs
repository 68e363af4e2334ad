//! Model lifecycle management
//!
//! Owns the per-model load state machine and the memory budget:
//!
//! ```text
//! UNLOADED -> LOADING -> LOADED -> UNLOADING -> UNLOADED
//!                |                     |
//!                +-------> ERROR <-----+
//!                  (retry back into LOADING or UNLOADING)
//! ```
//!
//! Each model has an operation lock so loads and unloads of one model are
//! serialized while different models proceed in parallel. Concurrent
//! requests for the same operation share a single execution.

use crate::budget::{GB_EPSILON, MemoryBudget};
use crate::error::{ManagerError, ManagerResult};
use crate::events::ModelEvent;
use crate::metrics;
use crate::models::inflight::InFlight;
use crate::models::{
    ArtifactMetadata, ArtifactPin, CacheEntry, CacheUsage, DownloadManager, MemoryTier,
    MemoryTiers, ModelBackend, ModelCatalog, ModelDescriptor, PerformanceTargets,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast};

/// Load state of one model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Error,
}

impl LoadState {
    pub fn can_transition_to(self, next: LoadState) -> bool {
        use LoadState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loading, Error)
                | (Loaded, Unloading)
                | (Unloading, Unloaded)
                | (Unloading, Error)
                | (Error, Loading)
                | (Error, Unloading)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
            LoadState::Unloading => "unloading",
            LoadState::Error => "error",
        }
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle tunables
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub total_memory_gb: f64,
    pub safety_threshold: f64,
    /// Tier tried first when a load does not ask for one
    pub preferred_tier: MemoryTier,
    /// Consecutive load failures after which a model is skipped by selection
    pub max_consecutive_errors: u32,
}

/// Mutable runtime fields of one model
#[derive(Debug, Default)]
struct ModelRuntime {
    load_state: LoadState,
    tier: Option<MemoryTier>,
    last_used_at: Option<DateTime<Utc>>,
    last_load_duration_ms: Option<u64>,
    consecutive_error_count: u32,
    last_error: Option<String>,
    artifact: Option<ArtifactMetadata>,
    /// Held while loading or loaded so the artifact stays on disk
    artifact_pin: Option<ArtifactPin>,
}

impl ModelRuntime {
    fn transition(&mut self, model_id: &str, next: LoadState) -> ManagerResult<()> {
        if !self.load_state.can_transition_to(next) {
            return Err(ManagerError::InvalidTransition {
                model_id: model_id.to_string(),
                from: self.load_state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(
            model_id = %model_id,
            from = %self.load_state,
            to = %next,
            "Load state transition"
        );
        self.load_state = next;
        Ok(())
    }
}

struct ModelSlot {
    descriptor: Arc<ModelDescriptor>,
    runtime: RwLock<ModelRuntime>,
    /// Serializes load and unload of this model
    op_lock: Arc<Mutex<()>>,
    leases: AtomicUsize,
}

impl ModelSlot {
    fn leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

/// A loaded model held for an in-flight request
///
/// While any lease exists the model cannot be unloaded or evicted.
pub struct ModelLease {
    slot: Arc<ModelSlot>,
}

impl ModelLease {
    pub fn model_id(&self) -> &str {
        &self.slot.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.slot.descriptor
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.slot.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("model_id", &self.model_id())
            .finish()
    }
}

/// Loaded model picked as an eviction victim, with its operation lock held
struct Victim {
    slot: Arc<ModelSlot>,
    _op: OwnedMutexGuard<()>,
    gb: f64,
    last_used_at: Option<DateTime<Utc>>,
}

/// Per-model status for callers and diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub id: String,
    pub display_name: String,
    pub source_name: String,
    pub priority: i32,
    pub content_affinities: BTreeSet<String>,
    pub memory_tiers: MemoryTiers,
    pub performance_targets: PerformanceTargets,
    pub load_state: LoadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<MemoryTier>,
    pub memory_gb: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_load_duration_ms: Option<u64>,
    pub consecutive_error_count: u32,
    /// False once the error count reaches the threshold
    pub eligible_for_selection: bool,
    pub active_leases: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub cached: bool,
    pub downloading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub total_gb: f64,
    pub safety_threshold: f64,
    pub limit_gb: f64,
    pub loaded_gb: f64,
    pub available_gb: f64,
}

/// Everything `GET /models` reports
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSummary {
    pub models: Vec<ModelStatus>,
    pub memory: MemoryUsage,
    pub cache: CacheUsage,
}

/// Decides which models are resident and keeps them within the memory budget
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Arc<ModelCatalog>,
    downloads: DownloadManager,
    backend: Arc<dyn ModelBackend>,
    config: LifecycleConfig,
    slots: HashMap<String, Arc<ModelSlot>>,
    budget: Mutex<MemoryBudget>,
    loads: InFlight<MemoryTier>,
    unloads: InFlight<()>,
    event_tx: broadcast::Sender<ModelEvent>,
}

impl LifecycleManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        downloads: DownloadManager,
        backend: Arc<dyn ModelBackend>,
        config: LifecycleConfig,
    ) -> Self {
        let slots = catalog
            .list_by_priority()
            .into_iter()
            .map(|descriptor| {
                let slot = ModelSlot {
                    descriptor: Arc::clone(&descriptor),
                    runtime: RwLock::new(ModelRuntime::default()),
                    op_lock: Arc::new(Mutex::new(())),
                    leases: AtomicUsize::new(0),
                };
                (descriptor.id.clone(), Arc::new(slot))
            })
            .collect();

        tracing::info!(
            models = catalog.len(),
            total_memory_gb = config.total_memory_gb,
            safety_threshold = config.safety_threshold,
            preferred_tier = %config.preferred_tier,
            "Lifecycle manager initialized"
        );

        let event_tx = downloads.event_sender();
        Self {
            inner: Arc::new(Inner {
                budget: Mutex::new(MemoryBudget::new(
                    config.total_memory_gb,
                    config.safety_threshold,
                )),
                catalog,
                downloads,
                backend,
                config,
                slots,
                loads: InFlight::new(),
                unloads: InFlight::new(),
                event_tx,
            }),
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.inner.catalog
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.inner.downloads
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ModelEvent> {
        self.inner.event_tx.subscribe()
    }

    fn slot(&self, model_id: &str) -> ManagerResult<Arc<ModelSlot>> {
        self.inner
            .slots
            .get(model_id)
            .cloned()
            .ok_or_else(|| ManagerError::not_found(model_id))
    }

    /// Make sure the model's artifact is on disk without loading it
    pub async fn ensure_cached(&self, model_id: &str) -> ManagerResult<CacheEntry> {
        self.inner.downloads.ensure_cached(model_id).await
    }

    /// Load a model at the best affordable tier
    ///
    /// Tiers are tried from the preferred one down to `minimum`. Returns the
    /// tier the model is resident at.
    pub async fn load(&self, model_id: &str) -> ManagerResult<MemoryTier> {
        self.load_with_tier(model_id, None).await
    }

    /// Load a model, optionally at one specific tier only
    ///
    /// A model that is already loaded is left at its current tier. A request
    /// that arrives while a load of the same model is running gets that
    /// load's result.
    pub async fn load_with_tier(
        &self,
        model_id: &str,
        tier: Option<MemoryTier>,
    ) -> ManagerResult<MemoryTier> {
        let slot = self.slot(model_id)?;

        if let Some(tier) = Self::touch_if_loaded(&slot).await {
            return Ok(tier);
        }

        let this = self.clone();
        let (result, joined) = self.inner.loads.run(model_id, async move {
            this.load_inner(slot, tier).await
        });
        if joined {
            tracing::debug!(model_id = %model_id, "Joining in-flight load");
        }
        result.await
    }

    /// Unload a model; a no-op if it is not loaded
    ///
    /// Fails with `InUse` while leases are held.
    pub async fn unload(&self, model_id: &str) -> ManagerResult<()> {
        let slot = self.slot(model_id)?;

        let this = self.clone();
        let (result, joined) = self.inner.unloads.run(model_id, async move {
            this.unload_inner(slot, false).await
        });
        if joined {
            tracing::debug!(model_id = %model_id, "Joining in-flight unload");
        }
        result.await
    }

    /// Loaded, selectable model for a content type, most protected first
    ///
    /// Never loads anything; see [`Self::preferred_candidate`] for what to load
    /// when this returns `None`.
    pub async fn select_for_content_type(&self, tag: &str) -> Option<Arc<ModelDescriptor>> {
        for descriptor in self.inner.catalog.list_by_content_affinity(tag) {
            let Some(slot) = self.inner.slots.get(&descriptor.id) else {
                continue;
            };
            let runtime = slot.runtime.read().await;
            if runtime.load_state == LoadState::Loaded && self.is_eligible(&runtime) {
                return Some(descriptor);
            }
        }
        None
    }

    /// Model the caller should load for a content type when none is loaded
    pub async fn preferred_candidate(&self, tag: &str) -> Option<Arc<ModelDescriptor>> {
        for descriptor in self.inner.catalog.list_by_content_affinity(tag) {
            let Some(slot) = self.inner.slots.get(&descriptor.id) else {
                continue;
            };
            if self.is_eligible(&*slot.runtime.read().await) {
                return Some(descriptor);
            }
        }
        None
    }

    /// Hold a loaded model for the duration of a request
    pub async fn pin(&self, model_id: &str) -> ManagerResult<ModelLease> {
        let slot = self.slot(model_id)?;
        let mut runtime = slot.runtime.write().await;

        if runtime.load_state != LoadState::Loaded {
            return Err(ManagerError::NotLoaded {
                model_id: model_id.to_string(),
                state: runtime.load_state.to_string(),
            });
        }

        slot.leases.fetch_add(1, Ordering::SeqCst);
        runtime.last_used_at = Some(Utc::now());
        drop(runtime);

        Ok(ModelLease { slot })
    }

    /// Clear a model's error count so it is selectable again
    pub async fn reset_errors(&self, model_id: &str) -> ManagerResult<ModelStatus> {
        let slot = self.slot(model_id)?;
        {
            let mut runtime = slot.runtime.write().await;
            if runtime.consecutive_error_count > 0 {
                tracing::info!(
                    model_id = %model_id,
                    errors = runtime.consecutive_error_count,
                    "Resetting consecutive error count"
                );
            }
            runtime.consecutive_error_count = 0;
            runtime.last_error = None;
        }
        Ok(self.status_of(&slot).await)
    }

    pub async fn status(&self, model_id: &str) -> ManagerResult<ModelStatus> {
        let slot = self.slot(model_id)?;
        Ok(self.status_of(&slot).await)
    }

    pub async fn memory_usage(&self) -> MemoryUsage {
        let budget = self.inner.budget.lock().await;
        MemoryUsage {
            total_gb: budget.total_gb(),
            safety_threshold: budget.safety_threshold(),
            limit_gb: budget.limit_gb(),
            loaded_gb: budget.loaded_gb(),
            available_gb: budget.available_gb(),
        }
    }

    /// Per-model state, memory usage and cache usage
    pub async fn summary(&self) -> ManagerSummary {
        let mut models = Vec::with_capacity(self.inner.slots.len());
        for descriptor in self.inner.catalog.list_by_priority() {
            if let Some(slot) = self.inner.slots.get(&descriptor.id) {
                models.push(self.status_of(slot).await);
            }
        }

        ManagerSummary {
            models,
            memory: self.memory_usage().await,
            cache: self.inner.downloads.usage().await,
        }
    }

    /// Cancel downloads and unload every model, leases notwithstanding
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down lifecycle manager");
        self.inner.downloads.cancel_all();

        // Least protected first
        for descriptor in self.inner.catalog.list_by_priority().iter().rev() {
            let Some(slot) = self.inner.slots.get(&descriptor.id) else {
                continue;
            };
            if slot.runtime.read().await.load_state == LoadState::Unloaded {
                continue;
            }
            if let Err(e) = self.unload_inner(Arc::clone(slot), true).await {
                tracing::warn!(model_id = %descriptor.id, error = %e, "Failed to unload during shutdown");
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn is_eligible(&self, runtime: &ModelRuntime) -> bool {
        runtime.consecutive_error_count < self.inner.config.max_consecutive_errors
    }

    async fn touch_if_loaded(slot: &ModelSlot) -> Option<MemoryTier> {
        let mut runtime = slot.runtime.write().await;
        if runtime.load_state != LoadState::Loaded {
            return None;
        }
        runtime.last_used_at = Some(Utc::now());
        runtime.tier
    }

    async fn load_inner(
        &self,
        slot: Arc<ModelSlot>,
        requested: Option<MemoryTier>,
    ) -> ManagerResult<MemoryTier> {
        let model_id = slot.descriptor.id.clone();
        let _op = slot.op_lock.lock().await;

        // Loaded by an operation that finished while this one queued
        if let Some(tier) = Self::touch_if_loaded(&slot).await {
            return Ok(tier);
        }

        let pin = self.inner.downloads.pin_artifact(&model_id);
        let entry = match self.inner.downloads.ensure_cached(&model_id).await {
            Ok(entry) => entry,
            Err(e) => return Err(self.load_rejected(&model_id, e)),
        };

        let tier = match self.reserve_memory(&slot, requested).await {
            Ok(tier) => tier,
            Err(e) => return Err(self.load_rejected(&model_id, e)),
        };

        {
            let mut runtime = slot.runtime.write().await;
            if let Err(e) = runtime.transition(&model_id, LoadState::Loading) {
                drop(runtime);
                self.inner.budget.lock().await.release(&model_id);
                return Err(e);
            }
        }

        tracing::info!(model_id = %model_id, tier = %tier, path = ?entry.path, "Loading model");
        let started = Instant::now();
        let result = call_backend(
            &model_id,
            self.inner.backend.load(&slot.descriptor, &entry, tier),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut runtime = slot.runtime.write().await;
        match result {
            Ok(metadata) => {
                runtime.transition(&model_id, LoadState::Loaded)?;
                runtime.tier = Some(tier);
                runtime.last_used_at = Some(Utc::now());
                runtime.last_load_duration_ms = Some(duration_ms);
                runtime.consecutive_error_count = 0;
                runtime.last_error = None;
                runtime.artifact = Some(metadata);
                runtime.artifact_pin = Some(pin);
                drop(runtime);

                tracing::info!(
                    model_id = %model_id,
                    tier = %tier,
                    memory_gb = slot.descriptor.memory_tiers.gb(tier),
                    duration_ms,
                    "Model loaded"
                );
                metrics::record_model_loaded(&model_id, tier.as_str(), duration_ms);
                let _ = self.inner.event_tx.send(ModelEvent::Loaded {
                    model_id: model_id.clone(),
                    tier,
                });
                self.publish_memory().await;
                Ok(tier)
            }
            Err(e) => {
                runtime.transition(&model_id, LoadState::Error)?;
                runtime.tier = None;
                runtime.consecutive_error_count += 1;
                runtime.last_error = Some(e.to_string());
                let errors = runtime.consecutive_error_count;
                drop(runtime);

                self.inner.budget.lock().await.release(&model_id);

                tracing::error!(
                    model_id = %model_id,
                    tier = %tier,
                    consecutive_errors = errors,
                    error = %e,
                    "Model load failed"
                );
                if errors >= self.inner.config.max_consecutive_errors {
                    tracing::warn!(
                        model_id = %model_id,
                        consecutive_errors = errors,
                        "Model excluded from automatic selection until reset"
                    );
                }
                self.publish_memory().await;
                Err(self.load_rejected(&model_id, e))
            }
        }
    }

    /// Report a failed load attempt and hand the error back
    fn load_rejected(&self, model_id: &str, err: ManagerError) -> ManagerError {
        metrics::record_load_failure(model_id, err.kind());
        let _ = self.inner.event_tx.send(ModelEvent::LoadFailed {
            model_id: model_id.to_string(),
            error: err.to_string(),
        });
        err
    }

    /// Charge the model's memory, evicting less protected models if needed
    ///
    /// Feasibility is decided before anything is evicted: if no candidate
    /// tier fits in free plus evictable memory, nothing is unloaded.
    async fn reserve_memory(
        &self,
        slot: &ModelSlot,
        requested: Option<MemoryTier>,
    ) -> ManagerResult<MemoryTier> {
        let descriptor = &slot.descriptor;
        let model_id = descriptor.id.as_str();
        let tiers: Vec<MemoryTier> = match requested {
            Some(tier) => vec![tier],
            None => self.inner.config.preferred_tier.and_lower().to_vec(),
        };

        let mut budget = self.inner.budget.lock().await;
        let own_gb = budget.reservation(model_id).map_or(0.0, |r| r.gb);
        let free_gb = budget.available_gb() + own_gb;
        let victims = self.eviction_candidates(model_id, &budget).await;
        let evictable_gb: f64 = victims.iter().map(|v| v.gb).sum();

        let affordable = tiers
            .iter()
            .copied()
            .find(|t| descriptor.memory_tiers.gb(*t) <= free_gb + evictable_gb + GB_EPSILON);

        let Some(tier) = affordable else {
            let tier = tiers.last().copied().unwrap_or_default();
            return Err(ManagerError::InsufficientMemory {
                model_id: model_id.to_string(),
                tier: tier.to_string(),
                required_gb: descriptor.memory_tiers.gb(tier),
                available_gb: free_gb,
                evictable_gb,
                limit_gb: budget.limit_gb(),
            });
        };

        if Some(&tier) != tiers.first() {
            tracing::info!(
                model_id = %model_id,
                preferred = %self.inner.config.preferred_tier,
                tier = %tier,
                "Falling back to a lower memory tier"
            );
        }

        let required_gb = descriptor.memory_tiers.gb(tier);
        if budget.try_reserve(model_id, tier, required_gb).is_ok() {
            return Ok(tier);
        }

        // Take victims out of service and earmark the memory they free, then
        // unload them with the budget released
        let shortfall_gb = required_gb - free_gb;
        let mut evicting = Vec::new();
        let mut freeing_gb = 0.0;
        for victim in victims {
            if freeing_gb + GB_EPSILON >= shortfall_gb {
                break;
            }
            if Self::begin_eviction(&victim, model_id).await {
                freeing_gb += victim.gb;
                evicting.push(victim);
            }
        }
        tracing::debug!(
            model_id = %model_id,
            shortfall_gb,
            victims = evicting.len(),
            "Memory shortfall, evicting"
        );
        budget.claim(model_id, tier, required_gb);
        drop(budget);

        for victim in evicting {
            self.finish_eviction(victim, model_id).await;
        }

        let mut budget = self.inner.budget.lock().await;
        match budget.commit_claim(model_id) {
            Ok(tier) => Ok(tier),
            // A victim took a lease after it was selected, or failed to unload
            Err(_) => Err(ManagerError::InsufficientMemory {
                model_id: model_id.to_string(),
                tier: tier.to_string(),
                required_gb,
                available_gb: budget.available_gb() + own_gb,
                evictable_gb: 0.0,
                limit_gb: budget.limit_gb(),
            }),
        }
    }

    /// Loaded models that may be evicted, in eviction order
    ///
    /// Highest priority number first, then least recently used. Models with
    /// leases or with an operation in flight are never candidates.
    async fn eviction_candidates(&self, for_model: &str, budget: &MemoryBudget) -> Vec<Victim> {
        let mut victims = Vec::new();

        for slot in self.inner.slots.values() {
            if slot.descriptor.id == for_model || slot.leases() > 0 {
                continue;
            }
            let Ok(op) = Arc::clone(&slot.op_lock).try_lock_owned() else {
                continue;
            };
            let runtime = slot.runtime.read().await;
            if runtime.load_state != LoadState::Loaded {
                continue;
            }
            let gb = budget
                .reservation(&slot.descriptor.id)
                .map_or(0.0, |r| r.gb);
            victims.push(Victim {
                slot: Arc::clone(slot),
                _op: op,
                gb,
                last_used_at: runtime.last_used_at,
            });
        }

        victims.sort_by(|a, b| {
            b.slot
                .descriptor
                .priority
                .cmp(&a.slot.descriptor.priority)
                .then(a.last_used_at.cmp(&b.last_used_at))
        });
        victims
    }

    /// Move an idle loaded victim to `Unloading`; false if it became busy
    async fn begin_eviction(victim: &Victim, for_model: &str) -> bool {
        let descriptor = &victim.slot.descriptor;
        let model_id = descriptor.id.as_str();
        let mut runtime = victim.slot.runtime.write().await;

        if runtime.load_state != LoadState::Loaded || victim.slot.leases() > 0 {
            tracing::debug!(model_id = %model_id, "Eviction candidate became busy, skipping");
            return false;
        }
        if runtime.transition(model_id, LoadState::Unloading).is_err() {
            return false;
        }

        tracing::info!(
            model_id = %model_id,
            for_model = %for_model,
            priority = descriptor.priority,
            memory_gb = victim.gb,
            "Evicting loaded model to free memory"
        );
        true
    }

    /// Unload a victim taken out of service by `begin_eviction`
    async fn finish_eviction(&self, victim: Victim, for_model: &str) {
        let descriptor = &victim.slot.descriptor;
        let model_id = descriptor.id.as_str();

        let result = call_backend(model_id, self.inner.backend.unload(descriptor)).await;

        let mut runtime = victim.slot.runtime.write().await;
        match result {
            Ok(()) => {
                let _ = runtime.transition(model_id, LoadState::Unloaded);
                runtime.tier = None;
                runtime.artifact_pin = None;
                drop(runtime);
                self.inner.budget.lock().await.release(model_id);

                metrics::record_memory_eviction(model_id);
                let _ = self.inner.event_tx.send(ModelEvent::Evicted {
                    model_id: model_id.to_string(),
                    for_model: for_model.to_string(),
                });
            }
            Err(e) => {
                let _ = runtime.transition(model_id, LoadState::Error);
                runtime.last_error = Some(e.to_string());
                tracing::error!(model_id = %model_id, error = %e, "Failed to evict model");
            }
        }
    }

    async fn unload_inner(&self, slot: Arc<ModelSlot>, force: bool) -> ManagerResult<()> {
        let model_id = slot.descriptor.id.as_str();
        let _op = slot.op_lock.lock().await;
        let mut runtime = slot.runtime.write().await;

        if runtime.load_state == LoadState::Unloaded {
            return Ok(());
        }

        let leases = slot.leases();
        if leases > 0 {
            if !force {
                return Err(ManagerError::InUse {
                    model_id: model_id.to_string(),
                    leases,
                });
            }
            tracing::warn!(model_id = %model_id, leases, "Unloading model with active leases");
        }

        runtime.transition(model_id, LoadState::Unloading)?;
        match call_backend(model_id, self.inner.backend.unload(&slot.descriptor)).await {
            Ok(()) => {
                runtime.transition(model_id, LoadState::Unloaded)?;
                runtime.tier = None;
                runtime.artifact_pin = None;
                drop(runtime);

                self.inner.budget.lock().await.release(model_id);
                tracing::info!(model_id = %model_id, "Model unloaded");
                metrics::record_model_unloaded(model_id);
                let _ = self.inner.event_tx.send(ModelEvent::Unloaded {
                    model_id: model_id.to_string(),
                });
                self.publish_memory().await;
                Ok(())
            }
            Err(e) => {
                // Memory stays charged; the engine state is unknown
                runtime.transition(model_id, LoadState::Error)?;
                runtime.last_error = Some(e.to_string());
                tracing::error!(model_id = %model_id, error = %e, "Model unload failed");
                Err(e)
            }
        }
    }

    async fn status_of(&self, slot: &ModelSlot) -> ModelStatus {
        let descriptor = &slot.descriptor;
        let memory_gb = self
            .inner
            .budget
            .lock()
            .await
            .reservation(&descriptor.id)
            .map_or(0.0, |r| r.gb);
        let cached = self
            .inner
            .downloads
            .store()
            .peek(&descriptor.id)
            .await
            .is_some();

        let runtime = slot.runtime.read().await;
        ModelStatus {
            id: descriptor.id.clone(),
            display_name: descriptor.display_name().to_string(),
            source_name: descriptor.source_name.clone(),
            priority: descriptor.priority,
            content_affinities: descriptor.content_affinities.clone(),
            memory_tiers: descriptor.memory_tiers,
            performance_targets: descriptor.performance_targets.clone(),
            load_state: runtime.load_state,
            tier: runtime.tier,
            memory_gb,
            last_used_at: runtime.last_used_at,
            last_load_duration_ms: runtime.last_load_duration_ms,
            consecutive_error_count: runtime.consecutive_error_count,
            eligible_for_selection: self.is_eligible(&runtime),
            active_leases: slot.leases(),
            last_error: runtime.last_error.clone(),
            cached,
            downloading: self.inner.downloads.is_downloading(&descriptor.id),
            artifact: runtime.artifact.clone(),
        }
    }

    async fn publish_memory(&self) {
        let budget = self.inner.budget.lock().await;
        metrics::update_loaded_memory(budget.loaded_gb(), budget.reservation_count());
    }
}

/// Await a backend call, turning a panic into a `Backend` error
async fn call_backend<T>(
    model_id: &str,
    call: impl Future<Output = ManagerResult<T>>,
) -> ManagerResult<T> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(model_id = %model_id, reason = %reason, "Backend panicked");
            Err(ManagerError::Backend {
                model_id: model_id.to_string(),
                reason: format!("backend panicked: {}", reason),
            })
        }
    }
}
