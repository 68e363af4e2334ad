//! Download and verification of model artifacts
//!
//! `ensure_cached` is the only way an artifact enters the cache:
//!
//! 1. A valid metadata record is a cache hit; its access time is refreshed.
//! 2. Otherwise the upstream manifest is fetched and disk space is reserved,
//!    evicting least recently accessed artifacts when the quota requires it.
//! 3. Files are streamed into a staging directory. A retry or a later call
//!    resumes from the bytes already staged.
//! 4. Sizes and published digests are verified, the staging directory is
//!    renamed into place, and only then is a `valid` record written.
//!
//! A crash at any point before step 4 finishes leaves at most a staging
//! directory or an unrecorded artifact directory, never a valid record.

use super::cache::{
    ArtifactFile, CacheLayout, fingerprint, move_to_trash, remove_dir_if_exists, sha256_file,
};
use super::catalog::{ModelCatalog, ModelDescriptor};
use super::inflight::{InFlight, SharedResult};
use super::metadata::{CacheEntry, MetadataStore};
use super::source::{ArtifactManifest, ArtifactSource, ManifestFile, SourceError};
use crate::budget::{StorageBudget, bytes_to_gb, gb_to_bytes};
use crate::error::{ManagerError, ManagerResult};
use crate::events::{DownloadProgress, ModelEvent};
use crate::metrics;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

/// Marker inside a staging directory naming the revision being staged
const REVISION_TAG: &str = ".revision";

/// Download manager tunables
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_cache_bytes: u64,
    /// Entries idle longer than this are evicted first and removed by cleanup
    pub cleanup_age: chrono::Duration,
    pub max_concurrent_downloads: usize,
    /// Retries after the first attempt for transient upstream failures
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub progress_interval: Duration,
    /// Write buffer size for staged files
    pub chunk_size_bytes: usize,
    /// Longest wait for the next chunk of a file before the attempt fails
    pub idle_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: gb_to_bytes(100.0),
            cleanup_age: chrono::Duration::days(30),
            max_concurrent_downloads: 2,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            progress_interval: Duration::from_millis(500),
            chunk_size_bytes: 8 * 1024 * 1024,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of a background download request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// Artifact was already cached; nothing was started
    Cached { entry: CacheEntry },
    Started { model_id: String },
}

/// Disk usage snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheUsage {
    pub used_gb: f64,
    pub max_gb: f64,
    pub reserved_gb: f64,
    pub entries: Vec<CacheEntry>,
    pub downloads_in_flight: Vec<String>,
    pub pinned: Vec<String>,
}

/// Keeps an artifact out of disk eviction while held
pub struct ArtifactPin {
    pins: Arc<DashMap<String, usize>>,
    model_id: String,
}

impl ArtifactPin {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Drop for ArtifactPin {
    fn drop(&mut self) {
        if let Some(mut count) = self.pins.get_mut(&self.model_id) {
            *count = count.saturating_sub(1);
        }
        self.pins.remove_if(&self.model_id, |_, count| *count == 0);
    }
}

impl std::fmt::Debug for ArtifactPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactPin")
            .field("model_id", &self.model_id)
            .finish()
    }
}

/// Why a transfer attempt stopped
#[derive(Debug)]
enum TransferFailure {
    /// Upstream failure; retried while transient
    Source(SourceError),
    /// Local failure, surfaced as is
    Local(ManagerError),
}

impl From<SourceError> for TransferFailure {
    fn from(err: SourceError) -> Self {
        TransferFailure::Source(err)
    }
}

impl From<ManagerError> for TransferFailure {
    fn from(err: ManagerError) -> Self {
        TransferFailure::Local(err)
    }
}

/// Running byte counts for one download, emitted at bounded intervals
struct ProgressTracker {
    tx: broadcast::Sender<DownloadProgress>,
    model_id: String,
    total: u64,
    transferred: u64,
    session_bytes: u64,
    started: Instant,
    last_emit: Option<Instant>,
    interval: Duration,
}

impl ProgressTracker {
    fn rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.session_bytes as f64 / elapsed
        } else {
            0.0
        }
    }

    fn advance(&mut self, file: &str, bytes: u64) {
        self.transferred += bytes;
        self.session_bytes += bytes;
        let due = self
            .last_emit
            .is_none_or(|last| last.elapsed() >= self.interval);
        if due {
            self.emit(file);
        }
    }

    fn resumed(&mut self, bytes: u64) {
        self.transferred += bytes;
    }

    fn rewind(&mut self, bytes: u64) {
        self.transferred = self.transferred.saturating_sub(bytes);
    }

    fn emit(&mut self, file: &str) {
        self.last_emit = Some(Instant::now());
        // No subscribers is fine
        let _ = self.tx.send(DownloadProgress::new(
            &self.model_id,
            file,
            self.transferred,
            self.total,
            self.rate(),
        ));
    }
}

/// Fetches, verifies and evicts cached artifacts
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Arc<ModelCatalog>,
    store: Arc<MetadataStore>,
    source: Arc<dyn ArtifactSource>,
    config: DownloadConfig,
    /// Reservations for in-flight transfers; every cache hit and every
    /// record removal happens under this lock. Evicted directories are moved
    /// to the trash under it and deleted after it is released.
    ledger: Mutex<StorageBudget>,
    permits: Semaphore,
    inflight: InFlight<CacheEntry>,
    pins: Arc<DashMap<String, usize>>,
    cancels: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
    progress_tx: broadcast::Sender<DownloadProgress>,
    event_tx: broadcast::Sender<ModelEvent>,
}

impl DownloadManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        store: Arc<MetadataStore>,
        source: Arc<dyn ArtifactSource>,
        config: DownloadConfig,
        event_tx: broadcast::Sender<ModelEvent>,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                catalog,
                ledger: Mutex::new(StorageBudget::new(config.max_cache_bytes)),
                permits: Semaphore::new(config.max_concurrent_downloads.max(1)),
                store,
                source,
                config,
                inflight: InFlight::new(),
                pins: Arc::new(DashMap::new()),
                cancels: DashMap::new(),
                shutdown: CancellationToken::new(),
                progress_tx,
                event_tx,
            }),
        }
    }

    /// Sender shared with the lifecycle manager so both publish on one channel
    pub fn event_sender(&self) -> broadcast::Sender<ModelEvent> {
        self.inner.event_tx.clone()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<DownloadProgress> {
        self.inner.progress_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.inner.store
    }

    pub fn layout(&self) -> &CacheLayout {
        self.inner.store.layout()
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    /// Return a valid cache entry for the model, downloading it if needed
    ///
    /// Concurrent calls for the same model share one transfer.
    pub async fn ensure_cached(&self, model_id: &str) -> ManagerResult<CacheEntry> {
        let descriptor = self.inner.catalog.get(model_id)?;

        if let Some(entry) = self.cache_hit(model_id).await? {
            return Ok(entry);
        }

        let (result, joined) = self.spawn_fetch(descriptor);
        if joined {
            tracing::debug!(model_id = %model_id, "Joining in-flight download");
        }
        result.await
    }

    /// Start a download without waiting for it
    pub async fn start_download(&self, model_id: &str) -> ManagerResult<DownloadOutcome> {
        let descriptor = self.inner.catalog.get(model_id)?;

        if self.inner.inflight.is_running(model_id) {
            return Err(ManagerError::AlreadyInProgress {
                model_id: model_id.to_string(),
            });
        }
        if let Some(entry) = self.cache_hit(model_id).await? {
            return Ok(DownloadOutcome::Cached { entry });
        }

        // The transfer runs on its own task and logs its own outcome
        let (_, joined) = self.spawn_fetch(descriptor);
        if joined {
            return Err(ManagerError::AlreadyInProgress {
                model_id: model_id.to_string(),
            });
        }
        Ok(DownloadOutcome::Started {
            model_id: model_id.to_string(),
        })
    }

    pub fn is_downloading(&self, model_id: &str) -> bool {
        self.inner.inflight.is_running(model_id)
    }

    /// Cancel an in-flight download, returning whether one was running
    ///
    /// The transfer stops, its staging directory is removed and waiters
    /// receive `Cancelled`.
    pub fn cancel(&self, model_id: &str) -> ManagerResult<bool> {
        self.inner.catalog.get(model_id)?;
        match self.inner.cancels.get(model_id) {
            Some(token) => {
                tracing::info!(model_id = %model_id, "Cancelling download");
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel every download, current and future
    pub fn cancel_all(&self) {
        tracing::info!(
            in_flight = self.inner.cancels.len(),
            "Cancelling all downloads"
        );
        self.inner.shutdown.cancel();
    }

    /// Keep the model's artifact out of disk eviction until the pin is dropped
    pub fn pin_artifact(&self, model_id: &str) -> ArtifactPin {
        *self.inner.pins.entry(model_id.to_string()).or_insert(0) += 1;
        ArtifactPin {
            pins: Arc::clone(&self.inner.pins),
            model_id: model_id.to_string(),
        }
    }

    pub fn is_pinned(&self, model_id: &str) -> bool {
        self.inner.pins.get(model_id).is_some_and(|c| *c > 0)
    }

    fn pin_count(&self, model_id: &str) -> usize {
        self.inner.pins.get(model_id).map_or(0, |c| *c)
    }

    /// Remove a cached artifact explicitly
    ///
    /// Fails with `InUse` while the artifact is pinned and with
    /// `AlreadyInProgress` while it is being downloaded.
    pub async fn evict_cached(&self, model_id: &str) -> ManagerResult<Option<CacheEntry>> {
        self.inner.catalog.get(model_id)?;
        let ledger = self.inner.ledger.lock().await;

        if self.is_pinned(model_id) {
            return Err(ManagerError::InUse {
                model_id: model_id.to_string(),
                leases: self.pin_count(model_id),
            });
        }
        if self.inner.inflight.is_running(model_id) {
            return Err(ManagerError::AlreadyInProgress {
                model_id: model_id.to_string(),
            });
        }

        let Some(entry) = self.inner.store.peek(model_id).await else {
            return Ok(None);
        };
        let trash = self.retire_artifact(&entry, "explicit").await?;
        drop(ledger);

        purge(trash).await;
        self.publish_usage().await;
        Ok(Some(entry))
    }

    /// Remove artifacts idle longer than the cleanup age
    ///
    /// Pinned and downloading models are skipped. Returns the removed ids.
    pub async fn cleanup_expired(&self) -> ManagerResult<Vec<String>> {
        let ledger = self.inner.ledger.lock().await;
        let now = Utc::now();

        let expired: Vec<CacheEntry> = self
            .inner
            .store
            .list_all()
            .await
            .into_iter()
            .filter(|e| e.idle_for(now) > self.inner.config.cleanup_age)
            .filter(|e| !self.is_pinned(&e.model_id) && !ledger.is_reserved(&e.model_id))
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        let mut trash = Vec::with_capacity(expired.len());
        let mut failure = None;
        for entry in &expired {
            match self.retire_artifact(entry, "expired").await {
                Ok(path) => {
                    trash.extend(path);
                    removed.push(entry.model_id.clone());
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(ledger);

        purge(trash).await;
        if let Some(e) = failure {
            self.publish_usage().await;
            return Err(e);
        }
        self.purge_leftover_trash().await;
        let stale_staging = self.remove_abandoned_staging(now).await;

        if !removed.is_empty() || stale_staging > 0 {
            tracing::info!(
                removed = ?removed,
                stale_staging,
                "Cache cleanup finished"
            );
        }
        self.publish_usage().await;
        Ok(removed)
    }

    pub async fn usage(&self) -> CacheUsage {
        let reserved = self.inner.ledger.lock().await.reserved_bytes();
        let mut pinned: Vec<String> = self.inner.pins.iter().map(|e| e.key().clone()).collect();
        pinned.sort();
        let mut downloads_in_flight = self.inner.inflight.running();
        downloads_in_flight.sort();

        CacheUsage {
            used_gb: self.inner.store.total_usage_gb().await,
            max_gb: bytes_to_gb(self.inner.config.max_cache_bytes),
            reserved_gb: bytes_to_gb(reserved),
            entries: self.inner.store.list_all().await,
            downloads_in_flight,
            pinned,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn spawn_fetch(
        &self,
        descriptor: Arc<ModelDescriptor>,
    ) -> (SharedResult<CacheEntry>, bool) {
        let model_id = descriptor.id.clone();

        // Registered before the task starts so an early `cancel` is not lost
        let (cancel, registered) = match self.inner.cancels.entry(model_id.clone()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => (e.insert(self.inner.shutdown.child_token()).clone(), true),
        };

        let this = self.clone();
        let key = model_id.clone();
        let (result, joined) = self.inner.inflight.run(&model_id, async move {
            let result = this.fetch(descriptor, &cancel).await;
            this.inner.cancels.remove(&key);
            result
        });
        if joined && registered {
            // The running transfer already dropped its own token
            self.inner.cancels.remove(&model_id);
        }
        (result, joined)
    }

    /// Validated entry with a refreshed access time
    async fn cache_hit(&self, model_id: &str) -> ManagerResult<Option<CacheEntry>> {
        let ledger = self.inner.ledger.lock().await;
        let recorded = self.inner.store.peek(model_id).await.is_some();

        if self.inner.store.get(model_id).await?.is_some() {
            metrics::record_cache_hit(model_id);
            return self.inner.store.touch(model_id).await;
        }
        if !recorded {
            return Ok(None);
        }

        // The record was dropped as stale; its files cannot be trusted
        let dir = self.layout().model_dir(model_id);
        let trash = move_to_trash(&dir, &self.layout().trash_root())
            .await
            .map_err(|e| ManagerError::storage("remove stale artifact", e))?;
        drop(ledger);

        purge(trash).await;
        self.publish_usage().await;
        Ok(None)
    }

    /// The coalesced body of `ensure_cached`
    async fn fetch(
        &self,
        descriptor: Arc<ModelDescriptor>,
        cancel: &CancellationToken,
    ) -> ManagerResult<CacheEntry> {
        let model_id = descriptor.id.clone();

        // A transfer that finished just before this one was registered
        if let Some(entry) = self.cache_hit(&model_id).await? {
            return Ok(entry);
        }
        metrics::record_cache_miss(&model_id);

        let _pin = self.pin_artifact(&model_id);

        let started = Instant::now();
        let result = self.download(&descriptor, cancel).await;

        self.inner.ledger.lock().await.release(&model_id);

        match &result {
            Ok(entry) => {
                tracing::info!(
                    model_id = %model_id,
                    size_gb = entry.size_gb(),
                    revision = %entry.revision,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Artifact cached"
                );
                let _ = self.inner.event_tx.send(ModelEvent::Cached {
                    model_id: model_id.clone(),
                    size_bytes: entry.size_bytes,
                });
            }
            Err(e) => {
                tracing::warn!(model_id = %model_id, error = %e, "Download failed");
                metrics::record_download_failure(&model_id, e.kind());
            }
        }
        self.publish_usage().await;

        result
    }

    async fn download(
        &self,
        descriptor: &ModelDescriptor,
        cancel: &CancellationToken,
    ) -> ManagerResult<CacheEntry> {
        let model_id = descriptor.id.as_str();

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(model_id)),
            permit = self.inner.permits.acquire() => permit
                .map_err(|_| ManagerError::Internal("download semaphore closed".into()))?,
        };

        let manifest = self
            .with_retries(model_id, cancel, || async {
                self.inner
                    .source
                    .manifest(&descriptor.source_name)
                    .await
                    .map_err(TransferFailure::from)
            })
            .await?;

        let total_bytes = manifest.total_bytes();
        tracing::info!(
            model_id = %model_id,
            source = self.inner.source.name(),
            source_name = %descriptor.source_name,
            revision = %manifest.revision,
            files = manifest.files.len(),
            size_gb = bytes_to_gb(total_bytes),
            "Downloading artifact"
        );

        self.reserve_space(model_id, total_bytes).await?;

        if let Some(entry) = self.adopt_orphan(model_id, &manifest).await? {
            return Ok(entry);
        }

        let staging = self.layout().staging_dir(model_id);
        self.prepare_staging(model_id, &staging, &manifest.revision)
            .await?;

        let transfer = self
            .with_retries(model_id, cancel, || {
                self.transfer_all(descriptor, &manifest, &staging, cancel)
            })
            .await;

        if let Err(e) = transfer {
            if matches!(
                e,
                ManagerError::Cancelled { .. } | ManagerError::IntegrityError { .. }
            ) {
                self.discard_staging(model_id, &staging).await;
            } else {
                tracing::info!(
                    model_id = %model_id,
                    staging = ?staging,
                    "Keeping staged files for a later resume"
                );
            }
            return Err(e);
        }

        let files = match self.verify_dir(model_id, &manifest, &staging).await {
            Ok(files) => files,
            Err(e) => {
                metrics::record_integrity_failure(model_id);
                self.discard_staging(model_id, &staging).await;
                return Err(e);
            }
        };

        self.commit(model_id, &manifest, files, &staging).await
    }

    /// Run `attempt` until it succeeds, backing off between transient failures
    async fn with_retries<T, F, Fut>(
        &self,
        model_id: &str,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> ManagerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferFailure>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(TransferFailure::Local(e)) => return Err(e),
                Err(TransferFailure::Source(e)) => e,
            };

            if !err.is_retryable() || attempts > self.inner.config.max_retries {
                return Err(ManagerError::TransferError {
                    model_id: model_id.to_string(),
                    attempts,
                    reason: err.to_string(),
                });
            }

            let delay = self.inner.config.retry_base_delay * 2u32.saturating_pow(attempts - 1);
            tracing::warn!(
                model_id = %model_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transfer attempt failed, retrying"
            );
            metrics::record_download_retry(model_id);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(model_id)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Reserve quota for a transfer, evicting idle artifacts if needed
    ///
    /// Nothing is evicted unless enough space can be freed.
    async fn reserve_space(&self, model_id: &str, bytes: u64) -> ManagerResult<()> {
        let mut ledger = self.inner.ledger.lock().await;
        let store = &self.inner.store;

        let used = store.total_usage_bytes().await;
        let shortfall = ledger.shortfall(used, bytes);
        let mut trash = Vec::new();

        if shortfall > 0 {
            let candidates = self.eviction_candidates(model_id, &ledger).await;
            let evictable: u64 = candidates.iter().map(|e| e.size_bytes).sum();

            if evictable < shortfall {
                return Err(ManagerError::QuotaExceeded {
                    model_id: model_id.to_string(),
                    required_gb: bytes_to_gb(bytes),
                    available_gb: bytes_to_gb(ledger.available_bytes(used)),
                    evictable_gb: bytes_to_gb(evictable),
                    max_gb: bytes_to_gb(ledger.max_bytes()),
                });
            }

            let mut freed = 0u64;
            for entry in candidates {
                if freed >= shortfall {
                    break;
                }
                tracing::info!(
                    model_id = %entry.model_id,
                    for_model = %model_id,
                    size_gb = entry.size_gb(),
                    last_accessed_at = %entry.last_accessed_at,
                    "Evicting cached artifact to free quota"
                );
                match self.retire_artifact(&entry, "quota").await {
                    Ok(path) => trash.extend(path),
                    Err(e) => {
                        drop(ledger);
                        purge(trash).await;
                        return Err(e);
                    }
                }
                freed += entry.size_bytes;
            }
        }

        let used = store.total_usage_bytes().await;
        let reserved = ledger.try_reserve(model_id, used, bytes);
        let available_gb = bytes_to_gb(ledger.available_bytes(used));
        drop(ledger);
        purge(trash).await;

        if !reserved {
            return Err(ManagerError::QuotaExceeded {
                model_id: model_id.to_string(),
                required_gb: bytes_to_gb(bytes),
                available_gb,
                evictable_gb: 0.0,
                max_gb: bytes_to_gb(self.inner.config.max_cache_bytes),
            });
        }
        Ok(())
    }

    /// Artifacts that may be evicted, in eviction order
    ///
    /// Entries idle past the cleanup age come first; within each group the
    /// least recently accessed goes first.
    async fn eviction_candidates(
        &self,
        for_model: &str,
        ledger: &StorageBudget,
    ) -> Vec<CacheEntry> {
        let now = Utc::now();
        let cleanup_age = self.inner.config.cleanup_age;

        let mut candidates: Vec<CacheEntry> = self
            .inner
            .store
            .list_all()
            .await
            .into_iter()
            .filter(|e| e.model_id != for_model)
            .filter(|e| !self.is_pinned(&e.model_id) && !ledger.is_reserved(&e.model_id))
            .collect();

        candidates.sort_by_key(|e| (e.idle_for(now) <= cleanup_age, e.last_accessed_at));
        candidates
    }

    /// Delete an artifact's record and move its files to the trash
    ///
    /// Called with the ledger held; the returned trash path is purged after
    /// the ledger is released.
    async fn retire_artifact(
        &self,
        entry: &CacheEntry,
        reason: &str,
    ) -> ManagerResult<Option<PathBuf>> {
        self.inner.store.delete(&entry.model_id).await?;
        let trash = move_to_trash(&entry.path, &self.layout().trash_root())
            .await
            .map_err(|e| ManagerError::storage("remove cached artifact", e))?;

        metrics::record_cache_eviction(&entry.model_id, reason);
        let _ = self.inner.event_tx.send(ModelEvent::CacheEvicted {
            model_id: entry.model_id.clone(),
            size_bytes: entry.size_bytes,
        });
        tracing::info!(
            model_id = %entry.model_id,
            reason = reason,
            size_gb = entry.size_gb(),
            "Removed cached artifact"
        );
        Ok(trash)
    }

    /// Delete trash left behind by a previous process
    async fn purge_leftover_trash(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(self.layout().trash_root()).await else {
            return;
        };
        let mut leftover = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            leftover.push(entry.path());
        }
        purge(leftover).await;
    }

    /// Record an unrecorded artifact directory left by an interrupted commit
    ///
    /// A directory that does not match the manifest is removed instead.
    async fn adopt_orphan(
        &self,
        model_id: &str,
        manifest: &ArtifactManifest,
    ) -> ManagerResult<Option<CacheEntry>> {
        let dir = self.layout().model_dir(model_id);
        if !dir.is_dir() {
            return Ok(None);
        }

        match self.verify_dir(model_id, manifest, &dir).await {
            Ok(files) => {
                tracing::info!(model_id = %model_id, path = ?dir, "Adopting unrecorded artifact");
                let entry = self.record(model_id, manifest, files, dir).await?;
                Ok(Some(entry))
            }
            Err(e) => {
                tracing::warn!(
                    model_id = %model_id,
                    path = ?dir,
                    error = %e,
                    "Removing unrecorded artifact that does not match upstream"
                );
                remove_dir_if_exists(&dir)
                    .await
                    .map_err(|e| ManagerError::storage("remove orphaned artifact", e))?;
                Ok(None)
            }
        }
    }

    /// Create the staging directory, keeping staged bytes only for the same revision
    async fn prepare_staging(
        &self,
        model_id: &str,
        staging: &Path,
        revision: &str,
    ) -> ManagerResult<()> {
        let tag = staging.join(REVISION_TAG);
        match tokio::fs::read_to_string(&tag).await {
            Ok(staged) if staged.trim() == revision => {
                tracing::info!(model_id = %model_id, revision = %revision, "Resuming staged download");
                return Ok(());
            }
            Ok(staged) => {
                tracing::info!(
                    model_id = %model_id,
                    staged = %staged.trim(),
                    upstream = %revision,
                    "Upstream revision changed, discarding staged files"
                );
            }
            Err(_) => {}
        }

        remove_dir_if_exists(staging)
            .await
            .map_err(|e| ManagerError::storage("clear staging directory", e))?;
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| ManagerError::storage("create staging directory", e))?;
        tokio::fs::write(&tag, revision)
            .await
            .map_err(|e| ManagerError::storage("write staging revision", e))
    }

    async fn discard_staging(&self, model_id: &str, staging: &Path) {
        if let Err(e) = remove_dir_if_exists(staging).await {
            tracing::warn!(model_id = %model_id, error = %e, "Failed to remove staging directory");
        }
    }

    /// One attempt at moving every incomplete file into staging
    async fn transfer_all(
        &self,
        descriptor: &ModelDescriptor,
        manifest: &ArtifactManifest,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TransferFailure> {
        let mut tracker = ProgressTracker {
            tx: self.inner.progress_tx.clone(),
            model_id: descriptor.id.clone(),
            total: manifest.total_bytes(),
            transferred: 0,
            session_bytes: 0,
            started: Instant::now(),
            last_emit: None,
            interval: self.inner.config.progress_interval,
        };

        for file in &manifest.files {
            let target = staging.join(&file.path);
            let staged = match tokio::fs::metadata(&target).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };

            if staged == file.size {
                tracker.resumed(staged);
                continue;
            }
            let offset = if staged > file.size { 0 } else { staged };
            tracker.resumed(offset);

            self.transfer_file(descriptor, manifest, file, &target, offset, &mut tracker, cancel)
                .await?;
        }

        tracker.emit("");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer_file(
        &self,
        descriptor: &ModelDescriptor,
        manifest: &ArtifactManifest,
        file: &ManifestFile,
        target: &Path,
        offset: u64,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), TransferFailure> {
        let model_id = descriptor.id.as_str();

        let idle_timeout = self.inner.config.idle_timeout;
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(model_id).into()),
            fetched = tokio::time::timeout(idle_timeout, self.inner.source.fetch(
                &descriptor.source_name,
                &manifest.revision,
                &file.path,
                offset,
            )) => fetched.map_err(|_| stalled(&file.path, idle_timeout))??,
        };

        let start = fetched.start.min(offset);
        if start < offset {
            tracker.rewind(offset - start);
        }
        tracing::debug!(model_id = %model_id, file = %file.path, start, size = file.size, "Fetching file");

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ManagerError::storage("create staging directory", e))?;
        }
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(target)
            .await
            .map_err(|e| ManagerError::storage("open staged file", e))?;
        handle
            .set_len(start)
            .await
            .map_err(|e| ManagerError::storage("truncate staged file", e))?;
        handle
            .seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| ManagerError::storage("seek staged file", e))?;

        let mut writer = BufWriter::with_capacity(self.inner.config.chunk_size_bytes.max(1), handle);
        let mut written = start;
        let mut stream = fetched.stream;

        let outcome: Result<(), TransferFailure> = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(cancelled(model_id).into()),
                next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
                    Ok(next) => next,
                    Err(_) => break Err(stalled(&file.path, idle_timeout).into()),
                },
            };

            match next {
                None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(chunk)) => {
                    written += chunk.len() as u64;
                    if written > file.size {
                        break Err(ManagerError::IntegrityError {
                            model_id: model_id.to_string(),
                            reason: format!(
                                "'{}' is larger than the advertised {} bytes",
                                file.path, file.size
                            ),
                        }
                        .into());
                    }
                    if let Err(e) = writer.write_all(&chunk).await {
                        break Err(ManagerError::storage("write staged file", e).into());
                    }
                    tracker.advance(&file.path, chunk.len() as u64);
                }
            }
        };

        // Persist whatever arrived so the next attempt can resume from it
        writer
            .flush()
            .await
            .map_err(|e| ManagerError::storage("flush staged file", e))?;
        writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| ManagerError::storage("sync staged file", e))?;
        outcome?;

        if written < file.size {
            return Err(SourceError::Transient(format!(
                "'{}' ended after {} of {} bytes",
                file.path, written, file.size
            ))
            .into());
        }
        Ok(())
    }

    /// Check every manifest file and the required markers in `dir`
    async fn verify_dir(
        &self,
        model_id: &str,
        manifest: &ArtifactManifest,
        dir: &Path,
    ) -> ManagerResult<Vec<ArtifactFile>> {
        let files: Vec<ArtifactFile> = manifest
            .files
            .iter()
            .map(|f| ArtifactFile {
                path: f.path.clone(),
                size: f.size,
            })
            .collect();

        let missing = self.layout().missing_files(dir, &files);
        if !missing.is_empty() {
            return Err(ManagerError::IntegrityError {
                model_id: model_id.to_string(),
                reason: format!("missing required files: {}", missing.join(", ")),
            });
        }

        let dir = dir.to_path_buf();
        let expected = manifest.files.clone();
        let mismatch = tokio::task::spawn_blocking(move || first_mismatch(&dir, &expected))
            .await
            .map_err(|e| ManagerError::Internal(e.to_string()))?;

        match mismatch {
            None => Ok(files),
            Some(reason) => {
                tracing::error!(model_id = %model_id, reason = %reason, "Artifact failed verification");
                Err(ManagerError::IntegrityError {
                    model_id: model_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Move verified staging into place and write the record
    async fn commit(
        &self,
        model_id: &str,
        manifest: &ArtifactManifest,
        files: Vec<ArtifactFile>,
        staging: &Path,
    ) -> ManagerResult<CacheEntry> {
        let final_dir = self.layout().model_dir(model_id);

        // Without its tag an interrupted staging directory is never resumed
        let _ = tokio::fs::remove_file(staging.join(REVISION_TAG)).await;
        remove_dir_if_exists(&final_dir)
            .await
            .map_err(|e| ManagerError::storage("clear artifact directory", e))?;
        tokio::fs::rename(staging, &final_dir)
            .await
            .map_err(|e| ManagerError::storage("move artifact into cache", e))?;

        let entry = self.record(model_id, manifest, files, final_dir).await?;
        metrics::record_download_completed(model_id, entry.size_bytes);
        Ok(entry)
    }

    async fn record(
        &self,
        model_id: &str,
        manifest: &ArtifactManifest,
        files: Vec<ArtifactFile>,
        dir: PathBuf,
    ) -> ManagerResult<CacheEntry> {
        let hash_dir = dir.clone();
        let hash_files = files.clone();
        let integrity_hash =
            tokio::task::spawn_blocking(move || fingerprint(&hash_dir, &hash_files))
                .await
                .map_err(|e| ManagerError::Internal(e.to_string()))?
                .map_err(|e| ManagerError::storage("fingerprint artifact", e))?;

        let now = Utc::now();
        let entry = CacheEntry {
            model_id: model_id.to_string(),
            path: dir,
            size_bytes: manifest.total_bytes(),
            downloaded_at: now,
            last_accessed_at: now,
            integrity_hash,
            valid: true,
            revision: manifest.revision.clone(),
            files,
        };
        self.inner.store.put(entry.clone()).await?;
        Ok(entry)
    }

    /// Remove staging directories of models that are not downloading and
    /// have not been written to within the cleanup age
    async fn remove_abandoned_staging(&self, now: chrono::DateTime<Utc>) -> usize {
        let root = self.layout().staging_root();
        let Ok(mut entries) = tokio::fs::read_dir(&root).await else {
            return 0;
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let model_id = urlencoding::decode(&name)
                .map(|s| s.into_owned())
                .unwrap_or(name);
            if self.inner.inflight.is_running(&model_id) {
                continue;
            }

            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .map(chrono::DateTime::<Utc>::from);
            let abandoned = match modified {
                Ok(at) => now.signed_duration_since(at) > self.inner.config.cleanup_age,
                Err(_) => false,
            };
            if abandoned && remove_dir_if_exists(&entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    async fn publish_usage(&self) {
        let store = &self.inner.store;
        metrics::update_cache_usage(store.total_usage_gb().await, store.len().await);
    }
}

/// Delete trashed directories; failures are logged and retried by cleanup
async fn purge(paths: impl IntoIterator<Item = PathBuf>) {
    for path in paths {
        if let Err(e) = remove_dir_if_exists(&path).await {
            tracing::warn!(path = ?path, error = %e, "Failed to delete evicted artifact");
        }
    }
}

fn stalled(path: &str, idle_timeout: Duration) -> SourceError {
    SourceError::Transient(format!(
        "'{}' received no data for {}ms",
        path,
        idle_timeout.as_millis()
    ))
}

fn cancelled(model_id: &str) -> ManagerError {
    ManagerError::Cancelled {
        model_id: model_id.to_string(),
    }
}

/// First size or digest mismatch between `dir` and the manifest
fn first_mismatch(dir: &Path, expected: &[ManifestFile]) -> Option<String> {
    for file in expected {
        let path = dir.join(&file.path);
        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => return Some(format!("'{}' unreadable: {}", file.path, e)),
        };
        if size != file.size {
            return Some(format!(
                "'{}' has {} bytes, expected {}",
                file.path, size, file.size
            ));
        }

        if let Some(want) = &file.sha256 {
            match sha256_file(&path) {
                Ok(got) if got.eq_ignore_ascii_case(want) => {}
                Ok(got) => {
                    return Some(format!(
                        "'{}' sha256 {} does not match expected {}",
                        file.path, got, want
                    ));
                }
                Err(e) => return Some(format!("'{}' unreadable: {}", file.path, e)),
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::descriptor;
    use crate::models::source::MirrorSource;
    use crate::storage::MemoryKvBackend;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        mirror: PathBuf,
        manager: DownloadManager,
    }

    async fn fixture(max_cache_bytes: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mirror = dir.path().join("mirror");
        let layout = CacheLayout::new(dir.path().join("cache"), vec!["config.json".into()]);
        let store = Arc::new(
            MetadataStore::open(Arc::new(MemoryKvBackend::new()), layout, true)
                .await
                .unwrap(),
        );
        let catalog = Arc::new(
            ModelCatalog::new(vec![
                descriptor("a", 1, &["code"], (4.0, 2.0, 1.0)),
                descriptor("b", 2, &["code"], (4.0, 2.0, 1.0)),
            ])
            .unwrap(),
        );
        let (event_tx, _) = broadcast::channel(16);
        let config = DownloadConfig {
            max_cache_bytes,
            retry_base_delay: Duration::from_millis(1),
            progress_interval: Duration::ZERO,
            ..Default::default()
        };
        let manager = DownloadManager::new(
            catalog,
            store,
            Arc::new(MirrorSource::new(&mirror)),
            config,
            event_tx,
        );
        Fixture {
            _dir: dir,
            mirror,
            manager,
        }
    }

    fn publish(mirror: &Path, model_id: &str, weights: usize) {
        let dir = mirror.join("org").join(model_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), b"{\"model_type\":\"llama\"}").unwrap();
        std::fs::write(dir.join("model.safetensors"), vec![3u8; weights]).unwrap();
    }

    #[tokio::test]
    async fn test_ensure_cached_downloads_then_hits() {
        let f = fixture(1 << 20).await;
        publish(&f.mirror, "a", 1000);

        let entry = f.manager.ensure_cached("a").await.unwrap();
        assert!(entry.valid);
        assert_eq!(entry.size_bytes, 1022);
        assert!(entry.path.join("model.safetensors").is_file());
        assert!(!f.manager.layout().staging_dir("a").exists());

        let again = f.manager.ensure_cached("a").await.unwrap();
        assert_eq!(again.downloaded_at, entry.downloaded_at);
        assert!(again.last_accessed_at >= entry.last_accessed_at);
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_found() {
        let f = fixture(1 << 20).await;
        let err = f.manager.ensure_cached("ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_upstream_missing_is_transfer_error_without_retries() {
        let f = fixture(1 << 20).await;
        let err = f.manager.ensure_cached("a").await.unwrap_err();
        match err {
            ManagerError::TransferError { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_required_marker_is_integrity_error() {
        let f = fixture(1 << 20).await;
        let dir = f.mirror.join("org/a");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.safetensors"), vec![1u8; 10]).unwrap();

        let err = f.manager.ensure_cached("a").await.unwrap_err();
        assert!(matches!(err, ManagerError::IntegrityError { .. }));
        assert!(f.manager.store().is_empty().await);
        assert!(!f.manager.layout().staging_dir("a").exists());
    }

    #[tokio::test]
    async fn test_quota_exceeded_evicts_nothing() {
        let f = fixture(1500).await;
        publish(&f.mirror, "a", 1000);
        publish(&f.mirror, "b", 2000);
        f.manager.ensure_cached("a").await.unwrap();

        let err = f.manager.ensure_cached("b").await.unwrap_err();
        assert!(matches!(err, ManagerError::QuotaExceeded { .. }));
        assert!(f.manager.store().peek("a").await.is_some());
    }

    #[tokio::test]
    async fn test_pinned_artifact_is_not_evicted() {
        let f = fixture(1500).await;
        publish(&f.mirror, "a", 1000);
        publish(&f.mirror, "b", 1000);
        f.manager.ensure_cached("a").await.unwrap();

        let pin = f.manager.pin_artifact("a");
        let err = f.manager.ensure_cached("b").await.unwrap_err();
        assert!(matches!(err, ManagerError::QuotaExceeded { .. }));

        drop(pin);
        assert!(!f.manager.is_pinned("a"));
        f.manager.ensure_cached("b").await.unwrap();
        assert!(f.manager.store().peek("a").await.is_none());
        assert!(!f.manager.layout().model_dir("a").exists());
    }

    #[tokio::test]
    async fn test_evict_cached_respects_pins() {
        let f = fixture(1 << 20).await;
        publish(&f.mirror, "a", 100);
        f.manager.ensure_cached("a").await.unwrap();

        let pin = f.manager.pin_artifact("a");
        let err = f.manager.evict_cached("a").await.unwrap_err();
        assert!(matches!(err, ManagerError::InUse { leases: 1, .. }));
        drop(pin);

        let removed = f.manager.evict_cached("a").await.unwrap();
        assert!(removed.is_some());
        assert!(f.manager.evict_cached("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_entries() {
        let f = fixture(1 << 20).await;
        publish(&f.mirror, "a", 100);
        publish(&f.mirror, "b", 100);
        let mut old = f.manager.ensure_cached("a").await.unwrap();
        f.manager.ensure_cached("b").await.unwrap();

        old.last_accessed_at = Utc::now() - chrono::Duration::days(45);
        f.manager.store().put(old).await.unwrap();

        let removed = f.manager.cleanup_expired().await.unwrap();
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(f.manager.store().peek("b").await.is_some());
    }

    #[tokio::test]
    async fn test_progress_is_reported() {
        let f = fixture(1 << 20).await;
        publish(&f.mirror, "a", 4096);
        let mut rx = f.manager.subscribe_progress();

        f.manager.ensure_cached("a").await.unwrap();

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(last.bytes_transferred, last.total_bytes);
        assert_eq!(last.percent, 100.0);
    }

    #[test]
    fn test_first_mismatch_detects_digest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("x"), b"abc").unwrap();
        let good = ManifestFile {
            path: "x".into(),
            size: 3,
            sha256: Some(
                "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".into(),
            ),
        };
        assert!(first_mismatch(dir.path(), &[good.clone()]).is_none());

        let bad = ManifestFile {
            sha256: Some("00".into()),
            ..good.clone()
        };
        assert!(first_mismatch(dir.path(), &[bad]).unwrap().contains("sha256"));

        let short = ManifestFile { size: 4, ..good };
        assert!(first_mismatch(dir.path(), &[short]).unwrap().contains("4"));
    }

    #[test]
    fn test_artifact_pin_counts() {
        let pins = Arc::new(DashMap::new());
        let make = || {
            *pins.entry("m".to_string()).or_insert(0) += 1;
            ArtifactPin {
                pins: Arc::clone(&pins),
                model_id: "m".into(),
            }
        };
        let first = make();
        let second = make();
        assert_eq!(*pins.get("m").unwrap(), 2);
        drop(first);
        assert_eq!(*pins.get("m").unwrap(), 1);
        drop(second);
        assert!(pins.get("m").is_none());
    }
}
