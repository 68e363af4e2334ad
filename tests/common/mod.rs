//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use model_manager::error::{ManagerError, ManagerResult};
use model_manager::lifecycle::{LifecycleConfig, LifecycleManager};
use model_manager::models::source::{
    ArtifactManifest, ArtifactSource, FetchStream, MIRROR_MANIFEST, ManifestFile, SourceError,
};
use model_manager::models::{
    ArtifactMetadata, CacheEntry, CacheLayout, DownloadConfig, DownloadManager, MemoryTier,
    MemoryTiers, MetadataStore, MirrorSource, ModelBackend, ModelCatalog, ModelDescriptor,
    PerformanceTargets,
};
use model_manager::storage::FileKvBackend;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Bytes per chunk yielded by [`TestSource`]
pub const CHUNK: usize = 64;

pub fn model(id: &str, priority: i32, tags: &[&str], tiers: (f64, f64, f64)) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        source_name: format!("org/{}", id),
        display_name: String::new(),
        memory_tiers: MemoryTiers {
            base: tiers.0,
            optimized: tiers.1,
            minimum: tiers.2,
        },
        content_affinities: tags.iter().map(|t| t.to_string()).collect(),
        priority,
        performance_targets: PerformanceTargets::default(),
    }
}

/// Write a minimal artifact into the mirror
pub fn publish(mirror: &Path, source_name: &str, weight_bytes: usize) {
    let dir = mirror.join(source_name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), br#"{"model_type":"llama","hidden_size":64}"#).unwrap();
    let weights: Vec<u8> = (0..weight_bytes).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.join("model.safetensors"), weights).unwrap();
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write a `.manifest.json` pinning `revision` with real or overridden digests
pub fn write_manifest(mirror: &Path, source_name: &str, revision: &str, bad_digest_for: Option<&str>) {
    let dir = mirror.join(source_name);
    let files = ["config.json", "model.safetensors"]
        .iter()
        .map(|path| {
            let content = std::fs::read(dir.join(path)).unwrap();
            let sha256 = if bad_digest_for == Some(*path) {
                "0".repeat(64)
            } else {
                sha256_hex(&content)
            };
            ManifestFile {
                path: path.to_string(),
                size: content.len() as u64,
                sha256: Some(sha256),
            }
        })
        .collect();
    let manifest = ArtifactManifest {
        revision: revision.to_string(),
        files,
    };
    std::fs::write(dir.join(MIRROR_MANIFEST), serde_json::to_vec(&manifest).unwrap()).unwrap();
}

/// Mirror-backed source whose transfers can be made to fail, stall or ignore ranges
pub struct TestSource {
    mirror: MirrorSource,
    root: PathBuf,
    /// Number of upcoming fetches that break off with a transient error
    pub failing_fetches: AtomicUsize,
    /// Bytes a failing fetch delivers before breaking off
    pub cut_after: AtomicUsize,
    /// Fetches deliver one chunk and then hang
    pub stall: AtomicBool,
    /// Fetches answer from byte 0 regardless of the requested offset
    pub ignore_range: AtomicBool,
    pub manifest_calls: AtomicUsize,
    /// (path, requested offset) of every fetch
    pub fetches: Mutex<Vec<(String, u64)>>,
}

impl TestSource {
    pub fn new(root: &Path) -> Self {
        Self {
            mirror: MirrorSource::new(root),
            root: root.to_path_buf(),
            failing_fetches: AtomicUsize::new(0),
            cut_after: AtomicUsize::new(CHUNK * 2),
            stall: AtomicBool::new(false),
            ignore_range: AtomicBool::new(false),
            manifest_calls: AtomicUsize::new(0),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn fetches(&self) -> Vec<(String, u64)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fail_next(&self, count: usize, cut_after: usize) {
        self.cut_after.store(cut_after, Ordering::SeqCst);
        self.failing_fetches.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactSource for TestSource {
    async fn manifest(&self, source_name: &str) -> Result<ArtifactManifest, SourceError> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        self.mirror.manifest(source_name).await
    }

    async fn fetch(
        &self,
        source_name: &str,
        _revision: &str,
        path: &str,
        offset: u64,
    ) -> Result<FetchStream, SourceError> {
        self.fetches
            .lock()
            .unwrap()
            .push((path.to_string(), offset));

        let content = std::fs::read(self.root.join(source_name).join(path))
            .map_err(|e| SourceError::NotFound(e.to_string()))?;
        let start = if self.ignore_range.load(Ordering::SeqCst) {
            0
        } else {
            offset.min(content.len() as u64)
        };
        let mut body = content[start as usize..].to_vec();

        // Only files longer than the cut are broken off
        let cut_after = self.cut_after.load(Ordering::SeqCst);
        let failing = body.len() > cut_after
            && self
                .failing_fetches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            body.truncate(cut_after);
        }

        let mut chunks: Vec<Result<Bytes, SourceError>> = body
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        if self.stall.load(Ordering::SeqCst) {
            chunks.truncate(1);
            let stream = futures::stream::iter(chunks).chain(futures::stream::pending());
            return Ok(FetchStream {
                start,
                stream: stream.boxed(),
            });
        }
        if failing {
            chunks.push(Err(SourceError::Transient("connection reset".into())));
        }

        Ok(FetchStream {
            start,
            stream: futures::stream::iter(chunks).boxed(),
        })
    }

    fn name(&self) -> &'static str {
        "test"
    }
}

/// Backend that records calls and can be told to fail, panic or be slow
#[derive(Default)]
pub struct TestBackend {
    pub loads: Mutex<Vec<(String, MemoryTier)>>,
    pub unloads: Mutex<Vec<String>>,
    pub failing: Mutex<HashSet<String>>,
    pub failing_unloads: Mutex<HashSet<String>>,
    pub panicking: Mutex<HashSet<String>>,
    pub delay: Mutex<Option<Duration>>,
    pub unload_delay: Mutex<Option<Duration>>,
    pub resident: Mutex<HashMap<String, MemoryTier>>,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn load_count(&self, model_id: &str) -> usize {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == model_id)
            .count()
    }

    pub fn unloaded(&self) -> Vec<String> {
        self.unloads.lock().unwrap().clone()
    }

    pub fn fail(&self, model_id: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(model_id.to_string());
        } else {
            set.remove(model_id);
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_unload_delay(&self, delay: Duration) {
        *self.unload_delay.lock().unwrap() = Some(delay);
    }

    pub fn panic_on_load(&self, model_id: &str, panicking: bool) {
        let mut set = self.panicking.lock().unwrap();
        if panicking {
            set.insert(model_id.to_string());
        } else {
            set.remove(model_id);
        }
    }
}

#[async_trait]
impl ModelBackend for TestBackend {
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        artifact: &CacheEntry,
        tier: MemoryTier,
    ) -> ManagerResult<ArtifactMetadata> {
        self.loads
            .lock()
            .unwrap()
            .push((descriptor.id.clone(), tier));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let panics = self.panicking.lock().unwrap().contains(&descriptor.id);
        if panics {
            panic!("engine crashed while loading {}", descriptor.id);
        }
        if self.failing.lock().unwrap().contains(&descriptor.id) {
            return Err(ManagerError::Backend {
                model_id: descriptor.id.clone(),
                reason: "engine refused the model".into(),
            });
        }
        assert!(artifact.path.join("config.json").is_file());
        self.resident
            .lock()
            .unwrap()
            .insert(descriptor.id.clone(), tier);
        Ok(ArtifactMetadata::default())
    }

    async fn unload(&self, descriptor: &ModelDescriptor) -> ManagerResult<()> {
        let delay = *self.unload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_unloads.lock().unwrap().contains(&descriptor.id) {
            return Err(ManagerError::Backend {
                model_id: descriptor.id.clone(),
                reason: "engine did not release the model".into(),
            });
        }
        self.unloads.lock().unwrap().push(descriptor.id.clone());
        self.resident.lock().unwrap().remove(&descriptor.id);
        Ok(())
    }
}

/// A temp directory holding a mirror and a cache, with managers built on top
pub struct Env {
    pub dir: TempDir,
    pub mirror: PathBuf,
    pub source: Arc<TestSource>,
    pub catalog: Arc<ModelCatalog>,
    pub config: DownloadConfig,
}

impl Env {
    /// Every model is published to the mirror with `weight_bytes` of weights
    pub fn new(models: Vec<ModelDescriptor>, weight_bytes: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let mirror = dir.path().join("mirror");
        for m in &models {
            publish(&mirror, &m.source_name, weight_bytes);
        }

        Self {
            source: Arc::new(TestSource::new(&mirror)),
            catalog: Arc::new(ModelCatalog::new(models).unwrap()),
            config: DownloadConfig {
                max_cache_bytes: 1 << 30,
                retry_base_delay: Duration::from_millis(1),
                progress_interval: Duration::ZERO,
                ..Default::default()
            },
            mirror,
            dir,
        }
    }

    pub fn with_quota(mut self, max_cache_bytes: u64) -> Self {
        self.config.max_cache_bytes = max_cache_bytes;
        self
    }

    pub fn cache_root(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn layout(&self) -> CacheLayout {
        CacheLayout::new(self.cache_root(), vec!["config.json".to_string()])
    }

    /// Open a download manager over the on-disk cache, as a fresh process would
    pub async fn downloads(&self) -> DownloadManager {
        let layout = self.layout();
        let kv = Arc::new(FileKvBackend::open(layout.metadata_dir()).await.unwrap());
        let store = Arc::new(MetadataStore::open(kv, layout, true).await.unwrap());
        let (event_tx, _) = broadcast::channel(64);
        DownloadManager::new(
            self.catalog.clone(),
            store,
            self.source.clone(),
            self.config.clone(),
            event_tx,
        )
    }

    pub async fn lifecycle(&self, total_memory_gb: f64, backend: Arc<TestBackend>) -> LifecycleManager {
        LifecycleManager::new(
            self.catalog.clone(),
            self.downloads().await,
            backend,
            LifecycleConfig {
                total_memory_gb,
                safety_threshold: 1.0,
                preferred_tier: MemoryTier::Optimized,
                max_consecutive_errors: 3,
            },
        )
    }
}
