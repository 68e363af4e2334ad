//! Cache metadata store
//!
//! Persisted index of validated on-disk artifacts. Every record lives in a
//! [`KvBackend`] and is mirrored in memory so lookups and usage totals never
//! touch the filesystem. Records that no longer match the filesystem are
//! dropped lazily, the first time they are read.

use super::cache::{ArtifactFile, CacheLayout, fingerprint};
use crate::budget::bytes_to_gb;
use crate::error::{ManagerError, ManagerResult};
use crate::storage::KvBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persisted record describing one cached artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub model_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Fingerprint digest of `files`, see [`fingerprint`]
    pub integrity_hash: String,
    pub valid: bool,
    /// Upstream revision the artifact was fetched at
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub files: Vec<ArtifactFile>,
}

impl CacheEntry {
    pub fn size_gb(&self) -> f64 {
        bytes_to_gb(self.size_bytes)
    }

    /// Time since the artifact was last accessed
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_accessed_at)
    }
}

/// Why a stored record was rejected on access
#[derive(Debug)]
enum Staleness {
    MarkedInvalid,
    MissingFiles(Vec<String>),
    FingerprintMismatch,
    Unreadable(String),
}

impl std::fmt::Display for Staleness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Staleness::MarkedInvalid => f.write_str("marked invalid"),
            Staleness::MissingFiles(files) => write!(f, "missing files: {}", files.join(", ")),
            Staleness::FingerprintMismatch => f.write_str("fingerprint mismatch"),
            Staleness::Unreadable(reason) => write!(f, "unreadable: {}", reason),
        }
    }
}

/// Fast persisted index of cached artifacts
pub struct MetadataStore {
    backend: Arc<dyn KvBackend>,
    layout: CacheLayout,
    entries: RwLock<HashMap<String, CacheEntry>>,
    verify_on_access: bool,
}

impl MetadataStore {
    /// Open the store and load every persisted record into memory
    pub async fn open(
        backend: Arc<dyn KvBackend>,
        layout: CacheLayout,
        verify_on_access: bool,
    ) -> ManagerResult<Self> {
        let mut entries = HashMap::new();

        for (key, bytes) in backend.scan().await? {
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) if entry.valid && entry.model_id == key => {
                    entries.insert(key, entry);
                }
                Ok(_) => {
                    tracing::warn!(model_id = %key, "Dropping invalid cache record");
                    backend.delete(&key).await?;
                }
                Err(e) => {
                    tracing::warn!(model_id = %key, error = %e, "Dropping unparseable cache record");
                    backend.delete(&key).await?;
                }
            }
        }

        tracing::info!(
            entries = entries.len(),
            usage_gb = bytes_to_gb(entries.values().map(|e| e.size_bytes).sum()),
            "Cache metadata loaded"
        );

        Ok(Self {
            backend,
            layout,
            entries: RwLock::new(entries),
            verify_on_access,
        })
    }

    /// Validated entry for a model
    ///
    /// A record whose files are missing or whose fingerprint no longer matches
    /// is deleted and reported as absent.
    pub async fn get(&self, model_id: &str) -> ManagerResult<Option<CacheEntry>> {
        let Some(entry) = self.peek(model_id).await else {
            return Ok(None);
        };

        match self.staleness(&entry).await {
            None => Ok(Some(entry)),
            Some(reason) => {
                tracing::warn!(
                    model_id = %model_id,
                    reason = %reason,
                    path = ?entry.path,
                    "Cache record does not match filesystem, dropping it"
                );
                self.delete_if_unchanged(&entry).await?;
                Ok(None)
            }
        }
    }

    /// Entry as recorded, without checking the filesystem
    pub async fn peek(&self, model_id: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(model_id).cloned()
    }

    pub async fn put(&self, entry: CacheEntry) -> ManagerResult<()> {
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| ManagerError::storage("serialize cache record", e))?;
        self.backend.put(&entry.model_id, &bytes).await?;
        self.entries
            .write()
            .await
            .insert(entry.model_id.clone(), entry);
        Ok(())
    }

    /// Remove the record, returning it if it existed
    pub async fn delete(&self, model_id: &str) -> ManagerResult<Option<CacheEntry>> {
        self.backend.delete(model_id).await?;
        Ok(self.entries.write().await.remove(model_id))
    }

    /// Refresh `last_accessed_at`, returning the updated entry
    pub async fn touch(&self, model_id: &str) -> ManagerResult<Option<CacheEntry>> {
        let updated = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(model_id) {
                Some(entry) => {
                    entry.last_accessed_at = Utc::now();
                    entry.clone()
                }
                None => return Ok(None),
            }
        };

        let bytes = serde_json::to_vec(&updated)
            .map_err(|e| ManagerError::storage("serialize cache record", e))?;
        self.backend.put(model_id, &bytes).await?;
        Ok(Some(updated))
    }

    /// Every recorded entry, ordered by model id
    pub async fn list_all(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        entries
    }

    pub async fn total_usage_bytes(&self) -> u64 {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.valid)
            .map(|e| e.size_bytes)
            .sum()
    }

    pub async fn total_usage_gb(&self) -> f64 {
        bytes_to_gb(self.total_usage_bytes().await)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    async fn staleness(&self, entry: &CacheEntry) -> Option<Staleness> {
        if !entry.valid {
            return Some(Staleness::MarkedInvalid);
        }

        let missing = self.layout.missing_files(&entry.path, &entry.files);
        if !missing.is_empty() {
            return Some(Staleness::MissingFiles(missing));
        }

        if !self.verify_on_access {
            return None;
        }

        let dir = entry.path.clone();
        let files = entry.files.clone();
        match tokio::task::spawn_blocking(move || fingerprint(&dir, &files)).await {
            Ok(Ok(digest)) if digest == entry.integrity_hash => None,
            Ok(Ok(_)) => Some(Staleness::FingerprintMismatch),
            Ok(Err(e)) => Some(Staleness::Unreadable(e.to_string())),
            Err(e) => Some(Staleness::Unreadable(e.to_string())),
        }
    }

    /// Delete a stale record unless it was replaced while being validated
    async fn delete_if_unchanged(&self, stale: &CacheEntry) -> ManagerResult<()> {
        let mut entries = self.entries.write().await;
        let unchanged = entries
            .get(&stale.model_id)
            .is_some_and(|current| current.downloaded_at == stale.downloaded_at);
        if unchanged {
            self.backend.delete(&stale.model_id).await?;
            entries.remove(&stale.model_id);
        }
        Ok(())
    }
}
