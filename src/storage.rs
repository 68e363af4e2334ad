//! Durable key-value backends for cache metadata

use crate::error::{ManagerError, ManagerResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Key-value interface used by the cache metadata store
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch the value stored under `key`
    async fn get(&self, key: &str) -> ManagerResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: &[u8]) -> ManagerResult<()>;

    /// Remove `key`; removing a missing key is not an error
    async fn delete(&self, key: &str) -> ManagerResult<()>;

    /// Every key/value pair in the backend
    async fn scan(&self) -> ManagerResult<Vec<(String, Vec<u8>)>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// One file per key under a directory
///
/// Keys are percent-encoded into file names. Writes go to a temp file which is
/// synced and renamed over the record, so a crash leaves either the old or the
/// new value, never a torn one.
pub struct FileKvBackend {
    dir: PathBuf,
}

impl FileKvBackend {
    pub async fn open(dir: impl Into<PathBuf>) -> ManagerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ManagerError::storage(&format!("create {:?}", dir), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", urlencoding::encode(key), RECORD_EXTENSION))
    }
}

#[async_trait]
impl KvBackend for FileKvBackend {
    async fn get(&self, key: &str) -> ManagerResult<Option<Vec<u8>>> {
        match fs::read(self.record_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ManagerError::storage(&format!("read record '{}'", key), e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> ManagerResult<()> {
        let path = self.record_path(key);
        let temp_file = path.with_extension(TEMP_EXTENSION);

        let mut file = fs::File::create(&temp_file)
            .await
            .map_err(|e| ManagerError::storage("create temp record", e))?;
        file.write_all(value)
            .await
            .map_err(|e| ManagerError::storage("write record", e))?;
        file.sync_all()
            .await
            .map_err(|e| ManagerError::storage("sync record", e))?;

        fs::rename(&temp_file, &path)
            .await
            .map_err(|e| ManagerError::storage("rename temp record", e))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> ManagerResult<()> {
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ManagerError::storage(&format!("delete record '{}'", key), e)),
        }
    }

    async fn scan(&self) -> ManagerResult<Vec<(String, Vec<u8>)>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| ManagerError::storage("scan metadata dir", e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ManagerError::storage("scan metadata dir", e))?
        {
            let path = entry.path();
            let Some(stem) = path
                .extension()
                .filter(|ext| *ext == RECORD_EXTENSION)
                .and_then(|_| path.file_stem())
                .and_then(|s| s.to_str())
            else {
                // Leftover temp files from an interrupted write are ignored
                continue;
            };

            let key = match urlencoding::decode(stem) {
                Ok(key) => key.into_owned(),
                Err(e) => {
                    tracing::warn!(file = ?path, error = %e, "Skipping undecodable metadata record");
                    continue;
                }
            };

            let bytes = fs::read(&path)
                .await
                .map_err(|e| ManagerError::storage(&format!("read record '{}'", key), e))?;
            records.push((key, bytes));
        }

        Ok(records)
    }
}

/// In-process backend, used when persistence is disabled and in tests
#[derive(Default)]
pub struct MemoryKvBackend {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn get(&self, key: &str) -> ManagerResult<Option<Vec<u8>>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> ManagerResult<()> {
        self.records
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> ManagerResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self) -> ManagerResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_backend_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let backend = FileKvBackend::open(dir.path()).await.unwrap();

        assert!(backend.get("llama").await.unwrap().is_none());

        backend.put("llama", b"{\"a\":1}").await.unwrap();
        assert_eq!(backend.get("llama").await.unwrap().unwrap(), b"{\"a\":1}");

        backend.put("llama", b"{\"a\":2}").await.unwrap();
        assert_eq!(backend.get("llama").await.unwrap().unwrap(), b"{\"a\":2}");

        backend.delete("llama").await.unwrap();
        assert!(backend.get("llama").await.unwrap().is_none());

        // Deleting twice is fine
        backend.delete("llama").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_backend_no_temp_files_left() {
        let dir = TempDir::new().unwrap();
        let backend = FileKvBackend::open(dir.path()).await.unwrap();
        backend.put("m", b"x").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["m.json".to_string()]);
    }

    #[tokio::test]
    async fn test_file_backend_scan_decodes_keys_and_skips_temp() {
        let dir = TempDir::new().unwrap();
        let backend = FileKvBackend::open(dir.path()).await.unwrap();
        backend.put("a b", b"1").await.unwrap();
        backend.put("c%d", b"2").await.unwrap();
        std::fs::write(dir.path().join("orphan.tmp"), b"partial").unwrap();

        let mut records = backend.scan().await.unwrap();
        records.sort();
        assert_eq!(
            records,
            vec![
                ("a b".to_string(), b"1".to_vec()),
                ("c%d".to_string(), b"2".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn test_file_backend_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = FileKvBackend::open(dir.path()).await.unwrap();
            backend.put("persist", b"yes").await.unwrap();
        }
        let backend = FileKvBackend::open(dir.path()).await.unwrap();
        assert_eq!(backend.get("persist").await.unwrap().unwrap(), b"yes");
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryKvBackend::new();
        assert!(backend.is_empty().await);
        backend.put("k", b"v").await.unwrap();
        assert_eq!(backend.len().await, 1);
        assert_eq!(backend.scan().await.unwrap().len(), 1);
        backend.delete("k").await.unwrap();
        assert!(backend.get("k").await.unwrap().is_none());
    }
}
