//! On-disk cache layout and artifact fingerprinting
//!
//! Layout under the cache root:
//! ```text
//! <cache_root>/
//! ├── qwen-7b/                 # one directory per model id (percent-encoded)
//! │   ├── config.json
//! │   └── model.safetensors
//! ├── .staging/
//! │   └── coder-13b/           # in-progress transfer, never read as an artifact
//! │       ├── .revision
//! │       └── model.safetensors
//! ├── .trash/                  # evicted artifacts awaiting deletion
//! └── .metadata/               # FileKvBackend records
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes hashed from the head and from the tail of each file when fingerprinting
const FINGERPRINT_SAMPLE_BYTES: u64 = 1024 * 1024;

const STAGING_DIR: &str = ".staging";
const METADATA_DIR: &str = ".metadata";
const TRASH_DIR: &str = ".trash";

/// One file belonging to a cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the artifact directory
    pub path: String,
    pub size: u64,
}

/// Paths of everything the manager keeps under its cache root
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    required_files: Vec<String>,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>, required_files: Vec<String>) -> Self {
        Self {
            root: root.into(),
            required_files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn required_files(&self) -> &[String] {
        &self.required_files
    }

    /// Final artifact directory for a model
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(dir_name(model_id))
    }

    /// Staging directory a transfer writes into before the atomic rename
    pub fn staging_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(dir_name(model_id))
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    /// Evicted artifacts are renamed here, then deleted
    pub fn trash_root(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    /// Files that must exist for `dir` to be a usable artifact
    ///
    /// Returns the names of missing required marker files and entry files.
    pub fn missing_files(&self, dir: &Path, files: &[ArtifactFile]) -> Vec<String> {
        let mut missing: Vec<String> = self
            .required_files
            .iter()
            .filter(|name| !dir.join(name.as_str()).is_file())
            .cloned()
            .collect();

        missing.extend(
            files
                .iter()
                .filter(|f| !self.required_files.contains(&f.path))
                .filter(|f| !dir.join(&f.path).is_file())
                .map(|f| f.path.clone()),
        );

        missing
    }
}

/// Directory name for a model id
fn dir_name(model_id: &str) -> String {
    urlencoding::encode(model_id).into_owned()
}

/// Reject manifest paths that would escape the artifact directory
pub fn is_safe_relative_path(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Digest over every file's name, size and sampled content
///
/// Only the first and last `FINGERPRINT_SAMPLE_BYTES` of each file are read,
/// so validating a multi-gigabyte artifact on access stays cheap. Full content
/// hashes are checked once, at download time.
pub fn fingerprint(dir: &Path, files: &[ArtifactFile]) -> std::io::Result<String> {
    let mut sorted: Vec<&ArtifactFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for file in sorted {
        let path = dir.join(&file.path);
        let actual_size = std::fs::metadata(&path)?.len();

        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(actual_size.to_le_bytes());

        let mut handle = File::open(&path)?;
        let mut buf = vec![0u8; FINGERPRINT_SAMPLE_BYTES.min(actual_size) as usize];
        handle.read_exact(&mut buf)?;
        hasher.update(&buf);

        if actual_size > FINGERPRINT_SAMPLE_BYTES {
            let tail_len = FINGERPRINT_SAMPLE_BYTES.min(actual_size - FINGERPRINT_SAMPLE_BYTES);
            handle.seek(SeekFrom::End(-(tail_len as i64)))?;
            let mut tail = vec![0u8; tail_len as usize];
            handle.read_exact(&mut tail)?;
            hasher.update(&tail);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Full SHA-256 of a file's content
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Rename `dir` into `trash_root` under a unique name
///
/// Returns `None` when `dir` does not exist.
pub async fn move_to_trash(dir: &Path, trash_root: &Path) -> std::io::Result<Option<PathBuf>> {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    if tokio::fs::metadata(dir).await.is_err() {
        return Ok(None);
    }
    tokio::fs::create_dir_all(trash_root).await?;

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = trash_root.join(format!(
        "{}.{}.{}",
        name,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    match tokio::fs::rename(dir, &target).await {
        Ok(()) => Ok(Some(target)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a directory tree, treating "already gone" as success
pub async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
