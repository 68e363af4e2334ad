//! Upstream artifact sources
//!
//! A source lists the files of an artifact (with sizes and, when published,
//! SHA-256 digests) and streams any file from a byte offset so interrupted
//! transfers can resume.

use super::cache::is_safe_relative_path;
use crate::error::{ManagerError, ManagerResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use hf_hub::api::tokio::{Api, ApiBuilder, ApiError};
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncSeekExt;

/// Name of the optional manifest a mirror directory may carry
pub const MIRROR_MANIFEST: &str = ".manifest.json";

/// One file of an upstream artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
    /// Hex SHA-256 of the content, when the upstream publishes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Everything needed to plan and verify a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Immutable upstream revision; staging data from another revision is discarded
    pub revision: String,
    pub files: Vec<ManifestFile>,
}

impl ArtifactManifest {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Reject manifests that would write outside the artifact directory
    pub fn validate(&self, source_name: &str) -> Result<(), SourceError> {
        if self.files.is_empty() {
            return Err(SourceError::Fatal(format!(
                "Upstream '{}' lists no files",
                source_name
            )));
        }
        if let Some(bad) = self.files.iter().find(|f| !is_safe_relative_path(&f.path)) {
            return Err(SourceError::Fatal(format!(
                "Upstream '{}' lists unsafe path '{}'",
                source_name, bad.path
            )));
        }
        Ok(())
    }
}

/// Failure talking to an upstream
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("not found upstream: {0}")]
    NotFound(String),
    /// Network hiccups, 5xx, rate limiting
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Body of a fetch
pub struct FetchStream {
    /// Offset the first yielded byte belongs to; 0 when the upstream ignored the range
    pub start: u64,
    pub stream: ByteStream,
}

/// Pull-based artifact transfer keyed by source name
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// List the artifact's files at the current upstream revision
    async fn manifest(&self, source_name: &str) -> Result<ArtifactManifest, SourceError>;

    /// Stream `path` at `revision`, starting at `offset` when ranges are supported
    async fn fetch(
        &self,
        source_name: &str,
        revision: &str,
        path: &str,
        offset: u64,
    ) -> Result<FetchStream, SourceError>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}

// ============================================================================
// Hugging Face Hub
// ============================================================================

/// Tree listing entry returned by the Hub API
#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    lfs: Option<LfsPointer>,
}

#[derive(Debug, Deserialize)]
struct LfsPointer {
    oid: String,
    size: u64,
}

/// Weight formats other than the preferred one, dropped when safetensors exist
const ALTERNATE_WEIGHT_SUFFIXES: &[&str] = &[
    ".bin", ".pt", ".pth", ".h5", ".msgpack", ".ot", ".ckpt",
];
const ALTERNATE_WEIGHT_DIRS: &[&str] = &["onnx/", "openvino/", "coreml/"];

/// Keep one weight format per artifact
///
/// Model repositories often ship the same weights for several frameworks;
/// only safetensors are needed when they are present.
pub fn select_weight_files(files: Vec<ManifestFile>) -> Vec<ManifestFile> {
    let has_safetensors = files.iter().any(|f| f.path.ends_with(".safetensors"));
    if !has_safetensors {
        return files;
    }

    files
        .into_iter()
        .filter(|f| {
            !ALTERNATE_WEIGHT_SUFFIXES.iter().any(|s| f.path.ends_with(s))
                && !ALTERNATE_WEIGHT_DIRS.iter().any(|d| f.path.starts_with(d))
        })
        .collect()
}

/// Hugging Face Hub source
///
/// hf-hub resolves the token and the immutable commit sha; file listing and
/// ranged downloads go through reqwest so transfers can resume mid-file.
pub struct HubSource {
    api: Api,
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HubSource {
    pub fn new(endpoint: &str, read_timeout: Duration) -> ManagerResult<Self> {
        let token = hf_hub::Cache::default().token();
        let endpoint = endpoint.trim_end_matches('/').to_string();

        let api = ApiBuilder::new()
            .with_endpoint(endpoint.clone())
            .with_token(token.clone())
            .build()
            .map_err(|e| ManagerError::Config(format!("Failed to create HF API client: {}", e)))?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("model-manager/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(read_timeout)
            .build()
            .map_err(|e| ManagerError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api,
            client,
            endpoint,
            token,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn classify(status: reqwest::StatusCode, what: &str) -> SourceError {
        if status == reqwest::StatusCode::NOT_FOUND {
            SourceError::NotFound(what.to_string())
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            SourceError::Transient(format!("{} returned {}", what, status))
        } else {
            SourceError::Fatal(format!("{} returned {}", what, status))
        }
    }

    /// hf-hub surfaces HTTP failures as request errors carrying the status
    fn classify_api(err: ApiError, source_name: &str) -> SourceError {
        match &err {
            ApiError::RequestError(e) => match e.status() {
                Some(status) => Self::classify(status, source_name),
                None => SourceError::Transient(format!("repo info for '{}': {}", source_name, err)),
            },
            _ => SourceError::Transient(format!("repo info for '{}': {}", source_name, err)),
        }
    }
}

#[async_trait]
impl ArtifactSource for HubSource {
    async fn manifest(&self, source_name: &str) -> Result<ArtifactManifest, SourceError> {
        let info = self
            .api
            .repo(Repo::new(source_name.to_string(), RepoType::Model))
            .info()
            .await
            .map_err(|e| Self::classify_api(e, source_name))?;

        let url = format!(
            "{}/api/models/{}/tree/{}?recursive=true",
            self.endpoint, source_name, info.sha
        );
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("tree listing: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::classify(response.status(), source_name));
        }

        let entries: Vec<TreeEntry> = response
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("tree listing body: {}", e)))?;

        let files = entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .map(|e| match e.lfs {
                Some(lfs) => ManifestFile {
                    path: e.path,
                    size: lfs.size,
                    sha256: Some(lfs.oid),
                },
                None => ManifestFile {
                    path: e.path,
                    size: e.size,
                    sha256: None,
                },
            })
            .collect();

        let manifest = ArtifactManifest {
            revision: info.sha,
            files: select_weight_files(files),
        };
        manifest.validate(source_name)?;
        Ok(manifest)
    }

    async fn fetch(
        &self,
        source_name: &str,
        revision: &str,
        path: &str,
        offset: u64,
    ) -> Result<FetchStream, SourceError> {
        let url = self
            .api
            .repo(Repo::with_revision(
                source_name.to_string(),
                RepoType::Model,
                revision.to_string(),
            ))
            .url(path);

        let mut request = self.authorized(self.client.get(&url));
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("GET {}: {}", path, e)))?;

        let start = match response.status() {
            reqwest::StatusCode::PARTIAL_CONTENT => offset,
            reqwest::StatusCode::OK => 0,
            status => return Err(Self::classify(status, path)),
        };

        if offset > 0 && start == 0 {
            tracing::debug!(path = %path, offset, "Upstream ignored range request, restarting file");
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| SourceError::Transient(e.to_string())))
            .boxed();

        Ok(FetchStream { start, stream })
    }

    fn name(&self) -> &'static str {
        "hub"
    }
}

// ============================================================================
// Local mirror
// ============================================================================

/// Directory mirror with one sub-directory per source name
///
/// A mirror may carry a `.manifest.json` next to the files to pin a revision
/// and publish digests; without one, the directory listing is the manifest.
pub struct MirrorSource {
    root: PathBuf,
}

impl MirrorSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn artifact_dir(&self, source_name: &str) -> Result<PathBuf, SourceError> {
        if !is_safe_relative_path(source_name) {
            return Err(SourceError::Fatal(format!(
                "Invalid source name '{}'",
                source_name
            )));
        }
        Ok(self.root.join(source_name))
    }
}

fn list_files(base: &Path, dir: &Path, out: &mut Vec<ManifestFile>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            list_files(base, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(base) {
            out.push(ManifestFile {
                path: relative.to_string_lossy().replace('\\', "/"),
                size: entry.metadata()?.len(),
                sha256: None,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl ArtifactSource for MirrorSource {
    async fn manifest(&self, source_name: &str) -> Result<ArtifactManifest, SourceError> {
        let dir = self.artifact_dir(source_name)?;
        if !dir.is_dir() {
            return Err(SourceError::NotFound(source_name.to_string()));
        }

        let manifest_path = dir.join(MIRROR_MANIFEST);
        let manifest = if manifest_path.is_file() {
            let content = tokio::fs::read(&manifest_path)
                .await
                .map_err(|e| SourceError::Transient(format!("read manifest: {}", e)))?;
            serde_json::from_slice(&content)
                .map_err(|e| SourceError::Fatal(format!("parse manifest: {}", e)))?
        } else {
            let listing_dir = dir.clone();
            let mut files = tokio::task::spawn_blocking(move || {
                let mut files = Vec::new();
                list_files(&listing_dir, &listing_dir, &mut files).map(|_| files)
            })
            .await
            .map_err(|e| SourceError::Fatal(e.to_string()))?
            .map_err(|e| SourceError::Transient(format!("list mirror: {}", e)))?;
            files.sort_by(|a, b| a.path.cmp(&b.path));

            ArtifactManifest {
                revision: "local".to_string(),
                files,
            }
        };

        manifest.validate(source_name)?;
        Ok(manifest)
    }

    async fn fetch(
        &self,
        source_name: &str,
        _revision: &str,
        path: &str,
        offset: u64,
    ) -> Result<FetchStream, SourceError> {
        if !is_safe_relative_path(path) {
            return Err(SourceError::Fatal(format!("Invalid file path '{}'", path)));
        }
        let file_path = self.artifact_dir(source_name)?.join(path);

        let mut file = tokio::fs::File::open(&file_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound(format!("{}/{}", source_name, path))
            } else {
                SourceError::Transient(format!("open {}: {}", path, e))
            }
        })?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| SourceError::Transient(format!("seek {}: {}", path, e)))?;

        let stream = tokio_util::io::ReaderStream::new(file)
            .map(|chunk| chunk.map_err(|e| SourceError::Transient(e.to_string())))
            .boxed();

        Ok(FetchStream {
            start: offset,
            stream,
        })
    }

    fn name(&self) -> &'static str {
        "mirror"
    }
}
