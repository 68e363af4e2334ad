//! Model artifacts
//!
//! Provides functionality for:
//! - The catalog of servable models and their memory tiers
//! - The on-disk cache layout and persisted cache metadata
//! - Fetching artifacts from an upstream with resume and verification
//! - The boundary to the serving engine that loads artifacts

pub mod cache;
pub mod catalog;
pub mod download;
pub mod inflight;
pub mod loader;
pub mod metadata;
pub mod source;

pub use cache::{ArtifactFile, CacheLayout};
pub use catalog::{MemoryTier, MemoryTiers, ModelCatalog, ModelDescriptor, PerformanceTargets};
pub use download::{ArtifactPin, CacheUsage, DownloadConfig, DownloadManager, DownloadOutcome};
pub use loader::{ArtifactMetadata, ArtifactCheckBackend, ModelBackend, parse_model_config};
pub use metadata::{CacheEntry, MetadataStore};
pub use source::{ArtifactManifest, ArtifactSource, HubSource, ManifestFile, MirrorSource};
