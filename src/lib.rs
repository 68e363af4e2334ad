//! Model Manager - memory-bounded model cache and lifecycle manager
//!
//! Keeps a catalog of servable models, caches their artifacts on disk within
//! a storage quota, and decides which models are resident within a memory
//! budget, evicting the least protected ones when space is needed.

pub mod api;
pub mod budget;
pub mod config;
pub mod error;
pub mod events;
pub mod gpu;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod storage;

pub use config::{ManagerConfig, UpstreamConfig};
pub use error::{ManagerError, ManagerResult};
pub use events::{DownloadProgress, ModelEvent};
pub use lifecycle::{LifecycleConfig, LifecycleManager, LoadState, ModelLease, ModelStatus};
pub use models::{
    CacheEntry, DownloadManager, MemoryTier, MetadataStore, ModelCatalog, ModelDescriptor,
};
pub use storage::{FileKvBackend, KvBackend, MemoryKvBackend};
