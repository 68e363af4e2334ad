//! Per-key request coalescing
//!
//! The first caller for a key starts the operation on its own task; callers
//! arriving while it runs wait on the same shared future. The task keeps
//! running if every caller goes away, so an abandoned request never leaves
//! half-finished state behind.

use crate::error::{ManagerError, ManagerResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::sync::Arc;

/// Result future shared by every caller of one operation
pub type SharedResult<T> = Shared<BoxFuture<'static, ManagerResult<T>>>;

pub struct InFlight<T: Clone> {
    ops: Arc<DashMap<String, SharedResult<T>>>,
}

/// Removes the key when the operation's task ends, panics included
struct Deregister<T: Clone> {
    ops: Arc<DashMap<String, SharedResult<T>>>,
    key: String,
}

impl<T: Clone> Drop for Deregister<T> {
    fn drop(&mut self) {
        self.ops.remove(&self.key);
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            ops: Arc::new(DashMap::new()),
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.ops.contains_key(key)
    }

    pub fn running(&self) -> Vec<String> {
        self.ops.iter().map(|e| e.key().clone()).collect()
    }

    /// Join the operation running for `key`, or start `op` if there is none
    ///
    /// Returns the shared result future and whether an existing operation was joined.
    pub fn run<F>(&self, key: &str, op: F) -> (SharedResult<T>, bool)
    where
        F: Future<Output = ManagerResult<T>> + Send + 'static,
    {
        match self.ops.entry(key.to_string()) {
            Entry::Occupied(existing) => (existing.get().clone(), true),
            Entry::Vacant(slot) => {
                let deregister = Deregister {
                    ops: Arc::clone(&self.ops),
                    key: key.to_string(),
                };
                // The entry guard is held until the insert below, so the task's
                // removal cannot run before the future is registered.
                let handle = tokio::spawn(async move {
                    let _deregister = deregister;
                    op.await
                });

                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(ManagerError::Internal(format!("operation task failed: {}", e)))
                    })
                }
                .boxed()
                .shared();

                slot.insert(shared.clone());
                (shared, false)
            }
        }
    }
}

impl<T> Default for InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
