//! Per-path serialization of read-modify-write sequences.
//!
//! Atomic rename keeps individual writes whole, but two callers that both
//! read, modify and write the same plan would still lose one update. Every
//! logical operation on a path runs under that path's async mutex; distinct
//! paths never contend.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone, Default)]
pub struct FileLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

fn lock_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` while holding the logical lock for `path`.
    pub async fn with_lock<F, Fut, T>(&self, path: &Path, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = lock_key(path);
        let entry = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.clone()).or_default())
        };

        let result = {
            let _guard = entry.lock().await;
            op().await
        };

        // Drop the map entry once nobody else is queued on it.
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = map.get(&key) {
            if Arc::ptr_eq(current, &entry) && Arc::strong_count(&entry) == 2 {
                map.remove(&key);
            }
        }
        result
    }

    /// Number of paths with an active or queued operation.
    pub fn active_paths(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}
