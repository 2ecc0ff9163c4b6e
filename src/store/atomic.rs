//! Atomic, retrying reads and writes of JSON documents.
//!
//! A write lands in a uniquely named temporary file next to the target and is
//! then renamed over it. The rename is the only atomicity boundary: readers
//! see either the previous document or the new one, never a partial write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{wlog_debug, wlog_warn, Error, Result};

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Busy, sharing/permission violations, try-again and handle exhaustion.
/// Everything else, including NotFound, is permanent.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::PermissionDenied
    ) {
        return true;
    }
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(code) => matches!(
            code,
            libc::EBUSY | libc::EACCES | libc::EPERM | libc::EAGAIN | libc::EMFILE | libc::ENFILE
        ),
        // ERROR_ACCESS_DENIED, ERROR_TOO_MANY_OPEN_FILES, ERROR_SHARING_VIOLATION,
        // ERROR_LOCK_VIOLATION
        #[cfg(windows)]
        Some(code) => matches!(code, 4 | 5 | 32 | 33),
        #[cfg(not(any(unix, windows)))]
        Some(_) => false,
        None => false,
    }
}

/// Run `op` until it succeeds, fails permanently, or the retry budget is
/// spent.
pub async fn retry_io<F, Fut, T>(path: &Path, policy: RetryPolicy, mut op: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.retries && is_transient(&err) => {
                let delay = policy.delay_for(attempt);
                wlog_debug!(
                    "transient I/O error on {} (attempt {}): {}; retrying in {:?}",
                    path.display(),
                    attempt + 1,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()))
}

/// Atomically replace `path` with whatever `write` puts into the temp file.
pub fn write_atomic_with<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_path_for(path);
    let result = (|| {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        write(&mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    if let Err(err) = result {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                wlog_warn!(
                    "failed to remove temp file {}: {}",
                    temp_path.display(),
                    cleanup
                );
            }
        }
        return Err(err);
    }
    Ok(())
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    write_atomic_with(path, |file| file.write_all(bytes))
}

async fn on_blocking_thread<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

/// Serialize `value` and write it atomically, retrying transient failures.
pub async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    policy: RetryPolicy,
) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    let target = path.to_path_buf();
    retry_io(path, policy, || {
        let target = target.clone();
        let bytes = bytes.clone();
        on_blocking_thread(move || write_atomic(&target, &bytes))
    })
    .await
    .map_err(|source| Error::Storage {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and parse a JSON document. A missing file is `Ok(None)`; a file that
/// does not parse is [`Error::Corrupt`] and is never retried.
pub async fn read_json<T: DeserializeOwned>(path: &Path, policy: RetryPolicy) -> Result<Option<T>> {
    let target = path.to_path_buf();
    let read = retry_io(path, policy, || {
        let target = target.clone();
        on_blocking_thread(move || fs::read_to_string(&target))
    })
    .await;

    let content = match read {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Storage {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}
