//! Cross-checkout lock for allocating spec numbers.
//!
//! The primary checkout and every task worktree share one lock file under
//! the primary project's `.warden/.locks`. The holder writes its pid so a
//! crashed holder can be detected and its lock reclaimed.

use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::locator::SpecLocator;
use crate::util::blocking;
use crate::{wlog_debug, wlog_warn, Error, Result};

pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

static SPEC_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{3})-").expect("static regex"));

/// Probe whether `pid` is alive with a no-op signal.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

enum Attempt {
    Acquired,
    Held(Option<u32>),
}

fn try_create(lock_path: &Path) -> Result<Attempt> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    match OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()?;
            Ok(Attempt::Acquired)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Ok(Attempt::Held(read_holder(lock_path)))
        }
        Err(e) => Err(Error::Storage {
            path: lock_path.to_path_buf(),
            source: e,
        }),
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

/// Reclaim a lock left behind by `dead_pid`.
///
/// The file is first moved aside so that only the one we inspected can be
/// deleted. If a live holder took the lock in the meantime, its file is put
/// back. Returns whether a stale lock was removed.
fn remove_stale_lock(lock_path: &Path, dead_pid: u32) -> Result<bool> {
    let storage = |source: io::Error| Error::Storage {
        path: lock_path.to_path_buf(),
        source,
    };
    let file_name = lock_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let aside = lock_path.with_file_name(format!("{}.{}.stale", file_name, Uuid::new_v4()));
    match fs::rename(lock_path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(storage(e)),
    }

    if read_holder(&aside) == Some(dead_pid) {
        fs::remove_file(&aside).map_err(storage)?;
        return Ok(true);
    }

    match fs::hard_link(&aside, lock_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            wlog_warn!(
                "spec numbering lock {} was retaken while restoring a live holder",
                lock_path.display()
            );
        }
        Err(e) => return Err(storage(e)),
    }
    fs::remove_file(&aside).map_err(storage)?;
    Ok(false)
}

/// Highest `NNN` prefix among the directories in `specs_dir`.
pub fn max_spec_number_in(specs_dir: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(specs_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            SPEC_DIR_RE
                .captures(&name)
                .and_then(|c| c[1].parse::<u32>().ok())
        })
        .max()
        .unwrap_or(0)
}

/// Exclusive lock over spec numbering for one project.
///
/// Released on drop.
pub struct SpecNumberLock {
    locator: SpecLocator,
    lock_path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    held: bool,
    cached_next: Option<u32>,
}

impl SpecNumberLock {
    pub fn new(locator: SpecLocator) -> Self {
        let lock_path = locator.numbering_lock_path();
        Self {
            locator,
            lock_path,
            timeout: LOCK_TIMEOUT,
            poll_interval: LOCK_POLL_INTERVAL,
            held: false,
            cached_next: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub async fn acquire(&mut self) -> Result<()> {
        if self.held {
            return Ok(());
        }
        let start = Instant::now();
        loop {
            let lock_path = self.lock_path.clone();
            match blocking(move || try_create(&lock_path)).await? {
                Attempt::Acquired => {
                    wlog_debug!("acquired spec numbering lock {}", self.lock_path.display());
                    self.held = true;
                    self.cached_next = None;
                    return Ok(());
                }
                Attempt::Held(Some(pid)) if !process_alive(pid) => {
                    wlog_warn!(
                        "removing stale spec numbering lock held by dead pid {}",
                        pid
                    );
                    let lock_path = self.lock_path.clone();
                    blocking(move || remove_stale_lock(&lock_path, pid)).await?;
                }
                Attempt::Held(holder) => {
                    let waited = start.elapsed();
                    if waited >= self.timeout {
                        return Err(Error::LockTimeout {
                            path: self.lock_path.clone(),
                            waited,
                        });
                    }
                    wlog_debug!("spec numbering lock busy (holder {:?}), polling", holder);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Next free spec number across the primary checkout and all worktrees.
    /// Computed once per held lock.
    pub fn next_spec_number(&mut self) -> Result<u32> {
        if !self.held {
            return Err(Error::Validation(
                "spec numbering lock is not held".to_string(),
            ));
        }
        if let Some(next) = self.cached_next {
            return Ok(next);
        }
        let max = self
            .locator
            .all_specs_dirs()
            .iter()
            .map(|dir| max_spec_number_in(dir))
            .max()
            .unwrap_or(0);
        let next = max + 1;
        self.cached_next = Some(next);
        Ok(next)
    }

    /// Allocate the next number and create its spec directory in the primary
    /// checkout.
    pub async fn create_spec_dir(&mut self, slug: &str) -> Result<(u32, PathBuf)> {
        let number = self.next_spec_number()?;
        let dir = self
            .locator
            .specs_dir()
            .join(format!("{:03}-{}", number, slug));
        let created = dir.clone();
        blocking(move || Ok(fs::create_dir_all(&created)?)).await?;
        self.cached_next = Some(number + 1);
        Ok((number, dir))
    }

    pub async fn release(&mut self) {
        if !self.held {
            return;
        }
        let lock_path = self.lock_path.clone();
        let removed = blocking(move || {
            remove_lock_file(&lock_path);
            Ok(())
        })
        .await;
        if let Err(e) = removed {
            wlog_warn!("spec numbering lock release did not complete: {}", e);
            remove_lock_file(&self.lock_path);
        }
        self.held = false;
        self.cached_next = None;
    }
}

fn remove_lock_file(lock_path: &Path) {
    if let Err(e) = fs::remove_file(lock_path) {
        if e.kind() != io::ErrorKind::NotFound {
            wlog_warn!(
                "failed to release spec numbering lock {}: {}",
                lock_path.display(),
                e
            );
        }
    }
}

impl Drop for SpecNumberLock {
    fn drop(&mut self) {
        if self.held {
            remove_lock_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(dir: &Path) -> SpecLocator {
        SpecLocator::new(dir)
    }

    #[test]
    fn test_max_spec_number_ignores_non_matching() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["001-init", "007-auth", "12-short", "notes", "abc-001"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("099-file-not-dir"), "").unwrap();
        assert_eq!(max_spec_number_in(dir.path()), 7);
        assert_eq!(max_spec_number_in(&dir.path().join("missing")), 0);
    }

    #[tokio::test]
    async fn test_next_number_scans_worktrees() {
        let project = tempfile::tempdir().unwrap();
        let loc = locator(project.path());
        fs::create_dir_all(loc.specs_dir().join("003-main")).unwrap();
        let wt_specs = loc
            .worktree_dir("011-feature")
            .join(".warden")
            .join("specs")
            .join("011-feature");
        fs::create_dir_all(&wt_specs).unwrap();

        let mut lock = SpecNumberLock::new(loc);
        lock.acquire().await.unwrap();
        assert_eq!(lock.next_spec_number().unwrap(), 12);

        let (n, dir) = lock.create_spec_dir("dark-mode").await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(n, 12);
        assert!(dir.ends_with("012-dark-mode"));
        assert_eq!(lock.next_spec_number().unwrap(), 13);
    }

    #[tokio::test]
    async fn test_next_number_requires_lock() {
        let project = tempfile::tempdir().unwrap();
        let mut lock = SpecNumberLock::new(locator(project.path()));
        assert!(matches!(
            lock.next_spec_number().unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let project = tempfile::tempdir().unwrap();
        let mut first = SpecNumberLock::new(locator(project.path()));
        first.acquire().await.unwrap();

        let mut second = SpecNumberLock::new(locator(project.path()))
            .with_timeout(Duration::from_millis(150), Duration::from_millis(20));
        let err = second.acquire().await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        first.release().await;
        assert!(!first.is_held());
        second.acquire().await.unwrap();
        assert!(second.is_held());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let project = tempfile::tempdir().unwrap();
        let mut lock = SpecNumberLock::new(locator(project.path()))
            .with_timeout(Duration::from_millis(200), Duration::from_millis(20));
        fs::create_dir_all(lock.lock_path().parent().unwrap()).unwrap();
        // Pid far above any default pid_max.
        fs::write(lock.lock_path(), "999999999\n").unwrap();

        lock.acquire().await.unwrap();
        let holder = fs::read_to_string(lock.lock_path()).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_removal_spares_a_live_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("numbering.lock");
        // Another waiter reclaimed the dead pid's lock and now holds it.
        fs::write(&lock_path, format!("{}\n", std::process::id())).unwrap();

        assert!(!remove_stale_lock(&lock_path, 999999999).unwrap());
        assert_eq!(read_holder(&lock_path), Some(std::process::id()));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".stale"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_removal_deletes_dead_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("numbering.lock");
        fs::write(&lock_path, "999999999\n").unwrap();

        assert!(remove_stale_lock(&lock_path, 999999999).unwrap());
        assert!(!lock_path.exists());
        assert!(!remove_stale_lock(&lock_path, 999999999).unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let project = tempfile::tempdir().unwrap();
        let path;
        {
            let mut lock = SpecNumberLock::new(locator(project.path()));
            lock.acquire().await.unwrap();
            path = lock.lock_path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_alive_for_self() {
        assert!(process_alive(std::process::id()));
    }
}
