use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::os::is_process_alive;
use crate::util::{ensure_directory, now_millis, remove_file_if_exists};

pub const EMBED_LOCK: &str = "embed";
pub const SYNC_LOCK: &str = "sync";

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// A lock file that exists but cannot be parsed is most likely being written
/// by its creator right now; it is only reclaimed after this long.
const HALF_WRITTEN_GRACE: Duration = Duration::from_secs(2);

const ACQUIRE_ATTEMPTS: usize = 3;

/// Extension of a lock file moved aside while it is being reclaimed.
const RECLAIM_EXTENSION: &str = "stale";

static RECLAIM_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub started_at_ms: u64,
}

impl LockRecord {
    pub fn age(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.started_at_ms))
    }
}

enum Existing {
    Held(LockRecord),
    /// Carries the exact bytes that were judged stale.
    Reclaimable {
        reason: &'static str,
        observed: Vec<u8>,
    },
    Vanished,
}

/// File-based mutual exclusion between processes, one file per logical
/// operation name.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    stale_after: Duration,
    pid: u32,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_after: DEFAULT_STALE_AFTER,
            pid: std::process::id(),
        }
    }

    #[cfg(test)]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Acts on behalf of another pid, modelling a foreign owner.
    #[cfg(test)]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Tries to take the named lock. `Ok(false)` means another live owner
    /// holds it, which callers treat as a normal outcome.
    pub fn acquire(&self, name: &str) -> Result<bool> {
        ensure_directory(&self.dir)?;
        let path = self.lock_path(name);

        for _ in 0..ACQUIRE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid: self.pid,
                        started_at_ms: now_millis(),
                    };
                    let data = serde_json::to_vec(&record)?;
                    file.write_all(&data)
                        .and_then(|_| file.sync_all())
                        .with_context(|| format!("failed to write lock {}", path.display()))?;
                    debug!(lock = name, pid = self.pid, "lock acquired");
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create lock {}", path.display()));
                }
            }

            match self.inspect(&path)? {
                Existing::Held(record) => {
                    debug!(lock = name, holder = record.pid, "lock is held by a live owner");
                    return Ok(false);
                }
                Existing::Reclaimable { reason, observed } => {
                    warn!(lock = name, reason, "reclaiming stale lock");
                    if !self.reclaim(&path, &observed)? {
                        debug!(lock = name, "lock changed while reclaiming it");
                    }
                }
                Existing::Vanished => {}
            }
        }

        Ok(false)
    }

    /// Removes the lock only when this process owns it.
    pub fn release(&self, name: &str) -> Result<bool> {
        let path = self.lock_path(name);
        match read_raw(&path)?.map(|raw| parse_record(&raw)) {
            Some(Some(record)) if record.pid == self.pid => {
                let removed = remove_file_if_exists(&path)?;
                debug!(lock = name, pid = self.pid, "lock released");
                Ok(removed)
            }
            Some(Some(record)) => {
                debug!(
                    lock = name,
                    holder = record.pid,
                    pid = self.pid,
                    "not releasing a lock owned by another process"
                );
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    pub fn holder(&self, name: &str) -> Result<Option<LockRecord>> {
        Ok(read_raw(&self.lock_path(name))?.and_then(|raw| parse_record(&raw)))
    }

    /// Deletes every lock whose owner process no longer exists, along with
    /// leftovers of interrupted reclaims.
    pub fn sweep(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list locks in {}", self.dir.display()));
            }
        };

        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("lock") => {}
                Some(RECLAIM_EXTENSION) if modified_age(&path) > HALF_WRITTEN_GRACE => {
                    remove_file_if_exists(&path)?;
                    continue;
                }
                _ => continue,
            }

            let Some(raw) = read_raw(&path)? else {
                continue;
            };
            let owner_dead = match parse_record(&raw) {
                Some(record) => !is_process_alive(record.pid),
                None => modified_age(&path) > HALF_WRITTEN_GRACE,
            };
            if owner_dead && self.reclaim(&path, &raw)? {
                let name = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                info!(lock = %name, "removed lock left behind by a dead process");
                removed.push(name);
            }
        }

        Ok(removed)
    }

    fn inspect(&self, path: &Path) -> Result<Existing> {
        let Some(observed) = read_raw(path)? else {
            return Ok(Existing::Vanished);
        };
        let existing = match parse_record(&observed) {
            Some(record) => {
                if !is_process_alive(record.pid) {
                    Existing::Reclaimable {
                        reason: "owner process is dead",
                        observed,
                    }
                } else if record.age() > self.stale_after {
                    Existing::Reclaimable {
                        reason: "lock exceeded its timeout",
                        observed,
                    }
                } else {
                    Existing::Held(record)
                }
            }
            None => {
                if modified_age(path) > HALF_WRITTEN_GRACE {
                    Existing::Reclaimable {
                        reason: "lock file is unreadable",
                        observed,
                    }
                } else {
                    Existing::Held(LockRecord {
                        pid: 0,
                        started_at_ms: now_millis(),
                    })
                }
            }
        };
        Ok(existing)
    }

    /// Removes the lock at `path` only if it still holds `observed`.
    ///
    /// The file is renamed aside before it is compared, so a lock another
    /// contender recreated after `observed` was read is put back instead of
    /// deleted. Returns whether the stale lock was removed.
    fn reclaim(&self, path: &Path, observed: &[u8]) -> Result<bool> {
        let sequence = RECLAIM_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let aside = path.with_extension(format!("lock.{}.{sequence}.{RECLAIM_EXTENSION}", self.pid));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to move aside lock {}", path.display()));
            }
        }

        let moved = fs::read(&aside)
            .with_context(|| format!("failed to read lock {}", aside.display()))?;
        if moved == observed {
            remove_file_if_exists(&aside)?;
            return Ok(true);
        }

        match fs::hard_link(&aside, path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                warn!(lock = %path.display(), "lock replaced again while reclaiming; keeping the newest");
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to restore lock {}", path.display()));
            }
        }
        remove_file_if_exists(&aside)?;
        Ok(false)
    }
}

/// `None` when the file is absent.
fn read_raw(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read lock {}", path.display())),
    }
}

/// `None` for a file that does not hold a valid record.
fn parse_record(raw: &[u8]) -> Option<LockRecord> {
    serde_json::from_slice(raw).ok()
}

fn modified_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn write_record(manager: &LockManager, name: &str, record: &LockRecord) {
        fs::create_dir_all(&manager.dir).unwrap();
        fs::write(manager.lock_path(name), serde_json::to_vec(record).unwrap()).unwrap();
    }

    #[test]
    fn second_acquire_by_live_owner_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());

        assert!(manager.acquire(EMBED_LOCK).unwrap());
        assert!(!manager.acquire(EMBED_LOCK).unwrap());
        assert_eq!(manager.holder(EMBED_LOCK).unwrap().unwrap().pid, std::process::id());
    }

    #[test]
    fn concurrent_acquires_yield_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles = (0..contenders)
            .map(|_| {
                let manager = LockManager::new(dir.path());
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.acquire(EMBED_LOCK).unwrap()
                })
            })
            .collect::<Vec<_>>();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn lock_with_dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        write_record(
            &manager,
            EMBED_LOCK,
            &LockRecord {
                pid: dead_pid(),
                started_at_ms: now_millis(),
            },
        );

        assert!(manager.acquire(EMBED_LOCK).unwrap());
        assert_eq!(manager.holder(EMBED_LOCK).unwrap().unwrap().pid, std::process::id());
    }

    fn leftover_files(manager: &LockManager) -> Vec<String> {
        fs::read_dir(&manager.dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".stale"))
            .collect()
    }

    #[test]
    fn reclaim_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        write_record(
            &manager,
            EMBED_LOCK,
            &LockRecord {
                pid: dead_pid(),
                started_at_ms: now_millis(),
            },
        );

        assert!(manager.acquire(EMBED_LOCK).unwrap());
        assert!(leftover_files(&manager).is_empty());
    }

    #[test]
    fn lock_replaced_after_inspection_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let stale = LockRecord {
            pid: dead_pid(),
            started_at_ms: now_millis(),
        };
        write_record(&manager, EMBED_LOCK, &stale);
        let path = manager.lock_path(EMBED_LOCK);
        let Existing::Reclaimable { observed, .. } = manager.inspect(&path).unwrap() else {
            panic!("dead owner should be reclaimable");
        };

        // Another contender reclaims and takes the lock before we act.
        let winner = LockManager::new(dir.path());
        assert!(winner.acquire(EMBED_LOCK).unwrap());
        let fresh = fs::read(&path).unwrap();

        assert!(!manager.reclaim(&path, &observed).unwrap());
        assert_eq!(fs::read(&path).unwrap(), fresh);
        assert!(leftover_files(&manager).is_empty());
        assert!(!manager.acquire(EMBED_LOCK).unwrap());
    }

    #[test]
    fn sweep_clears_leftovers_of_interrupted_reclaims() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let leftover = dir.path().join("embed.lock.42.0.stale");
        fs::write(&leftover, b"{}").unwrap();
        let old = SystemTime::now() - Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&leftover)
            .unwrap()
            .set_modified(old)
            .unwrap();

        assert!(manager.sweep().unwrap().is_empty());
        assert!(!leftover.exists());
    }

    #[test]
    fn lock_older_than_timeout_is_reclaimed_even_if_owner_lives() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path()).with_stale_after(Duration::from_secs(60));
        write_record(
            &manager,
            SYNC_LOCK,
            &LockRecord {
                pid: std::process::id(),
                started_at_ms: now_millis() - 120_000,
            },
        );

        assert!(manager.acquire(SYNC_LOCK).unwrap());
    }

    #[test]
    fn release_ignores_locks_owned_by_someone_else() {
        let dir = tempfile::tempdir().unwrap();
        let owner = LockManager::new(dir.path());
        let other = LockManager::new(dir.path()).with_pid(std::process::id() + 1);

        assert!(owner.acquire(EMBED_LOCK).unwrap());
        assert!(!other.release(EMBED_LOCK).unwrap());
        assert!(owner.lock_path(EMBED_LOCK).exists());

        assert!(owner.release(EMBED_LOCK).unwrap());
        assert!(!owner.lock_path(EMBED_LOCK).exists());
        assert!(!owner.release(EMBED_LOCK).unwrap());
    }

    #[test]
    fn embed_and_sync_locks_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        assert!(manager.acquire(EMBED_LOCK).unwrap());
        assert!(manager.acquire(SYNC_LOCK).unwrap());
    }

    #[test]
    fn fresh_unparseable_lock_counts_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        fs::write(manager.lock_path(EMBED_LOCK), b"").unwrap();

        assert!(!manager.acquire(EMBED_LOCK).unwrap());
    }

    #[test]
    fn sweep_removes_only_dead_owners() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        write_record(
            &manager,
            EMBED_LOCK,
            &LockRecord {
                pid: dead_pid(),
                started_at_ms: now_millis(),
            },
        );
        assert!(manager.acquire(SYNC_LOCK).unwrap());

        let removed = manager.sweep().unwrap();
        assert_eq!(removed, vec![EMBED_LOCK.to_string()]);
        assert!(manager.lock_path(SYNC_LOCK).exists());
    }

    #[test]
    fn sweep_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path().join("absent"));
        assert!(manager.sweep().unwrap().is_empty());
    }
}
