//! System-wide advisory run lock.
//!
//! The lock is an exclusive `flock` on a well-known file. The file also
//! carries a JSON record of the holder (pid, acquisition time, timeout) so
//! contenders can report who they are waiting on and detect records left by
//! dead holders.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {path} still held by pid {holder:?} after {waited_secs}s")]
    Timeout {
        path: PathBuf,
        holder: Option<u32>,
        waited_secs: u64,
    },
    #[error("cancelled while waiting for lock")]
    Cancelled,
    #[error("lock i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct RunLock {
    path: PathBuf,
    timeout: Duration,
    poll: Duration,
}

/// Holding this value holds the lock. Dropping it clears the holder record
/// and releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, poll: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            // A zero interval would spin.
            poll: poll.max(Duration::from_millis(10)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self, cancel: &Cancellation) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io(source))?;
        }
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut reclaimed = false;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.path)
                .map_err(|source| self.io(source))?;

            match file.try_lock_exclusive() {
                Ok(()) => return self.take(file),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let holder = read_record(&self.path);
                    if let Some(record) = &holder {
                        if !reclaimed && !process_alive(record.pid) {
                            // The flock is held through a descriptor the dead
                            // holder leaked (e.g. to a child). Unlink so new
                            // contenders meet a fresh inode.
                            warn!(
                                path = %self.path.display(),
                                pid = record.pid,
                                "reclaiming lock recorded by a dead process"
                            );
                            fs::remove_file(&self.path).map_err(|source| self.io(source))?;
                            reclaimed = true;
                            continue;
                        }
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout {
                            path: self.path.clone(),
                            holder: holder.map(|r| r.pid),
                            waited_secs: now.duration_since(started).as_secs(),
                        });
                    }
                    if cancel.is_cancelled() {
                        return Err(LockError::Cancelled);
                    }
                    debug!(path = %self.path.display(), "lock busy, waiting");
                    std::thread::sleep(self.poll.min(deadline - now));
                }
                Err(source) => return Err(self.io(source)),
            }
        }
    }

    fn take(&self, mut file: File) -> Result<LockGuard, LockError> {
        if let Some(previous) = read_record(&self.path) {
            if previous.pid != std::process::id() {
                warn!(
                    pid = previous.pid,
                    since = %previous.acquired_at,
                    "previous holder exited without releasing the lock record"
                );
            }
        }
        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            timeout_secs: self.timeout.as_secs(),
        };
        let bytes = serde_json::to_vec(&record).unwrap_or_default();
        let write = (|| -> std::io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&bytes)?;
            file.sync_all()
        })();
        if let Err(source) = write {
            let _ = file.unlock();
            return Err(self.io(source));
        }
        info!(path = %self.path.display(), pid = record.pid, "run lock acquired");
        Ok(LockGuard {
            file,
            path: self.path.clone(),
        })
    }

    fn io(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "run lock released");
    }
}

/// Holder record currently written in the lock file, if any.
pub fn read_record(path: &Path) -> Option<LockRecord> {
    let mut data = Vec::new();
    File::open(path).ok()?.read_to_end(&mut data).ok()?;
    if data.is_empty() {
        return None;
    }
    serde_json::from_slice(&data).ok()
}

/// Whether a lock file exists that no live process currently holds.
pub fn is_stale(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                true
            }
            Err(_) => read_record(path).map_or(false, |r| !process_alive(r.pid)),
        },
        Err(_) => false,
    }
}

pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 checks existence without delivering anything.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lock_at(path: &Path, timeout_ms: u64) -> RunLock {
        RunLock::new(
            path,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(20),
        )
    }

    #[test]
    fn second_acquire_times_out_while_first_is_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/modsign.lock");
        let cancel = Cancellation::new();
        let guard = lock_at(&path, 100).acquire(&cancel).unwrap();
        let record = read_record(&path).unwrap();
        assert_eq!(record.pid, std::process::id());

        let err = lock_at(&path, 100).acquire(&cancel).unwrap_err();
        match err {
            LockError::Timeout { holder, .. } => assert_eq!(holder, Some(std::process::id())),
            other => panic!("unexpected {other:?}"),
        }

        drop(guard);
        assert!(read_record(&path).is_none());
        let _again = lock_at(&path, 100).acquire(&cancel).unwrap();
    }

    #[test]
    fn waiter_proceeds_once_holder_releases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("modsign.lock");
        let cancel = Cancellation::new();
        let guard = lock_at(&path, 100).acquire(&cancel).unwrap();
        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            lock_at(&waiter_path, 3_000)
                .acquire(&Cancellation::new())
                .map(|_| ())
        });
        std::thread::sleep(Duration::from_millis(150));
        drop(guard);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn leftover_record_from_dead_process_is_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("modsign.lock");
        let stale = LockRecord {
            pid: i32::MAX as u32,
            acquired_at: Utc::now(),
            timeout_secs: 30,
        };
        fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();
        assert!(is_stale(&path));
        let _guard = lock_at(&path, 100).acquire(&Cancellation::new()).unwrap();
        assert_eq!(read_record(&path).unwrap().pid, std::process::id());
        assert!(!is_stale(&path));
    }

    #[test]
    fn cancellation_stops_waiting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("modsign.lock");
        let _guard = lock_at(&path, 100).acquire(&Cancellation::new()).unwrap();
        let cancel = Cancellation::new();
        cancel.cancel(crate::cancel::CancelReason::Interrupted);
        let err = lock_at(&path, 5_000).acquire(&cancel).unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
    }
}
