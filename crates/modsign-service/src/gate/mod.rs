//! Pre-flight safety gate in front of the signer.
//!
//! Checks run in a fixed order: rate limit, disk space, key permissions,
//! run lock, circuit breaker. The only state a failing gate leaves behind is
//! the rate-limit timestamp, which is recorded as soon as that check passes.

use chrono::Utc;
use modsign_core::cancel::Cancellation;
use modsign_core::config::ModsignConfig;
use modsign_core::fsutil;
use modsign_core::lock::{LockError, LockGuard, RunLock};
use modsign_core::records::{FailureCounter, RateLimitRecord, FAILURE_KEY, RATE_LIMIT_KEY};
use modsign_core::state::{StateStore, StateStoreExt};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::GateError;

/// Proof that every check passed. The run lock is held for as long as this
/// value lives.
#[derive(Debug)]
pub struct GatePass {
    pub lock: LockGuard,
    pub key_warnings: Vec<String>,
}

pub struct SafetyGate<'a> {
    config: &'a ModsignConfig,
    state: &'a dyn StateStore,
}

impl<'a> SafetyGate<'a> {
    pub fn new(config: &'a ModsignConfig, state: &'a dyn StateStore) -> Self {
        Self { config, state }
    }

    pub fn run_all(&self, cancel: &Cancellation) -> Result<GatePass, GateError> {
        self.check_rate_limit()?;
        self.check_disk_space()?;
        let key_warnings = self.check_key_permissions();
        let lock = self.acquire_lock(cancel)?;
        // Dropping `lock` on error releases it.
        self.check_circuit_breaker()?;
        Ok(GatePass { lock, key_warnings })
    }

    /// Fails when the last attempt is more recent than the configured
    /// interval; otherwise records this attempt before anything else runs.
    pub fn check_rate_limit(&self) -> Result<(), GateError> {
        let min = self.config.safety.min_interval_secs;
        let current = self.state.get(RATE_LIMIT_KEY)?;
        let now = Utc::now();

        if let Some(value) = &current {
            match serde_json::from_value::<RateLimitRecord>(value.clone()) {
                Ok(record) => {
                    let elapsed = now.signed_duration_since(record.last_attempt).num_seconds();
                    if elapsed < 0 {
                        warn!(last_attempt = %record.last_attempt, "rate-limit record is in the future; ignoring it");
                    } else if (elapsed as u64) < min {
                        return Err(GateError::RateLimited {
                            remaining_secs: min - elapsed as u64,
                        });
                    }
                }
                Err(e) => warn!(error = %e, "unreadable rate-limit record; overwriting"),
            }
        }

        let next = serde_json::to_value(RateLimitRecord { last_attempt: now })
            .map_err(modsign_core::state::StateError::from)?;
        if !self
            .state
            .compare_and_swap(RATE_LIMIT_KEY, current.as_ref(), &next)?
        {
            // Another run recorded an attempt between our read and write.
            return Err(GateError::RateLimited { remaining_secs: min });
        }
        info!(min_interval_secs = min, "rate limit passed; attempt recorded");
        Ok(())
    }

    pub fn check_disk_space(&self) -> Result<(), GateError> {
        let safety = &self.config.safety;
        let paths = &self.config.paths;
        for (mount, required_kb) in [
            (&paths.root_mount, safety.root_min_kb),
            (&paths.boot_mount, safety.boot_min_kb),
        ] {
            if !mount.exists() {
                warn!(mount = %mount.display(), "mount point missing; skipping space check");
                continue;
            }
            match available_kb(mount) {
                Some(available_kb) if available_kb < required_kb => {
                    return Err(GateError::InsufficientResources {
                        mount: mount.clone(),
                        available_kb,
                        required_kb,
                    });
                }
                Some(_) => {}
                None => warn!(mount = %mount.display(), "statvfs failed; skipping space check"),
            }
        }
        Ok(())
    }

    /// Non-fatal: returns one warning per key whose mode is not accepted.
    pub fn check_key_permissions(&self) -> Vec<String> {
        let key = &self.config.paths.private_key;
        let accepted = &self.config.safety.accepted_key_modes;
        let mut warnings = Vec::new();
        match fsutil::file_mode(key) {
            Ok(mode) if accepted.contains(&mode) => {}
            Ok(mode) => {
                let msg = format!(
                    "private key {} has mode {:o}; expected one of {}",
                    key.display(),
                    mode,
                    accepted
                        .iter()
                        .map(|m| format!("{m:o}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                warn!("{msg}");
                warnings.push(msg);
            }
            Err(e) => {
                let msg = format!("cannot stat private key {}: {e:#}", key.display());
                warn!("{msg}");
                warnings.push(msg);
            }
        }
        warnings
    }

    pub fn acquire_lock(&self, cancel: &Cancellation) -> Result<LockGuard, GateError> {
        let safety = &self.config.safety;
        let lock = RunLock::new(
            &self.config.paths.lock_file,
            Duration::from_secs(safety.lock_timeout_secs),
            Duration::from_secs(safety.lock_poll_secs),
        );
        lock.acquire(cancel).map_err(|e| match e {
            LockError::Timeout {
                path,
                holder,
                waited_secs,
            } => GateError::LockTimeout {
                path,
                holder,
                waited_secs,
            },
            LockError::Cancelled => GateError::Cancelled(
                cancel
                    .reason()
                    .unwrap_or(modsign_core::cancel::CancelReason::Interrupted),
            ),
            other => GateError::Lock(other.to_string()),
        })
    }

    pub fn check_circuit_breaker(&self) -> Result<(), GateError> {
        let threshold = self.config.safety.circuit_breaker_threshold;
        let counter: FailureCounter = self.state.load(FAILURE_KEY)?.unwrap_or_default();
        if counter.is_open(threshold) {
            error!(
                failures = counter.count,
                threshold,
                reason = counter.last_reason.as_deref().unwrap_or("unknown"),
                "circuit breaker open; run `modsign-recover reset-breaker` after investigating"
            );
            return Err(GateError::CircuitBreakerOpen {
                failures: counter.count,
                threshold,
            });
        }
        Ok(())
    }
}

/// Whether the failure breaker is currently open.
pub fn breaker_open(state: &dyn StateStore, threshold: u32) -> bool {
    state
        .load::<FailureCounter>(FAILURE_KEY)
        .ok()
        .flatten()
        .map_or(false, |c| c.is_open(threshold))
}

/// Free space available to unprivileged writers, in KiB.
fn available_kb(path: &Path) -> Option<u64> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes()).ok()?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret != 0 {
            return None;
        }
        let stat = unsafe { stat.assume_init() };
        Some(stat.f_bavail as u64 * stat.f_frsize as u64 / 1024)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsign_core::state::MemoryStateStore;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> ModsignConfig {
        let mut config = ModsignConfig::default();
        config.paths.lock_file = dir.join("modsign.lock");
        config.paths.private_key = dir.join("key.priv");
        config.paths.root_mount = dir.to_path_buf();
        config.paths.boot_mount = dir.to_path_buf();
        config.safety.root_min_kb = 0;
        config.safety.boot_min_kb = 0;
        config.safety.lock_timeout_secs = 0;
        config
    }

    #[test]
    fn rate_limit_allows_first_run_and_blocks_second() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStateStore::new();
        let gate = SafetyGate::new(&config, &store);
        gate.check_rate_limit().unwrap();
        assert!(store.load::<RateLimitRecord>(RATE_LIMIT_KEY).unwrap().is_some());
        match gate.check_rate_limit() {
            Err(GateError::RateLimited { remaining_secs }) => {
                assert!(remaining_secs > 0 && remaining_secs <= 300)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rate_limit_passes_after_interval() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStateStore::new();
        store
            .save(
                RATE_LIMIT_KEY,
                &RateLimitRecord {
                    last_attempt: Utc::now() - chrono::Duration::seconds(301),
                },
            )
            .unwrap();
        SafetyGate::new(&config, &store).check_rate_limit().unwrap();
    }

    #[test]
    fn disk_space_requirement_enforced() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        let store = MemoryStateStore::new();
        SafetyGate::new(&config, &store).check_disk_space().unwrap();
        config.safety.boot_min_kb = u64::MAX / 2048;
        assert!(matches!(
            SafetyGate::new(&config, &store).check_disk_space(),
            Err(GateError::InsufficientResources { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn loose_key_mode_only_warns() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStateStore::new();
        std::fs::write(&config.paths.private_key, b"key").unwrap();
        fsutil::set_mode(&config.paths.private_key, 0o644).unwrap();
        let gate = SafetyGate::new(&config, &store);
        assert_eq!(gate.check_key_permissions().len(), 1);
        fsutil::set_mode(&config.paths.private_key, 0o400).unwrap();
        assert!(gate.check_key_permissions().is_empty());
        fsutil::set_mode(&config.paths.private_key, 0o600).unwrap();
        assert!(gate.check_key_permissions().is_empty());
    }

    #[test]
    fn breaker_blocks_at_threshold_and_releases_lock() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStateStore::new();
        let mut counter = FailureCounter::default();
        for _ in 0..3 {
            counter.record_failure("unsigned after run");
        }
        store.save(FAILURE_KEY, &counter).unwrap();
        std::fs::write(&config.paths.private_key, b"key").unwrap();

        let gate = SafetyGate::new(&config, &store);
        let err = gate.run_all(&Cancellation::new()).unwrap_err();
        assert!(matches!(err, GateError::CircuitBreakerOpen { failures: 3, threshold: 3 }));
        assert!(breaker_open(&store, 3));
        // The lock taken during the gate was released on the error path.
        let _held = gate.acquire_lock(&Cancellation::new()).unwrap();
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let store = MemoryStateStore::new();
        let gate = SafetyGate::new(&config, &store);
        let _first = gate.acquire_lock(&Cancellation::new()).unwrap();
        assert!(matches!(
            gate.acquire_lock(&Cancellation::new()),
            Err(GateError::LockTimeout { .. })
        ));
    }
}
