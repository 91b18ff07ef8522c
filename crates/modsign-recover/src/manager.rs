//! Restore modules from the backup store and repair run state.
//!
//! Every restore is itself reversible: the file currently at the target is
//! copied into the store (reason `pre-restore`) before it is overwritten.
//! Recovery does not take the signing run lock.

use chrono::{DateTime, Utc};
use modsign_core::backup_store::{self, Backup, BackupReason, BackupStore};
use modsign_core::config::ModsignConfig;
use modsign_core::fsutil;
use modsign_core::lock::{self, LockRecord};
use modsign_core::module::{Module, ModuleScanner};
use modsign_core::records::{
    ExecutionState, FailureCounter, SuccessCounter, EXECUTION_KEY, FAILURE_KEY, SUCCESS_KEY,
};
use modsign_core::state::{StateStore, StateStoreExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::RecoveryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub module: String,
    pub target: PathBuf,
    pub backup: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_backup: Option<PathBuf>,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRestore {
    pub module: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoReport {
    pub restored: Vec<RestoreReport>,
    pub failed: Vec<FailedRestore>,
}

impl AutoReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub records_removed: usize,
    pub lock_removed: bool,
    /// Pid of a live run whose lock file was left in place.
    pub live_holder: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub module: String,
    pub count: usize,
    pub latest: PathBuf,
    pub latest_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    pub backup_dir: PathBuf,
    pub backups: usize,
    pub modules: Vec<BackupSummary>,
    pub last_run: Option<ExecutionState>,
    pub success_counter: SuccessCounter,
    pub failure_counter: FailureCounter,
    pub circuit_open: bool,
    pub lock_holder: Option<LockRecord>,
    pub lock_stale: bool,
}

pub struct RecoveryManager<'a> {
    config: &'a ModsignConfig,
    state: &'a dyn StateStore,
    store: BackupStore,
    kernel: Option<String>,
}

impl<'a> RecoveryManager<'a> {
    /// `kernel` is only used to locate modules whose backups carry no
    /// source path.
    pub fn new(
        config: &'a ModsignConfig,
        state: &'a dyn StateStore,
        kernel: Option<String>,
    ) -> Result<Self, RecoveryError> {
        let store = BackupStore::open(&config.paths.backup_dir)?;
        Ok(Self {
            config,
            state,
            store,
            kernel,
        })
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// All backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<Backup>, RecoveryError> {
        Ok(self.store.list()?)
    }

    /// Where `backup` should be restored to: the recorded source path, or a
    /// module of the same name under the configured search directories.
    pub fn resolve_target(&self, backup: &Backup) -> Result<PathBuf, RecoveryError> {
        if let Some(source) = &backup.meta.source {
            return Ok(source.clone());
        }
        let kernel = backup
            .meta
            .kernel
            .clone()
            .or_else(|| self.kernel.clone())
            .ok_or_else(|| RecoveryError::TargetUnknown(backup.module_name().to_string()))?;
        let scanner = ModuleScanner::new(self.config.module_search_dirs(&kernel), kernel);
        let found = scanner
            .find_modules(backup.module_name())
            .map_err(|e| RecoveryError::io(&self.config.paths.modules_root, format!("{e:#}")))?
            .find(|m| m.basename == backup.module_name());
        found
            .map(|m| m.path)
            .ok_or_else(|| RecoveryError::TargetUnknown(backup.module_name().to_string()))
    }

    /// Copy `backup` over `target`. The backup must pass the integrity check
    /// first; the current target is saved beforehand and put back if the
    /// restored size does not match.
    pub fn restore_module(
        &self,
        backup: &Backup,
        target: &Path,
    ) -> Result<RestoreReport, RecoveryError> {
        let module_name = backup.module_name().to_string();
        backup_store::verify_integrity(backup).map_err(|e| {
            error!(module = %module_name, backup = %backup.path.display(), error = %e, "backup failed integrity check");
            RecoveryError::BackupRejected {
                backup: backup.path.clone(),
                reason: e.to_string(),
            }
        })?;

        let safety = if target.is_file() {
            let current = Module::new(target.to_path_buf(), &self.kernel_for(backup));
            Some(self.store.create(&current, BackupReason::PreRestore)?)
        } else {
            warn!(target = %target.display(), "target missing; restoring without a safety backup");
            None
        };

        let mode = backup
            .meta
            .mode
            .or_else(|| fsutil::file_mode(target).ok());
        fsutil::copy_atomic(&backup.path, target, mode)
            .map_err(|e| RecoveryError::io(target, format!("{e:#}")))?;

        let expected = fs::metadata(&backup.path)
            .map_err(|e| RecoveryError::io(&backup.path, e))?
            .len();
        let actual = fs::metadata(target)
            .map_err(|e| RecoveryError::io(target, e))?
            .len();
        if actual != expected {
            error!(
                module = %module_name,
                target = %target.display(),
                expected,
                actual,
                "restored size mismatch; reverting"
            );
            if let Some(safety) = &safety {
                if let Err(e) = fsutil::copy_atomic(&safety.path, target, safety.meta.mode) {
                    error!(
                        target = %target.display(),
                        safety_backup = %safety.path.display(),
                        error = %format!("{e:#}"),
                        "revert failed; copy the safety backup back by hand"
                    );
                }
            }
            return Err(RecoveryError::SizeMismatch {
                target: target.to_path_buf(),
                expected,
                actual,
            });
        }

        info!(
            module = %module_name,
            target = %target.display(),
            backup = %backup.path.display(),
            bytes = actual,
            "module restored"
        );
        Ok(RestoreReport {
            module: module_name,
            target: target.to_path_buf(),
            backup: backup.path.clone(),
            safety_backup: safety.map(|s| s.path),
            bytes: actual,
        })
    }

    /// Restore one module from its newest backup, or from the named backup
    /// file when given.
    pub fn restore_one(
        &self,
        module: &str,
        backup_file: Option<&str>,
    ) -> Result<RestoreReport, RecoveryError> {
        let backup = match backup_file {
            Some(name) => self
                .store
                .find(name)?
                .ok_or_else(|| RecoveryError::NoBackups(name.to_string()))?,
            None => self
                .store
                .latest_for(module)?
                .ok_or_else(|| RecoveryError::NoBackups(module.to_string()))?,
        };
        if backup.module_name() != module {
            warn!(
                requested = module,
                backup_module = backup.module_name(),
                "backup belongs to a different module name"
            );
        }
        let target = self.resolve_target(&backup)?;
        self.restore_module(&backup, &target)
    }

    /// Best effort over the newest backup of every module; one failure does
    /// not stop the rest.
    pub fn restore_all(&self) -> Result<AutoReport, RecoveryError> {
        let candidates = self.store.latest_per_module()?;
        if candidates.is_empty() {
            return Err(RecoveryError::NoBackups(
                self.store.root().display().to_string(),
            ));
        }
        let mut report = AutoReport::default();
        for backup in &candidates {
            let result = self
                .resolve_target(backup)
                .and_then(|target| self.restore_module(backup, &target));
            match result {
                Ok(r) => report.restored.push(r),
                Err(e) => {
                    warn!(module = backup.module_name(), error = %e, "restore failed; continuing");
                    report.failed.push(FailedRestore {
                        module: backup.module_name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "automatic recovery finished"
        );
        Ok(report)
    }

    /// Delete every state record and the run lock file. No checks.
    pub fn clear_corrupted_state(&self) -> Result<ClearReport, RecoveryError> {
        let records_removed = self.state.clear()?;
        let lock_file = &self.config.paths.lock_file;
        let mut live_holder = None;
        let lock_removed = if !lock_file.exists() {
            false
        } else if lock::is_stale(lock_file) {
            match fs::remove_file(lock_file) {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(RecoveryError::io(lock_file, e)),
            }
        } else {
            live_holder = lock::read_record(lock_file).map(|r| r.pid);
            warn!(
                path = %lock_file.display(),
                pid = ?live_holder,
                "lock is held by a live run; leaving it in place"
            );
            false
        };
        warn!(
            records_removed,
            lock_removed,
            "run state cleared; rate limit, counters and breaker are reset"
        );
        Ok(ClearReport {
            records_removed,
            lock_removed,
            live_holder,
        })
    }

    /// Manual circuit-breaker reset. Returns whether a counter was present.
    pub fn reset_breaker(&self) -> Result<bool, RecoveryError> {
        let removed = self.state.remove(FAILURE_KEY)?;
        info!(removed, "failure counter reset");
        Ok(removed)
    }

    /// Unreadable state records are reported as absent.
    pub fn status(&self) -> Result<RecoveryStatus, RecoveryError> {
        let backups = self.store.list()?;
        let mut modules: BTreeMap<String, BackupSummary> = BTreeMap::new();
        for b in backups.iter().filter(|b| b.is_restore_candidate()) {
            modules
                .entry(b.module_name().to_string())
                .and_modify(|s| s.count += 1)
                .or_insert_with(|| BackupSummary {
                    module: b.module_name().to_string(),
                    count: 1,
                    latest: b.path.clone(),
                    latest_at: b.created_at(),
                });
        }
        let failure_counter: FailureCounter = self
            .state
            .load(FAILURE_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        let lock_file = &self.config.paths.lock_file;
        Ok(RecoveryStatus {
            backup_dir: self.store.root().to_path_buf(),
            backups: backups.len(),
            modules: modules.into_values().collect(),
            last_run: self.state.load(EXECUTION_KEY).ok().flatten(),
            success_counter: self
                .state
                .load(SUCCESS_KEY)
                .ok()
                .flatten()
                .unwrap_or_default(),
            circuit_open: failure_counter.is_open(self.config.safety.circuit_breaker_threshold),
            failure_counter,
            lock_holder: lock::read_record(lock_file),
            lock_stale: lock::is_stale(lock_file),
        })
    }

    fn kernel_for(&self, backup: &Backup) -> String {
        backup
            .meta
            .kernel
            .clone()
            .or_else(|| self.kernel.clone())
            .unwrap_or_default()
    }
}
