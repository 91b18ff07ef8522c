//! Per-module signing state machine.
//!
//! ```text
//! Unsigned → BackingUp → Signing → Verifying → Signed
//!                │           └──(tool failed)──→ RolledBack
//!                └──(backup failed)──→ Untouched
//! ```
//!
//! A module is only handed to the signing tool once a byte-identical backup
//! exists. When the tool fails, the backup is copied back and its digest
//! re-checked before moving on.

use modsign_core::backup_store::{Backup, BackupReason, BackupStore};
use modsign_core::cancel::Cancellation;
use modsign_core::fsutil;
use modsign_core::module::{classify, Module, SignatureProbe, SignatureStatus};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use super::tools::{BootImageBuilder, KeyPair, SignTool};
use crate::error::ModuleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignState {
    Unsigned,
    BackingUp,
    Signing,
    Verifying,
    Signed,
    RolledBack,
    /// Backup failed; the module was never handed to the tool.
    Untouched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum ModuleOutcome {
    Signed {
        backup: PathBuf,
        /// False when the signature could not be observed right after
        /// signing. The module still counts as signed.
        verified: bool,
    },
    Skipped,
    Failed {
        state: SignState,
        error: String,
        /// Whether the original bytes are confirmed back in place.
        restored: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleReport {
    pub module: String,
    pub path: PathBuf,
    pub outcome: ModuleOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignReport {
    pub total: usize,
    pub signed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub modules: Vec<ModuleReport>,
}

impl SignReport {
    fn record(&mut self, module: &Module, outcome: ModuleOutcome) {
        match &outcome {
            ModuleOutcome::Signed { .. } => self.signed += 1,
            ModuleOutcome::Skipped => self.skipped += 1,
            ModuleOutcome::Failed { .. } => self.failed += 1,
        }
        self.modules.push(ModuleReport {
            module: module.basename.clone(),
            path: module.path.clone(),
            outcome,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum RebuildOutcome {
    NotNeeded,
    Skipped { reason: String },
    Rebuilt,
    Failed { error: String },
}

impl RebuildOutcome {
    pub fn failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

pub struct Signer<'a> {
    tool: &'a dyn SignTool,
    probe: &'a dyn SignatureProbe,
    backups: &'a BackupStore,
    keys: KeyPair,
    hash_algorithm: String,
}

impl<'a> Signer<'a> {
    pub fn new(
        tool: &'a dyn SignTool,
        probe: &'a dyn SignatureProbe,
        backups: &'a BackupStore,
        keys: KeyPair,
        hash_algorithm: impl Into<String>,
    ) -> Self {
        Self {
            tool,
            probe,
            backups,
            keys,
            hash_algorithm: hash_algorithm.into(),
        }
    }

    /// Process classified modules in order. Signed ones are skipped; each
    /// unsigned one is handled independently. Cancellation is honoured
    /// between modules only.
    pub fn sign_all(&self, modules: &[Module], cancel: &Cancellation) -> SignReport {
        let mut report = SignReport {
            total: modules.len(),
            ..SignReport::default()
        };
        for module in modules {
            if cancel.is_cancelled() {
                warn!(
                    remaining = modules.len() - report.modules.len(),
                    "cancellation requested; stopping before next module"
                );
                report.cancelled = true;
                break;
            }
            if module.status == SignatureStatus::Signed {
                debug!(module = %module.basename, "already signed; skipping");
                report.record(module, ModuleOutcome::Skipped);
                continue;
            }
            let outcome = self.sign_module(module);
            report.record(module, outcome);
        }
        info!(
            total = report.total,
            signed = report.signed,
            skipped = report.skipped,
            failed = report.failed,
            "signing pass finished"
        );
        report
    }

    pub fn sign_module(&self, module: &Module) -> ModuleOutcome {
        let name = module.basename.as_str();
        transition(name, SignState::Unsigned, SignState::BackingUp);
        let backup = match self.backups.create(module, BackupReason::PreSign) {
            Ok(b) => b,
            Err(e) => {
                let err = ModuleError::from(e);
                error!(module = %name, error = %err, "backup failed; module left untouched");
                return ModuleOutcome::Failed {
                    state: SignState::Untouched,
                    error: err.to_string(),
                    restored: true,
                };
            }
        };

        transition(name, SignState::BackingUp, SignState::Signing);
        if let Err(e) = self.tool.sign(&self.hash_algorithm, &self.keys, &module.path) {
            let err = ModuleError::from(e);
            error!(module = %name, error = %err, "signing failed; restoring from backup");
            let restored = match restore_from(&backup, module) {
                Ok(()) => {
                    transition(name, SignState::Signing, SignState::RolledBack);
                    true
                }
                Err(restore_err) => {
                    error!(
                        module = %name,
                        backup = %backup.path.display(),
                        error = %restore_err,
                        "restore after failed signing did not complete; run `modsign-recover restore {}`",
                        name
                    );
                    false
                }
            };
            return ModuleOutcome::Failed {
                state: SignState::RolledBack,
                error: err.to_string(),
                restored,
            };
        }

        transition(name, SignState::Signing, SignState::Verifying);
        let verified = classify(self.probe, module) == SignatureStatus::Signed;
        if !verified {
            // The taint oracle only updates on reload and modinfo can lag on
            // some filesystems; this is reported, not failed.
            warn!(
                module = %name,
                "verification inconclusive: signature not observed yet; counting as signed"
            );
        }
        transition(name, SignState::Verifying, SignState::Signed);
        info!(module = %name, backup = %backup.path.display(), "module signed");
        ModuleOutcome::Signed {
            backup: backup.path,
            verified,
        }
    }
}

fn transition(module: &str, from: SignState, to: SignState) {
    debug!(module, ?from, ?to, "sign state");
}

/// Put the backup's bytes back over the module and confirm the digest.
fn restore_from(backup: &Backup, module: &Module) -> Result<(), ModuleError> {
    let fail = |reason: String| ModuleError::Restore {
        backup: backup.path.clone(),
        reason,
    };
    fsutil::copy_atomic(&backup.path, &module.path, backup.meta.mode)
        .map_err(|e| fail(format!("{e:#}")))?;
    let Some(expected) = backup.meta.sha256.as_deref() else {
        return Ok(());
    };
    let actual = fsutil::hash_file(&module.path).map_err(|e| fail(format!("{e:#}")))?;
    if actual != expected {
        return Err(fail(format!(
            "digest after restore {actual} does not match backup {expected}"
        )));
    }
    Ok(())
}

/// Rebuild the boot image once when at least one module was signed.
pub fn rebuild_boot_image(builder: &dyn BootImageBuilder, report: &SignReport) -> RebuildOutcome {
    if report.signed == 0 {
        return RebuildOutcome::NotNeeded;
    }
    if report.cancelled {
        warn!("run cancelled after signing; boot image not rebuilt, rebuild it manually");
        return RebuildOutcome::Skipped {
            reason: "cancelled".into(),
        };
    }
    info!(signed = report.signed, "rebuilding boot image");
    match builder.rebuild() {
        Ok(()) => {
            info!("boot image rebuilt");
            RebuildOutcome::Rebuilt
        }
        Err(e) => {
            error!(error = %e, "boot image rebuild failed; signed modules stay signed");
            RebuildOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}
