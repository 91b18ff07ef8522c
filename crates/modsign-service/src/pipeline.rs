//! One signing run, end to end:
//! detect → scan → gate → sign → rebuild → verify → record → exit code.

use chrono::Utc;
use modsign_core::backup_store::BackupStore;
use modsign_core::cancel::Cancellation;
use modsign_core::config::ModsignConfig;
use modsign_core::exit_code::{resolve, ExitCode};
use modsign_core::module::{Module, ModuleScanner, SignatureProbe, SignatureStatus};
use modsign_core::records::{ExecutionState, SecureBootState, TpmState, EXECUTION_KEY};
use modsign_core::state::{StateStore, StateStoreExt};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::detect::SystemDetector;
use crate::error::{cancel_exit_code, GateError};
use crate::gate::{breaker_open, SafetyGate};
use crate::signing::{
    rebuild_boot_image, BootImageBuilder, KeyPair, RebuildOutcome, SignReport, SignTool, Signer,
};
use crate::verify::{PostVerifier, VerifyReport};

/// Capabilities the pipeline drives.
pub struct Ports<'a> {
    pub probe: &'a dyn SignatureProbe,
    pub sign_tool: &'a dyn SignTool,
    pub boot_builder: &'a dyn BootImageBuilder,
    pub state: &'a dyn StateStore,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedModule {
    pub module: String,
    pub path: std::path::PathBuf,
    pub status: SignatureStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub kernel: String,
    pub secure_boot: SecureBootState,
    pub tpm: TpmState,
    pub dry_run: bool,
    pub total: usize,
    pub signed: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub key_warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<PlannedModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing: Option<SignReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild: Option<RebuildOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerifyReport>,
    pub exit_code: ExitCode,
}

impl RunReport {
    fn new(kernel: &str, secure_boot: SecureBootState, tpm: TpmState, dry_run: bool) -> Self {
        Self {
            kernel: kernel.to_string(),
            secure_boot,
            tpm,
            dry_run,
            total: 0,
            signed: 0,
            skipped: 0,
            failed: 0,
            abort_reason: None,
            key_warnings: Vec::new(),
            planned: Vec::new(),
            signing: None,
            rebuild: None,
            verification: None,
            exit_code: ExitCode::Success,
        }
    }

    fn abort(mut self, err: &GateError) -> Self {
        error!(error = %err, "run aborted before any module was touched");
        self.exit_code = err.exit_code();
        self.abort_reason = Some(err.to_string());
        self
    }
}

pub struct Pipeline<'a> {
    config: &'a ModsignConfig,
    kernel: String,
    detector: SystemDetector,
    ports: Ports<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a ModsignConfig, kernel: impl Into<String>, ports: Ports<'a>) -> Self {
        Self {
            config,
            kernel: kernel.into(),
            detector: SystemDetector::new(),
            ports,
        }
    }

    pub fn with_detector(mut self, detector: SystemDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn scanner(&self) -> ModuleScanner {
        ModuleScanner::new(self.config.module_search_dirs(&self.kernel), self.kernel.clone())
    }

    pub fn run(&self, options: RunOptions, cancel: &Cancellation) -> RunReport {
        let secure_boot = self.detector.detect_secure_boot();
        let tpm = self.detector.detect_tpm();
        info!(kernel = %self.kernel, ?secure_boot, ?tpm, "environment detected");
        let report = RunReport::new(&self.kernel, secure_boot, tpm, options.dry_run);

        if let Err(e) = self.preflight(secure_boot) {
            return report.abort(&e);
        }

        let scanner = self.scanner();
        let modules = match scanner.scan(&self.config.paths.module_pattern, self.ports.probe) {
            Ok(m) => m,
            Err(e) => {
                return report.abort(&GateError::Configuration(format!("{e:#}")));
            }
        };
        let report = if options.dry_run {
            self.plan(report, &modules)
        } else {
            self.execute(report, &scanner, &modules, cancel)
        };
        info!(
            total = report.total,
            signed = report.signed,
            skipped = report.skipped,
            failed = report.failed,
            exit = %report.exit_code,
            "run summary"
        );
        report
    }

    fn preflight(&self, secure_boot: SecureBootState) -> Result<(), GateError> {
        if self.config.safety.require_root && !running_as_root() {
            return Err(GateError::PermissionDenied);
        }
        if self.config.signing.require_secure_boot && secure_boot != SecureBootState::Enabled {
            return Err(GateError::SecureBootNotEnabled(
                format!("{secure_boot:?}").to_lowercase(),
            ));
        }
        if secure_boot != SecureBootState::Enabled {
            warn!(?secure_boot, "secure boot not enabled; signing anyway");
        }
        self.detector.verify_prerequisites(self.config, &self.kernel)
    }

    fn plan(&self, mut report: RunReport, modules: &[Module]) -> RunReport {
        report.total = modules.len();
        report.skipped = modules
            .iter()
            .filter(|m| m.status == SignatureStatus::Signed)
            .count();
        report.planned = modules
            .iter()
            .map(|m| PlannedModule {
                module: m.basename.clone(),
                path: m.path.clone(),
                status: m.status,
            })
            .collect();
        for m in modules.iter().filter(|m| m.status != SignatureStatus::Signed) {
            info!(module = %m.basename, path = %m.path.display(), "dry run: would sign");
        }
        report.exit_code = if modules.is_empty() {
            ExitCode::SystemNotReady
        } else {
            ExitCode::Success
        };
        report
    }

    fn execute(
        &self,
        mut report: RunReport,
        scanner: &ModuleScanner,
        modules: &[Module],
        cancel: &Cancellation,
    ) -> RunReport {
        let threshold = self.config.safety.circuit_breaker_threshold;
        let prior_circuit_open = breaker_open(self.ports.state, threshold);
        report.total = modules.len();

        if modules.is_empty() {
            warn!(
                pattern = %self.config.paths.module_pattern,
                "no modules found; driver not installed for this kernel?"
            );
            report.exit_code = ExitCode::SystemNotReady;
            self.record(&report);
            return report;
        }

        // Gated even when nothing needs signing.
        let gate = SafetyGate::new(self.config, self.ports.state);
        let _lock = match gate.run_all(cancel) {
            Ok(pass) => {
                report.key_warnings = pass.key_warnings;
                pass.lock
            }
            Err(e) => return report.abort(&e),
        };
        if modules.iter().all(|m| m.status == SignatureStatus::Signed) {
            info!(total = modules.len(), "all modules already signed");
        }

        let backups = match BackupStore::open(&self.config.paths.backup_dir) {
            Ok(b) => b,
            Err(e) => {
                return report.abort(&GateError::Configuration(format!("backup store: {e}")));
            }
        };
        let signer = Signer::new(
            self.ports.sign_tool,
            self.ports.probe,
            &backups,
            KeyPair {
                private_key: self.config.paths.private_key.clone(),
                public_key: self.config.paths.public_key.clone(),
            },
            self.config.signing.hash_algorithm.clone(),
        );
        let signing = signer.sign_all(modules, cancel);
        let rebuild = rebuild_boot_image(self.ports.boot_builder, &signing);
        report.signed = signing.signed;
        report.skipped = signing.skipped;
        report.failed = signing.failed;

        if let Some(reason) = cancel.reason().filter(|_| signing.cancelled) {
            report.exit_code = cancel_exit_code(reason);
        } else {
            let verifier = PostVerifier::new(
                scanner,
                &self.config.paths.module_pattern,
                self.ports.probe,
                self.ports.state,
            )
            .with_boot_image(
                self.config.boot_image_path(&self.kernel),
                Duration::from_secs(self.config.verify.boot_image_max_age_secs),
            )
            .with_threshold(threshold);
            let run_clean = signing.failed == 0 && !rebuild.failed();
            match verifier.run(run_clean) {
                Ok(v) => report.verification = Some(v),
                Err(e) => error!(error = %format!("{e:#}"), "post-signing verification failed to run"),
            }

            let mut code = resolve(
                modules.len(),
                signing.signed,
                signing.failed,
                prior_circuit_open,
            );
            if rebuild.failed() && code == ExitCode::Success {
                code = ExitCode::PartialSuccess;
            }
            report.exit_code = code;
        }
        report.signing = Some(signing);
        report.rebuild = Some(rebuild);
        self.record(&report);
        report
    }

    fn record(&self, report: &RunReport) {
        let state = ExecutionState {
            timestamp: Utc::now(),
            kernel: report.kernel.clone(),
            secure_boot: report.secure_boot,
            tpm: report.tpm,
            signed: report.signed,
            skipped: report.skipped,
            failed: report.failed,
            rebuild_failed: report.rebuild.as_ref().map_or(false, |r| r.failed()),
            exit_code: report.exit_code.code(),
        };
        if let Err(e) = self.ports.state.save(EXECUTION_KEY, &state) {
            error!(error = %e, "failed to persist execution state");
        }
    }
}

fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}
