use modsign_core::backup_store::BackupStoreError;
use modsign_core::cancel::CancelReason;
use modsign_core::state::StateError;
use modsign_core::ExitCode;
use std::path::PathBuf;

/// Pre-flight failures. Any of these aborts the run before a module is
/// touched.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("prerequisites missing: {}", .0.join(", "))]
    PrerequisitesMissing(Vec<String>),
    #[error("rate limited: last attempt too recent, retry in {remaining_secs}s")]
    RateLimited { remaining_secs: u64 },
    #[error("timed out after {waited_secs}s waiting for run lock {} (holder pid {holder:?})", .path.display())]
    LockTimeout {
        path: PathBuf,
        holder: Option<u32>,
        waited_secs: u64,
    },
    #[error("circuit breaker open: {failures} consecutive verification failures (threshold {threshold}); reset required")]
    CircuitBreakerOpen { failures: u32, threshold: u32 },
    #[error("insufficient space on {}: {available_kb} KiB available, {required_kb} KiB required", .mount.display())]
    InsufficientResources {
        mount: PathBuf,
        available_kb: u64,
        required_kb: u64,
    },
    #[error("root privileges required")]
    PermissionDenied,
    #[error("secure boot is {0} but signing requires it enabled")]
    SecureBootNotEnabled(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("state store unavailable: {0}")]
    State(#[from] StateError),
    #[error("run lock unavailable: {0}")]
    Lock(String),
    #[error("cancelled ({0:?})")]
    Cancelled(CancelReason),
}

impl GateError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::PrerequisitesMissing(_) | Self::Configuration(_) => ExitCode::ConfigurationError,
            Self::RateLimited { .. } => ExitCode::RateLimited,
            Self::PermissionDenied => ExitCode::PermissionDenied,
            Self::InsufficientResources { .. } | Self::SecureBootNotEnabled(_) => {
                ExitCode::SystemNotReady
            }
            Self::LockTimeout { .. }
            | Self::CircuitBreakerOpen { .. }
            | Self::State(_)
            | Self::Lock(_) => ExitCode::GeneralFailure,
            Self::Cancelled(reason) => cancel_exit_code(*reason),
        }
    }
}

pub fn cancel_exit_code(reason: CancelReason) -> ExitCode {
    match reason {
        CancelReason::Interrupted => ExitCode::Interrupted,
        CancelReason::Terminated => ExitCode::Terminated,
    }
}

/// Failure of an external program (signing utility, boot-image builder).
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// Per-module failures. None of these stop the run.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("backup failed: {0}")]
    Backup(#[from] BackupStoreError),
    #[error("signing failed: {0}")]
    Signing(#[from] ToolError),
    #[error("restore from {} failed: {reason}", .backup.display())]
    Restore { backup: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_errors_map_to_exit_codes() {
        assert_eq!(
            GateError::PrerequisitesMissing(vec!["modinfo".into()]).exit_code(),
            ExitCode::ConfigurationError
        );
        assert_eq!(
            GateError::RateLimited { remaining_secs: 10 }.exit_code(),
            ExitCode::RateLimited
        );
        assert_eq!(
            GateError::CircuitBreakerOpen {
                failures: 3,
                threshold: 3
            }
            .exit_code(),
            ExitCode::GeneralFailure
        );
        assert_eq!(
            GateError::Cancelled(CancelReason::Terminated).exit_code(),
            ExitCode::Terminated
        );
        let msg = GateError::PrerequisitesMissing(vec!["modinfo".into(), "sign-file".into()])
            .to_string();
        assert!(msg.contains("modinfo, sign-file"));
    }
}
