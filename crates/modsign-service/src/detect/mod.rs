//! Host environment detection: Secure Boot, TPM and signing prerequisites.

use modsign_core::config::ModsignConfig;
use modsign_core::fsutil::find_executable;
use modsign_core::records::{SecureBootState, TpmState};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::GateError;

const SECURE_BOOT_VAR: &str = "SecureBoot-8be4df61-93ca-11d2-aa0d-e98c0344ff8c";

pub struct SystemDetector {
    efi_root: PathBuf,
    mokutil: String,
    tpm_devices: Vec<PathBuf>,
    tpm_tools: Vec<String>,
}

impl Default for SystemDetector {
    fn default() -> Self {
        Self {
            efi_root: PathBuf::from("/sys/firmware/efi"),
            mokutil: "mokutil".into(),
            tpm_devices: vec![PathBuf::from("/dev/tpmrm0"), PathBuf::from("/dev/tpm0")],
            tpm_tools: vec!["tpm2_getcap".into()],
        }
    }
}

impl SystemDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_efi_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.efi_root = root.into();
        self
    }

    pub fn with_mokutil(mut self, mokutil: impl Into<String>) -> Self {
        self.mokutil = mokutil.into();
        self
    }

    pub fn with_tpm(mut self, devices: Vec<PathBuf>, tools: Vec<String>) -> Self {
        self.tpm_devices = devices;
        self.tpm_tools = tools;
        self
    }

    /// Firmware variable first, `mokutil --sb-state` as fallback. A host
    /// without EFI reports `Unsupported`.
    pub fn detect_secure_boot(&self) -> SecureBootState {
        if !self.efi_root.is_dir() {
            debug!(path = %self.efi_root.display(), "no EFI firmware interface");
            return SecureBootState::Unsupported;
        }
        let var = self.efi_root.join("efivars").join(SECURE_BOOT_VAR);
        if let Ok(bytes) = std::fs::read(&var) {
            if let Some(state) = parse_efivar(&bytes) {
                return state;
            }
            warn!(path = %var.display(), "unexpected SecureBoot variable layout");
        }
        match Command::new(&self.mokutil).arg("--sb-state").output() {
            Ok(out) => {
                let text = format!(
                    "{}{}",
                    String::from_utf8_lossy(&out.stdout),
                    String::from_utf8_lossy(&out.stderr)
                );
                parse_sb_state(&text).unwrap_or(SecureBootState::Unsupported)
            }
            Err(e) => {
                warn!(error = %e, "mokutil unavailable; secure boot state indeterminate");
                SecureBootState::Unsupported
            }
        }
    }

    pub fn detect_tpm(&self) -> TpmState {
        let device = self.tpm_devices.iter().find(|d| d.exists());
        let Some(device) = device else {
            return TpmState::Unavailable;
        };
        let missing: Vec<&String> = self
            .tpm_tools
            .iter()
            .filter(|t| find_executable(t).is_none())
            .collect();
        if missing.is_empty() {
            debug!(device = %device.display(), "tpm available");
            TpmState::Available
        } else {
            debug!(device = %device.display(), ?missing, "tpm present but tools missing");
            TpmState::ToolsMissing
        }
    }

    /// Every tool and key file signing depends on. All absences are reported
    /// together.
    pub fn verify_prerequisites(
        &self,
        config: &ModsignConfig,
        kernel: &str,
    ) -> Result<(), GateError> {
        let mut missing = Vec::new();
        for tool in &config.signing.required_tools {
            if find_executable(tool).is_none() {
                missing.push(tool.clone());
            }
        }
        if let Some(rebuild) = config.paths.boot_rebuild_command.first() {
            if find_executable(rebuild).is_none() && !missing.contains(rebuild) {
                missing.push(rebuild.clone());
            }
        }
        let sign_tool = config.sign_tool_path(kernel);
        if find_executable(&sign_tool.to_string_lossy()).is_none() {
            missing.push(sign_tool.display().to_string());
        }
        for key in [&config.paths.private_key, &config.paths.public_key] {
            if !is_file(key) {
                missing.push(key.display().to_string());
            }
        }
        if missing.is_empty() {
            info!(kernel, "signing prerequisites present");
            Ok(())
        } else {
            Err(GateError::PrerequisitesMissing(missing))
        }
    }
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

/// efivarfs content: 4 attribute bytes followed by the value byte.
pub fn parse_efivar(bytes: &[u8]) -> Option<SecureBootState> {
    match bytes.get(4)? {
        1 => Some(SecureBootState::Enabled),
        0 => Some(SecureBootState::Disabled),
        _ => None,
    }
}

pub fn parse_sb_state(output: &str) -> Option<SecureBootState> {
    let lower = output.to_ascii_lowercase();
    if lower.contains("secureboot enabled") {
        Some(SecureBootState::Enabled)
    } else if lower.contains("secureboot disabled") {
        Some(SecureBootState::Disabled)
    } else if lower.contains("efi variables are not supported") {
        Some(SecureBootState::Unsupported)
    } else {
        None
    }
}
