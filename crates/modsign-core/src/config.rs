use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/modsign/config.toml";

/// Placeholder expanded with the running (or overridden) kernel release.
pub const KERNEL_PLACEHOLDER: &str = "{kernel}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    pub modules_root: PathBuf,
    pub module_subdirs: Vec<String>,
    pub module_pattern: String,
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    pub sign_tool: String,
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub lock_file: PathBuf,
    pub boot_image: String,
    pub boot_rebuild_command: Vec<String>,
    pub root_mount: PathBuf,
    pub boot_mount: PathBuf,
    /// Location of the loaded-module taint flags.
    pub sysfs_modules: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetySettings {
    pub min_interval_secs: u64,
    pub root_min_kb: u64,
    pub boot_min_kb: u64,
    pub lock_timeout_secs: u64,
    pub lock_poll_secs: u64,
    pub circuit_breaker_threshold: u32,
    pub require_root: bool,
    pub accepted_key_modes: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SigningSettings {
    pub hash_algorithm: String,
    pub require_secure_boot: bool,
    pub required_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifySettings {
    pub boot_image_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ModsignConfig {
    pub paths: PathSettings,
    pub safety: SafetySettings,
    pub signing: SigningSettings,
    pub verify: VerifySettings,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            modules_root: PathBuf::from("/lib/modules"),
            module_subdirs: vec![
                "extra".into(),
                "updates".into(),
                "kernel/drivers/video".into(),
            ],
            module_pattern: "nvidia*.ko".into(),
            private_key: PathBuf::from("/etc/pki/akmods/private/private_key.priv"),
            public_key: PathBuf::from("/etc/pki/akmods/certs/public_key.der"),
            sign_tool: "/usr/src/kernels/{kernel}/scripts/sign-file".into(),
            state_dir: PathBuf::from("/var/lib/modsign"),
            backup_dir: PathBuf::from("/var/lib/modsign/backups"),
            lock_file: PathBuf::from("/run/modsign/modsign.lock"),
            boot_image: "/boot/initramfs-{kernel}.img".into(),
            boot_rebuild_command: vec!["dracut".into(), "--force".into()],
            root_mount: PathBuf::from("/"),
            boot_mount: PathBuf::from("/boot"),
            sysfs_modules: PathBuf::from("/sys/module"),
        }
    }
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            min_interval_secs: 300,
            root_min_kb: 102_400,
            boot_min_kb: 51_200,
            lock_timeout_secs: 30,
            lock_poll_secs: 1,
            circuit_breaker_threshold: 3,
            require_root: true,
            accepted_key_modes: vec![0o400, 0o600],
        }
    }
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            hash_algorithm: "sha256".into(),
            require_secure_boot: false,
            required_tools: vec!["modinfo".into()],
        }
    }
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            boot_image_max_age_secs: 300,
        }
    }
}

impl ModsignConfig {
    /// Load configuration. An explicit path must exist and parse; the default
    /// path silently falls back to built-in defaults when absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Directories searched for modules of the given kernel release.
    pub fn module_search_dirs(&self, kernel: &str) -> Vec<PathBuf> {
        let base = self.paths.modules_root.join(kernel);
        self.paths
            .module_subdirs
            .iter()
            .map(|sub| base.join(sub))
            .collect()
    }

    pub fn sign_tool_path(&self, kernel: &str) -> PathBuf {
        PathBuf::from(expand_kernel(&self.paths.sign_tool, kernel))
    }

    pub fn boot_image_path(&self, kernel: &str) -> PathBuf {
        PathBuf::from(expand_kernel(&self.paths.boot_image, kernel))
    }
}

pub fn expand_kernel(template: &str, kernel: &str) -> String {
    template.replace(KERNEL_PLACEHOLDER, kernel)
}

/// Kernel release of the running system.
pub fn running_kernel_release() -> Result<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("read /proc/sys/kernel/osrelease")?;
    Ok(raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: ModsignConfig = toml::from_str(
            r#"
            [safety]
            min_interval_secs = 60

            [paths]
            module_pattern = "vboxdrv*.ko"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.safety.min_interval_secs, 60);
        assert_eq!(cfg.safety.circuit_breaker_threshold, 3);
        assert_eq!(cfg.paths.module_pattern, "vboxdrv*.ko");
        assert_eq!(cfg.paths.backup_dir, PathBuf::from("/var/lib/modsign/backups"));
    }

    #[test]
    fn kernel_placeholders_expand() {
        let cfg = ModsignConfig::default();
        assert_eq!(
            cfg.sign_tool_path("6.9.4-200.fc40.x86_64"),
            PathBuf::from("/usr/src/kernels/6.9.4-200.fc40.x86_64/scripts/sign-file")
        );
        assert_eq!(
            cfg.boot_image_path("6.9.4"),
            PathBuf::from("/boot/initramfs-6.9.4.img")
        );
        let dirs = cfg.module_search_dirs("6.9.4");
        assert_eq!(dirs[0], PathBuf::from("/lib/modules/6.9.4/extra"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModsignConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
