//! Module discovery and signature classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    Signed,
    Unsigned,
    Unknown,
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Signed => "signed",
            Self::Unsigned => "unsigned",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Module {
    pub path: PathBuf,
    pub basename: String,
    pub kernel: String,
    pub status: SignatureStatus,
}

impl Module {
    pub fn new(path: PathBuf, kernel: &str) -> Self {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path,
            basename,
            kernel: kernel.to_string(),
            status: SignatureStatus::Unknown,
        }
    }

    /// Name the kernel knows the module by once loaded.
    pub fn kernel_name(&self) -> String {
        kernel_module_name(&self.basename)
    }
}

/// `nvidia-drm.ko.xz` → `nvidia_drm`
pub fn kernel_module_name(basename: &str) -> String {
    let stem = basename
        .find(".ko")
        .map(|idx| &basename[..idx])
        .unwrap_or(basename);
    stem.replace('-', "_")
}

// ── Signature oracles ───────────────────────────────────────────────────────

pub trait SignatureProbe: Send + Sync {
    /// Signer recorded in the module's embedded signature, if any.
    fn embedded_signer(&self, path: &Path) -> anyhow::Result<Option<String>>;
    /// Taint flags of the loaded module, `None` when it is not loaded.
    fn taint(&self, module_name: &str) -> Option<String>;
}

/// Kernel flag set on modules loaded without a valid signature.
const UNSIGNED_TAINT_FLAG: char = 'E';

/// Either oracle is sufficient proof of a signature; the embedded signer is
/// consulted first.
pub fn classify(probe: &dyn SignatureProbe, module: &Module) -> SignatureStatus {
    match probe.embedded_signer(&module.path) {
        Ok(Some(signer)) => {
            debug!(module = %module.basename, signer = %signer, "embedded signer present");
            return SignatureStatus::Signed;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(module = %module.basename, error = %e, "signer metadata query failed");
        }
    }
    match probe.taint(&module.kernel_name()) {
        Some(flags) if !flags.contains(UNSIGNED_TAINT_FLAG) => {
            debug!(module = %module.basename, taint = %flags, "loaded module taint is clean");
            SignatureStatus::Signed
        }
        _ => SignatureStatus::Unsigned,
    }
}

/// Probe backed by `modinfo` and sysfs.
pub struct KernelProbe {
    modinfo: String,
    sysfs_modules: PathBuf,
}

impl KernelProbe {
    pub fn new(sysfs_modules: impl Into<PathBuf>) -> Self {
        Self {
            modinfo: "modinfo".into(),
            sysfs_modules: sysfs_modules.into(),
        }
    }

    pub fn with_modinfo(mut self, modinfo: impl Into<String>) -> Self {
        self.modinfo = modinfo.into();
        self
    }
}

impl SignatureProbe for KernelProbe {
    fn embedded_signer(&self, path: &Path) -> anyhow::Result<Option<String>> {
        let output = Command::new(&self.modinfo)
            .arg("-F")
            .arg("signer")
            .arg(path)
            .output()?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "{} exited with {}: {}",
                self.modinfo,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let signer = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!signer.is_empty()).then_some(signer))
    }

    fn taint(&self, module_name: &str) -> Option<String> {
        let path = self.sysfs_modules.join(module_name).join("taint");
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }
}

// ── Scanner ─────────────────────────────────────────────────────────────────

/// Enumerates module files matching a glob pattern under the search
/// directories. Each call to [`ModuleScanner::find_modules`] walks the
/// filesystem again.
pub struct ModuleScanner {
    search_dirs: Vec<PathBuf>,
    kernel: String,
}

impl ModuleScanner {
    pub fn new(search_dirs: Vec<PathBuf>, kernel: impl Into<String>) -> Self {
        Self {
            search_dirs,
            kernel: kernel.into(),
        }
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    pub fn find_modules<'a>(
        &'a self,
        pattern: &str,
    ) -> anyhow::Result<impl Iterator<Item = Module> + 'a> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid module pattern {pattern:?}: {e}"))?;
        let kernel = self.kernel.as_str();
        Ok(self
            .search_dirs
            .iter()
            .filter(|dir| dir.is_dir())
            .flat_map(|dir| {
                WalkDir::new(dir)
                    .follow_links(false)
                    .sort_by_file_name()
                    .into_iter()
            })
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry during module scan");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter(move |e| matcher.matches(&e.file_name().to_string_lossy()))
            .map(move |e| Module::new(e.into_path(), kernel)))
    }

    /// Enumerate and classify in one pass.
    pub fn scan(&self, pattern: &str, probe: &dyn SignatureProbe) -> anyhow::Result<Vec<Module>> {
        Ok(self
            .find_modules(pattern)?
            .map(|mut m| {
                m.status = classify(probe, &m);
                m
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct StaticProbe {
        signers: HashMap<PathBuf, String>,
        taints: HashMap<String, String>,
        fail_signer: bool,
    }

    impl SignatureProbe for StaticProbe {
        fn embedded_signer(&self, path: &Path) -> anyhow::Result<Option<String>> {
            if self.fail_signer {
                anyhow::bail!("modinfo missing");
            }
            Ok(self.signers.get(path).cloned())
        }
        fn taint(&self, module_name: &str) -> Option<String> {
            self.taints.get(module_name).cloned()
        }
    }

    fn probe() -> StaticProbe {
        StaticProbe {
            signers: HashMap::new(),
            taints: HashMap::new(),
            fail_signer: false,
        }
    }

    #[test]
    fn module_names_follow_kernel_convention() {
        assert_eq!(kernel_module_name("nvidia-drm.ko"), "nvidia_drm");
        assert_eq!(kernel_module_name("nvidia-uvm.ko.xz"), "nvidia_uvm");
        assert_eq!(kernel_module_name("plain"), "plain");
    }

    #[test]
    fn either_oracle_marks_signed() {
        let m = Module::new(PathBuf::from("/x/nvidia.ko"), "6.9");
        let mut p = probe();
        assert_eq!(classify(&p, &m), SignatureStatus::Unsigned);

        p.signers.insert(m.path.clone(), "Local MOK".into());
        assert_eq!(classify(&p, &m), SignatureStatus::Signed);

        let mut p = probe();
        p.fail_signer = true;
        p.taints.insert("nvidia".into(), "PO".into());
        assert_eq!(classify(&p, &m), SignatureStatus::Signed);

        p.taints.insert("nvidia".into(), "POE".into());
        assert_eq!(classify(&p, &m), SignatureStatus::Unsigned);
    }

    #[test]
    fn scan_is_fresh_and_pattern_filtered() {
        let dir = tempdir().unwrap();
        let extra = dir.path().join("extra");
        std::fs::create_dir_all(extra.join("nested")).unwrap();
        std::fs::write(extra.join("nvidia.ko"), b"a").unwrap();
        std::fs::write(extra.join("nested/nvidia-drm.ko"), b"b").unwrap();
        std::fs::write(extra.join("e1000e.ko"), b"c").unwrap();
        let scanner = ModuleScanner::new(
            vec![extra.clone(), dir.path().join("missing")],
            "6.9",
        );
        let names: Vec<String> = scanner
            .find_modules("nvidia*.ko")
            .unwrap()
            .map(|m| m.basename)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"nvidia.ko".to_string()));

        std::fs::write(extra.join("nvidia-uvm.ko"), b"d").unwrap();
        assert_eq!(scanner.find_modules("nvidia*.ko").unwrap().count(), 3);
        assert!(scanner.find_modules("[").is_err());
    }
}
