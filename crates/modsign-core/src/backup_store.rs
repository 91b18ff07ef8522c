//! Timestamped module backups.
//!
//! Layout: `{backup_dir}/{timestamp}_{basename}` plus a sidecar
//! `{timestamp}_{basename}.json` describing the copy. Backups are never
//! pruned here.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::fsutil;
use crate::module::{Module, SignatureStatus};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6f";
const SIDECAR_EXT: &str = "json";
const BACKUP_FILE_MODE: u32 = 0o600;

/// Smallest file accepted as a plausible kernel module.
pub const MIN_MODULE_SIZE: u64 = 1024;
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

#[derive(Debug, thiserror::Error)]
pub enum BackupStoreError {
    #[error("backup i/o error on {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("backup of {path} differs from source – expected {expected}, got {actual}")]
    Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("backup {path} rejected: {reason}")]
    Rejected { path: PathBuf, reason: String },
}

impl BackupStoreError {
    fn io(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackupReason {
    PreSign,
    PreRestore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    pub module: String,
    pub source: Option<PathBuf>,
    pub kernel: Option<String>,
    pub size: u64,
    pub sha256: Option<String>,
    pub mode: Option<u32>,
    pub status: SignatureStatus,
    pub reason: Option<BackupReason>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub path: PathBuf,
    pub meta: BackupMeta,
}

impl Backup {
    pub fn module_name(&self) -> &str {
        &self.meta.module
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }

    /// Safety copies taken right before a restore are excluded.
    pub fn is_restore_candidate(&self) -> bool {
        self.meta.reason != Some(BackupReason::PreRestore)
    }

    fn sidecar_path(&self) -> PathBuf {
        sidecar_for(&self.path)
    }
}

fn sidecar_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXT);
    PathBuf::from(name)
}

pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, BackupStoreError> {
        let root = root.as_ref().to_path_buf();
        fsutil::ensure_private_dir(&root).map_err(|e| BackupStoreError::io(&root, format!("{e:#}")))?;
        fsutil::cleanup_staging(&root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `module` into the store and confirm the copy is byte-identical.
    pub fn create(
        &self,
        module: &Module,
        reason: BackupReason,
    ) -> Result<Backup, BackupStoreError> {
        let source_hash =
            fsutil::hash_file(&module.path).map_err(|e| BackupStoreError::io(&module.path, format!("{e:#}")))?;
        let mode = fsutil::file_mode(&module.path).ok();
        let (created_at, dest) = self.fresh_destination(&module.basename);

        let size = fsutil::copy_atomic(&module.path, &dest, Some(BACKUP_FILE_MODE))
            .map_err(|e| BackupStoreError::io(&dest, format!("{e:#}")))?;
        let copy_hash = fsutil::hash_file(&dest).map_err(|e| BackupStoreError::io(&dest, format!("{e:#}")))?;
        if copy_hash != source_hash {
            let _ = fs::remove_file(&dest);
            return Err(BackupStoreError::Mismatch {
                path: module.path.clone(),
                expected: source_hash,
                actual: copy_hash,
            });
        }

        let backup = Backup {
            path: dest,
            meta: BackupMeta {
                module: module.basename.clone(),
                source: Some(module.path.clone()),
                kernel: Some(module.kernel.clone()),
                size,
                sha256: Some(source_hash),
                mode,
                status: module.status,
                reason: Some(reason),
                created_at,
            },
        };
        let sidecar = serde_json::to_vec_pretty(&backup.meta)
            .map_err(|e| BackupStoreError::io(&backup.path, e))?;
        fsutil::write_atomic(&backup.sidecar_path(), &sidecar, Some(BACKUP_FILE_MODE))
            .map_err(|e| BackupStoreError::io(&backup.sidecar_path(), format!("{e:#}")))?;

        info!(
            module = %module.basename,
            backup = %backup.path.display(),
            size,
            "module backed up"
        );
        Ok(backup)
    }

    fn fresh_destination(&self, basename: &str) -> (DateTime<Utc>, PathBuf) {
        loop {
            let now = Utc::now();
            let dest = self
                .root
                .join(format!("{}_{}", now.format(TIMESTAMP_FORMAT), basename));
            if !dest.exists() {
                return (now, dest);
            }
            std::thread::sleep(std::time::Duration::from_micros(50));
        }
    }

    /// All backups, newest first.
    pub fn list(&self) -> Result<Vec<Backup>, BackupStoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| BackupStoreError::io(&self.root, e))?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) == Some(SIDECAR_EXT) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            match load_backup(&path, &name) {
                Some(backup) => out.push(backup),
                None => warn!(path = %path.display(), "ignoring file without backup timestamp"),
            }
        }
        out.sort_by(|a, b| {
            b.meta
                .created_at
                .cmp(&a.meta.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(out)
    }

    /// Newest restore candidate of each module. Older backups and the safety
    /// copies taken by a restore stay on disk but are not candidates for
    /// batch restore.
    pub fn latest_per_module(&self) -> Result<Vec<Backup>, BackupStoreError> {
        let mut seen = HashSet::new();
        Ok(self
            .list()?
            .into_iter()
            .filter(Backup::is_restore_candidate)
            .filter(|b| seen.insert(b.meta.module.clone()))
            .collect())
    }

    pub fn latest_for(&self, module: &str) -> Result<Option<Backup>, BackupStoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(Backup::is_restore_candidate)
            .find(|b| b.meta.module == module))
    }

    /// Find a backup by file name or path inside the store.
    pub fn find(&self, name: &str) -> Result<Option<Backup>, BackupStoreError> {
        let wanted = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string());
        Ok(self.list()?.into_iter().find(|b| {
            b.path
                .file_name()
                .map_or(false, |n| n.to_string_lossy() == wanted)
        }))
    }
}

fn load_backup(path: &Path, name: &str) -> Option<Backup> {
    let sidecar = sidecar_for(path);
    if let Ok(bytes) = fs::read(&sidecar) {
        match serde_json::from_slice::<BackupMeta>(&bytes) {
            Ok(meta) => {
                return Some(Backup {
                    path: path.to_path_buf(),
                    meta,
                })
            }
            Err(e) => warn!(sidecar = %sidecar.display(), error = %e, "unreadable backup metadata"),
        }
    }
    // Bare copies (no sidecar) are still usable; derive what we can from
    // the name.
    let (created, module) = split_backup_name(name)?;
    let size = fs::metadata(path).ok()?.len();
    Some(Backup {
        path: path.to_path_buf(),
        meta: BackupMeta {
            module: module.to_string(),
            source: None,
            kernel: None,
            size,
            sha256: None,
            mode: None,
            status: SignatureStatus::Unknown,
            reason: None,
            created_at: created.and_utc(),
        },
    })
}

/// Splits `{timestamp}_{module}`. Older copies used `%Y%m%d_%H%M%S`, whose
/// own underscore is part of the timestamp.
fn split_backup_name(name: &str) -> Option<(NaiveDateTime, &str)> {
    const LEGACY_FORMAT: &str = "%Y%m%d_%H%M%S";
    const LEGACY_LEN: usize = 15;

    if let (Some(ts), Some(rest)) = (name.get(..LEGACY_LEN), name.get(LEGACY_LEN..)) {
        if let (Ok(created), Some(module)) = (
            NaiveDateTime::parse_from_str(ts, LEGACY_FORMAT),
            rest.strip_prefix('_'),
        ) {
            return Some((created, module));
        }
    }
    let (ts, module) = name.split_once('_')?;
    let created = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(ts, "%Y%m%dT%H%M%S"))
        .ok()?;
    Some((created, module))
}

/// Sanity checks before trusting a backup: ELF header, plausible size, and
/// the recorded digest when one exists.
pub fn verify_integrity(backup: &Backup) -> Result<(), BackupStoreError> {
    let reject = |reason: String| BackupStoreError::Rejected {
        path: backup.path.clone(),
        reason,
    };
    let meta = fs::metadata(&backup.path).map_err(|e| reject(format!("unreadable: {e}")))?;
    if meta.len() < MIN_MODULE_SIZE {
        return Err(reject(format!(
            "size {} below minimum {}",
            meta.len(),
            MIN_MODULE_SIZE
        )));
    }
    let mut magic = [0u8; 4];
    File::open(&backup.path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| reject(format!("cannot read header: {e}")))?;
    if magic != ELF_MAGIC {
        return Err(reject("not an ELF object".into()));
    }
    if let Some(expected) = &backup.meta.sha256 {
        let actual = fsutil::hash_file(&backup.path).map_err(|e| reject(format!("{e:#}")))?;
        if &actual != expected {
            return Err(reject(format!(
                "digest mismatch – expected {expected}, got {actual}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_module(dir: &Path, name: &str, fill: u8) -> Module {
        let path = dir.join(name);
        let mut bytes = ELF_MAGIC.to_vec();
        bytes.resize(4096, fill);
        fs::write(&path, bytes).unwrap();
        let mut m = Module::new(path, "6.9.4");
        m.status = SignatureStatus::Unsigned;
        m
    }

    #[test]
    fn backup_is_identical_with_sidecar() {
        let dir = tempdir().unwrap();
        let store = BackupStore::open(dir.path().join("backups")).unwrap();
        let module = fake_module(dir.path(), "nvidia.ko", 1);
        let backup = store.create(&module, BackupReason::PreSign).unwrap();
        assert_eq!(fs::read(&backup.path).unwrap(), fs::read(&module.path).unwrap());
        assert!(backup.sidecar_path().exists());
        assert_eq!(backup.meta.status, SignatureStatus::Unsigned);
        verify_integrity(&backup).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![backup]);
    }

    #[test]
    fn latest_per_module_picks_newest() {
        let dir = tempdir().unwrap();
        let store = BackupStore::open(dir.path().join("backups")).unwrap();
        let a = fake_module(dir.path(), "nvidia.ko", 1);
        let b = fake_module(dir.path(), "nvidia-drm.ko", 2);
        let _old = store.create(&a, BackupReason::PreSign).unwrap();
        fs::write(&a.path, [ELF_MAGIC.to_vec(), vec![9u8; 2048]].concat()).unwrap();
        let newer = store.create(&a, BackupReason::PreSign).unwrap();
        store.create(&b, BackupReason::PreSign).unwrap();
        store.create(&a, BackupReason::PreRestore).unwrap();

        assert_eq!(store.list().unwrap().len(), 4);
        let latest = store.latest_per_module().unwrap();
        assert_eq!(latest.len(), 2);
        let nv = latest.iter().find(|b| b.module_name() == "nvidia.ko").unwrap();
        assert_eq!(nv.path, newer.path);
        assert_eq!(store.latest_for("nvidia.ko").unwrap().unwrap().path, newer.path);
    }

    #[test]
    fn integrity_rejects_small_or_foreign_files() {
        let dir = tempdir().unwrap();
        let store = BackupStore::open(dir.path().join("backups")).unwrap();
        let tiny = store.root().join("20240101T000000_tiny.ko");
        fs::write(&tiny, b"\x7fELF").unwrap();
        let text = store.root().join("20240101T000000_text.ko");
        fs::write(&text, vec![b'a'; 4096]).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        for backup in &listed {
            assert!(matches!(
                verify_integrity(backup),
                Err(BackupStoreError::Rejected { .. })
            ));
            assert_eq!(backup.meta.status, SignatureStatus::Unknown);
        }
    }

    #[test]
    fn bare_copies_parse_both_name_layouts() {
        let (created, module) = split_backup_name("20240101_120000_nvidia.ko").unwrap();
        assert_eq!(module, "nvidia.ko");
        assert_eq!(created.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-01-01 12:00:00");

        let (_, module) = split_backup_name("20240101T120000.123456_nvidia-drm.ko").unwrap();
        assert_eq!(module, "nvidia-drm.ko");
        let (_, module) = split_backup_name("20240101T120000_nvidia_uvm.ko").unwrap();
        assert_eq!(module, "nvidia_uvm.ko");
        assert!(split_backup_name("nvidia.ko").is_none());

        let dir = tempdir().unwrap();
        let store = BackupStore::open(dir.path().join("backups")).unwrap();
        let mut bytes = ELF_MAGIC.to_vec();
        bytes.resize(4096, 7);
        fs::write(store.root().join("20240101_120000_nvidia.ko"), bytes).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].module_name(), "nvidia.ko");
    }

    #[test]
    fn tampered_backup_fails_digest_check() {
        let dir = tempdir().unwrap();
        let store = BackupStore::open(dir.path().join("backups")).unwrap();
        let module = fake_module(dir.path(), "nvidia.ko", 3);
        let backup = store.create(&module, BackupReason::PreSign).unwrap();
        let mut bytes = fs::read(&backup.path).unwrap();
        bytes[100] ^= 0xff;
        fs::write(&backup.path, bytes).unwrap();
        assert!(verify_integrity(&backup).is_err());
    }
}
