//! Filesystem helpers shared by the signer, the state store and recovery.

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

const STAGING_PREFIX: &str = ".modsign_staging_";

/// SHA-256 of a file, hex encoded.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write `bytes` to `dest` through a staging file in the same directory,
/// then rename over the destination.
pub fn write_atomic(dest: &Path, bytes: &[u8], mode: Option<u32>) -> Result<()> {
    let parent = parent_of(dest)?;
    fs::create_dir_all(parent)?;
    let staging = staging_path(parent);
    {
        let mut file = File::create(&staging)
            .with_context(|| format!("create staging {}", staging.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    finish_staged(&staging, dest, mode)
}

/// Copy `src` over `dest` atomically. `mode` is applied to the result when
/// given, otherwise the source permissions carry over.
pub fn copy_atomic(src: &Path, dest: &Path, mode: Option<u32>) -> Result<u64> {
    let parent = parent_of(dest)?;
    fs::create_dir_all(parent)?;
    let staging = staging_path(parent);
    let copied = fs::copy(src, &staging)
        .with_context(|| format!("copy {} -> {}", src.display(), staging.display()))?;
    if let Err(e) = File::open(&staging).and_then(|f| f.sync_all()) {
        let _ = fs::remove_file(&staging);
        return Err(e).context("fsync staging copy");
    }
    finish_staged(&staging, dest, mode)?;
    Ok(copied)
}

fn finish_staged(staging: &Path, dest: &Path, mode: Option<u32>) -> Result<()> {
    if let Some(mode) = mode {
        if let Err(e) = set_mode(staging, mode) {
            let _ = fs::remove_file(staging);
            return Err(e);
        }
    }
    if let Err(e) = fs::rename(staging, dest) {
        let _ = fs::remove_file(staging);
        return Err(e).with_context(|| format!("rename into {}", dest.display()));
    }
    if let Some(parent) = dest.parent() {
        fsync_dir(parent);
    }
    Ok(())
}

fn staging_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4().simple()))
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| anyhow!("no parent directory for {}", path.display()))
}

/// Remove staging files left behind by a crash mid-copy.
pub fn cleanup_staging(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(STAGING_PREFIX)
            {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn fsync_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Ok(dir) = OpenOptions::new().read(true).open(path) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {:o} on {}", mode, path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Permission bits (lower 12) of a file.
pub fn file_mode(path: &Path) -> Result<u32> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        Ok(if meta.permissions().readonly() { 0o444 } else { 0o644 })
    }
}

/// Create `path` (and parents) and restrict it to the owner.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
    if let Err(e) = set_mode(path, 0o700) {
        warn!("cannot restrict permissions on {}: {}", path.display(), e);
    }
    Ok(())
}

/// Resolve a tool name against `PATH`. Names containing a slash are checked
/// as-is.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let p = PathBuf::from(name);
        return is_executable(&p).then_some(p);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode() & 0o111 != 0
            }
            #[cfg(not(unix))]
            {
                true
            }
        }
        _ => false,
    }
}
