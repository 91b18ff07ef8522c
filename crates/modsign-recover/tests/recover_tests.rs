use modsign_core::backup_store::{BackupReason, BackupStore, ELF_MAGIC};
use modsign_core::module::{classify, Module, SignatureProbe, SignatureStatus};
use modsign_core::records::{FailureCounter, FAILURE_KEY};
use modsign_core::state::{FileStateStore, StateStore, StateStoreExt};
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const KERNEL: &str = "6.9.4-test";
const SIG_MARKER: &[u8] = b"~Module signature appended~\n";

struct MarkerProbe;

impl SignatureProbe for MarkerProbe {
    fn embedded_signer(&self, path: &Path) -> anyhow::Result<Option<String>> {
        Ok(fs::read(path)?
            .ends_with(SIG_MARKER)
            .then(|| "Test MOK".to_string()))
    }
    fn taint(&self, _: &str) -> Option<String> {
        None
    }
}

struct Fixture {
    dir: TempDir,
    config: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("lib/modules").join(KERNEL).join("extra")).unwrap();
        let config = root.join("config.toml");
        fs::write(
            &config,
            format!(
                "[paths]\n\
                 modules_root = '{root}/lib/modules'\n\
                 module_subdirs = ['extra']\n\
                 state_dir = '{root}/state'\n\
                 backup_dir = '{root}/state/backups'\n\
                 lock_file = '{root}/run/modsign.lock'\n",
                root = root.display()
            ),
        )
        .unwrap();
        Self { dir, config }
    }

    fn module_path(&self, name: &str) -> PathBuf {
        self.dir
            .path()
            .join("lib/modules")
            .join(KERNEL)
            .join("extra")
            .join(name)
    }

    fn write_module(&self, name: &str, fill: u8, signed: bool) -> PathBuf {
        let path = self.module_path(name);
        let mut bytes = ELF_MAGIC.to_vec();
        bytes.resize(4096, fill);
        if signed {
            bytes.extend_from_slice(SIG_MARKER);
        }
        fs::write(&path, bytes).unwrap();
        path
    }

    fn store(&self) -> BackupStore {
        BackupStore::open(self.dir.path().join("state/backups")).unwrap()
    }

    fn state(&self) -> FileStateStore {
        FileStateStore::open(self.dir.path().join("state")).unwrap()
    }

    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("modsign-recover").unwrap();
        cmd.arg("--config")
            .arg(&self.config)
            .arg("--kernel")
            .arg(KERNEL);
        cmd
    }
}

fn classified(path: &Path) -> SignatureStatus {
    classify(&MarkerProbe, &Module::new(path.to_path_buf(), KERNEL))
}

#[test]
fn unreadable_config_is_configuration_error() {
    let dir = tempdir().unwrap();
    let mut cmd = assert_cmd::Command::cargo_bin("modsign-recover").unwrap();
    cmd.arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("list");
    cmd.assert().code(6);
}

#[test]
fn list_on_empty_store_prints_empty_array() {
    let fx = Fixture::new();
    fx.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn restore_round_trip_matches_backup_status() {
    let fx = Fixture::new();
    let path = fx.write_module("nvidia.ko", 1, false);
    let mut module = Module::new(path.clone(), KERNEL);
    module.status = classified(&path);
    let backup = fx.store().create(&module, BackupReason::PreSign).unwrap();
    assert_eq!(backup.meta.status, SignatureStatus::Unsigned);

    // A later signing run leaves the module signed.
    fx.write_module("nvidia.ko", 1, true);
    assert_eq!(classified(&path), SignatureStatus::Signed);

    fx.cmd()
        .args(["restore", "nvidia.ko"])
        .assert()
        .success()
        .stdout(predicate::str::contains("safetyBackup"));

    assert_eq!(fs::read(&path).unwrap(), fs::read(&backup.path).unwrap());
    assert_eq!(classified(&path), backup.meta.status);
}

#[test]
fn restore_named_backup_and_missing_module() {
    let fx = Fixture::new();
    let path = fx.write_module("nvidia-drm.ko", 1, false);
    let first = fx
        .store()
        .create(&Module::new(path.clone(), KERNEL), BackupReason::PreSign)
        .unwrap();
    fx.write_module("nvidia-drm.ko", 2, false);
    fx.store()
        .create(&Module::new(path.clone(), KERNEL), BackupReason::PreSign)
        .unwrap();
    fx.write_module("nvidia-drm.ko", 3, true);

    let name = first.path.file_name().unwrap().to_string_lossy().to_string();
    fx.cmd()
        .args(["restore", "nvidia-drm.ko", "--backup", &name])
        .assert()
        .success();
    assert_eq!(fs::read(&path).unwrap(), fs::read(&first.path).unwrap());

    fx.cmd()
        .args(["restore", "nvidia-uvm.ko"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no backups found"));
}

#[test]
fn auto_restores_every_module() {
    let fx = Fixture::new();
    let a = fx.write_module("nvidia.ko", 1, false);
    let b = fx.write_module("nvidia-modeset.ko", 2, false);
    let store = fx.store();
    store
        .create(&Module::new(a.clone(), KERNEL), BackupReason::PreSign)
        .unwrap();
    store
        .create(&Module::new(b.clone(), KERNEL), BackupReason::PreSign)
        .unwrap();
    let a_original = fs::read(&a).unwrap();
    let b_original = fs::read(&b).unwrap();
    fx.write_module("nvidia.ko", 9, true);
    fx.write_module("nvidia-modeset.ko", 9, true);

    fx.cmd().arg("auto").assert().success();

    assert_eq!(fs::read(&a).unwrap(), a_original);
    assert_eq!(fs::read(&b).unwrap(), b_original);

    // Running again restores the same signer backups, not the safety copies.
    fx.cmd().arg("auto").assert().success();
    assert_eq!(fs::read(&a).unwrap(), a_original);
}

#[test]
fn auto_without_backups_fails() {
    let fx = Fixture::new();
    fx.cmd().arg("auto").assert().code(1);
}

#[test]
fn reset_breaker_and_clear_state() {
    let fx = Fixture::new();
    let state = fx.state();
    let mut failures = FailureCounter::default();
    for _ in 0..3 {
        failures.record_failure("signature missing after run");
    }
    state.save(FAILURE_KEY, &failures).unwrap();

    fx.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"circuitOpen\": true"));

    fx.cmd()
        .arg("reset-breaker")
        .assert()
        .success()
        .stdout(predicate::str::contains("true"));
    assert!(state.get(FAILURE_KEY).unwrap().is_none());

    let lock = fx.dir.path().join("run/modsign.lock");
    fs::create_dir_all(lock.parent().unwrap()).unwrap();
    fs::write(&lock, b"").unwrap();
    state.set("rate_limit", &serde_json::json!({"lastAttempt": "bogus"})).unwrap();

    fx.cmd()
        .arg("clear-state")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"lockRemoved\": true"));
    assert!(!lock.exists());
    assert!(state.get("rate_limit").unwrap().is_none());
}

#[test]
fn interactive_exit_choice_succeeds() {
    let fx = Fixture::new();
    fx.cmd()
        .arg("interactive")
        .write_stdin("0\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("modsign recovery"));
}
