//! Post-signing verification and the persisted success/failure counters
//! that feed the circuit breaker.

use chrono::{DateTime, Utc};
use modsign_core::module::{ModuleScanner, SignatureProbe, SignatureStatus};
use modsign_core::records::{FailureCounter, SuccessCounter, FAILURE_KEY, SUCCESS_KEY};
use modsign_core::state::{StateError, StateStore, StateStoreExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignatureCheck {
    pub total: usize,
    pub verified: usize,
    pub unverified: Vec<String>,
}

impl SignatureCheck {
    pub fn all_verified(&self) -> bool {
        self.unverified.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum Freshness {
    Fresh { age_secs: u64 },
    Stale { age_secs: u64 },
    Missing { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterUpdate {
    pub successes: u64,
    pub failures: u32,
    pub alert_raised: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub signatures: SignatureCheck,
    pub boot_image: Freshness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<CounterUpdate>,
}

pub struct PostVerifier<'a> {
    scanner: &'a ModuleScanner,
    pattern: &'a str,
    probe: &'a dyn SignatureProbe,
    state: &'a dyn StateStore,
    boot_image: PathBuf,
    max_age: Duration,
    threshold: u32,
}

impl<'a> PostVerifier<'a> {
    pub fn new(
        scanner: &'a ModuleScanner,
        pattern: &'a str,
        probe: &'a dyn SignatureProbe,
        state: &'a dyn StateStore,
    ) -> Self {
        Self {
            scanner,
            pattern,
            probe,
            state,
            boot_image: PathBuf::new(),
            max_age: Duration::from_secs(300),
            threshold: 3,
        }
    }

    pub fn with_boot_image(mut self, path: impl Into<PathBuf>, max_age: Duration) -> Self {
        self.boot_image = path.into();
        self.max_age = max_age;
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Re-scan and re-classify every module matching the pattern.
    pub fn verify_signatures(&self) -> anyhow::Result<SignatureCheck> {
        let mut check = SignatureCheck::default();
        for module in self.scanner.scan(self.pattern, self.probe)? {
            check.total += 1;
            if module.status == SignatureStatus::Signed {
                check.verified += 1;
            } else {
                warn!(module = %module.basename, "signature not present after run");
                check.unverified.push(module.basename);
            }
        }
        info!(
            total = check.total,
            verified = check.verified,
            "signature verification finished"
        );
        Ok(check)
    }

    /// Staleness is only a warning: the image may legitimately predate this
    /// run.
    pub fn verify_boot_image_freshness(&self) -> Freshness {
        let modified = std::fs::metadata(&self.boot_image).and_then(|m| m.modified());
        let modified: DateTime<Utc> = match modified {
            Ok(t) => t.into(),
            Err(_) => {
                warn!(path = %self.boot_image.display(), "boot image not found");
                return Freshness::Missing {
                    path: self.boot_image.clone(),
                };
            }
        };
        let age_secs = Utc::now()
            .signed_duration_since(modified)
            .num_seconds()
            .max(0) as u64;
        if age_secs > self.max_age.as_secs() {
            warn!(
                path = %self.boot_image.display(),
                age_secs,
                threshold = self.max_age.as_secs(),
                "boot image older than threshold"
            );
            Freshness::Stale { age_secs }
        } else {
            Freshness::Fresh { age_secs }
        }
    }

    /// A clean run bumps the success counter and clears the failure counter
    /// and marker; anything else bumps the failure counter. Crossing the
    /// breaker threshold raises an alert but halts nothing here.
    pub fn update_counters(&self, success: bool, reason: &str) -> Result<CounterUpdate, StateError> {
        let mut successes: SuccessCounter = self.state.load(SUCCESS_KEY)?.unwrap_or_default();
        let mut failures: FailureCounter = self.state.load(FAILURE_KEY)?.unwrap_or_default();
        let mut alert_raised = false;

        if success {
            successes.record_success();
            failures = FailureCounter::default();
            self.state.save(SUCCESS_KEY, &successes)?;
            self.state.remove(FAILURE_KEY)?;
        } else {
            let was_open = failures.is_open(self.threshold);
            failures.record_failure(reason);
            self.state.save(FAILURE_KEY, &failures)?;
            if !was_open && failures.is_open(self.threshold) {
                alert_raised = true;
                error!(
                    target: "modsign::alert",
                    failures = failures.count,
                    threshold = self.threshold,
                    reason,
                    "module signing keeps failing verification; further runs are blocked until the breaker is reset"
                );
            }
        }
        Ok(CounterUpdate {
            successes: successes.count,
            failures: failures.count,
            alert_raised,
        })
    }

    /// Full verification pass. `run_clean` is whether the signing run itself
    /// (including the boot-image rebuild) succeeded.
    pub fn run(&self, run_clean: bool) -> anyhow::Result<VerifyReport> {
        let mut report = self.check()?;
        let success = run_clean && report.signatures.all_verified();
        let reason = if !run_clean {
            "signing run reported failures".to_string()
        } else {
            format!("unsigned after run: {}", report.signatures.unverified.join(", "))
        };
        report.counters = Some(self.update_counters(success, &reason)?);
        Ok(report)
    }

    /// Read-only verification; counters are left alone.
    pub fn check(&self) -> anyhow::Result<VerifyReport> {
        Ok(VerifyReport {
            signatures: self.verify_signatures()?,
            boot_image: self.verify_boot_image_freshness(),
            counters: None,
        })
    }

    pub fn boot_image(&self) -> &Path {
        &self.boot_image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsign_core::state::MemoryStateStore;
    use std::path::Path;
    use tempfile::tempdir;

    struct MarkerProbe;

    impl SignatureProbe for MarkerProbe {
        fn embedded_signer(&self, path: &Path) -> anyhow::Result<Option<String>> {
            let bytes = std::fs::read(path)?;
            Ok(bytes.ends_with(b"SIGNED").then(|| "test".to_string()))
        }
        fn taint(&self, _: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn counters_reset_on_success_and_alert_once_at_threshold() {
        let dir = tempdir().unwrap();
        let scanner = ModuleScanner::new(vec![dir.path().to_path_buf()], "6.9");
        let store = MemoryStateStore::new();
        let probe = MarkerProbe;
        let verifier = PostVerifier::new(&scanner, "*.ko", &probe, &store).with_threshold(2);

        let first = verifier.update_counters(false, "x").unwrap();
        assert_eq!(first.failures, 1);
        assert!(!first.alert_raised);
        let second = verifier.update_counters(false, "x").unwrap();
        assert!(second.alert_raised);
        let third = verifier.update_counters(false, "x").unwrap();
        assert_eq!(third.failures, 3);
        assert!(!third.alert_raised);

        let ok = verifier.update_counters(true, "").unwrap();
        assert_eq!(ok.failures, 0);
        assert_eq!(ok.successes, 1);
        assert!(store.get(FAILURE_KEY).unwrap().is_none());
    }

    #[test]
    fn signature_check_and_freshness() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.ko"), b"\x7fELF...SIGNED").unwrap();
        std::fs::write(dir.path().join("b.ko"), b"\x7fELF...").unwrap();
        let image = dir.path().join("initramfs.img");
        let scanner = ModuleScanner::new(vec![dir.path().to_path_buf()], "6.9");
        let store = MemoryStateStore::new();
        let probe = MarkerProbe;
        let verifier = PostVerifier::new(&scanner, "*.ko", &probe, &store)
            .with_boot_image(&image, Duration::from_secs(300));

        let report = verifier.check().unwrap();
        assert_eq!(report.signatures.total, 2);
        assert_eq!(report.signatures.unverified, vec!["b.ko".to_string()]);
        assert!(matches!(report.boot_image, Freshness::Missing { .. }));

        std::fs::write(&image, b"img").unwrap();
        assert!(matches!(
            verifier.verify_boot_image_freshness(),
            Freshness::Fresh { .. }
        ));
        let strict = PostVerifier::new(&scanner, "*.ko", &probe, &store)
            .with_boot_image(&image, Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(matches!(
            strict.verify_boot_image_freshness(),
            Freshness::Stale { .. }
        ));

        let full = verifier.run(true).unwrap();
        assert_eq!(full.counters.unwrap().failures, 1);
    }
}
