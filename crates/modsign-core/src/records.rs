use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EXECUTION_KEY: &str = "execution";
pub const RATE_LIMIT_KEY: &str = "rate_limit";
pub const FAILURE_KEY: &str = "failure_counter";
pub const SUCCESS_KEY: &str = "success_counter";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecureBootState {
    Enabled,
    Disabled,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TpmState {
    Available,
    Unavailable,
    ToolsMissing,
}

/// Outcome of the last completed run. Overwritten every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub timestamp: DateTime<Utc>,
    pub kernel: String,
    pub secure_boot: SecureBootState,
    pub tpm: TpmState,
    pub signed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rebuild_failed: bool,
    pub exit_code: i32,
}

/// Start time of the last gated signing attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    pub last_attempt: DateTime<Utc>,
}

/// Consecutive verification failures. `marker` is set while the most recent
/// verification failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureCounter {
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
}

impl FailureCounter {
    pub fn record_failure(&mut self, reason: &str) {
        self.count = self.count.saturating_add(1);
        self.marker = Some(Utc::now());
        self.last_reason = Some(reason.to_string());
    }

    pub fn is_open(&self, threshold: u32) -> bool {
        threshold > 0 && self.count >= threshold
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessCounter {
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
}

impl SuccessCounter {
    pub fn record_success(&mut self) {
        self.count = self.count.saturating_add(1);
        self.last_success = Some(Utc::now());
    }
}
