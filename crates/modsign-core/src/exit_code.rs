use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Process exit codes consumed by timers, package hooks and operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitCode {
    Success,
    GeneralFailure,
    PermissionDenied,
    SystemNotReady,
    PartialSuccess,
    RateLimited,
    ConfigurationError,
    Interrupted,
    Terminated,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::GeneralFailure => 1,
            Self::PermissionDenied => 2,
            Self::SystemNotReady => 3,
            Self::PartialSuccess => 4,
            Self::RateLimited => 5,
            Self::ConfigurationError => 6,
            Self::Interrupted => 130,
            Self::Terminated => 143,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        [
            Self::Success,
            Self::GeneralFailure,
            Self::PermissionDenied,
            Self::SystemNotReady,
            Self::PartialSuccess,
            Self::RateLimited,
            Self::ConfigurationError,
            Self::Interrupted,
            Self::Terminated,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::GeneralFailure => "general failure",
            Self::PermissionDenied => "permission denied",
            Self::SystemNotReady => "system not ready",
            Self::PartialSuccess => "partial success",
            Self::RateLimited => "rate limited",
            Self::ConfigurationError => "configuration error",
            Self::Interrupted => "interrupted",
            Self::Terminated => "terminated",
        };
        write!(f, "{name} ({})", self.code())
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        // Every code fits in a byte.
        std::process::ExitCode::from(code.code() as u8)
    }
}

/// Count-based resolution for runs that got past the safety gate.
///
/// An open breaker aborts a run in the gate, so `prior_circuit_open` does not
/// change the outcome here; it is only reported.
pub fn resolve(total: usize, signed: usize, failed: usize, prior_circuit_open: bool) -> ExitCode {
    if prior_circuit_open {
        warn!(total, signed, failed, "resolving a run that began with the breaker open");
    }
    if total == 0 {
        ExitCode::SystemNotReady
    } else if failed > 0 && signed > 0 {
        ExitCode::PartialSuccess
    } else if failed > 0 {
        ExitCode::GeneralFailure
    } else {
        ExitCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_resolution() {
        assert_eq!(resolve(0, 0, 0, false), ExitCode::SystemNotReady);
        assert_eq!(resolve(3, 3, 0, false), ExitCode::Success);
        assert_eq!(resolve(3, 2, 1, false), ExitCode::PartialSuccess);
        assert_eq!(resolve(2, 0, 2, false), ExitCode::GeneralFailure);
        assert_eq!(resolve(2, 0, 0, false), ExitCode::Success);
        assert_eq!(resolve(2, 2, 0, true), ExitCode::Success);
        assert_eq!(resolve(2, 1, 1, true), ExitCode::PartialSuccess);
    }

    #[test]
    fn numeric_codes_are_stable() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::PartialSuccess.code(), 4);
        assert_eq!(ExitCode::Interrupted.code(), 130);
        assert_eq!(ExitCode::Terminated.code(), 143);
        assert_eq!(ExitCode::from_code(5), Some(ExitCode::RateLimited));
        assert_eq!(ExitCode::from_code(42), None);
    }
}
