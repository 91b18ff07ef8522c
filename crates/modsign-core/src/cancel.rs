use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Interrupted,
    Terminated,
}

/// Cancellation handle threaded through a run. The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins_across_clones() {
        let c = Cancellation::new();
        let other = c.clone();
        assert!(!c.is_cancelled());
        other.cancel(CancelReason::Terminated);
        c.cancel(CancelReason::Interrupted);
        assert!(c.is_cancelled());
        assert_eq!(c.reason(), Some(CancelReason::Terminated));
    }
}
