//! Out-of-band recovery for kernel modules: restore from the backups the
//! signer leaves behind, reset the failure breaker, or wipe corrupted run
//! state. Depends on `modsign-core` only.

pub mod error;
pub mod interactive;
pub mod manager;

pub use error::RecoveryError;
pub use manager::{AutoReport, ClearReport, RecoveryManager, RecoveryStatus, RestoreReport};
