//! Shared building blocks for the module signing service and the recovery
//! helper: configuration, persisted state, the run lock, backups and module
//! classification.

pub mod backup_store;
pub mod cancel;
pub mod config;
pub mod exit_code;
pub mod fsutil;
pub mod lock;
pub mod module;
pub mod records;
pub mod state;

pub use config::ModsignConfig;
pub use exit_code::ExitCode;
