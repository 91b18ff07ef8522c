//! Signing-and-recovery orchestration for out-of-tree kernel modules on
//! Secure Boot hosts.

pub mod detect;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod signing;
pub mod verify;

pub use error::{GateError, ModuleError, ToolError};
pub use pipeline::{Pipeline, Ports, RunOptions, RunReport};
