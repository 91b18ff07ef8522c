pub mod signer;
pub mod tools;

pub use signer::{
    rebuild_boot_image, ModuleOutcome, ModuleReport, RebuildOutcome, SignReport, SignState, Signer,
};
pub use tools::{BootImageBuilder, CommandBootImageBuilder, KeyPair, SignFileTool, SignTool};
