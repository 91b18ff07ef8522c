//! External programs the signer drives, behind traits so tests can swap
//! them out.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::ToolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

pub trait SignTool: Send + Sync {
    /// Sign `target` in place. On error the file contents are unspecified.
    fn sign(&self, hash_algorithm: &str, keys: &KeyPair, target: &Path) -> Result<(), ToolError>;
}

pub trait BootImageBuilder: Send + Sync {
    fn rebuild(&self) -> Result<(), ToolError>;
}

/// The kernel's `scripts/sign-file`.
pub struct SignFileTool {
    program: PathBuf,
}

impl SignFileTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SignTool for SignFileTool {
    fn sign(&self, hash_algorithm: &str, keys: &KeyPair, target: &Path) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(hash_algorithm)
            .arg(&keys.private_key)
            .arg(&keys.public_key)
            .arg(target);
        run(cmd, &self.program.display().to_string())
    }
}

/// Runs a configured command line, e.g. `dracut --force`.
pub struct CommandBootImageBuilder {
    argv: Vec<String>,
}

impl CommandBootImageBuilder {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl BootImageBuilder for CommandBootImageBuilder {
    fn rebuild(&self) -> Result<(), ToolError> {
        let (program, args) = self.argv.split_first().ok_or_else(|| ToolError::Failed {
            program: "<boot image builder>".into(),
            status: None,
            stderr: "empty command".into(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        run(cmd, &self.argv.join(" "))
    }
}

fn run(mut cmd: Command, label: &str) -> Result<(), ToolError> {
    debug!(command = %label, "running external tool");
    let output = cmd.output().map_err(|source| ToolError::Spawn {
        program: label.to_string(),
        source,
    })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ToolError::Failed {
            program: label.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn command_builder_reports_exit_status() {
        let ok = CommandBootImageBuilder::new(vec!["true".into()]);
        assert!(ok.rebuild().is_ok());
        let fail = CommandBootImageBuilder::new(vec!["false".into()]);
        assert!(matches!(
            fail.rebuild(),
            Err(ToolError::Failed { status: Some(1), .. })
        ));
        let missing = CommandBootImageBuilder::new(vec!["no-such-builder-xyz".into()]);
        assert!(matches!(missing.rebuild(), Err(ToolError::Spawn { .. })));
        assert!(CommandBootImageBuilder::new(vec![]).rebuild().is_err());
    }
}
