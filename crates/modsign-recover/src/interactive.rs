//! One-shot operator menu. Reads a single choice, performs it, and returns.

use std::io::{self, BufRead, Write};

use crate::manager::RecoveryManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    RestoreAll,
    RestoreOne,
    List,
    ClearState,
    Status,
    Exit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "1" | "all" => Some(Self::RestoreAll),
            "2" | "one" => Some(Self::RestoreOne),
            "3" | "list" => Some(Self::List),
            "4" | "clear" => Some(Self::ClearState),
            "5" | "status" => Some(Self::Status),
            "0" | "q" | "exit" | "" => Some(Self::Exit),
            _ => None,
        }
    }
}

const MENU: &str = "\
modsign recovery
  1) restore all modules from their latest backups
  2) restore one module
  3) list backups
  4) clear corrupted state (removes counters, rate limit and a stale lock)
  5) show status
  0) exit
> ";

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, text: &str) -> io::Result<String> {
    write!(output, "{text}")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Present the menu and run the chosen action. Returns whether the action
/// succeeded; choosing to exit counts as success.
pub fn run_menu<R: BufRead, W: Write>(
    manager: &RecoveryManager<'_>,
    input: &mut R,
    output: &mut W,
) -> io::Result<bool> {
    let answer = prompt(input, output, MENU)?;
    let Some(choice) = MenuChoice::parse(&answer) else {
        writeln!(output, "unknown choice {answer:?}")?;
        return Ok(false);
    };

    match choice {
        MenuChoice::Exit => Ok(true),
        MenuChoice::RestoreAll => match manager.restore_all() {
            Ok(report) => {
                for r in &report.restored {
                    writeln!(output, "restored {} -> {}", r.module, r.target.display())?;
                }
                for f in &report.failed {
                    writeln!(output, "FAILED {}: {}", f.module, f.error)?;
                }
                Ok(report.success())
            }
            Err(e) => {
                writeln!(output, "error: {e}")?;
                Ok(false)
            }
        },
        MenuChoice::RestoreOne => {
            let module = prompt(input, output, "module file name (e.g. nvidia.ko): ")?;
            if module.is_empty() {
                writeln!(output, "no module given")?;
                return Ok(false);
            }
            match manager.restore_one(&module, None) {
                Ok(r) => {
                    writeln!(
                        output,
                        "restored {} from {}",
                        r.target.display(),
                        r.backup.display()
                    )?;
                    Ok(true)
                }
                Err(e) => {
                    writeln!(output, "error: {e}")?;
                    Ok(false)
                }
            }
        }
        MenuChoice::List => match manager.list_backups() {
            Ok(backups) => {
                if backups.is_empty() {
                    writeln!(output, "no backups")?;
                }
                for b in backups {
                    writeln!(
                        output,
                        "{}  {:<24} {:>10}  {}",
                        b.created_at().format("%Y-%m-%d %H:%M:%S"),
                        b.module_name(),
                        b.meta.size,
                        b.path.display()
                    )?;
                }
                Ok(true)
            }
            Err(e) => {
                writeln!(output, "error: {e}")?;
                Ok(false)
            }
        },
        MenuChoice::ClearState => match manager.clear_corrupted_state() {
            Ok(r) => {
                writeln!(
                    output,
                    "removed {} state records; lock file removed: {}",
                    r.records_removed, r.lock_removed
                )?;
                if let Some(pid) = r.live_holder {
                    writeln!(output, "lock kept: held by running pid {pid}")?;
                }
                Ok(true)
            }
            Err(e) => {
                writeln!(output, "error: {e}")?;
                Ok(false)
            }
        },
        MenuChoice::Status => match manager.status() {
            Ok(status) => {
                let json = serde_json::to_string_pretty(&status)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                writeln!(output, "{json}")?;
                Ok(true)
            }
            Err(e) => {
                writeln!(output, "error: {e}")?;
                Ok(false)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsign_core::config::ModsignConfig;
    use modsign_core::records::{FailureCounter, FAILURE_KEY};
    use modsign_core::state::{MemoryStateStore, StateStore, StateStoreExt};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> ModsignConfig {
        let mut config = ModsignConfig::default();
        config.paths.backup_dir = dir.join("backups");
        config.paths.lock_file = dir.join("modsign.lock");
        config.paths.modules_root = dir.join("modules");
        config
    }

    #[test]
    fn parses_choices() {
        assert_eq!(MenuChoice::parse(" 1\n"), Some(MenuChoice::RestoreAll));
        assert_eq!(MenuChoice::parse("STATUS"), Some(MenuChoice::Status));
        assert_eq!(MenuChoice::parse(""), Some(MenuChoice::Exit));
        assert_eq!(MenuChoice::parse("9"), None);
    }

    #[test]
    fn clear_state_runs_without_further_input() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let state = MemoryStateStore::new();
        state.save(FAILURE_KEY, &FailureCounter::default()).unwrap();
        let manager = RecoveryManager::new(&config, &state, None).unwrap();

        let mut out = Vec::new();
        let ok = run_menu(&manager, &mut Cursor::new("4\n"), &mut out).unwrap();
        assert!(ok);
        assert!(state.get(FAILURE_KEY).unwrap().is_none());
        assert!(String::from_utf8(out).unwrap().contains("removed 1 state records"));
    }

    #[test]
    fn list_and_unknown_choice() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let state = MemoryStateStore::new();
        let manager = RecoveryManager::new(&config, &state, None).unwrap();

        let mut out = Vec::new();
        assert!(run_menu(&manager, &mut Cursor::new("3\n"), &mut out).unwrap());
        assert!(String::from_utf8(out).unwrap().contains("no backups"));

        let mut out = Vec::new();
        assert!(!run_menu(&manager, &mut Cursor::new("x\n"), &mut out).unwrap());

        let mut out = Vec::new();
        assert!(!run_menu(&manager, &mut Cursor::new("1\n"), &mut out).unwrap());
        assert!(String::from_utf8(out).unwrap().contains("no backups found"));
    }
}
