use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modsign_core::config::{running_kernel_release, ModsignConfig};
use modsign_core::state::FileStateStore;
use modsign_core::ExitCode;
use modsign_recover::interactive::run_menu;
use modsign_recover::RecoveryManager;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Kernel module recovery helper", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Kernel release used to locate modules for backups without a source path
    #[arg(long, global = true)]
    kernel: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Restore every module from its latest backup (best effort)
    Auto,
    /// Menu-driven single recovery action
    Interactive,
    /// List backups, newest first
    List,
    /// Restore one module
    Restore {
        /// Module file name, e.g. nvidia.ko
        module: String,
        /// Specific backup file instead of the latest one
        #[arg(long)]
        backup: Option<String>,
    },
    /// Delete all run state and a stale lock file
    ClearState,
    /// Backups, counters and lock holder as JSON
    Status,
    /// Reset the failure circuit breaker
    ResetBreaker,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::GeneralFailure
        }
    };
    code.into()
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = match ModsignConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(err) => {
            error!("{err:#}");
            return Ok(ExitCode::ConfigurationError);
        }
    };
    let kernel = cli.kernel.or_else(|| running_kernel_release().ok());
    let state = FileStateStore::open(&config.paths.state_dir)
        .with_context(|| format!("open state dir {}", config.paths.state_dir.display()))?;
    let manager = RecoveryManager::new(&config, &state, kernel)?;

    match cli.command {
        Commands::Auto => {
            let report = manager.restore_all()?;
            print_json(&report)?;
            Ok(if report.success() {
                ExitCode::Success
            } else if report.restored.is_empty() {
                ExitCode::GeneralFailure
            } else {
                ExitCode::PartialSuccess
            })
        }
        Commands::Interactive => {
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut output = std::io::stdout();
            let ok = run_menu(&manager, &mut input, &mut output)?;
            Ok(if ok {
                ExitCode::Success
            } else {
                ExitCode::GeneralFailure
            })
        }
        Commands::List => {
            print_json(&manager.list_backups()?)?;
            Ok(ExitCode::Success)
        }
        Commands::Restore { module, backup } => {
            let report = manager.restore_one(&module, backup.as_deref())?;
            print_json(&report)?;
            Ok(ExitCode::Success)
        }
        Commands::ClearState => {
            print_json(&manager.clear_corrupted_state()?)?;
            Ok(ExitCode::Success)
        }
        Commands::Status => {
            print_json(&manager.status()?)?;
            Ok(ExitCode::Success)
        }
        Commands::ResetBreaker => {
            let removed = manager.reset_breaker()?;
            println!("{}", serde_json::json!({ "failureCounterRemoved": removed }));
            Ok(ExitCode::Success)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
