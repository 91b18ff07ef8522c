use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modsign_core::cancel::{CancelReason, Cancellation};
use modsign_core::config::{running_kernel_release, ModsignConfig};
use modsign_core::lock;
use modsign_core::module::{KernelProbe, ModuleScanner};
use modsign_core::records::{
    ExecutionState, FailureCounter, RateLimitRecord, SuccessCounter, EXECUTION_KEY, FAILURE_KEY,
    RATE_LIMIT_KEY, SUCCESS_KEY,
};
use modsign_core::state::{FileStateStore, StateStoreExt};
use modsign_core::ExitCode;
use modsign_service::detect::SystemDetector;
use modsign_service::error::cancel_exit_code;
use modsign_service::signing::{CommandBootImageBuilder, SignFileTool};
use modsign_service::verify::PostVerifier;
use modsign_service::{Pipeline, Ports, RunOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Kernel module signing service", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Kernel release to operate on instead of the running one
    #[arg(long, global = true)]
    kernel: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect, sign unsigned modules, rebuild the boot image and verify
    Run {
        /// Report what would be signed without touching anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print environment and persisted state as JSON
    Status,
    /// Re-check module signatures and boot image age (read-only)
    Verify,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::GeneralFailure
        }
    };
    code.into()
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = match ModsignConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(err) => {
            error!("{err:#}");
            return Ok(ExitCode::ConfigurationError);
        }
    };
    let kernel = match cli.kernel {
        Some(k) => k,
        None => running_kernel_release()?,
    };
    match cli.command {
        Commands::Run { dry_run } => run_command(config, kernel, dry_run).await,
        Commands::Status => status_command(&config, &kernel),
        Commands::Verify => verify_command(&config, &kernel),
    }
}

async fn run_command(config: ModsignConfig, kernel: String, dry_run: bool) -> Result<ExitCode> {
    let cancel = Cancellation::new();
    let signals = tokio::spawn(watch_signals(cancel.clone()));

    let run_cancel = cancel.clone();
    let task = tokio::task::spawn_blocking(move || -> Result<ExitCode> {
        let state = FileStateStore::open(&config.paths.state_dir)
            .with_context(|| format!("open state dir {}", config.paths.state_dir.display()))?;
        let probe = KernelProbe::new(&config.paths.sysfs_modules);
        let sign_tool = SignFileTool::new(config.sign_tool_path(&kernel));
        let boot_builder =
            CommandBootImageBuilder::new(config.paths.boot_rebuild_command.clone());
        let pipeline = Pipeline::new(
            &config,
            kernel.clone(),
            Ports {
                probe: &probe,
                sign_tool: &sign_tool,
                boot_builder: &boot_builder,
                state: &state,
            },
        );
        let report = pipeline.run(RunOptions { dry_run }, &run_cancel);
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(report.exit_code)
    });

    // The blocking task owns the lock guard; awaiting it guarantees release
    // before we exit, even when a signal arrived.
    let result = task.await.context("signing task panicked")?;
    signals.abort();
    let code = result?;
    Ok(match cancel.reason() {
        Some(reason) => {
            info!(?reason, "run cancelled");
            cancel_exit_code(reason)
        }
        None => code,
    })
}

async fn watch_signals(cancel: Cancellation) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                cancel.cancel(CancelReason::Interrupted);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => cancel.cancel(CancelReason::Interrupted),
            _ = term.recv() => cancel.cancel(CancelReason::Terminated),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel(CancelReason::Interrupted);
        }
    }
    info!("cancellation requested; finishing the current module");
}

fn status_command(config: &ModsignConfig, kernel: &str) -> Result<ExitCode> {
    let detector = SystemDetector::new();
    let state = FileStateStore::open(&config.paths.state_dir)?;
    let execution: Option<ExecutionState> = state.load(EXECUTION_KEY)?;
    let failures: FailureCounter = state.load(FAILURE_KEY)?.unwrap_or_default();
    let successes: SuccessCounter = state.load(SUCCESS_KEY)?.unwrap_or_default();
    let rate_limit: Option<RateLimitRecord> = state.load(RATE_LIMIT_KEY)?;
    let snapshot = serde_json::json!({
        "kernel": kernel,
        "secureBoot": detector.detect_secure_boot(),
        "tpm": detector.detect_tpm(),
        "lastRun": execution,
        "successCounter": successes,
        "failureCounter": failures,
        "circuitOpen": failures.is_open(config.safety.circuit_breaker_threshold),
        "rateLimit": rate_limit,
        "lockHolder": lock::read_record(&config.paths.lock_file),
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(ExitCode::Success)
}

fn verify_command(config: &ModsignConfig, kernel: &str) -> Result<ExitCode> {
    let state = FileStateStore::open(&config.paths.state_dir)?;
    let probe = KernelProbe::new(&config.paths.sysfs_modules);
    let scanner = ModuleScanner::new(config.module_search_dirs(kernel), kernel);
    let verifier = PostVerifier::new(&scanner, &config.paths.module_pattern, &probe, &state)
        .with_boot_image(
            config.boot_image_path(kernel),
            Duration::from_secs(config.verify.boot_image_max_age_secs),
        );
    let report = verifier.check()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.signatures.all_verified() && report.signatures.total > 0 {
        ExitCode::Success
    } else {
        ExitCode::GeneralFailure
    })
}
