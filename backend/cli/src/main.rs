mod config;
mod doctor_cmd;
mod run_cmd;
mod terminal_output;
mod wiring;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use usbcage_config::ensure_valid;
use usbcage_core::CageError;
use usbcage_logging::init_logger;

use config::{load_effective, FlagOverrides};
use terminal_output::{note_error, note_info};

#[derive(Parser)]
#[command(name = "usbcage")]
#[command(about = "usbcage: hand a USB stick to a sandbox VM, never to the host")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.usbcage/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the recovery journals
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Isolate the host and pass the next USB mass-storage device to a sandbox
    Run(RunArgs),
    /// Check prerequisites without changing anything
    Doctor,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Sandbox name or UUID; a second value is the gateway of a pair
    #[arg(long, num_args = 1..=2, required_unless_present = "restore")]
    sandbox: Vec<String>,

    /// Interfaces to take down instead of auto-discovering them
    #[arg(long, num_args = 1..)]
    interfaces: Option<Vec<String>>,

    /// Gateway sandbox for the workstation given with --sandbox
    #[arg(long)]
    gateway_pair: Option<String>,

    /// Undo a previous run from its recovery journals, then exit
    #[arg(long, conflicts_with_all = ["sandbox", "interfaces", "gateway_pair"])]
    restore: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            note_error(&format!("{e:#}"));
            if let Some(hint) = remediation(&e) {
                note_info(hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let flags = FlagOverrides { config_path: cli.config, state_dir: cli.state_dir };
    let effective = load_effective(&flags).await?;
    let config = effective.config;

    init_logger(&effective.log_dir, &config.log_level, cli.verbose).context("Failed to initialize logging")?;
    ensure_valid(&config).map_err(|e| CageError::Precondition(format!("invalid configuration: {e:#}")))?;

    match cli.command {
        Commands::Run(args) if args.restore => run_cmd::restore(&config).await,
        Commands::Run(args) => {
            let target = run_cmd::resolve_target(&args.sandbox, args.gateway_pair.as_deref())?;
            run_cmd::run(&config, target, args.interfaces).await
        }
        Commands::Doctor => doctor_cmd::run(&config).await,
    }
}

/// A next step for errors the operator can fix.
fn remediation(error: &anyhow::Error) -> Option<&'static str> {
    match error.chain().find_map(|cause| cause.downcast_ref::<CageError>())? {
        CageError::GuardUnavailable => Some("Install usbguard and start its daemon (`sudo systemctl enable --now usbguard`)"),
        CageError::AuthenticationFailure(_) => {
            Some("Check your sudo password. Links already taken down are journaled; `usbcage run --restore` brings them back")
        }
        CageError::CommandTimeout { .. } => Some("A host tool hung; `usbcage run --restore` undoes anything already changed"),
        CageError::RecoveryLog(_) => Some("Inspect or move the journals in the state directory, then run `usbcage doctor`"),
        _ => None,
    }
}
