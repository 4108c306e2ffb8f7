//! The Stagehand agent binary.
//!
//! Carries the support programs that must run as separate processes. The
//! one that matters here is `spawn-env-setupper`, which the spawner execs
//! inside a freshly forked child to perform all the non-async-signal-safe
//! startup work before the application itself runs.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use stagehand::envsetup::{self, SetupPhase};

#[derive(Parser)]
#[command(name = "stagehand-agent", version, about = "Stagehand support agent")]
struct Cli {
    #[command(subcommand)]
    command: AgentCommand,
}

#[derive(Subcommand)]
enum AgentCommand {
    /// Prepare the environment inside a spawned child, then exec the
    /// application. Invoked by the spawner, not by hand.
    #[command(name = "spawn-env-setupper")]
    SpawnEnvSetupper {
        /// The spawn work directory.
        work_dir: PathBuf,
        /// Run the phase before the optional login shell.
        #[arg(long, conflicts_with = "after")]
        before: bool,
        /// Run the phase after the optional login shell.
        #[arg(long)]
        after: bool,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("STAGEHAND_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        AgentCommand::SpawnEnvSetupper {
            work_dir,
            before,
            after,
        } => {
            let phase = match (before, after) {
                (true, false) => SetupPhase::Before,
                (false, true) => SetupPhase::After,
                _ => {
                    eprintln!(
                        "Usage: stagehand-agent spawn-env-setupper <workdir> {{--before|--after}}"
                    );
                    return ExitCode::FAILURE;
                }
            };
            // Only returns on failure; success replaces the process image.
            ExitCode::from(envsetup::run(&work_dir, phase) as u8)
        }
    }
}
