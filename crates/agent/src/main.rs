//! mirsync-agent: remote agent for mirsync
//!
//! Binary deployed to the destination host, serving mirror operations over
//! stdin/stdout with a length-prefixed binary protocol. Logs go to stderr,
//! where the local side forwards them into its own logger.

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::info;

use mirsync_core::Executor;

#[derive(Parser)]
#[command(name = "mirsync-agent")]
#[command(version)]
#[command(about = "Remote agent for mirsync tree mirroring")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in daemon mode, serving requests on stdin until shutdown
    Daemon {
        /// Root directory the mirrored trees live under
        #[arg(short, long)]
        root: PathBuf,
    },
    /// Print version and exit
    Version,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            eprintln!("mirsync-agent {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Daemon { root } => {
            run_daemon(&root)?;
        }
    }

    Ok(())
}

fn run_daemon(root: &PathBuf) -> Result<()> {
    std::fs::create_dir_all(root)?;
    info!(root = %root.display(), "agent daemon starting");

    let executor = Executor::new(root);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    mirsync_core::exec::serve(
        &executor,
        BufReader::new(stdin.lock()),
        BufWriter::new(stdout.lock()),
    )?;

    info!("agent daemon shutting down");
    Ok(())
}
