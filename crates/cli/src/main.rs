//! mirsync: continuous tree mirroring to a remote agent
//!
//! Mirrors one or more local directory trees to matching trees behind a
//! long-running agent process, over its stdio pipe:
//! - Block-level transfer: only changed 4 MiB blocks cross the wire
//! - Debounced watching: editor save-storms become one pass
//! - Gitignore-aware skipping via the `ignore` engine

mod debug_log;

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{builder::Styles, Parser, Subcommand};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use notify::{RecursiveMode, Watcher as _};
use tracing::{error, info};

use mirsync_core::{Executor, Mapping, MirrorConfig, SkipPolicy, SyncOptions, Syncer};
use mirsync_transport::AgentProcess;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "mirsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Continuous tree mirroring to a remote agent")]
#[command(long_about = r#"
mirsync mirrors local directory trees to matching trees behind a
long-running agent process.

Examples:
  mirsync sync ./project /backups/project       Mirror once and exit
  mirsync watch ./project /backups/project      Mirror continuously
  mirsync watch --agent-cmd "ssh host mirsync-agent daemon --root /backups" ./project
  mirsync scan ./project                        Print local signatures

With no positional paths, mappings come from .mirsync.toml.
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write a full trace log to /tmp
    #[arg(long, global = true)]
    trace_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror once, wait for quiescence, and exit
    Sync {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Watch and continuously mirror changes
    Watch {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Scan a local directory and print its signatures
    Scan {
        /// Directory to scan
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Local directory to mirror (defaults to .mirsync.toml mappings)
    local: Option<PathBuf>,

    /// Agent root directory (spawns a local agent there)
    dest: Option<PathBuf>,

    /// Full agent command to spawn instead of a local mirsync-agent
    #[arg(long)]
    agent_cmd: Option<String>,

    /// Debounce delay in milliseconds
    #[arg(short, long)]
    debounce: Option<u64>,

    /// Skip policy: none, dotgit, or gitignore
    #[arg(short, long)]
    skip: Option<String>,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let _log_guard = if cli.trace_file {
        let session = debug_log::init(filter);
        info!("trace log: {}", session.log_path.display());
        Some(session.guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        None
    };

    match cli.command {
        Commands::Scan { path } => scan_command(&path),
        Commands::Sync { target } => run_command(&target, false),
        Commands::Watch { target } => run_command(&target, true),
    }
}

fn scan_command(path: &PathBuf) -> Result<()> {
    info!("Scanning {}...", path.display());

    let executor = Executor::new(path);
    let entries = executor.full_scan("")?;

    eprintln!("Entries: {}", entries.len());
    for (sub, sig) in &entries {
        match sig {
            mirsync_core::Signature::File {
                size, block_hashes, ..
            } => eprintln!("  {sub} ({size} bytes, {} blocks)", block_hashes.len()),
            mirsync_core::Signature::Dir { perms } => eprintln!("  {sub}/ (mode {perms:o})"),
            mirsync_core::Signature::Symlink { target } => eprintln!("  {sub} -> {target}"),
        }
    }
    Ok(())
}

/// Resolved invocation: mappings plus the agent command to spawn
struct Plan {
    mappings: Vec<Mapping>,
    agent_argv: Vec<String>,
    options: SyncOptions,
}

fn resolve_plan(target: &TargetArgs) -> Result<Plan> {
    let config = MirrorConfig::load(&std::env::current_dir()?)?;

    let mappings = match (&target.local, &target.dest) {
        (Some(local), _) => vec![Mapping::new(local.clone(), "")],
        (None, _) if !config.mappings.is_empty() => config
            .mappings
            .iter()
            .map(|m| Mapping::new(m.local.clone(), m.dest.clone()))
            .collect(),
        _ => return Err(eyre!("no local directory given and no .mirsync.toml mappings")),
    };

    let agent_argv = match &target.agent_cmd {
        Some(cmd) => cmd.split_whitespace().map(str::to_string).collect(),
        None => {
            let root = target
                .dest
                .clone()
                .or(config.agent_root)
                .ok_or_else(|| eyre!("no destination given; pass DEST or set agent_root"))?;
            vec![
                "mirsync-agent".to_string(),
                "daemon".to_string(),
                "--root".to_string(),
                root.display().to_string(),
            ]
        }
    };

    let skip = match target.skip.as_deref() {
        Some("none") => SkipPolicy::None,
        Some("dotgit") => SkipPolicy::DotGit,
        Some("gitignore") => SkipPolicy::Gitignore,
        Some(other) => return Err(eyre!("unknown skip policy: {other}")),
        None => config.skip.unwrap_or_default(),
    };
    let debounce_ms = target.debounce.or(config.debounce_ms).unwrap_or(100);

    Ok(Plan {
        mappings,
        agent_argv,
        options: SyncOptions {
            debounce: Duration::from_millis(debounce_ms),
            skip,
            ..SyncOptions::default()
        },
    })
}

fn run_command(target: &TargetArgs, watch: bool) -> Result<()> {
    let plan = resolve_plan(target)?;
    for mapping in &plan.mappings {
        info!(
            "Mirroring {} -> {}",
            mapping.local_root.display(),
            if mapping.remote_dest.is_empty() {
                "<agent root>"
            } else {
                &mapping.remote_dest
            }
        );
    }

    let (process, client) = AgentProcess::spawn(&plan.agent_argv)?;

    let (done_tx, done_rx) = mpsc::channel();
    let syncer = Syncer::spawn(
        client,
        plan.mappings.clone(),
        plan.options,
        Box::new(move || {
            let _ = done_tx.send(());
        }),
    )?;

    // keep the watcher alive for the whole run
    let mut watcher = None;
    if watch {
        let events = syncer.events();
        let mut w = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            if let Ok(event) = result {
                let _ = events.send(event.paths);
            }
        })?;
        for mapping in &plan.mappings {
            w.watch(&mapping.local_root, RecursiveMode::Recursive)?;
        }
        watcher = Some(w);
    }

    // the initial pass ends with a completion signal
    done_rx
        .recv_timeout(Duration::from_secs(3600))
        .map_err(|_| eyre!("initial mirror did not complete"))?;
    info!("Mirror up to date");

    if watch {
        info!("Watching for changes (Ctrl+C to stop)...");
        loop {
            match done_rx.recv() {
                Ok(()) => info!("Mirror up to date"),
                Err(_) => break, // sync loop ended (fatal transport error)
            }
        }
        error!("Sync loop stopped");
    }

    drop(watcher);
    syncer.close()?;
    process.wait()?;
    Ok(())
}
