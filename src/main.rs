mod coalescer;
mod config;
mod console;
mod notifier;
mod registrar;
mod runner;
mod shutdown;
mod signals;
mod status;
mod subscription;
mod supervisor;

use clap::Parser;
use config::{CoalesceMode, DevloopConfig};
use console::Terminal;
use notifier::FsNotifier;
use runner::RunOutcome;
use signals::SignalListener;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::ChildCommand;

/// A Rust CLI tool that watches a source tree and restarts a development
/// process whenever it changes, streaming its output to the terminal.
#[derive(Parser, Debug)]
#[command(name = "devloop", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "devloop.toml")]
    config: PathBuf,

    /// Directory to watch (overrides config)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Subtree whose changes trigger a restart (overrides config)
    #[arg(long)]
    subtree: Option<PathBuf>,

    /// Quiet period before a burst of changes restarts the process
    #[arg(long, value_name = "MS")]
    debounce_ms: Option<u64>,

    /// Restart on every change batch instead of debouncing
    #[arg(long)]
    immediate: bool,

    /// Print the resolved config and exit
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (coalescing and child lifecycle details)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors in the log
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Command to supervise (overrides config)
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut DevloopConfig) {
        if let Some(root) = &self.root {
            config.watch.root = root.clone();
        }
        if let Some(subtree) = &self.subtree {
            config.watch.subtree = subtree.clone();
        }
        if let Some(ms) = self.debounce_ms {
            config.coalesce.debounce_ms = ms;
        }
        if self.immediate {
            config.coalesce.mode = CoalesceMode::Immediate;
        }
        if let Some((program, args)) = self.command.split_first() {
            config.child.command = program.clone();
            config.child.args = args.to_vec();
        }
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("Dry run mode: resolved config, not running.\n");
                print!("{rendered}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                eprintln!("error: failed to render config: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("error: cannot determine working directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let command = ChildCommand::resolve(&config.child, &cwd);

    let mut signals = match SignalListener::install() {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("error: failed to install signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(command = %command, root = %config.watch.root.display(), "devloop starting");

    let notifier = FsNotifier::new();
    let console = Terminal::new(config.display.color);
    match runner::run(&config, command, &notifier, console, &mut signals).await {
        Ok(RunOutcome::Clean) => ExitCode::SUCCESS,
        Ok(RunOutcome::ForcedExit) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
