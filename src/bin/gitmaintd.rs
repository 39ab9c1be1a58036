//! Maintenance daemon entrypoint.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};

use gitmaint::backend::GitCliProvider;
use gitmaint::cancel::CancelToken;
use gitmaint::config::Config;
use gitmaint::janitor::Janitor;
use gitmaint::metrics::Metrics;
use gitmaint::optimizer::Optimizer;
use gitmaint::repofs::LocalFs;
use gitmaint::store::MemoryStore;
use gitmaint::telemetry;

#[derive(Parser)]
#[command(
    name = "gitmaintd",
    about = "Background maintenance daemon for fleets of bare git repositories",
    version
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the maintenance daemon until terminated.
    Run {
        /// Override the repository root directory.
        #[arg(long)]
        repos_dir: Option<PathBuf>,

        /// Override the optimizer worker-pool width.
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Write a default config file and exit.
    InitConfig {
        /// Where to write the config file.
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init("info");

    match cli.command {
        Command::InitConfig { path } => match Config::default().write(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "wrote default config");
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to write config");
                ExitCode::FAILURE
            }
        },
        Command::Run {
            repos_dir,
            concurrency,
        } => {
            let mut config = Config::load_or_default(cli.config.as_deref());
            if let Some(repos_dir) = repos_dir {
                config.repos_dir = repos_dir;
            }
            if let Some(concurrency) = concurrency {
                config.optimize_concurrency = concurrency;
            }
            run(config)
        }
    }
}

fn run(config: Config) -> ExitCode {
    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());
    let token = CancelToken::from_flag(shutdown);

    tracing::info!(
        repos_dir = %config.repos_dir.display(),
        shard = %config.shard_id,
        "starting maintenance daemon"
    );

    let metrics = Metrics::with_tracing();
    let fs = Arc::new(LocalFs::new(config.repos_dir.clone()));
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(GitCliProvider::new());

    let janitor = Janitor::new(
        config.clone(),
        fs.clone(),
        store.clone(),
        provider.clone(),
        metrics.clone(),
    );
    let optimizer = Optimizer::new(config, fs, provider, metrics);

    std::thread::scope(|scope| {
        let janitor_token = token.clone();
        scope.spawn(move || janitor.run(&janitor_token));

        let optimizer_token = token.clone();
        scope.spawn(move || optimizer.run(&optimizer_token));
    });

    tracing::info!("shutdown complete");
    ExitCode::SUCCESS
}
