use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use dyntaxa_sync::app::{App, RunMode, RunOptions};
use dyntaxa_sync::config::{ConfigOverrides, SyncConfig};
use dyntaxa_sync::dyntaxa::DyntaxaHttpClient;
use dyntaxa_sync::error::SyncError;
use dyntaxa_sync::output::JsonOutput;

#[derive(Parser)]
#[command(name = "dyntaxa-sync")]
#[command(
    about = "Refresh the local Lepidoptera species cache and SQLite database from the Dyntaxa taxon service"
)]
#[command(version, author)]
struct Cli {
    /// Run even if the source revision is unchanged (ignore fast exit).
    #[arg(long)]
    force: bool,

    /// Skip the database reconciliation step.
    #[arg(long)]
    no_db: bool,

    /// Only refresh the taxon cache; skip lists and database.
    #[arg(long, conflicts_with = "only_build_lists")]
    only_refresh_cache: bool,

    /// Only rebuild the list files from the cache; no remote detail fetches.
    #[arg(long)]
    only_build_lists: bool,

    /// Culture parameter passed to the service (default: sv_SE).
    #[arg(long)]
    culture: Option<String>,

    /// Cache TTL in seconds (0 = fetch once, never refresh).
    #[arg(long)]
    ttl_seconds: Option<u64>,

    /// Detail-fetch batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// HTTP timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Root directory for cache, list files and database.
    #[arg(long)]
    data_root: Option<Utf8PathBuf>,

    /// SQLite database path.
    #[arg(long)]
    db: Option<Utf8PathBuf>,

    /// Disable the fast exit on an unchanged source revision.
    #[arg(long)]
    no_fast_exit: bool,

    /// Debug-level logging.
    #[arg(long, conflicts_with = "quiet")]
    verbose: bool,

    /// Warnings and errors only.
    #[arg(long)]
    quiet: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(sync) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(sync));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::MissingApiKey
        | SyncError::InvalidConfig { .. }
        | SyncError::AmbiguousRoot(_) => 2,
        SyncError::ServiceHttp(_)
        | SyncError::ServiceStatus { .. }
        | SyncError::UnexpectedPayload { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let overrides = ConfigOverrides {
        culture: cli.culture.clone(),
        ttl_seconds: cli.ttl_seconds,
        batch_size: cli.batch_size,
        timeout_seconds: cli.timeout,
        no_fast_exit: cli.no_fast_exit,
        data_root: cli.data_root.clone(),
        db_path: cli.db.clone(),
    };
    let config = SyncConfig::resolve(&overrides)?;

    let mode = if cli.only_refresh_cache {
        RunMode::CacheOnly
    } else if cli.only_build_lists {
        RunMode::ListsOnly
    } else {
        RunMode::Full
    };
    let options = RunOptions {
        force: cli.force,
        no_db: cli.no_db,
        mode,
    };

    let client = DyntaxaHttpClient::new(&config)?;
    let app = App::new(config, client);
    let summary = app.run(&options)?;
    JsonOutput::print_summary(&summary).into_diagnostic()?;
    Ok(())
}
