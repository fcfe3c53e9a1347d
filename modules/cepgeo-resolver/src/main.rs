use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cepgeo_common::Config;
use cepgeo_resolver::sources::LiveChainFactory;
use cepgeo_resolver::{
    BatchOrchestrator, Budget, Concurrency, RateLimitScope, RecordStore, RunOptions, SourceKind,
};

#[derive(Parser)]
#[command(name = "cepgeo", about = "Fill in coordinates for stored postal-code records")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve coordinates for every record the ledger hasn't settled.
    Resolve(ResolveArgs),
    /// Rewrite every record's cep field into digit-only form.
    Canonicalize {
        /// Files processed at once
        #[arg(long, default_value_t = 8)]
        parallelism: usize,
    },
}

#[derive(Args)]
struct ResolveArgs {
    /// Stop each worker after this many records
    #[arg(long, env = "MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Stop the whole run after this many seconds
    #[arg(long, env = "MAX_SECONDS")]
    max_seconds: Option<u64>,

    /// Run this many workers, each with its own browser session
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// One geocoder rate limiter for all workers instead of one each
    #[arg(long)]
    shared_rate_limit: bool,

    /// Give previously failed records another try
    #[arg(long)]
    retry_failed: bool,

    /// Sources to try, in order
    #[arg(
        long,
        value_enum,
        value_delimiter = ',',
        default_value = "geocoder,keyed,scraper-a,scraper-b"
    )]
    sources: Vec<SourceKind>,

    /// Skip the scraper sources and never open a browser
    #[arg(long)]
    no_browser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cepgeo=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    config.log_redacted();

    let store = RecordStore::new(&config.cep_dir);

    match cli.command {
        Command::Canonicalize { parallelism } => {
            let report = store
                .canonicalize_identifiers(parallelism)
                .await
                .context("Failed to canonicalize records")?;
            println!("\n=== Canonicalize Complete ===");
            println!("Scanned: {}", report.scanned);
            println!("Changed: {}", report.changed.len());
            println!("Errors:  {}", report.errors.len());
            for (id, error) in &report.errors {
                println!("  {id}: {error}");
            }
        }
        Command::Resolve(args) => {
            let concurrency = match args.workers {
                Some(n) if n > 1 => Concurrency::Parallel { workers: n },
                _ => Concurrency::Sequential,
            };
            let parallel = matches!(concurrency, Concurrency::Parallel { .. });

            let options = RunOptions {
                budget: Budget {
                    max_attempts: args.max_attempts,
                    max_wall_clock: args.max_seconds.map(Duration::from_secs),
                },
                concurrency,
                rate_limit_scope: if args.shared_rate_limit {
                    RateLimitScope::Shared
                } else {
                    RateLimitScope::PerWorker
                },
                retry_failed: args.retry_failed,
                geocode_min_interval: config.geocode_min_interval,
            };

            info!(
                sources = ?args.sources,
                concurrency = ?options.concurrency,
                budget = ?options.budget,
                "Resolving coordinates"
            );

            let factory = Arc::new(LiveChainFactory::new(
                config.clone(),
                args.sources,
                !args.no_browser,
                parallel,
            ));
            let orchestrator = BatchOrchestrator::new(
                store,
                &config.ledger_dir,
                &config.data_dir,
                factory,
                options,
            );
            let stats = orchestrator.run().await?;
            println!("{stats}");
        }
    }

    Ok(())
}
