//! insight binary: counter service and offline tooling

use clap::{Parser, Subcommand};
use insight::common::{BackendKind, Config};
use insight::store::{open_backend, read_totals};
use insight::InsightServer;
use std::path::PathBuf;
use tracing::{Instrument, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "insight")]
#[command(about = "Durable event counters with a Prometheus endpoint")]
#[command(version)]
struct Cli {
    /// Config file (TOML); `INSIGHT__*` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// HTTP listen address
        #[arg(long)]
        http_addr: Option<String>,

        /// Path to the db file
        #[arg(long)]
        db: Option<PathBuf>,

        /// Storage engine
        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        /// Debug logging with source locations
        #[arg(long)]
        debug: bool,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long)]
        log_level: Option<String>,

        /// Runtime worker threads (defaults to the CPU count)
        #[arg(long, visible_alias = "maxprocs")]
        worker_threads: Option<usize>,
    },

    /// Print every stored total (server must be stopped)
    Dump {
        /// Path to the db file
        #[arg(long)]
        db: Option<PathBuf>,

        /// Storage engine
        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
}

/// Errors go to stderr, everything else to stdout
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.effective_log_level().into());
    let writer = std::io::stderr
        .with_max_level(Level::ERROR)
        .or_else(std::io::stdout);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_file(config.debug)
                .with_line_number(config.debug),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Load config from file and environment, then override with CLI arguments
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            http_addr,
            db,
            backend,
            debug,
            log_level,
            worker_threads,
        } => {
            if let Some(addr) = http_addr {
                config.http_addr = addr.parse()?;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(backend) = backend {
                config.backend = backend;
            }
            if debug {
                config.debug = true;
            }
            if let Some(level) = log_level {
                config.log_level = level;
            }
            if worker_threads.is_some() {
                config.worker_threads = worker_threads;
            }
            config.validate()?;

            init_tracing(&config);

            // Outside debug mode every line carries the service identity
            let root = if config.debug {
                tracing::Span::none()
            } else {
                tracing::info_span!("insight", app = "insight", version = insight::VERSION)
            };

            let workers = config.worker_threads();
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers)
                .enable_all()
                .build()?;

            runtime.block_on(
                async move {
                    tracing::info!(version = insight::VERSION, workers, "Preparing");
                    if let Err(e) = InsightServer::new(config).serve().await {
                        tracing::error!(error = %e, "Insight server stopped");
                        return Err(anyhow::Error::from(e));
                    }
                    tracing::info!("Finished");
                    Ok(())
                }
                .instrument(root),
            )?;
        }

        Commands::Dump { db, backend, json } => {
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(backend) = backend {
                config.backend = backend;
            }
            if config.backend == BackendKind::Memory {
                anyhow::bail!("nothing to dump from the in-memory backend");
            }
            init_tracing(&config);

            let backend = open_backend(config.backend, &config.db_path)?;
            let totals = read_totals(backend.as_ref())?;
            if json {
                for total in &totals {
                    println!("{}", serde_json::to_string(total)?);
                }
            } else {
                println!("{:<24} {:<24} {:>20}", "APP", "TYPE", "TOTAL");
                for total in &totals {
                    println!(
                        "{:<24} {:<24} {:>20}",
                        total.app, total.counter_type, total.total
                    );
                }
                println!("{} counters", totals.len());
            }
        }
    }

    Ok(())
}
