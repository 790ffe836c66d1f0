// ABOUTME: CLI entry point for geo-changeset-sync
// ABOUTME: Parses commands, sets up logging and TLS policy, and routes to handlers

use clap::{Parser, Subcommand};
use geo_changeset_sync::changeset::PayloadFormat;
use geo_changeset_sync::commands;
use geo_changeset_sync::config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "geo-changeset-sync")]
#[command(about = "Incremental WFS changeset sync into PostGIS tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to config.toml (defaults to ~/.geo-changeset-sync/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and apply changesets for registered datasets
    Sync {
        /// Only sync this dataset id (repeatable)
        #[arg(long = "dataset")]
        datasets: Vec<i64>,
        /// Maximum datasets synced concurrently (overrides [sync] max_workers)
        #[arg(long)]
        workers: Option<usize>,
        /// Metadata database holding the registry, API keys and run history
        #[arg(long, env = "METADATA_DATABASE_URL")]
        metadata_url: Option<String>,
        /// Target PostGIS database
        #[arg(long, env = "TARGET_DATABASE_URL")]
        target_url: Option<String>,
    },
    /// Show the window the next sync of a dataset would cover
    Window {
        #[arg(long)]
        dataset: i64,
        #[arg(long, env = "METADATA_DATABASE_URL")]
        metadata_url: Option<String>,
    },
    /// Decode a saved changeset payload and print its records (offline)
    Inspect {
        /// Payload file (GeoJSON or GML)
        #[arg(long)]
        file: PathBuf,
        /// Payload format; sniffed from the content when omitted
        #[arg(long, value_enum)]
        format: Option<PayloadFormat>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    geo_changeset_sync::postgres::init_tls_policy(cli.allow_self_signed_certs);

    match cli.command {
        Commands::Sync {
            datasets,
            workers,
            metadata_url,
            target_url,
        } => {
            let config = Config::load_or_default(cli.config.as_deref())?;
            commands::sync(
                &config,
                commands::sync::SyncOptions {
                    datasets,
                    workers,
                    metadata_url,
                    target_url,
                },
            )
            .await
        }
        Commands::Window {
            dataset,
            metadata_url,
        } => {
            let config = Config::load_or_default(cli.config.as_deref())?;
            commands::window(&config, dataset, metadata_url).await
        }
        Commands::Inspect { file, format } => commands::inspect(&file, format).await,
    }
}
