//! Ambisync Service - Scheduled weather-station synchronization.
//!
//! Run with: `cargo run -p ambisync-service`

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

use ambisync_core::{AmbientClient, DeviceDirectory, StaticDirectory, SyncEngine};
use ambisync_service::status::{format_listing_table, format_status_table};
use ambisync_service::{Config, Runner, collect_listing, collect_status};
use ambisync_store::Store;

/// Ambisync Service - Pull weather-station readings into a local database.
#[derive(Parser, Debug)]
#[command(name = "ambisync-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Read credentials from this env file instead of searching for `.env`.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Run a single pass and exit.
    #[arg(long, global = true)]
    once: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronize on a schedule until interrupted (default behavior).
    Run,

    /// List devices from the directory with their latest stored reading.
    Devices {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show stored readings and the last sync run per device.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ambisync_service=info".parse()?)
                .add_directive("ambisync_core=info".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::Devices { json }) => list_devices(&config, json).await,
        Some(Command::Status { json }) => show_status(&config, json),
        Some(Command::Run) | None => run_sync(config, args.once).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Variables already in the environment take precedence over either file
    match &args.env_file {
        Some(path) => config.apply_env_file(path)?,
        None => {
            if let Ok(path) = dotenv::dotenv() {
                debug!("Loaded environment from {:?}", path);
            }
            config.apply_env()?;
        }
    }

    // Override config with CLI args
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }

    config.validate()?;
    Ok(config)
}

fn build_client(config: &Config) -> anyhow::Result<AmbientClient> {
    let client = AmbientClient::new(
        &config.remote.endpoint,
        &config.remote.api_key,
        &config.remote.application_key,
    )?
    .with_timeout(config.remote.timeout())?;
    Ok(client)
}

/// Devices listed in the config win over the remote device list.
fn build_directory(config: &Config, client: &AmbientClient) -> Box<dyn DeviceDirectory> {
    if config.devices.is_empty() {
        Box::new(client.clone())
    } else {
        info!(
            count = config.devices.len(),
            "Using devices from configuration"
        );
        Box::new(StaticDirectory::new(config.static_devices()))
    }
}

async fn run_sync(config: Config, once: bool) -> anyhow::Result<()> {
    config.validate_for_sync()?;

    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)?;

    let client = build_client(&config)?;
    let directory = build_directory(&config, &client);
    let engine = SyncEngine::new(client, store, config.to_sync_options())?;
    let runner = Runner::new(engine, directory, config.sync.interval());

    if once {
        let report = runner.run_once().await?;
        if report.all_failed() {
            bail!(
                "All {} device(s) failed to synchronize",
                report.outcomes.len()
            );
        }
        return Ok(());
    }

    runner.run_until(shutdown_signal()).await;
    Ok(())
}

async fn list_devices(config: &Config, json: bool) -> anyhow::Result<()> {
    if config.devices.is_empty()
        && (config.remote.api_key.is_empty() || config.remote.application_key.is_empty())
    {
        bail!("API and application keys are required to list devices from the remote API");
    }

    let client = build_client(config)?;
    let devices = build_directory(config, &client)
        .devices()
        .await
        .context("Failed to get devices")?;

    let store = Store::open(&config.storage.path)?;
    let listing = collect_listing(&devices, &store)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        print!("{}", format_listing_table(&listing));
    }
    Ok(())
}

fn show_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = Store::open(&config.storage.path)?;
    let statuses = collect_status(&store)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        print!("{}", format_status_table(&statuses));
    }
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
