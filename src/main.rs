// ABOUTME: CLI entry point for mqtt-replicator
// ABOUTME: Loads settings, installs logging and runs the publisher, subscriber or a one-shot command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mqtt_replicator::config::{Overrides, Role, Settings};
use mqtt_replicator::delta::{parse_timestamp, Delta};
use mqtt_replicator::store::AnyStore;
use mqtt_replicator::sync::{
    run_subscriber, DirectoryFileSink, Dispatcher, FileSink, PublisherLoop, WatchedFile,
};
use mqtt_replicator::transport::{MqttBusClient, TransportSession};
use mqtt_replicator::utils::sanitize_url;
use mqtt_replicator::{ChangeTracker, DeltaApplier};

#[derive(Parser)]
#[command(name = "mqtt-replicator")]
#[command(about = "Keep a table in sync between two hosts over MQTT", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML config file (defaults to ./mqtt-replicator.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Override the configured role (publisher or subscriber)
    #[arg(long, global = true)]
    role: Option<Role>,
    /// Override the configured topic
    #[arg(long, global = true)]
    topic: Option<String>,
    /// Store connection URL (postgres://..., sqlite://path or a .db file)
    #[arg(long = "store-url", env = "MQTT_REPLICATOR_STORE_URL", global = true)]
    store_url: Option<String>,
    #[arg(long = "broker-host", global = true)]
    broker_host: Option<String>,
    #[arg(long = "broker-port", global = true)]
    broker_port: Option<u16>,
    #[arg(
        long = "broker-password",
        env = "MQTT_REPLICATOR_BROKER_PASSWORD",
        hide_env_values = true,
        global = true
    )]
    broker_password: Option<String>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured role until Ctrl+C
    Run,
    /// Write the changes since a point in time to a delta file
    Snapshot {
        #[arg(long)]
        output: PathBuf,
        /// Start of the window (RFC 3339); defaults to now minus the startup skew
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,
    },
    /// Apply a delta file to the configured store
    Apply {
        #[arg(long)]
        input: PathBuf,
    },
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(value).ok_or_else(|| format!("invalid timestamp '{}'", value))
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            role: self.role,
            topic: self.topic.clone(),
            store_url: self.store_url.clone(),
            broker_host: self.broker_host.clone(),
            broker_port: self.broker_port,
            broker_password: self.broker_password.clone(),
            allow_self_signed_certs: self.allow_self_signed_certs,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply_overrides(cli.overrides());
    settings.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::Snapshot { output, since } => snapshot(settings, output, since).await,
        Commands::Apply { input } => apply(settings, input).await,
    }
}

async fn open_store(settings: &Settings) -> anyhow::Result<AnyStore> {
    let url = settings.store_url()?;
    tracing::info!("Opening store {}", sanitize_url(url));
    AnyStore::open(url, settings.store.allow_self_signed_certs)
        .await
        .with_context(|| format!("Failed to open store {}", sanitize_url(url)))
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings).await?;
    let session = TransportSession::new(MqttBusClient::new(), settings.session_config());

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    tracing::info!(
        "Running as {:?} on {}:{} topic {}",
        settings.role,
        settings.broker.host,
        settings.broker.port,
        settings.topic
    );
    println!("Press Ctrl+C to stop");

    match settings.role {
        Role::Publisher => {
            let mut tracker = ChangeTracker::new(store, settings.tracker_config());
            if let Some(path) = &settings.tracker.state_path {
                tracker = tracker
                    .with_state_file(path, settings.store_url()?)
                    .await?;
            }
            let mut publisher =
                PublisherLoop::new(tracker, session, settings.publisher_config());
            if let Some(path) = &settings.files.publish_path {
                publisher = publisher.with_watched_file(WatchedFile::new(path));
            }
            publisher.run(shutdown_rx).await
        }
        Role::Subscriber => {
            let sink = settings
                .files
                .save_dir
                .as_ref()
                .map(|dir| Arc::new(DirectoryFileSink::new(dir)) as Arc<dyn FileSink>);
            let applier = DeltaApplier::new(store, settings.table.clone());
            let dispatcher = Arc::new(Dispatcher::new(applier, sink));
            run_subscriber(session, &settings.topic, dispatcher, shutdown_rx).await
        }
    }
}

async fn snapshot(
    settings: Settings,
    output: PathBuf,
    since: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    let store = open_store(&settings).await?;
    let config = settings.tracker_config();
    let mut tracker = match since {
        Some(since) => ChangeTracker::with_watermark(store, config, since),
        None => ChangeTracker::new(store, config),
    };
    if since.is_none() {
        if let Some(path) = &settings.tracker.state_path {
            tracker = tracker
                .with_state_file(path, settings.store_url()?)
                .await?;
        }
    }

    let delta = tracker.save_delta_to_file(&output).await?;
    println!(
        "Wrote {} inserts and {} updates to {}",
        delta.inserts.len(),
        delta.updates.len(),
        output.display()
    );
    Ok(())
}

async fn apply(settings: Settings, input: PathBuf) -> anyhow::Result<()> {
    let delta = Delta::read_from_file(&input).await?;
    let store = open_store(&settings).await?;
    let applier = DeltaApplier::new(store, settings.table.clone());
    let report = applier.apply(&delta).await?;

    println!(
        "Applied {}: {} upserted, {} deleted, {} rejected",
        input.display(),
        report.upserted,
        report.deleted,
        report.rejected.len()
    );
    for column in &report.ignored_columns {
        println!("  ignored column: {}", column);
    }
    for rejected in &report.rejected {
        println!("  rejected: {}", rejected);
    }
    if !report.is_clean() {
        anyhow::bail!("{} rows were rejected", report.rejected.len());
    }
    Ok(())
}
