//! muon-watch - coincidence muon detector acquisition
//!
//! Reads detector lines, keeps a rolling event buffer, flags rate anomalies
//! against a median baseline and saves buffer snapshots, optionally
//! replicating anomaly snapshots to a WebDAV store.
//!
//! # Usage
//!
//! ```bash
//! # Detector serial output piped in
//! cat /dev/ttyUSB0 | muon-watch --stdin
//!
//! # Serial-to-TCP bridge
//! muon-watch --tcp 192.168.1.20:5000
//!
//! # Replay a recorded run, 10x faster than real time
//! muon-watch --file run.txt --speed 10
//!
//! # Validate a config file
//! muon-watch check-config muon_config.toml
//! ```
//!
//! # Environment Variables
//!
//! - `MUON_CONFIG`: Path to the configuration file
//! - `RUST_LOG`: Logging filter (default: `logging.level` from config)

use anyhow::{Context, Result};
use clap::Parser;
use muon_watch::config::defaults::FILE_REPLAY_BASE_DELAY_MS;
use muon_watch::config::{LoadedConfig, MonitorConfig};
use muon_watch::pipeline::source::replay_delay;
use muon_watch::pipeline::{
    run_pipeline, MonitorContext, PipelineOptions, PipelineReport, ReaderSource, Replication,
    TcpSource,
};
use muon_watch::remote::{ReplicatorSettings, RetryQueue, SystemClock, WebDavStore};
use muon_watch::storage::SessionLayout;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "muon-watch")]
#[command(about = "Coincidence muon detector acquisition with rate anomaly detection")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read detector lines from stdin (default when no input is given)
    #[arg(long, conflicts_with_all = ["file", "tcp"])]
    stdin: bool,

    /// Replay a recorded detector log
    #[arg(long, value_name = "PATH", conflicts_with = "tcp")]
    file: Option<PathBuf>,

    /// Replay speed multiplier for --file (1 = one line per second, 0 = no delay)
    #[arg(long, default_value = "1", requires = "file")]
    speed: u64,

    /// Read detector lines from a serial-to-TCP bridge
    #[arg(long, value_name = "HOST:PORT")]
    tcp: Option<String>,

    /// Override storage.root_dir
    #[arg(long, value_name = "DIR")]
    root_dir: Option<PathBuf>,

    /// Save a snapshot every cycle, not only on anomalies
    #[arg(long)]
    save_all: bool,

    /// Emit console logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Config file (default: the normal search order)
        path: Option<PathBuf>,
    },
}

// ============================================================================
// Logging
// ============================================================================

/// Console layer plus a plain-text copy in the session's activity log.
fn init_logging(level: &str, json: bool, session: &SessionLayout) -> Result<()> {
    let log_path = session.log_path();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open activity log {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console: Box<dyn Layer<Registry> + Send + Sync> = if json {
        tracing_subscriber::fmt::layer().json().with_target(false).boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(log_file));

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .try_init()
        .context("Failed to initialise logging")?;
    Ok(())
}

fn log_config(loaded: &LoadedConfig) {
    info!(source = %loaded.source, "Configuration loaded");
    for warning in &loaded.warnings {
        warn!("Config: {}", warning);
    }
}

// ============================================================================
// Subcommands
// ============================================================================

fn run_check_config(path: Option<PathBuf>) -> Result<()> {
    let loaded = MonitorConfig::load(path.as_deref())?;
    println!("# Configuration source: {}", loaded.source);
    for warning in &loaded.warnings {
        println!("# warning: {warning}");
    }
    println!(
        "# Replication: {}",
        if loaded.config.replication_enabled() { "enabled" } else { "disabled" }
    );
    println!("{}", loaded.config.to_redacted_toml()?);
    Ok(())
}

// ============================================================================
// Replication Setup
// ============================================================================

fn build_replication(ctx: &MonitorContext) -> Result<Option<Replication>> {
    if !ctx.config.replication_enabled() {
        info!("Remote replication disabled (no remote.endpoint)");
        return Ok(None);
    }

    let remote = &ctx.config.remote;
    let store = WebDavStore::new(remote, &ctx.user_id).context("Invalid remote configuration")?;
    let queue = Arc::new(RetryQueue::new(remote.queue_capacity));

    let queue_file = ctx.queue_file();
    match queue.load(&queue_file) {
        Ok(report) if report.restored + report.missing > 0 => info!(
            restored = report.restored,
            missing = report.missing,
            "Restored pending uploads from previous run"
        ),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Could not restore pending uploads"),
    }

    info!(
        endpoint = %remote.endpoint.as_deref().unwrap_or_default(),
        user_id = %ctx.user_id,
        "Remote replication enabled"
    );
    Ok(Some(Replication {
        store: Arc::new(store),
        clock: Arc::new(SystemClock),
        queue,
        settings: ReplicatorSettings::from_config(remote, Some(queue_file)),
    }))
}

fn log_report(report: &PipelineReport) {
    if let Some(ingest) = &report.ingest {
        info!(
            lines = ingest.lines,
            events = ingest.events,
            malformed = ingest.parse_errors,
            banners = ingest.banners,
            "Ingest summary"
        );
    }
    if let Some(persist) = &report.persistence {
        info!(
            anomaly = persist.anomaly_written,
            all = persist.all_written,
            failed = persist.failed,
            dropped_all = report.dispatch.dropped_all,
            dropped_anomaly = report.dispatch.dropped_anomaly,
            backlog_high_water = report.dispatch.high_water,
            "Persistence summary"
        );
    }
    if let Some(replication) = &report.replication {
        info!(
            uploaded = replication.uploaded,
            unsent = replication.unsent.len(),
            given_up = replication.given_up,
            evicted = replication.evicted.len(),
            "Replication summary"
        );
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    if let Some(SubCommand::CheckConfig { path }) = args.command {
        return run_check_config(path.or(args.config));
    }

    // Configuration errors are fatal
    let mut loaded = MonitorConfig::load(args.config.as_deref())?;
    if let Some(root) = args.root_dir {
        loaded.config.storage.root_dir = root;
    }
    if args.save_all {
        loaded.config.detector.save_all = true;
    }
    loaded.config.validate()?;

    let root = loaded.config.storage.root_dir.clone();
    let session = SessionLayout::create(&root)
        .with_context(|| format!("Cannot start session under {}", root.display()))?;

    init_logging(&loaded.config.logging.level, args.json_logs, &session)?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  muon-watch {}", env!("CARGO_PKG_VERSION"));
    info!("  Coincidence muon detector acquisition");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log_config(&loaded);
    info!(session = %session.dir().display(), "Session directory created");

    let ctx = MonitorContext::new(loaded.config, session);
    let replication = build_replication(&ctx)?;

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let options = PipelineOptions::default();
    let report = if let Some(addr) = args.tcp {
        info!("📥 Input: TCP ({})", addr);
        run_pipeline(&ctx, TcpSource::new(addr), replication, cancel_token, options).await?
    } else if let Some(path) = args.file {
        let delay = replay_delay(FILE_REPLAY_BASE_DELAY_MS, args.speed);
        info!(
            "📥 Input: file {} ({}ms delay between lines)",
            path.display(),
            delay.as_millis()
        );
        let source = ReaderSource::open_file(&path, delay).await?;
        run_pipeline(&ctx, source, replication, cancel_token, options).await?
    } else {
        info!("📥 Input: stdin");
        run_pipeline(&ctx, ReaderSource::stdin(), replication, cancel_token, options).await?
    };

    log_report(&report);
    info!("✓ muon-watch shutdown complete");
    Ok(())
}
