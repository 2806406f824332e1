//! BioAttend kiosk CLI - registration and check-in that keep working offline.
//!
//! Every write is queued locally first and synced when the backend is
//! reachable. `bioattend watch` keeps a kiosk running with background sync.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bioattend_core::auth::Session;
use bioattend_core::cache::{CacheEvent, HttpRequest, ResponseSource};
use bioattend_core::connectivity::ConnectivityEdge;
use bioattend_core::models::{Identifier, Registration, TimeRange};
use bioattend_core::queue::{LocalId, LocalRecord, RecordPayload};
use bioattend_core::sync::{DrainOutcome, DrainReport, SyncEvent};
use bioattend_core::{Config, HostSignal, OfflineEngine};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of the daily log files written by `watch`
const LOG_FILE_PREFIX: &str = "bioattend.log";

#[derive(Parser, Debug)]
#[command(name = "bioattend")]
#[command(about = "Offline-first event registration and check-in")]
#[command(version)]
struct Cli {
    /// Path to config file (default: $XDG_CONFIG_HOME/bioattend/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a new attendee registration
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        event_id: Option<i64>,
    },
    /// Queue a check-in
    Checkin(CheckinArgs),
    /// Queue, sync and cache status
    Status,
    /// Sync pending records now
    Sync,
    /// List records the server rejected
    Failed,
    /// Re-submit a rejected record
    Retry { local_id: LocalId },
    /// GET any URL through the response cache
    Get { url: String },
    Events,
    Sessions { event_id: i64 },
    Users,
    Dashboard {
        #[arg(long)]
        event_id: Option<i64>,
        /// today, week, month or all_time
        #[arg(long, default_value = "today")]
        range: TimeRange,
    },
    /// Install the configured build's assets and activate it
    Activate,
    /// Delete synced records past the retention window and expired cache entries
    Prune,
    /// Drop every cached entry of a store
    Evict { store: String },
    /// Store the API token issued by the identity service
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        operator: Option<String>,
    },
    Logout,
    /// Run background sync until interrupted
    Watch,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct CheckinIdentifier {
    #[arg(long)]
    fallback_id: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    /// Local id of a registration queued on this device
    #[arg(long)]
    local: Option<LocalId>,
}

#[derive(Args, Debug)]
struct CheckinArgs {
    #[command(flatten)]
    identifier: CheckinIdentifier,
    #[arg(long)]
    event_id: i64,
    #[arg(long)]
    session_id: i64,
}

impl CheckinIdentifier {
    fn into_identifier(self) -> Result<Identifier> {
        match (self.fallback_id, self.phone, self.local) {
            (Some(id), None, None) => Ok(Identifier::FallbackId(id)),
            (None, Some(phone), None) => Ok(Identifier::Phone(phone)),
            (None, None, Some(local_id)) => Ok(Identifier::LocalRegistration(local_id)),
            _ => anyhow::bail!("Exactly one of --fallback-id, --phone or --local is required"),
        }
    }
}

/// Initialize the tracing subscriber, optionally mirroring logs to a daily file
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    let mut config = Config::load_from(&path)?;
    // Device id must be stable across runs
    if config.ensure_device_id() {
        config.save_to(&path)?;
    }
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let data_dir = config.data_dir()?;

    let log_dir = matches!(cli.command, Command::Watch).then_some(data_dir.as_path());
    let _log_guard = init_tracing(log_dir);

    let mut session = Session::new(data_dir.clone());
    session.load()?;

    match cli.command {
        Command::Login { token, operator } => {
            session.update(token, operator);
            session.save()?;
            println!("Token stored in {}", data_dir.display());
            return Ok(());
        }
        Command::Logout => {
            session.clear()?;
            println!("Token removed");
            return Ok(());
        }
        _ => {}
    }

    let mut engine = OfflineEngine::open(config, session.token()).await?;
    let result = run(&mut engine, cli.command).await;
    engine.shutdown().await;
    result
}

async fn run(engine: &mut OfflineEngine, command: Command) -> Result<()> {
    match command {
        Command::Register {
            name,
            phone,
            email,
            event_id,
        } => {
            let local_id = engine.enqueue_registration(Registration {
                name,
                phone,
                email,
                event_id,
            })?;
            println!("Registration queued as {}", local_id);
            report_drain(&engine.sync_now().await?);
        }
        Command::Checkin(args) => {
            let identifier = args.identifier.into_identifier()?;
            let local_id = engine.enqueue_check_in(identifier, args.event_id, args.session_id)?;
            println!("Check-in queued as {}", local_id);
            report_drain(&engine.sync_now().await?);
        }
        Command::Status => status(engine)?,
        Command::Sync => report_drain(&engine.sync_now().await?),
        Command::Failed => {
            let failed = engine.failed_records()?;
            if failed.is_empty() {
                println!("No rejected records");
            }
            for record in &failed {
                print_record(record);
            }
        }
        Command::Retry { local_id } => match engine.retry_failed(local_id).await {
            Ok(server_id) => println!("{} synced as {}", local_id, server_id),
            Err(e) => anyhow::bail!("Retry of {} failed: {}", local_id, e),
        },
        Command::Get { url } => {
            let url = url.parse().with_context(|| format!("Invalid URL: {}", url))?;
            let routed = engine.fetch(HttpRequest::get(url)).await?;
            eprintln!(
                "{} ({})",
                routed.response.status,
                source_label(&routed.source)
            );
            println!("{}", String::from_utf8_lossy(&routed.response.body));
        }
        Command::Events => {
            let events = engine.events().await?;
            println!("Events ({})", source_label(&events.source));
            for event in &events.data {
                println!(
                    "  {:>4}  {}  {}",
                    event.id,
                    event.name,
                    event.location.as_deref().unwrap_or("")
                );
            }
        }
        Command::Sessions { event_id } => {
            let sessions = engine.sessions(event_id).await?;
            println!("Sessions of event {} ({})", event_id, source_label(&sessions.source));
            for session in &sessions.data {
                println!(
                    "  {:>4}  {}  {}",
                    session.id,
                    session.name,
                    session.start_time.as_deref().unwrap_or("")
                );
            }
        }
        Command::Users => {
            let users = engine.users().await?;
            println!("Users ({})", source_label(&users.source));
            for user in &users.data {
                println!(
                    "  {:>4}  {:<24} {}",
                    user.id,
                    user.name,
                    user.fallback_id.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Dashboard { event_id, range } => {
            let dashboard = engine.dashboard(event_id, range).await?;
            // Denominator when the server does not report a total
            let known_users = match engine.users().await {
                Ok(users) => users.data.len() as u64,
                Err(_) => 0,
            };
            let stats = &dashboard.data.stats;
            println!("Dashboard, {} ({})", range.as_str(), source_label(&dashboard.source));
            println!("  Unique attendees:      {}", stats.unique_attendees);
            println!("  Fingerprint check-ins: {}", stats.fingerprint_checkins);
            println!("  QR check-ins:          {}", stats.qr_checkins);
            println!("  Check-in rate:         {}%", dashboard.data.checkin_rate(known_users));
        }
        Command::Activate => {
            let outcome = engine.install_assets().await?;
            info!(?outcome, "Install finished");
            engine.signal(HostSignal::SkipWaiting)?;
            println!("Active cache version: {}", engine.active_cache_version());
        }
        Command::Prune => {
            let records = engine.prune_synced()?;
            let entries = engine.expire_caches()?;
            println!(
                "Removed {} synced record(s) and {} expired cache entr(ies)",
                records, entries
            );
        }
        Command::Evict { store } => {
            let removed = engine.evict_store(&store)?;
            println!("Removed {} entr(ies) from {}", removed, store);
        }
        Command::Watch => watch(engine).await?,
        Command::Login { .. } | Command::Logout => {}
    }
    Ok(())
}

fn status(engine: &OfflineEngine) -> Result<()> {
    let stats = engine.stats()?;
    println!("Device:   {}", engine.config().device_id());
    println!("Backend:  {}", engine.config().api_base_url);
    println!(
        "Queue:    {} pending, {} syncing, {} synced, {} rejected",
        stats.pending, stats.syncing, stats.synced, stats.failed
    );
    println!("Cache:    version {}", engine.active_cache_version());
    if let Some(waiting) = engine.waiting_version()? {
        println!("          {} waiting for activation", waiting);
    }
    for store in engine.cache_summaries()? {
        println!(
            "          {:<28} {:<28} {} entries",
            store.version_tag, store.store_name, store.entries
        );
    }
    Ok(())
}

fn source_label(source: &ResponseSource) -> String {
    match source {
        ResponseSource::Network | ResponseSource::Passthrough => "live".to_string(),
        ResponseSource::Cache => "cached".to_string(),
        ResponseSource::Stale { stored_at } => {
            format!("offline copy from {}", stored_at.format("%Y-%m-%d %H:%M UTC"))
        }
    }
}

fn report_drain(report: &DrainReport) {
    match &report.outcome {
        DrainOutcome::Completed => println!(
            "Sync complete: {} synced, {} rejected",
            report.synced, report.rejected
        ),
        DrainOutcome::Interrupted { reason, retry_in } => println!(
            "Offline, records stay queued ({} synced so far; {}; next attempt in {}s)",
            report.synced,
            reason,
            retry_in.as_secs()
        ),
        DrainOutcome::Coalesced => println!("A sync is already running"),
    }
}

fn print_record(record: &LocalRecord) {
    let summary = match &record.payload {
        RecordPayload::UserRegistration(reg) => format!("{} <{}>", reg.name, reg.phone),
        RecordPayload::CheckIn(checkin) => format!(
            "event {} session {} via {:?}",
            checkin.event_id, checkin.session_id, checkin.identifier
        ),
    };
    println!(
        "{:>6}  {:<12} {}  [{}]",
        record.local_id.to_string(),
        record.kind().to_string(),
        summary,
        record.state
    );
}

/// Kiosk mode: background sync plus a live feed of engine notifications.
async fn watch(engine: &mut OfflineEngine) -> Result<()> {
    let mut sync_events = engine.subscribe_sync();
    let mut cache_events = engine.subscribe_cache();
    let mut edges = engine.subscribe_connectivity();
    engine.start_background();

    println!(
        "Watching {} pending record(s). Press Ctrl-C to stop.",
        engine.pending_count()?
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = sync_events.recv() => match event {
                Ok(SyncEvent::RecordSynced { local_id, server_id }) => {
                    println!("synced    {} -> {}", local_id, server_id)
                }
                Ok(SyncEvent::RecordRejected { local_id, reason }) => {
                    println!("rejected  {}: {}", local_id, reason)
                }
                Ok(SyncEvent::BackoffScheduled { retry_in, failures }) => {
                    println!("offline   retry in {}s (attempt {})", retry_in.as_secs(), failures)
                }
                Ok(SyncEvent::Idle) => println!("idle      queue drained"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Sync notifications dropped"),
                Err(RecvError::Closed) => break,
            },
            event = cache_events.recv() => match event {
                Ok(CacheEvent::Miss { url }) => println!("miss      {}", url),
                Ok(CacheEvent::StaleServed { url, stored_at }) => {
                    println!("stale     {} (from {})", url, stored_at.format("%H:%M"))
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Cache notifications dropped"),
                Err(RecvError::Closed) => break,
            },
            edge = edges.recv() => match edge {
                Ok(ConnectivityEdge::Online) => println!("online"),
                Ok(ConnectivityEdge::Offline) => println!("offline"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("Stopping");
    Ok(())
}
