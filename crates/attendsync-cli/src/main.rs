//! attendsync - offline-first attendance capture from the command line.
//!
//! Every subcommand opens the local store, does its work through the core
//! library and closes the store again. If the store cannot be opened, `mark`
//! falls back to submitting straight to the remote service.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use attendsync_core::cache::CacheStatus;
use attendsync_core::models::{idempotency_token, QueuedRecord};
use attendsync_core::utils::{format_timestamp, truncate_string};
use attendsync_core::{
    ApiClient, ApplyOutcome, ApplyRequest, AttendanceEntry, AttendanceStatus, Config,
    Connectivity, DrainOutcome, DrainReport, LocalStore, ManualConnectivity, PendingQueue,
    StoreHandle, StoreLocation, SyncEngine, SyncEvent, UserCache,
};

// ============================================================================
// Constants
// ============================================================================

/// Log file prefix inside the data directory's `logs/` folder
const LOG_FILE_NAME: &str = "attendsync.log";

/// Width of the error column in queue listings
const ERROR_COLUMN_WIDTH: usize = 48;

#[derive(Parser, Debug)]
#[command(name = "attendsync", version)]
#[command(about = "Offline-first attendance capture and sync", long_about = None)]
struct Cli {
    /// Local database path (defaults to the platform data directory)
    #[arg(long, env = "ATTENDSYNC_DB", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue an attendance mark for a member
    Mark {
        /// Miqaat (event) id
        miqaat: String,
        /// ITS id or secondary id of the member
        identifier: String,
        /// Present, Late, Absent or Excused
        #[arg(long, default_value = "present", value_parser = parse_status)]
        status: AttendanceStatus,
        /// Marker identity (defaults to the configured marker)
        #[arg(long)]
        by: Option<String>,
        /// Drain the queue right after marking
        #[arg(long, default_value_t = false)]
        sync: bool,
    },
    /// List marks waiting for delivery
    Pending,
    /// List marks the remote rejected
    Rejected,
    /// Return a rejected mark to delivery
    Requeue { id: i64 },
    /// Drop one queued mark without delivering it
    Discard { id: i64 },
    /// Drop every queued mark, delivered or not
    Clear {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Deliver queued marks now
    Sync,
    /// Replace the cached user directory with a fresh copy
    RefreshUsers,
    /// Resolve an identifier against the cached directory
    Lookup { identifier: String },
    /// Show queue, cache and schema status
    Status,
    /// Keep syncing in the background until interrupted
    Watch {
        /// Seconds between connectivity probes
        #[arg(long, default_value_t = 30)]
        probe_secs: u64,
    },
}

fn parse_status(s: &str) -> Result<AttendanceStatus, String> {
    AttendanceStatus::parse(s)
        .ok_or_else(|| format!("unknown status '{}' (present, late, absent, excused)", s))
}

/// Initialize the tracing subscriber for logging.
///
/// Stderr gets the `RUST_LOG` filter (default `warn`); a daily-rolling file
/// in the data directory records everything at `info` and above.
fn init_tracing() -> Option<WorkerGuard> {
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_filter(stderr_filter);

    let file = Config::data_dir().ok().and_then(|dir| {
        let logs_dir = dir.join("logs");
        std::fs::create_dir_all(&logs_dir).ok()?;
        let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_NAME);
        Some(tracing_appender::non_blocking(appender))
    });

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer()
                .with_ansi(false) // No ANSI colors in log files
                .with_writer(writer)
                .with_filter(EnvFilter::new("info"));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing();
    info!("attendsync starting");

    let config = Config::load().context("Failed to load config")?;
    let db_path = match cli.db {
        Some(path) => path,
        None => config.database_path()?,
    };

    let store = LocalStore::new(StoreLocation::File(db_path));
    let result = match store.open().await {
        Ok(handle) => run(cli.command, &config, handle).await,
        Err(e) if e.is_unavailable() => {
            warn!(error = %e, "Local store unavailable");
            eprintln!("offline mode unavailable: {}", e);
            run_online_only(cli.command, &config).await
        }
        Err(e) => Err(e).context("Failed to open local store"),
    };
    store.close().await;
    result
}

fn api_client(config: &Config) -> Result<ApiClient> {
    let base_url = config
        .api_base_url
        .as_deref()
        .context("No API URL configured (set ATTENDSYNC_API_URL or api_base_url)")?;
    let mut client = ApiClient::with_timeout(base_url, config.sync_options().submit_timeout)?;
    if let Some(ref token) = config.api_token {
        client.set_token(token.clone());
    }
    Ok(client)
}

fn engine(config: &Config, handle: StoreHandle, client: ApiClient) -> SyncEngine {
    SyncEngine::new(
        PendingQueue::new(handle.clone()),
        UserCache::new(handle),
        Arc::new(client),
        config.sync_options(),
    )
}

fn marker(config: &Config, by: Option<String>) -> String {
    by.or_else(|| config.marker_id.clone()).unwrap_or_default()
}

async fn run(command: Command, config: &Config, handle: StoreHandle) -> Result<()> {
    let queue = PendingQueue::new(handle.clone());
    let cache = UserCache::new(handle.clone());

    match command {
        Command::Mark {
            miqaat,
            identifier,
            status,
            by,
            sync,
        } => {
            let entry = match cache.lookup(&identifier).await? {
                Some(user) => AttendanceEntry::new(user.its_id.clone(), status).for_member(&user),
                None => {
                    eprintln!("warning: '{}' is not in the cached directory", identifier.trim());
                    AttendanceEntry::new(identifier, status)
                }
            };
            let entry = entry.marked_by(marker(config, by));
            let record = queue.enqueue(&miqaat, entry).await?;
            println!(
                "Queued #{} {} {} ({})",
                record.id,
                record.entry.user_identifier,
                record.entry.status,
                record.idempotency_token
            );

            if sync {
                let engine = engine(config, handle, api_client(config)?);
                print_drain(engine.drain().await?);
            }
        }

        Command::Pending => {
            let queued = queue.deliverable().await?;
            if queued.is_empty() {
                println!("No pending attendance.");
            }
            for item in &queued {
                print_queued(item, item.delivery.last_error.as_deref());
            }
        }

        Command::Rejected => {
            let dead = queue.dead_letters().await?;
            if dead.is_empty() {
                println!("No rejected attendance.");
            }
            for item in &dead {
                print_queued(item, item.delivery.rejected_reason.as_deref());
            }
        }

        Command::Requeue { id } => {
            if queue.requeue(id).await? {
                println!("Requeued #{}", id);
            } else {
                bail!("No rejected record #{}", id);
            }
        }

        Command::Discard { id } => {
            if queue.get(id).await?.is_none() {
                bail!("No queued record #{}", id);
            }
            queue.remove(id).await?;
            println!("Discarded #{}", id);
        }

        Command::Clear { yes } => {
            if !yes {
                bail!("Refusing to discard unsynced attendance without --yes");
            }
            let discarded = queue.clear().await?;
            println!("Discarded {} record(s)", discarded);
        }

        Command::Sync => {
            let engine = engine(config, handle, api_client(config)?);
            print_drain(engine.drain().await?);
        }

        Command::RefreshUsers => {
            let client = api_client(config)?;
            let engine = engine(config, handle, client.clone());
            let count = engine.refresh_users(&client).await?;
            println!("Cached {} user(s)", count);
        }

        Command::Lookup { identifier } => match cache.lookup(&identifier).await? {
            Some(user) => {
                println!("{} ({})", user.display_name(), user.its_id);
                if let Some(ref mohallah) = user.mohallah_id {
                    println!("  Mohallah: {}", mohallah);
                }
                if let Some(ref role) = user.role {
                    println!("  Role:     {}", role);
                }
            }
            None => bail!("'{}' not found in cached directory", identifier.trim()),
        },

        Command::Status => {
            let pending = queue.deliverable().await?.len();
            let rejected = queue.dead_letters().await?.len();
            println!("Schema version: {}", handle.schema_version().await?);
            println!("Pending:        {}", pending);
            println!("Rejected:       {}", rejected);
            print_cache_status(cache.status().await?, config.sync.cache_stale_minutes);
            match config.api_base_url {
                Some(ref url) => println!("Remote:         {}", url),
                None => println!("Remote:         (not configured)"),
            }
        }

        Command::Watch { probe_secs } => {
            let client = api_client(config)?;
            watch(engine(config, handle, client.clone()), client, probe_secs).await;
        }
    }

    Ok(())
}

/// Without a local store only direct submission is possible.
async fn run_online_only(command: Command, config: &Config) -> Result<()> {
    let Command::Mark {
        miqaat,
        identifier,
        status,
        by,
        ..
    } = command
    else {
        bail!("This command needs the local store");
    };

    let client = api_client(config)?;
    let entry = AttendanceEntry::new(identifier.trim(), status).marked_by(marker(config, by));
    let request = ApplyRequest {
        miqaat_id: miqaat,
        idempotency_token: idempotency_token(&entry.user_identifier, Utc::now()),
        entry,
    };

    match client.apply_attendance(&request).await? {
        ApplyOutcome::Accepted | ApplyOutcome::AlreadyApplied => {
            println!("Submitted {} ({})", request.entry.user_identifier, request.idempotency_token);
            Ok(())
        }
        ApplyOutcome::Rejected { reason } => bail!("Rejected by remote: {}", reason),
    }
}

async fn watch(engine: SyncEngine, client: ApiClient, probe_secs: u64) {
    let initial = if client.ping().await {
        Connectivity::Online
    } else {
        Connectivity::Offline
    };
    let monitor = ManualConnectivity::new(initial);

    let probe_monitor = monitor.clone();
    let probe = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(probe_secs.max(1)));
        loop {
            interval.tick().await;
            let state = if client.ping().await {
                Connectivity::Online
            } else {
                Connectivity::Offline
            };
            probe_monitor.set(state);
        }
    });

    let mut events = engine.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::DrainCompleted(report) if !report.outcomes.is_empty() => {
                    print_report(&report)
                }
                SyncEvent::Rejected { id, reason, .. } => {
                    eprintln!("Rejected #{}: {}", id, reason)
                }
                _ => {}
            }
        }
    });

    println!("Watching for connectivity (Ctrl-C to stop)...");
    engine
        .run(&monitor, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    probe.abort();
    reporter.abort();
}

fn print_queued(item: &QueuedRecord, note: Option<&str>) {
    let record = &item.record;
    println!(
        "#{:<5} {:<12} {:<10} {:<8} {} attempts={} {}",
        record.id,
        truncate_string(&record.miqaat_id, 12),
        record.entry.user_identifier,
        record.entry.status,
        format_timestamp(&record.created_at),
        item.delivery.attempts,
        note.map(|n| truncate_string(n, ERROR_COLUMN_WIDTH))
            .unwrap_or_default()
    );
}

fn print_report(report: &DrainReport) {
    println!(
        "Synced: {} confirmed, {} retrying, {} rejected, {} waiting",
        report.confirmed(),
        report.retried(),
        report.rejected(),
        report.deferred + report.untried
    );
    if report.aborted {
        println!("Remote unreachable; remaining records stay queued.");
    }
}

fn print_drain(outcome: DrainOutcome) {
    match outcome {
        DrainOutcome::Completed(report) => print_report(&report),
        DrainOutcome::Coalesced => println!("A sync is already running."),
    }
}

fn print_cache_status(status: Option<CacheStatus>, stale_minutes: i64) {
    match status {
        Some(status) => println!(
            "User cache:     {} user(s), refreshed {}{}",
            status.user_count,
            status.age_display(),
            if status.is_stale(stale_minutes) { " (stale)" } else { "" }
        ),
        None => println!("User cache:     empty"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mark() {
        let cli = Cli::try_parse_from([
            "attendsync", "mark", "m1", "10101010", "--status", "LATE", "--sync",
        ])
        .unwrap();
        match cli.command {
            Command::Mark {
                miqaat,
                identifier,
                status,
                sync,
                ..
            } => {
                assert_eq!(miqaat, "m1");
                assert_eq!(identifier, "10101010");
                assert_eq!(status, AttendanceStatus::Late);
                assert!(sync);
            }
            other => panic!("expected mark, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_status() {
        assert!(Cli::try_parse_from(["attendsync", "mark", "m1", "1", "--status", "gone"]).is_err());
    }

    #[test]
    fn test_clear_defaults_to_unconfirmed() {
        let cli = Cli::try_parse_from(["attendsync", "clear"]).unwrap();
        assert!(matches!(cli.command, Command::Clear { yes: false }));
    }
}
