//! # TabTime — headless host
//!
//! Runs the background scheduler against file-backed stores and tokio timers.
//!
//! Usage:
//!   tabtime                         # Run the scheduler (same as `tabtime run`)
//!   tabtime status                  # Show schedules and pending closes
//!   tabtime init                    # Write a default config file
//!   tabtime --config ./tabtime.toml # Custom config file

mod host;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use tabtime_core::file_store::FileStore;
use tabtime_core::traits::{Clock, SystemClock};
use tabtime_core::TabTimeConfig;
use tabtime_scheduler::{Host, PendingCloseRegistry, TabTimeService, recurring, time};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::host::{HeadlessTabs, TimerAlarms};

#[derive(Parser)]
#[command(name = "tabtime", version, about = "⏰ TabTime — open URLs on a daily schedule")]
struct Cli {
    /// Config file (default: ~/.tabtime/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Print schedules, next fire times and pending closes
    Status,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// One thread: every store callback runs to completion between suspension points.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tabtime=debug,tabtime_scheduler=debug,tabtime_core=debug"
    } else {
        "tabtime=info,tabtime_scheduler=info,tabtime_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let command = cli.command.unwrap_or(Command::Run);
    if let Command::Init { force } = command {
        let path = cli.config.unwrap_or_else(TabTimeConfig::default_path);
        return init(&path, force);
    }

    let config = match &cli.config {
        Some(path) => TabTimeConfig::load_from(path)?,
        None => TabTimeConfig::load()?,
    };
    let data_dir = config.data_path();
    let sync = Arc::new(FileStore::open(&data_dir, "sync")?);
    let local = Arc::new(FileStore::open(&data_dir, "local")?);

    match command {
        Command::Status => status(sync, local).await,
        _ => run(config, sync, local).await,
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    TabTimeConfig::default().save_to(path)?;
    println!("📝 Wrote default config to {}", path.display());
    Ok(())
}

/// Pick up edits the options UI (or a person with an editor) makes to the
/// store files while we run.
async fn watch_stores(stores: Vec<Arc<FileStore>>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for store in &stores {
                    if let Err(e) = store.refresh().await {
                        tracing::warn!("⚠️ Store refresh failed: {e}");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run(config: TabTimeConfig, sync: Arc<FileStore>, local: Arc<FileStore>) -> Result<()> {
    tracing::info!("📂 Data directory: {}", config.data_path().display());

    let watched = vec![sync.clone(), local.clone()];
    let host = Host {
        sync,
        local,
        alarms: Arc::new(TimerAlarms::new()),
        tabs: Arc::new(HeadlessTabs::new(config.tabs.launcher.as_deref())),
        clock: Arc::new(SystemClock),
    };
    let service = Arc::new(TabTimeService::new(host, config.lock.clone()));

    let launch = service.detect_launch(env!("CARGO_PKG_VERSION")).await?;
    tracing::info!("🚦 Launch: {:?}", launch);

    let (stop, shutdown) = watch::channel(false);
    let loop_handle = tokio::spawn(service.clone().run(shutdown.clone()));
    let watch_handle = tokio::spawn(watch_stores(
        watched,
        Duration::from_millis(config.poll_interval_ms.max(100)),
        shutdown,
    ));

    if let Err(e) = service.launch(launch).await {
        tracing::error!("❌ Launch hooks failed: {e}");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down");
    let _ = stop.send(true);
    loop_handle.await?;
    watch_handle.await?;
    Ok(())
}

async fn status(sync: Arc<FileStore>, local: Arc<FileStore>) -> Result<()> {
    let now = SystemClock.now();
    let schedules = recurring::load_schedules(sync.as_ref()).await?;

    println!("⏰ TabTime status ({})\n", now.format("%Y-%m-%d %H:%M"));
    println!("Schedules: {}", schedules.len());
    for (index, entry) in schedules.iter().enumerate() {
        let next = time::next_fire(&entry.time, &now)
            .filter(|_| entry.is_valid())
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "—".into());
        println!(
            "  #{index:<3} {:<5} next {:<16} close {:<15} {}",
            entry.time,
            next,
            serde_json::to_value(entry.auto_close)?.as_str().unwrap_or_default(),
            entry.url
        );
    }

    let pending = PendingCloseRegistry::new(local).load().await?;
    println!("\nPending closes: {}", pending.len());
    for entry in &pending {
        let at = Local
            .timestamp_millis_opt(entry.close_time)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| entry.close_time.to_string());
        println!("  tab {:<6} at {}  ({})", entry.tab_id, at, entry.alarm_name);
    }
    Ok(())
}
