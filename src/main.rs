use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use fx_crawler::cache::{Cache, MemoryCache};
use fx_crawler::config::{Config, ConfigSnapshot, LogFormat};
use fx_crawler::dashboard::start_dashboard;
use fx_crawler::db::{now_local, Database, DbHandle};
use fx_crawler::notifier::{AutoCloser, BidNotifier, Notifier, TelegramNotifier};
use fx_crawler::registry::Factory;
use fx_crawler::resource::load_resources;
use fx_crawler::scheduler::Scheduler;
use fx_crawler::websocket::{new_event_channel, EventSender};

#[derive(Parser)]
#[command(name = "fx-crawler")]
#[command(about = "Currency exchange bid monitor and shift trader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grab bids from every resource on a schedule
    Monitor,
    /// Run the shift trader once, right now
    Trade,
    /// Register the resources file in the database
    InsertResources,
    /// Append a config row from a JSON file
    PushConfig {
        /// Path to a JSON object with the config keys
        file: String,
    },
    /// Serve the dashboard without grabbing
    Serve,
}

fn init_logging(format: &LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fx_crawler=info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn open_db(config: &Config) -> Result<DbHandle> {
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let db = Database::open(&config.database_path)?;
    info!("Database initialized at {}", config.database_path);
    Ok(DbHandle::new(db))
}

fn spawn_dashboard(config: &Config, db: DbHandle, cache: Arc<dyn Cache>, events: EventSender) {
    if !config.dashboard_enabled {
        return;
    }
    let config = config.clone();
    tokio::spawn(async move {
        if let Err(e) = start_dashboard(&config, db, cache, events).await {
            error!("Dashboard stopped: {:#}", e);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_logging(&config.log_format);

    let db = open_db(&config)?;
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(Duration::from_secs(
        config.cache_ttl_secs,
    )));

    match cli.command {
        Commands::Monitor => monitor(&config, db, cache).await,
        Commands::Trade => trade(&config, db, cache).await,
        Commands::InsertResources => insert_resources(&config, db),
        Commands::PushConfig { file } => push_config(db, &file),
        Commands::Serve => {
            let events = new_event_channel();
            start_dashboard(&config, db, cache, events).await
        }
    }
}

async fn monitor(config: &Config, db: DbHandle, cache: Arc<dyn Cache>) -> Result<()> {
    info!("fx-crawler monitor starting");

    let resources = load_resources(&config.resources_path)?;
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(config)?);
    let events = new_event_channel();

    let factory = Factory::new(db.clone(), config);
    let grabbers = factory.create(&resources)?;
    let daily = factory.create_daily(config, cache.clone(), notifier.clone(), Some(events.clone()))?;
    info!(
        "Loaded {} resources and {} daily tasks",
        grabbers.len(),
        daily.len()
    );

    let stored = db.acquire()?.load_config();
    if let Err(e) = stored {
        warn!("{:#}. Push one with `fx-crawler push-config <file>`", e);
    }

    spawn_dashboard(config, db.clone(), cache.clone(), events.clone());

    let mut scheduler =
        Scheduler::new(db.clone(), cache, config.default_refresh_minutes).with_events(events);
    scheduler.add_tasks(grabbers);
    scheduler.add_daily_tasks(daily);
    scheduler.add_hook(Box::new(BidNotifier::new(db.clone(), notifier)));
    scheduler.add_hook(Box::new(AutoCloser::new(db, config.auto_close_enabled)));

    let result = scheduler.run_forever().await;
    scheduler.cleanup().await;
    if let Err(e) = &result {
        error!("Scheduler stopped: {:#}", e);
    }
    result
}

async fn trade(config: &Config, db: DbHandle, cache: Arc<dyn Cache>) -> Result<()> {
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(config)?);
    let factory = Factory::new(db, config);

    // Forced on: the subcommand is an explicit request to trade
    let mut config = config.clone();
    config.trader_enabled = true;
    let mut tasks = factory.create_daily(&config, cache.clone(), notifier, None)?;

    for task in tasks.iter_mut() {
        info!(task = task.name(), "Running now");
        task.run().await?;
    }
    cache.close().await
}

fn insert_resources(config: &Config, db: DbHandle) -> Result<()> {
    let resources = load_resources(&config.resources_path)?;
    let factory = Factory::new(db, config);
    let inserted = factory.register(&resources)?;
    for name in &inserted {
        info!(resource = %name, "Resource registered");
    }
    info!(
        "{} of {} resources were new",
        inserted.len(),
        resources.len()
    );
    Ok(())
}

fn push_config(db: DbHandle, file: &str) -> Result<()> {
    let raw =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?;
    let snapshot: ConfigSnapshot =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", file))?;
    let id = db.acquire()?.insert_config(&snapshot, now_local())?;
    info!(config_id = id, "Config pushed");
    Ok(())
}
