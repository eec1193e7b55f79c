//! evsync runner
//!
//! Keeps the configured accounts' event streams in sync against the HTTP API.

mod accounts;
mod config;
mod listeners;
mod shutdown;

use accounts::{ConfiguredStreams, publish_accounts};
use clap::Parser;
use config::ConfigLoader;
use evsync_core::account::{AccountManager, AppLifecycle, AppLifecycleProvider, AppLifecycleState, InMemoryAccountStore};
use evsync_core::api::HttpEventApi;
use evsync_core::config::SettingsStore;
use evsync_core::events::process_tick_channel;
use evsync_core::processors::{
    AccountStateHandler, EventManagerDeps, EventManagerProvider, EventWorkerRunner,
    EventWorkerScheduler, SessionLockRegistry, SessionManager,
};
use evsync_core::repository::{
    EventMetadataRepository, InMemoryEventMetadataRepository, PgEventMetadataRepository,
};
use evsync_core::session::HttpAuthRepository;
use evsync_sdk::client::{AuthClient, EventsClient};
use listeners::{LoggingListener, LoggingSessionListener};
use shutdown::{Reloadable, shutdown_signal, spawn_config_reload_handler};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// evsync - event stream synchronization daemon
#[derive(Parser, Debug)]
#[command(name = "evsync-runner")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./evsync.toml")]
    config: PathBuf,

    /// Postgres URL for event metadata; without it metadata is kept in memory
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Log as JSON lines
    #[arg(long, default_value = "false")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    tracing::info!("Starting evsync-runner v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = Arc::new(ConfigLoader::new(&args.config));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!(
        accounts = loaded_config.accounts.len(),
        "Configuration loaded from {:?}",
        args.config
    );

    // Metadata storage
    let (repository, db_pool) = open_repository(&args).await?;

    // Accounts, sessions and settings
    let store = Arc::new(InMemoryAccountStore::new());
    let engine_settings = SettingsStore::new(loaded_config.engine.clone());
    let account_configs = SettingsStore::new(loaded_config.accounts.clone());
    let app_lifecycle = Arc::new(AppLifecycle::new(if loaded_config.foreground {
        AppLifecycleState::Foreground
    } else {
        AppLifecycleState::Background
    }));

    // HTTP clients
    let http = reqwest::Client::builder()
        .timeout(loaded_config.api.timeout)
        .build()?;
    let mut events_client =
        EventsClient::new(loaded_config.api.base_url.clone()).with_http_client(http.clone());
    let mut auth_client =
        AuthClient::new(loaded_config.api.base_url.clone()).with_http_client(http);
    if let Some(version) = &loaded_config.api.app_version {
        events_client = events_client.with_app_version(version.clone());
        auth_client = auth_client.with_app_version(version.clone());
    }

    let session_manager = Arc::new(SessionManager::new(
        store.clone(),
        store.clone(),
        Arc::new(HttpAuthRepository::new(auth_client)),
        Arc::new(LoggingSessionListener),
        Arc::new(SessionLockRegistry::new()),
    ));
    let api = HttpEventApi::new(events_client, store.clone()).with_session_manager(session_manager);

    // Engine
    let (tick_tx, tick_rx) = process_tick_channel();
    let scheduler = Arc::new(EventWorkerScheduler::new(
        tick_tx,
        engine_settings.clone(),
        app_lifecycle.state(),
    ));
    let deps = EventManagerDeps {
        repository,
        api: Arc::new(api),
        worker: scheduler.clone(),
        accounts: store.clone(),
        app_lifecycle: app_lifecycle.clone(),
        settings: engine_settings.clone(),
    };
    let provider = Arc::new(EventManagerProvider::new(
        deps,
        Arc::new(ConfiguredStreams::new(account_configs.clone())),
        LoggingListener::all(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let account_changes = store.on_account_state_changed();
    let account_handler = tokio::spawn(
        AccountStateHandler::new(store.clone(), provider.clone())
            .run(shutdown_rx.clone(), account_changes),
    );
    let worker_runner = tokio::spawn(
        EventWorkerRunner::new(scheduler, provider.clone()).run(shutdown_rx.clone(), tick_rx),
    );
    let reload_handler = spawn_config_reload_handler(
        Reloadable {
            loader: config_loader,
            engine: engine_settings,
            accounts: account_configs,
            store: store.clone(),
            app_lifecycle,
        },
        shutdown_rx,
    )?;

    publish_accounts(&store, &loaded_config.accounts);
    tracing::info!("Sync engine running");

    shutdown_signal().await?;

    // Stop every task, then the managers they drive
    let _ = shutdown_tx.send(true);
    for (name, handle) in [
        ("account handler", account_handler),
        ("worker runner", worker_runner),
        ("reload handler", reload_handler),
    ] {
        if let Err(e) = handle.await {
            tracing::error!("{} task failed: {}", name, e);
        }
    }
    for manager in provider.active() {
        manager.stop().await;
    }

    if let Some(pool) = db_pool {
        tracing::info!("Closing database connections...");
        pool.close().await;
    }
    tracing::info!("Runner shutdown complete");
    Ok(())
}

/// Postgres when a database URL is given, in-memory otherwise.
async fn open_repository(
    args: &Args,
) -> anyhow::Result<(Arc<dyn EventMetadataRepository>, Option<PgPool>)> {
    let Some(database_url) = &args.database_url else {
        tracing::warn!("No database URL given, event metadata will not survive restarts");
        return Ok((Arc::new(InMemoryEventMetadataRepository::new()), None));
    };

    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    Ok((
        Arc::new(PgEventMetadataRepository::new(db_pool.clone())),
        Some(db_pool),
    ))
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
