use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gallery_sync::api::ApiServer;
use gallery_sync::cli::posts::{self, PostsConfig};
use gallery_sync::config::{DatabaseSettings, Settings};
use gallery_sync::database_ops::db;
use gallery_sync::database_ops::gallery::{SyncOptions, SyncStatus};
use gallery_sync::logging;
use gallery_sync::orchestrator::{self, Syncer};
use gallery_sync::util::env as env_util;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Logged (redacted) at startup; validation happens when settings are resolved.
const SNAPSHOT_KEYS: [&str; 9] = [
    "GALLERY_USER_ID",
    "GALLERY_BASE_URL",
    "DATABASE_URL",
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "DB_USER",
    "DB_PASSWORD",
    "DB_SSLMODE",
];

#[derive(Parser, Debug)]
#[command(name = "gallery-sync", version, about = "Mirror one gallery account into a database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run one sync pass and exit (default)
    Sync,
    /// Serve the read API and sync periodically
    Serve {
        /// Override API_HOST
        #[arg(long)]
        host: Option<String>,
        /// Override API_PORT
        #[arg(long)]
        port: Option<u16>,
        /// Override SYNC_INTERVAL_SECS; 0 disables periodic runs
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Print stored posts, newest first
    Posts {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        page_size: i64,
    },
    /// Print one stored post with its images
    Post { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    logging::init_tracing(logging::DEFAULT_FILTER)?;

    let cli = Cli::parse();
    env_util::preflight_check("gallery-sync", &[], &SNAPSHOT_KEYS)?;
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => run_sync(&load_settings()?).await,
        Commands::Serve {
            host,
            port,
            interval_secs,
        } => serve(&load_settings()?, host, port, interval_secs).await,
        Commands::Posts { page, page_size } => {
            let database = DatabaseSettings::from_env().context("invalid configuration")?;
            posts::run_list(&database, PostsConfig { page, page_size }).await
        }
        Commands::Post { id } => {
            let database = DatabaseSettings::from_env().context("invalid configuration")?;
            posts::run_show(&database, &id).await
        }
    }
}

fn load_settings() -> Result<Settings> {
    let settings = Settings::from_env().context("invalid configuration")?;
    info!(
        user_id = %settings.user_id,
        database = ?settings.database,
        pagination = ?settings.pagination,
        "configuration loaded"
    );
    Ok(settings)
}

async fn run_sync(settings: &Settings) -> Result<()> {
    let report = match orchestrator::run_once(settings).await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %format!("{err:#}"), "sync failed");
            return Err(err);
        }
    };
    match report.status {
        SyncStatus::NoPosts => info!("nothing to sync"),
        SyncStatus::Completed => {
            let summary = report.summary();
            info!(
                candidates = summary.candidates,
                inserted = summary.inserted,
                skipped = summary.skipped,
                failed = summary.failed,
                images = summary.images,
                "sync complete"
            );
            for f in &summary.failures {
                warn!(post_id = %f.post_id, reason = %f.reason, "post not stored");
            }
        }
    }
    if let Some(reason) = &report.truncated {
        warn!(reason = %reason, "listing was cut short; some posts may be missing");
    }
    Ok(())
}

async fn serve(
    settings: &Settings,
    host: Option<String>,
    port: Option<u16>,
    interval_secs: Option<u64>,
) -> Result<()> {
    let server = ApiServer::from_env()?.with_overrides(host, port);
    let interval_secs =
        interval_secs.unwrap_or_else(|| env_util::env_parse("SYNC_INTERVAL_SECS", 1800u64));

    let store = db::connect(&settings.database).await?;
    store.ensure_schema().await.context("ensure schema")?;
    let provider = orchestrator::build_provider(settings)?;
    let syncer = Arc::new(Syncer::new(
        Arc::clone(&store),
        Arc::new(provider),
        settings.user_id.clone(),
        SyncOptions::from(settings),
    ));

    let periodic = if interval_secs > 0 {
        Some(tokio::spawn(
            Arc::clone(&syncer).run_periodic(Duration::from_secs(interval_secs)),
        ))
    } else {
        info!("periodic sync disabled");
        None
    };

    let served = server.run(syncer).await;
    if let Some(handle) = periodic {
        handle.abort();
    }
    store.close().await;
    served
}
