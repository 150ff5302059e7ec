use anyhow::Context;
use sqlx::{
    ConnectOptions,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::time::Duration;
use threadmail::{Config, Services, init_tracing, run_workers, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs only the C5 event workers (`mail`, `send`, `del`). See
/// `threadmail-smtp`'s doc comment for the in-process event stream caveat
/// when splitting this from the SMTP listener.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .expect("DATABASE_URL must be a valid URL");

    let db_options = PgConnectOptions::from_url(&database_url)?.application_name("threadmail-worker");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let config = Config::from_env().context("failed to load configuration")?;
    let services = Services::new(pool, config).context("failed to construct collaborators")?;

    let shutdown = CancellationToken::new();
    let concurrency = std::env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    run_workers(&services, concurrency, shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping workers");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
