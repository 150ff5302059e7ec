use anyhow::Context;
use sqlx::{
    ConnectOptions,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::time::Duration;
use threadmail::{Config, Services, init_tracing, run_smtp, run_workers, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs the SMTP listener and event workers in one process, sharing an
/// in-process `EventStream`. This is the single-binary deployment shape
/// SPEC_FULL.md §6.4 describes this crate as shipping.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .expect("DATABASE_URL must be a valid URL");

    let db_options = PgConnectOptions::from_url(&database_url)?.application_name("threadmail-all");

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

    run_smtp(&services, shutdown.clone());
    run_workers(&services, concurrency, shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
