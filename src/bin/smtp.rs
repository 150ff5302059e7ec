use anyhow::Context;
use sqlx::{
    ConnectOptions,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::time::Duration;
use threadmail::{Config, Services, init_tracing, run_smtp, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs only the SMTP listener (C3). The event stream it publishes to is
/// in-process (`LocalEventStream`): this binary is only useful alongside a
/// `threadmail-worker` in the same process, or with a networked `EventStream`
/// implementation swapped in by an embedding platform (SPEC_FULL.md §6.4).
/// `threadmail-all` is the single-binary deployment this crate is built for.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .expect("DATABASE_URL must be a valid URL");

    let db_options = PgConnectOptions::from_url(&database_url)?.application_name("threadmail-smtp");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    let config = Config::from_env().context("failed to load configuration")?;
    let services = Services::new(pool, config).context("failed to construct collaborators")?;

    let shutdown = CancellationToken::new();
    run_smtp(&services, shutdown.clone());

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping smtp server");
    shutdown.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
