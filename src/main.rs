use std::sync::Arc;

use feedmill::actors;
use feedmill::config::Config;
use feedmill::infrastructure::bus::Bus;
use feedmill::infrastructure::database::setup_database;
use feedmill::infrastructure::feed_reader::FeedReader;
use feedmill::infrastructure::scheduler::start_scheduler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Default to info level in production; use RUST_LOG env var to override
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedmill=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    tracing::info!("Connecting to database: {}", config.database_url);
    let db_pool = setup_database(&config.database_url).await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!().run(&db_pool).await?;
    tracing::info!("Migrations complete");

    let (bus, state_rx, fetch_rx) = Bus::new(config.bus_capacity);
    let reader = Arc::new(FeedReader::new()?);

    let state_loop = actors::spawn_state_loop(db_pool.clone(), bus.clone(), state_rx);
    let fetch_loop = actors::spawn_fetch_loop(reader, bus.clone(), fetch_rx);

    let _scheduler = start_scheduler(db_pool.clone(), bus.clone(), &config).await?;
    tracing::info!("FeedMill ingestion pipeline running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    state_loop.abort();
    fetch_loop.abort();

    Ok(())
}
