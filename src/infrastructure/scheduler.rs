use std::time::Duration;

use sqlx::SqlitePool;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::actors::state;
use crate::config::Config;
use crate::infrastructure::bus::Bus;

/// The creation janitor runs on a fixed cadence independent of the feed
/// check interval.
const CLEAN_FEED_CREATION_SECONDS: u64 = 600;

/// Start the periodic jobs: the outdated-feed sweep and the feed-creation
/// janitor.
pub async fn start_scheduler(
    pool: SqlitePool,
    bus: Bus,
    config: &Config,
) -> Result<JobScheduler, Box<dyn std::error::Error>> {
    let scheduler = JobScheduler::new().await?;
    let check_feed_seconds = config.check_feed_minutes * 60;

    {
        let pool = pool.clone();
        let bus = bus.clone();
        scheduler
            .add(Job::new_repeated_async(
                Duration::from_secs(check_feed_seconds),
                move |_uuid, _lock| {
                    let pool = pool.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        if let Err(err) = state::check_feed(&pool, &bus, check_feed_seconds).await
                        {
                            tracing::error!("feed check sweep failed: {}", err);
                        }
                    })
                },
            )?)
            .await?;
    }

    {
        let pool = pool.clone();
        let bus = bus.clone();
        scheduler
            .add(Job::new_repeated_async(
                Duration::from_secs(CLEAN_FEED_CREATION_SECONDS),
                move |_uuid, _lock| {
                    let pool = pool.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        if let Err(err) = state::clean_feed_creation(&pool, &bus).await {
                            tracing::error!("feed creation cleanup failed: {}", err);
                        }
                    })
                },
            )?)
            .await?;
    }

    scheduler.start().await?;
    tracing::info!(
        "scheduler started (check feeds every {}s, clean creations every {}s)",
        check_feed_seconds,
        CLEAN_FEED_CREATION_SECONDS
    );

    Ok(scheduler)
}
