use std::env;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    /// Minutes between outdated-feed sweeps; also sets the jitter window
    /// and the expiry of the sync messages each sweep emits.
    pub check_feed_minutes: u64,
    pub bus_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://feedmill.db".to_string());

        let check_feed_minutes = env::var("CHECK_FEED_MINUTES")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()?;

        let bus_capacity = env::var("BUS_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse::<usize>()?;

        Ok(Config {
            database_url,
            check_feed_minutes,
            bus_capacity,
        })
    }
}
