use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
    Error as SqlxError,
};
use std::str::FromStr;
use std::time::Duration;

/// State handlers write serially on one connection at a time; the rest of
/// the pool serves the scheduler sweeps and read-mostly work.
const MAX_CONNECTIONS: u32 = 5;

/// Write transactions from merges and bulk story saves are short; waiting
/// beats failing the message and relying on redelivery.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn setup_database(url: &str) -> Result<SqlitePool, SqlxError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        // WAL lets the outdated-feed sweep read while a handler
        // transaction is mid-write
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        // Deleting or merging a feed must cascade its storys and user feeds
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
}
