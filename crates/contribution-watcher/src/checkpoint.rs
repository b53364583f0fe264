//! Redis height checkpoint
//!
//! Keeps a single integer: the last block height the scanner finished.
//! Bootstrap falls back to `checkpoint + 1` when the backend names no
//! transaction to resume from.

use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::info;

pub const LAST_PROCESSED_HEIGHT_KEY: &str = "watcher:last_processed_height";

#[derive(Clone)]
pub struct Checkpoint {
    conn: ConnectionManager,
}

impl Checkpoint {
    pub async fn new(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis for height checkpoint");

        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Successfully connected to Redis");

        Ok(Self { conn })
    }

    pub async fn last_processed_height(&self) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let height: Option<u64> = conn
            .get(LAST_PROCESSED_HEIGHT_KEY)
            .await
            .context("Failed to read height checkpoint")?;
        Ok(height)
    }

    pub async fn record_height(&self, height: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(LAST_PROCESSED_HEIGHT_KEY, height)
            .await
            .with_context(|| format!("Failed to checkpoint height {}", height))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;
        Ok(())
    }
}
