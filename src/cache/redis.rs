//! Redis cache backend.
//!
//! Every process instance pointed at the same Redis shares quota state.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{CacheClient, CacheError, CacheResult};

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            CacheError::Timeout(Duration::ZERO)
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            CacheError::Connection(err.to_string())
        } else {
            CacheError::Backend(err.to_string())
        }
    }
}

/// Cache client over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> CacheResult<Self> {
        info!(url = %sanitize_url(url), "Connecting to Redis");
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Redis connection established");
        Ok(Self { conn })
    }

    /// Round-trip a PING to verify the connection.
    pub async fn health_check(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Redis health check passed");
        Ok(())
    }
}

/// Hide any password embedded in a connection URL.
fn sanitize_url(url: &str) -> String {
    match url.split_once('@') {
        Some((credentials, host)) => match credentials.rsplit_once(':') {
            Some((scheme_user, _password)) if scheme_user.contains("://") => {
                format!("{}:***@{}", scheme_user, host)
            }
            _ => format!("***@{}", host),
        },
        None => url.to_string(),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: bool = conn.pexpire(key, ttl_millis(ttl) as i64).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }
}
