//! Redis cache module
//!
//! This module provides the shared Redis connection used for counters that
//! must be updated atomically across service instances. Multi-key updates
//! go through server-side Lua scripts so that check-and-increment is a
//! single round trip that no other client can interleave with.

use crate::error::{CacheError, CacheResult};
use redis::{Client, FromRedisValue, Script, ToRedisArgs, aio::MultiplexedConnection};
use tracing::info;

/// Configuration for Redis connection
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
}

impl RedisConfig {
    /// Create a new RedisConfig from environment variables
    ///
    /// # Environment Variables
    /// - `REDIS_URL`: Redis connection URL (default: "redis://localhost:6379")
    pub fn from_env() -> Self {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        RedisConfig { url }
    }
}

/// Shared Redis connection
///
/// Wraps a multiplexed connection; clones share the same underlying socket.
#[derive(Clone)]
pub struct RedisPool {
    connection: MultiplexedConnection,
}

impl RedisPool {
    /// Open a client and establish the multiplexed connection
    pub async fn new(config: &RedisConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.clone()).map_err(CacheError::Connection)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(CacheError::Connection)?;
        info!("Redis client initialized with URL: {}", config.url);
        Ok(RedisPool { connection })
    }

    /// Get a handle on the shared connection
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Run a Lua script atomically with the given keys and arguments
    pub async fn run_script<K, A, T>(&self, script: &Script, keys: &[K], args: &[A]) -> CacheResult<T>
    where
        K: ToRedisArgs,
        A: ToRedisArgs,
        T: FromRedisValue,
    {
        let mut conn = self.connection();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(CacheError::Command)
    }

    /// Check if Redis is reachable
    pub async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.connection();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Command)?;
        Ok(pong == "PONG")
    }
}
