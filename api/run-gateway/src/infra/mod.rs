use crate::config::db::RedisConfig;
use redis::Client as RedisClient;
use redis::aio::MultiplexedConnection;
use redis::cmd;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct InfraClients {
    pub redis: RedisClient,
    pub timeout: Duration,
}

pub const IDEMPOTENCY_PREFIX: &str = "idem:";
pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";
pub const RUNS_PREFIX: &str = "runs:";

pub async fn init_infra(redis: Option<RedisConfig>) -> Result<Option<InfraClients>, String> {
    let Some(redis) = redis else {
        return Ok(None);
    };

    let client =
        RedisClient::open(redis.url.clone()).map_err(|e| format!("redis init failed: {e}"))?;
    let infra = InfraClients {
        redis: client,
        timeout: Duration::from_millis(redis.timeout_ms),
    };
    let mut conn = infra.connection().await?;
    let pong: String = infra
        .bounded(cmd("PING").query_async(&mut conn))
        .await?
        .map_err(|e| format!("redis ping failed: {e}"))?;
    if pong != "PONG" {
        return Err("redis ping returned unexpected response".to_string());
    }
    Ok(Some(infra))
}

impl InfraClients {
    pub async fn connection(&self) -> Result<MultiplexedConnection, String> {
        self.bounded(self.redis.get_multiplexed_async_connection())
            .await?
            .map_err(|e| format!("redis connect failed: {e}"))
    }

    /// Runs a backend call under the configured timeout.
    pub async fn bounded<F, T>(&self, fut: F) -> Result<T, String>
    where
        F: Future<Output = T>,
    {
        timeout(self.timeout, fut)
            .await
            .map_err(|_| format!("redis call exceeded {}ms", self.timeout.as_millis()))
    }
}
