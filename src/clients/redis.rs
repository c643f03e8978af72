use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

use crate::{clients::Cache, config::Config};

#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|_| anyhow!("Failed to create redis client"))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| anyhow!("Failed to connect to redis client"))?;

        info!("Redis connection established");

        Ok(Self { connection })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        // SET EX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);

        connection
            .set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(|e| anyhow!("Failed to set key: {}", e))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut connection = self.connection.clone();

        let value: Option<String> = connection
            .get(key)
            .await
            .map_err(|e| anyhow!("Failed to get cached value: {}", e))?;

        Ok(value)
    }

    async fn health_check(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        connection
            .ping::<String>()
            .await
            .map_err(|e| anyhow!("Redis ping failed: {}", e))?;

        Ok(())
    }
}
