use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::{error::AppError, persistence::Persistence};

/// Namespace for every key this service writes
const KEY_PREFIX: &str = "relayrank:";

/// Redis-backed persistence for registry checkpoints and job timestamps
pub struct RedisStore {
    client: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            AppError::PersistenceError(format!("Failed to create Redis client: {}", e))
        })?;

        // Connection manager reconnects automatically
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!("Connected to Redis");

        Ok(Self {
            client: conn_manager,
        })
    }

    fn key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl Persistence for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.client.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(Self::key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to get {} from Redis: {}", key, e)))?;
        Ok(value)
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.client.clone();
        redis::cmd("SET")
            .arg(Self::key(key))
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to store {} in Redis: {}", key, e)))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.client.clone();
        redis::cmd("DEL")
            .arg(Self::key(key))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| {
                AppError::PersistenceError(format!("Failed to delete {} from Redis: {}", key, e))
            })?;
        Ok(())
    }
}
