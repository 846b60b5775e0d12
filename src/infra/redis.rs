//! Redis-backed response store.
//!
//! The connection is established lazily on first use and re-attempted on
//! later calls while Redis stays unreachable, so the proxy can start and serve
//! (uncached) before the store is up.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::info;

use crate::cache::{ResponseStore, StoreError};

use super::error::InfraError;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RedisStore {
    client: Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Validate `url` and prepare a client. No connection is opened here.
    pub fn new(url: &str) -> Result<Self, InfraError> {
        let client = Client::open(url)
            .map_err(|err| InfraError::configuration(format!("invalid redis url: {err}")))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let manager = timeout(OPERATION_TIMEOUT, ConnectionManager::new(self.client.clone()))
                    .await
                    .map_err(|_| StoreError::unavailable("timed out connecting to redis"))?
                    .map_err(|err| StoreError::unavailable(err.to_string()))?;
                info!(
                    target = "infra::redis",
                    "connected to redis"
                );
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl ResponseStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        timeout(OPERATION_TIMEOUT, conn.get::<_, Option<String>>(key))
            .await
            .map_err(|_| StoreError::unavailable("redis GET timed out"))?
            .map_err(|err| StoreError::unavailable(err.to_string()))
    }

    async fn set(&self, key: &str, payload: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        timeout(OPERATION_TIMEOUT, conn.set_ex::<_, _, ()>(key, payload, seconds))
            .await
            .map_err(|_| StoreError::unavailable("redis SET timed out"))?
            .map_err(|err| StoreError::unavailable(err.to_string()))
    }
}
