//! Redis-backed [`RemoteStore`].
//!
//! Records are plain keys written with `PSETEX`-style millisecond TTLs;
//! completion channels are Redis pub/sub. Each subscription holds its own
//! pub/sub connection, so dropping the handle is the unsubscribe.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::warn;

use tether_types::TaskError;

use crate::store::{RemoteStore, StoreError, Subscription};

pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to the store at `endpoint` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(endpoint: &str) -> Result<Self, TaskError> {
        let client = redis::Client::open(endpoint).map_err(|err| {
            TaskError::invalid_argument(format!("remote_store_endpoint: {err}"))
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| TaskError::internal(format!("connect to remote store: {err}")))?;
        Ok(Self { client, conn })
    }
}

fn store_err(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        conn.pset_ex::<_, _, ()>(key, value, ttl_ms)
            .await
            .map_err(store_err)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(store_err)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, i64>(key).await.map(|_| ()).map_err(store_err)
    }

    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, i64>(channel, message)
            .await
            .map(|_| ())
            .map_err(store_err)
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_err)?;
        pubsub.subscribe(channel).await.map_err(store_err)?;
        Ok(Box::new(RedisSubscription { pubsub }))
    }
}

struct RedisSubscription {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            let message = self.pubsub.on_message().next().await?;
            match message.get_payload::<Vec<u8>>() {
                Ok(payload) => return Some(payload),
                Err(err) => {
                    warn!(error = %err, "dropping undecodable message on completion channel");
                }
            }
        }
    }
}
