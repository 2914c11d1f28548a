//! Remote store contract for the distributed coordinator, plus the
//! in-process implementation used by tests and single-host embeds.
//!
//! The coordinator needs exactly this much from a store: per-key TTL with
//! atomic set, and a publish/subscribe channel facility. No multi-key
//! transactions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Failure talking to the store. All variants are treated as transient by
/// the coordinator's bounded internal retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// Live channel subscription. Dropping the handle unsubscribes.
#[async_trait]
pub trait Subscription: Send {
    /// Next message on the channel, or `None` once the channel is gone.
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// Key/value store with per-key TTL plus a publish/subscribe facility.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Atomically set `key` to `value` with the given time-to-live.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Deliver `message` to current subscribers of `channel`. A publish with
    /// no subscriber is not an error.
    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError>;
}

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryStoreInner {
    keys: Mutex<HashMap<String, StoredValue>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

/// In-process [`RemoteStore`] with lazily enforced TTLs.
///
/// Expiry is checked on read, so a key past its deadline is indistinguishable
/// from an absent one, which is all the coordinator relies on.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, StoredValue>> {
        self.inner.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Vec<u8>>>> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.keys().insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut keys = self.keys();
        match keys.get(key) {
            Some(value) if value.expires_at > Instant::now() => Ok(Some(value.bytes.clone())),
            Some(_) => {
                keys.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.keys().remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<(), StoreError> {
        if let Some(sender) = self.channels().get(channel) {
            // No receivers is fine; the stored record covers late readers.
            let _ = sender.send(message);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        let rx = self
            .channels()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe();
        Ok(Box::new(MemorySubscription { rx }))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscription lagged; continuing");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test(start_paused = true))]
    async fn set_get_delete_round_trip() {
        let store = MemoryStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        // Deleting a missing key stays quiet.
        store.delete("k").await.unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn ttl_expires_keys() {
        let store = MemoryStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn overwrite_refreshes_the_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", b"a".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .set("k", b"b".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn subscribers_receive_published_messages() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("ch").await.unwrap();
        store.publish("ch", b"hello".to_vec()).await.unwrap();
        assert_eq!(sub.recv().await, Some(b"hello".to_vec()));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn publish_without_subscribers_is_not_an_error() {
        let store = MemoryStore::new();
        store.publish("empty", b"dropped".to_vec()).await.unwrap();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn messages_published_before_subscribe_are_not_replayed() {
        let store = MemoryStore::new();
        store.publish("ch", b"early".to_vec()).await.unwrap();

        let mut sub = store.subscribe("ch").await.unwrap();
        store.publish("ch", b"late".to_vec()).await.unwrap();
        assert_eq!(sub.recv().await, Some(b"late".to_vec()));
    }
}
