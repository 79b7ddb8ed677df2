use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, warn};

use cavisense_core::metrics::LINK_ERRORS;
use cavisense_core::SensorPayload;

use crate::error::{Error, Result};

/// Last-value cache holding one payload per key.
///
/// Writes fail loudly with `StoreUnavailable`. Reads never fail: a missing
/// or unreadable entry is `None`, since a missing catch-up snapshot only
/// degrades the viewer experience.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Overwrite the slot at `key`
    async fn set(&self, key: &str, payload: &SensorPayload) -> Result<()>;

    /// Last persisted payload at `key`, or `None` when absent or unreadable
    async fn get(&self, key: &str) -> Option<SensorPayload>;

    /// Release the backing connection
    async fn close(&self) {}
}

/// In-process store for single-node mode and tests
///
/// Values are kept in their serialized form, like they would be in Redis.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    slots: DashMap<String, String>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn set(&self, key: &str, payload: &SensorPayload) -> Result<()> {
        let raw = payload.to_json()?;
        self.slots.insert(key.to_string(), raw);
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<SensorPayload> {
        let raw = self.slots.get(key)?.value().clone();
        match SensorPayload::from_json(&raw) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable snapshot");
                None
            }
        }
    }
}

/// Redis-backed store (`SET` / `GET` of the payload JSON)
///
/// Connects lazily so a Redis outage at boot does not keep the process from
/// starting; the underlying `ConnectionManager` reconnects on its own once
/// established.
pub struct RedisSnapshotStore {
    client: RedisClient,
    connection: Mutex<Option<ConnectionManager>>,
    op_timeout: Duration,
}

impl RedisSnapshotStore {
    pub fn new(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            op_timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = timeout(self.op_timeout, self.client.get_connection_manager())
            .await
            .map_err(|_| Error::StoreUnavailable("Timed out connecting to Redis".to_string()))?
            .map_err(|e| Error::StoreUnavailable(format!("Failed to connect to Redis: {e}")))?;

        debug!("Snapshot store connected to Redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        timeout(self.op_timeout, conn.get::<_, Option<String>>(key))
            .await
            .map_err(|_| Error::StoreUnavailable("Timed out reading snapshot".to_string()))?
            .map_err(|e| Error::StoreUnavailable(format!("Failed to read snapshot: {e}")))
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn set(&self, key: &str, payload: &SensorPayload) -> Result<()> {
        let raw = payload.to_json()?;
        let mut conn = self.connection().await.inspect_err(|_| {
            LINK_ERRORS.with_label_values(&["store"]).inc();
        })?;

        let outcome = timeout(self.op_timeout, conn.set::<_, _, ()>(key, raw)).await;
        match outcome {
            Ok(Ok(())) => {
                debug!(key = %key, "Snapshot persisted");
                Ok(())
            }
            Ok(Err(e)) => {
                LINK_ERRORS.with_label_values(&["store"]).inc();
                Err(Error::StoreUnavailable(format!("Failed to persist snapshot: {e}")))
            }
            Err(_) => {
                LINK_ERRORS.with_label_values(&["store"]).inc();
                Err(Error::StoreUnavailable("Timed out persisting snapshot".to_string()))
            }
        }
    }

    async fn get(&self, key: &str) -> Option<SensorPayload> {
        let raw = match self.read(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                LINK_ERRORS.with_label_values(&["store"]).inc();
                error!(key = %key, error = %e, "Failed to read snapshot, treating as absent");
                return None;
            }
        };

        match SensorPayload::from_json(&raw) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable snapshot");
                None
            }
        }
    }

    async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            debug!("Snapshot store connection released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn payload(value: Value) -> SensorPayload {
        let Value::Object(fields) = value else { panic!("expected object") };
        SensorPayload::stamp(fields)
    }

    #[tokio::test]
    async fn test_memory_store_absent_until_set() {
        let store = MemorySnapshotStore::new();
        assert!(store.get("sensor:latest").await.is_none());

        let p = payload(json!({"temp": 90}));
        store.set("sensor:latest", &p).await.unwrap();

        assert_eq!(store.get("sensor:latest").await, Some(p));
        assert!(store.get("other").await.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_last_write_wins() {
        let store = MemorySnapshotStore::new();
        let first = payload(json!({"temp": 90}));
        let second = payload(json!({"temp": 91, "rpm": 1400}));

        store.set("sensor:latest", &first).await.unwrap();
        store.set("sensor:latest", &second).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("sensor:latest").await, Some(second));
    }

    #[tokio::test]
    async fn test_memory_store_corrupt_entry_reads_as_absent() {
        let store = MemorySnapshotStore::new();
        store.slots.insert("sensor:latest".to_string(), "{not json".to_string());
        assert!(store.get("sensor:latest").await.is_none());
    }

    #[test]
    fn test_redis_store_rejects_invalid_url() {
        assert!(matches!(
            RedisSnapshotStore::new("not a url", Duration::from_secs(1)),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_redis_store_unreachable() {
        // Nothing listens on port 1
        let store = RedisSnapshotStore::new("redis://127.0.0.1:1/", Duration::from_millis(500)).unwrap();
        let p = payload(json!({"temp": 90}));

        assert!(matches!(
            store.set("sensor:latest", &p).await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(store.get("sensor:latest").await.is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_redis_store_integration() {
        let store = RedisSnapshotStore::new("redis://127.0.0.1:6379", Duration::from_secs(5)).unwrap();
        let key = format!("cavisense:test:{}", nanoid::nanoid!(8));
        let p = payload(json!({"temp": 90}));

        store.set(&key, &p).await.unwrap();
        assert_eq!(store.get(&key).await, Some(p));
        store.close().await;
    }
}
