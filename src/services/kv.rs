//! Durable key-value persistence for queue snapshots and small cached projections.
//!
//! Every value is one JSON document stored under a fixed key and always replaced
//! as a whole.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Upper bound for a single persisted document.
pub const MAX_DOCUMENT_BYTES: usize = 2 * 1024 * 1024;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Replace the document under `key` in a single write.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn remove(&self, key: &str) -> Result<(), KvError>;

    /// Connectivity check for health reporting.
    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

fn check_size(key: &str, value: &str) -> Result<(), KvError> {
    if value.len() > MAX_DOCUMENT_BYTES {
        return Err(KvError::TooLarge {
            key: key.to_string(),
            size: value.len(),
        });
    }
    Ok(())
}

/// One file per key under a directory. Writes go to a temp file in the same
/// directory and are renamed over the target, so readers never see a torn document.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, KvError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
            || key.starts_with('.')
        {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key.replace(':', "_"))))
    }

    fn write_atomic(dir: &Path, target: &Path, value: &str) -> Result<(), KvError> {
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(value.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(target).map_err(|e| KvError::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        check_size(key, value)?;
        let path = self.path_for(key)?;
        let dir = self.dir.clone();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || Self::write_atomic(&dir, &path, &value))
            .await
            .map_err(|e| KvError::Io(std::io::Error::other(e)))?
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self) -> Result<(), KvError> {
        tokio::fs::metadata(&self.dir).await?;
        Ok(())
    }
}

/// Redis-backed store for deployments that already run a Redis instance.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: "fieldsync:".to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(self.full_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        check_size(key, value)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(self.full_key(key), value).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(self.full_key(key)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Process-local store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        check_size(key, value)?;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Document for {key} is {size} bytes, over the 2 MiB limit")]
    TooLarge { key: String, size: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        assert_eq!(store.get("offline_queue").await.unwrap(), None);
        store.set("offline_queue", "[1,2]").await.unwrap();
        store.set("offline_queue", "[3]").await.unwrap();
        assert_eq!(store.get("offline_queue").await.unwrap().as_deref(), Some("[3]"));

        store.remove("offline_queue").await.unwrap();
        store.remove("offline_queue").await.unwrap();
        assert_eq!(store.get("offline_queue").await.unwrap(), None);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        for key in ["../escape", "a/b", "", ".hidden"] {
            let err = store.set(key, "{}").await.unwrap_err();
            assert!(matches!(err, KvError::InvalidKey(_)), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn oversized_documents_are_refused() {
        let store = MemoryStore::new();
        let big = "x".repeat(MAX_DOCUMENT_BYTES + 1);
        let err = store.set("big", &big).await.unwrap_err();
        assert!(matches!(err, KvError::TooLarge { .. }));
        assert_eq!(store.get("big").await.unwrap(), None);
    }
}
