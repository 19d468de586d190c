use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::StorageSettings, error::AppError, models::Registry, redis_cache::RedisStore,
    registry::RegistryStore,
};

/// Key under which the registry checkpoint is stored
pub const REGISTRY_KEY: &str = "relay_registry";

/// Last-run timestamps of the periodic jobs
pub const LAST_FETCH_KEY: &str = "last_fetch";
pub const LAST_RESET_KEY: &str = "last_reset";
pub const LAST_PUSH_KEY: &str = "last_push";

/// Durable key-value store holding opaque serialized values
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn save(&self, key: &str, value: &str) -> Result<(), AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
}

/// Open the store selected by the startup configuration
pub async fn open_store(settings: &StorageSettings) -> Result<Arc<dyn Persistence>, AppError> {
    match settings {
        StorageSettings::Redis(url) => {
            let store = RedisStore::new(url).await?;
            tracing::info!("Persisting registry to Redis");
            Ok(Arc::new(store))
        }
        StorageSettings::File(path) => {
            let store = FileStore::open(path).await?;
            tracing::info!("Persisting registry under {}", path);
            Ok(Arc::new(store))
        }
        StorageSettings::Memory => {
            tracing::info!("No DATA_PATH or REDIS_URL provided, running in memory-only mode");
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}

/// One JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, AppError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            AppError::PersistenceError(format!("Failed to create {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AppError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(AppError::PersistenceError(format!(
                "invalid persistence key {:?}",
                key
            )));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl Persistence for FileStore {
    async fn load(&self, key: &str) -> Result<Option<String>, AppError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        // Write then rename so a crash never leaves a torn file behind
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store for memory-only mode
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Load and decode a value; any failure is logged and reads as absent
pub async fn load_json<T: DeserializeOwned>(store: &dyn Persistence, key: &str) -> Option<T> {
    match store.load(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Failed to decode {}: {}", key, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::error!("Failed to load {}: {}", key, e);
            None
        }
    }
}

pub async fn save_json<T: Serialize>(
    store: &dyn Persistence,
    key: &str,
    value: &T,
) -> Result<(), AppError> {
    let raw = serde_json::to_string(value)?;
    store.save(key, &raw).await
}

/// Last-run timestamp of a periodic job
pub async fn load_timestamp(store: &dyn Persistence, key: &str) -> Option<DateTime<Utc>> {
    load_json(store, key).await
}

/// Restore the registry checkpoint, starting empty on any failure
pub async fn restore_registry(store: &dyn Persistence) -> RegistryStore {
    match load_json::<Registry>(store, REGISTRY_KEY).await {
        Some(registry) => {
            let restored = RegistryStore::from_registry(registry);
            let snapshot = restored.snapshot();
            tracing::info!(
                "Restored registry with {} regions and {} nodes",
                snapshot.region_count(),
                snapshot.node_count()
            );
            restored
        }
        None => {
            tracing::info!("No registry checkpoint found, starting empty");
            RegistryStore::new()
        }
    }
}

/// Saves the registry whenever it changed since the last successful save.
///
/// A failed save is not retried on the spot; the unsaved generation makes the
/// next checkpoint call try again.
pub struct Checkpointer {
    store: Arc<dyn Persistence>,
    registry: Arc<RegistryStore>,
    saved_generation: tokio::sync::Mutex<Option<u64>>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn Persistence>, registry: Arc<RegistryStore>) -> Self {
        Self {
            store,
            registry,
            saved_generation: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns true when the persisted checkpoint is current
    pub async fn checkpoint(&self) -> bool {
        let mut saved = self.saved_generation.lock().await;
        let (generation, snapshot) = self.registry.snapshot_with_generation();
        if *saved == Some(generation) {
            return true;
        }

        match save_json(self.store.as_ref(), REGISTRY_KEY, &snapshot).await {
            Ok(()) => {
                tracing::debug!(
                    "Checkpointed registry generation {} ({} nodes)",
                    generation,
                    snapshot.node_count()
                );
                *saved = Some(generation);
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to save registry checkpoint, will retry at the next checkpoint: {}",
                    e
                );
                false
            }
        }
    }

    /// Drop the persisted checkpoint, used by the wipe-and-rediscover job
    pub async fn discard(&self) {
        let mut saved = self.saved_generation.lock().await;
        if let Err(e) = self.store.delete(REGISTRY_KEY).await {
            tracing::error!("Failed to delete {}: {}", REGISTRY_KEY, e);
        }
        *saved = None;
    }
}
