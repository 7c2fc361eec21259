//! Local storage provider (C3).
//!
//! One directory per space, holding a single embedded key/value database
//! (`store.db`, a p2panda [`SqliteStore`]) plus that space's persisted key
//! bundle (`keys.json`, see [`crate::space_keys`]). Concurrent readers are
//! fine; writes are serialized per tree via the tree's own lock (C7), not by
//! this provider.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use p2panda_store::sqlite::store::{connection_pool, create_database, run_pending_migrations, SqliteStore};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::error::CoreError;
use crate::space_keys::{SpaceKeySet, SpaceKeysError};

pub type SpaceStore = SqliteStore<String, ()>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("space storage already exists: {0}")]
    AlreadyExists(String),
    #[error("space storage not found: {0}")]
    Missing(String),
    #[error("db init error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("space key error: {0}")]
    Keys(#[from] SpaceKeysError),
}

impl From<StorageError> for CoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::AlreadyExists(_) => CoreError::conflict(e.to_string()),
            StorageError::Missing(_) => CoreError::not_found(e.to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

/// A newly created or reopened space's storage handle.
pub struct SpaceStorage {
    pub space_id: String,
    pub dir: PathBuf,
    pub store: Arc<Mutex<SpaceStore>>,
    pub keys: SpaceKeySet,
    tree_index: RwLock<Vec<String>>,
}

impl SpaceStorage {
    fn db_path(dir: &Path) -> PathBuf {
        dir.join("store.db")
    }

    fn keys_path(dir: &Path) -> PathBuf {
        dir.join("keys.json")
    }

    fn tree_index_path(dir: &Path) -> PathBuf {
        dir.join("tree_index.json")
    }

    /// Record a newly created tree id (spec §4.3: storage is "indexed by
    /// tree-id"). Idempotent; used by the UTM's `build_space_index` to find
    /// every tree without scanning the op store directly.
    pub async fn register_tree_id(&self, tree_id: &str) -> Result<(), StorageError> {
        let mut index = self.tree_index.write().await;
        if index.iter().any(|id| id == tree_id) {
            return Ok(());
        }
        index.push(tree_id.to_string());
        let json = serde_json::to_vec_pretty(&*index).map_err(|e| StorageError::Db(e.to_string()))?;
        std::fs::write(Self::tree_index_path(&self.dir), json)?;
        Ok(())
    }

    pub async fn stored_tree_ids(&self) -> Vec<String> {
        self.tree_index.read().await.clone()
    }

    fn load_tree_index(dir: &Path) -> Vec<String> {
        std::fs::read(Self::tree_index_path(dir))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }
}

/// Payload for creating a new space's storage (spec §4.3 / §4.2).
pub struct CreateSpacePayload {
    pub space_id: String,
    pub signing_key: p2panda_core::PrivateKey,
}

/// Holds every space's [`SpaceStorage`] this peer has opened, keyed by
/// space id. Distinct from the UTM's in-memory tree maps (C9) — this tracks
/// *storage handles*, UTM tracks *built trees*.
#[derive(Default)]
pub struct StorageProvider {
    base_dir: PathBuf,
    open: RwLock<HashMap<String, Arc<SpaceStorage>>>,
}

impl StorageProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        StorageProvider {
            base_dir: base_dir.into(),
            open: RwLock::new(HashMap::new()),
        }
    }

    fn space_dir(&self, space_id: &str) -> PathBuf {
        self.base_dir.join("spaces").join(space_id)
    }

    /// `create_space_storage(payload) → storage | already_exists`.
    pub async fn create_space_storage(
        &self,
        payload: CreateSpacePayload,
    ) -> Result<Arc<SpaceStorage>, StorageError> {
        let dir = self.space_dir(&payload.space_id);
        if dir.exists() {
            return Err(StorageError::AlreadyExists(payload.space_id));
        }
        std::fs::create_dir_all(&dir)?;

        let keys = SpaceKeySet::generate(payload.signing_key);
        keys.persist(SpaceStorage::keys_path(&dir))?;

        let store = open_store(&SpaceStorage::db_path(&dir)).await?;
        let storage = Arc::new(SpaceStorage {
            space_id: payload.space_id.clone(),
            dir,
            store: Arc::new(Mutex::new(store)),
            keys,
            tree_index: RwLock::new(Vec::new()),
        });

        self.open.write().await.insert(payload.space_id, storage.clone());
        Ok(storage)
    }

    /// `wait_space_storage(id) → storage | missing`. Returns the in-memory
    /// handle if already open, otherwise reopens from disk if the directory
    /// exists, otherwise `Missing`.
    pub async fn wait_space_storage(&self, space_id: &str) -> Result<Arc<SpaceStorage>, StorageError> {
        if let Some(existing) = self.open.read().await.get(space_id) {
            return Ok(existing.clone());
        }
        self.reopen_existing(space_id).await
    }

    /// `reopen_existing(id)` — used on process restart, when only the DB
    /// file is present on disk and no in-memory handle exists yet.
    pub async fn reopen_existing(&self, space_id: &str) -> Result<Arc<SpaceStorage>, StorageError> {
        let dir = self.space_dir(space_id);
        if !dir.exists() {
            return Err(StorageError::Missing(space_id.to_string()));
        }

        let keys = match SpaceKeySet::load(SpaceStorage::keys_path(&dir)) {
            Ok(keys) => keys,
            Err(SpaceKeysError::NoLocalKeys) => {
                // Remotely-joined space: storage exists but the read key
                // must be recovered from ACL state by the caller later.
                // We still need *a* signing key placeholder to satisfy the
                // struct; callers that hit this path replace it once the
                // ACL join flow recovers the real key material.
                return Err(StorageError::Keys(SpaceKeysError::NoLocalKeys));
            }
            Err(e) => return Err(e.into()),
        };

        let store = open_store(&SpaceStorage::db_path(&dir)).await?;
        let tree_index = SpaceStorage::load_tree_index(&dir);
        let storage = Arc::new(SpaceStorage {
            space_id: space_id.to_string(),
            dir,
            store: Arc::new(Mutex::new(store)),
            keys,
            tree_index: RwLock::new(tree_index),
        });

        self.open.write().await.insert(space_id.to_string(), storage.clone());
        Ok(storage)
    }

    pub async fn list_space_ids(&self) -> Vec<String> {
        let spaces_dir = self.base_dir.join("spaces");
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&spaces_dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        out.push(name.to_string());
                    }
                }
            }
        }
        out
    }
}

async fn open_store(db_path: &Path) -> Result<SpaceStore, StorageError> {
    let url = format!("sqlite://{}", db_path.display());
    create_database(&url)
        .await
        .map_err(|e| StorageError::Db(e.to_string()))?;
    let pool = connection_pool(&url, 5)
        .await
        .map_err(|e| StorageError::Db(e.to_string()))?;
    run_pending_migrations(&pool)
        .await
        .map_err(|e| StorageError::Db(e.to_string()))?;
    Ok(SqliteStore::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2panda_core::PrivateKey;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("matou-storage-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn create_then_reopen_roundtrips() {
        let base = scratch_dir();
        let provider = StorageProvider::new(&base);

        let storage = provider
            .create_space_storage(CreateSpacePayload {
                space_id: "space1".to_string(),
                signing_key: PrivateKey::new(),
            })
            .await
            .unwrap();
        let read_key = storage.keys.read_key;

        let provider2 = StorageProvider::new(&base);
        let reopened = provider2.reopen_existing("space1").await.unwrap();
        assert_eq!(reopened.keys.read_key, read_key);

        std::fs::remove_dir_all(&base).ok();
    }

    #[tokio::test]
    async fn create_twice_fails_already_exists() {
        let base = scratch_dir();
        let provider = StorageProvider::new(&base);
        provider
            .create_space_storage(CreateSpacePayload {
                space_id: "space1".to_string(),
                signing_key: PrivateKey::new(),
            })
            .await
            .unwrap();

        let err = provider
            .create_space_storage(CreateSpacePayload {
                space_id: "space1".to_string(),
                signing_key: PrivateKey::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        std::fs::remove_dir_all(&base).ok();
    }

    #[tokio::test]
    async fn wait_for_missing_space_fails() {
        let base = scratch_dir();
        let provider = StorageProvider::new(&base);
        let err = provider.wait_space_storage("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::Missing(_)));
    }
}
