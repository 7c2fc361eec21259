//! Unified tree manager (C9) and the shared space resolver that breaks the
//! cyclic construction dependency between the sync protocol glue and the
//! tree manager (spec §9, "Cyclic references").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use p2panda_core::PrivateKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::storage::{CreateSpacePayload, SpaceStorage, StorageError, StorageProvider};
use crate::tree::{change_types, ChangePayloadMeta, ObjectTree, TreeError};

#[derive(Debug, Error)]
pub enum UtmError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("tree not found: {0}")]
    TreeNotFound(String),
    #[error("timed out waiting for sync")]
    SyncTimeout,
}

impl From<UtmError> for CoreError {
    fn from(e: UtmError) -> Self {
        match e {
            UtmError::ObjectNotFound(_) | UtmError::TreeNotFound(_) => CoreError::not_found(e.to_string()),
            UtmError::SyncTimeout => CoreError::NetworkUnavailable(e.to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

// ─── Shared space resolver (spec §9) ─────────────────────────────────────────

/// Consulted by both the UTM and the sync protocol glue (C12) instead of
/// either constructing the other. Populated lazily on first use rather than
/// at construction time, so `Utm::new` and `SyncEngine::new` can be built
/// independently and wired together afterward.
pub struct SpaceResolver {
    storage: Arc<StorageProvider>,
}

impl SpaceResolver {
    pub fn new(storage: Arc<StorageProvider>) -> Self {
        SpaceResolver { storage }
    }

    /// Returns the open storage handle for `space_id`, opening it from disk
    /// on first use if necessary.
    pub async fn get_or_open(&self, space_id: &str) -> Result<Arc<SpaceStorage>, UtmError> {
        match self.storage.wait_space_storage(space_id).await {
            Ok(storage) => Ok(storage),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_space(&self, payload: CreateSpacePayload) -> Result<Arc<SpaceStorage>, UtmError> {
        Ok(self.storage.create_space_storage(payload).await?)
    }
}

// ─── Index entries ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedTree {
    pub change_type: String,
    pub object_id: String,
    pub object_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub trees_changed_locally: u64,
    pub heads_received: u64,
    pub heads_applied: u64,
}

// ─── Unified tree manager ────────────────────────────────────────────────────

pub struct Utm {
    resolver: Arc<SpaceResolver>,
    /// tree-id → built tree. A soft cache: every `get_tree` call rebuilds
    /// from storage and overwrites the entry, so a tree whose read key was
    /// populated from stale ACL state is never served twice (spec §4.4).
    trees: RwLock<HashMap<String, Arc<ObjectTree>>>,
    /// space-id → (tree-id → classification).
    space_index: RwLock<HashMap<String, HashMap<String, IndexedTree>>>,
    /// object-id → tree-id.
    object_map: RwLock<HashMap<String, String>>,
    sync_status: RwLock<HashMap<String, SyncStatus>>,
}

impl Utm {
    pub fn new(resolver: Arc<SpaceResolver>) -> Self {
        Utm {
            resolver,
            trees: RwLock::new(HashMap::new()),
            space_index: RwLock::new(HashMap::new()),
            object_map: RwLock::new(HashMap::new()),
            sync_status: RwLock::new(HashMap::new()),
        }
    }

    /// Builds a root with `change_payload = {object_id, object_type}`, a
    /// random 32-byte seed as content, encrypted, timestamped. Registers the
    /// tree in all three in-memory indexes plus the space's on-disk tree
    /// index.
    pub async fn create_object_tree(
        &self,
        space_id: &str,
        object_id: &str,
        object_type: &str,
        change_type: &str,
        signing_key: &PrivateKey,
    ) -> Result<Arc<ObjectTree>, UtmError> {
        let storage = self.resolver.get_or_open(space_id).await?;
        let seed = crate::crypto::random_key_256().to_vec();

        let (tree, _hash) = ObjectTree::create_root(
            storage.store.clone(),
            signing_key,
            change_type,
            ChangePayloadMeta { object_id: object_id.to_string(), object_type: object_type.to_string() },
            storage.keys.read_key,
            seed,
            true,
            change_type.to_string(),
        )
        .await?;

        let tree = Arc::new(tree);
        storage.register_tree_id(tree.id()).await?;
        self.index_tree(space_id, tree.id(), change_type, object_id, object_type).await;
        self.object_map.write().await.insert(object_id.to_string(), tree.id().to_string());
        self.trees.write().await.insert(tree.id().to_string(), tree.clone());

        Ok(tree)
    }

    /// Builds a tree fresh from storage on every call (spec §4.4). On
    /// success, lazily adds it to the index if its root is classifiable.
    pub async fn get_tree(&self, space_id: &str, tree_id: &str) -> Result<Arc<ObjectTree>, UtmError> {
        let storage = self.resolver.get_or_open(space_id).await?;
        let tree = Arc::new(ObjectTree::open(tree_id.to_string(), storage.store.clone(), Some(storage.keys.read_key)));

        if let Ok((change_type, meta)) = tree.root_classification().await {
            if change_types::ALL.contains(&change_type.as_str()) {
                self.index_tree(space_id, tree_id, &change_type, &meta.object_id, &meta.object_type).await;
                self.object_map.write().await.insert(meta.object_id, tree_id.to_string());
            }
        }

        self.trees.write().await.insert(tree_id.to_string(), tree.clone());
        Ok(tree)
    }

    pub async fn get_tree_for_object(&self, space_id: &str, object_id: &str) -> Result<Arc<ObjectTree>, UtmError> {
        let tree_id = self
            .object_map
            .read()
            .await
            .get(object_id)
            .cloned()
            .ok_or_else(|| UtmError::ObjectNotFound(object_id.to_string()))?;
        self.get_tree(space_id, &tree_id).await
    }

    pub async fn get_trees_for_space(&self, space_id: &str) -> Vec<(String, IndexedTree)> {
        self.space_index
            .read()
            .await
            .get(space_id)
            .map(|m| m.iter().map(|(id, info)| (id.clone(), info.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn get_trees_by_type(&self, space_id: &str, object_type: &str) -> Vec<(String, IndexedTree)> {
        self.get_trees_for_space(space_id)
            .await
            .into_iter()
            .filter(|(_, info)| info.object_type == object_type)
            .collect()
    }

    pub async fn get_trees_by_change_type(&self, space_id: &str, change_type: &str) -> Vec<(String, IndexedTree)> {
        self.get_trees_for_space(space_id)
            .await
            .into_iter()
            .filter(|(_, info)| info.change_type == change_type)
            .collect()
    }

    /// Walks the space's on-disk tree index; for each tree id, reads the
    /// root's unencrypted classification and indexes it without caching the
    /// tree instance. Idempotent.
    pub async fn build_space_index(&self, space_id: &str) -> Result<(), UtmError> {
        let storage = self.resolver.get_or_open(space_id).await?;
        for tree_id in storage.stored_tree_ids().await {
            let tree = ObjectTree::open(tree_id.clone(), storage.store.clone(), Some(storage.keys.read_key));
            if let Ok((change_type, meta)) = tree.root_classification().await {
                if change_types::ALL.contains(&change_type.as_str()) {
                    self.index_tree(space_id, &tree_id, &change_type, &meta.object_id, &meta.object_type).await;
                    self.object_map.write().await.insert(meta.object_id, tree_id);
                }
            }
        }
        Ok(())
    }

    async fn index_tree(&self, space_id: &str, tree_id: &str, change_type: &str, object_id: &str, object_type: &str) {
        self.space_index
            .write()
            .await
            .entry(space_id.to_string())
            .or_default()
            .insert(
                tree_id.to_string(),
                IndexedTree {
                    change_type: change_type.to_string(),
                    object_id: object_id.to_string(),
                    object_type: object_type.to_string(),
                },
            );
    }

    /// Polls with exponential backoff (100 ms → 2 s cap) until at least
    /// `min_trees` are indexed for `space_id` or `timeout` elapses.
    pub async fn wait_for_sync(&self, space_id: &str, min_trees: usize, timeout: Duration) -> Result<(), UtmError> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(100);
        loop {
            let count = self.space_index.read().await.get(space_id).map(|m| m.len()).unwrap_or(0);
            if count >= min_trees {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UtmError::SyncTimeout);
            }
            tokio::time::sleep(backoff.min(deadline.saturating_duration_since(Instant::now()))).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    pub async fn register_sync_status(&self, space_id: &str, f: impl FnOnce(&mut SyncStatus)) {
        let mut statuses = self.sync_status.write().await;
        let entry = statuses.entry(space_id.to_string()).or_default();
        f(entry);
    }

    pub async fn get_sync_status(&self, space_id: &str) -> SyncStatus {
        self.sync_status.read().await.get(space_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_utm() -> (Utm, String) {
        let base = std::env::temp_dir().join(format!("matou-utm-{}", uuid::Uuid::new_v4()));
        let storage = Arc::new(StorageProvider::new(&base));
        let resolver = Arc::new(SpaceResolver::new(storage));
        let signing_key = PrivateKey::new();
        resolver
            .create_space(CreateSpacePayload { space_id: "space1".into(), signing_key })
            .await
            .unwrap();
        (Utm::new(resolver), "space1".to_string())
    }

    #[tokio::test]
    async fn create_object_tree_registers_in_all_indexes() {
        let (utm, space_id) = fresh_utm().await;
        let signing_key = PrivateKey::new();

        let tree = utm
            .create_object_tree(&space_id, "obj1", "note", change_types::OBJECT, &signing_key)
            .await
            .unwrap();

        let by_space = utm.get_trees_for_space(&space_id).await;
        assert_eq!(by_space.len(), 1);
        assert_eq!(by_space[0].0, tree.id());

        let via_object = utm.get_tree_for_object(&space_id, "obj1").await.unwrap();
        assert_eq!(via_object.id(), tree.id());

        let by_type = utm.get_trees_by_change_type(&space_id, change_types::OBJECT).await;
        assert_eq!(by_type.len(), 1);
    }

    #[tokio::test]
    async fn build_space_index_is_idempotent() {
        let (utm, space_id) = fresh_utm().await;
        let signing_key = PrivateKey::new();
        utm.create_object_tree(&space_id, "obj1", "note", change_types::OBJECT, &signing_key)
            .await
            .unwrap();

        utm.build_space_index(&space_id).await.unwrap();
        utm.build_space_index(&space_id).await.unwrap();

        assert_eq!(utm.get_trees_for_space(&space_id).await.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_sync_times_out_when_trees_never_arrive() {
        let (utm, space_id) = fresh_utm().await;
        let err = utm.wait_for_sync(&space_id, 5, Duration::from_millis(150)).await.unwrap_err();
        assert!(matches!(err, UtmError::SyncTimeout));
    }

    #[tokio::test]
    async fn sync_status_counters_accumulate() {
        let (utm, space_id) = fresh_utm().await;
        utm.register_sync_status(&space_id, |s| s.heads_received += 1).await;
        utm.register_sync_status(&space_id, |s| s.heads_received += 1).await;
        assert_eq!(utm.get_sync_status(&space_id).await.heads_received, 2);
    }
}
