//! matou sync-engine core.
//!
//! Per §9's "no globally mutable singleton" redesign note, every dependency
//! a component needs is a constructor parameter rather than a process-global
//! service — [`Peer`] is the one object an embedding binary constructs, and
//! everything else (facades, the ACL engine, the sync engine) takes `&Peer`
//! or one of its sub-handles explicitly.

pub mod acl;
pub mod blockstore;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod facades;
pub mod files;
pub mod keys;
pub mod logging;
pub mod space_keys;
pub mod state;
pub mod storage;
pub mod sync;
pub mod tree;
pub mod utm;

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use coordinator::{CoordinatorClient, HttpCoordinatorClient, InMemoryCoordinator};
use error::CoreError;
use events::EventBroker;
use keys::{KeyError, PeerKey};
use sync::{HttpSpaceSyncClient, InMemorySpaceSyncClient, SpaceSyncClient, SyncEngine};
use utm::{SpaceResolver, Utm};

/// Everything [`Peer::init`] needs to stand up one running node. `coordinator_url`
/// and `relay_url` are `None` in tests / single-process setups, which selects
/// the in-memory stand-ins instead of the HTTP clients (spec §6 makes the
/// relay transport pluggable; this is that seam).
pub struct PeerConfig {
    pub data_dir: PathBuf,
    pub node_config: config::NodeConfig,
    pub peer_key_path: PathBuf,
    pub coordinator_url: Option<String>,
    pub relay_url: Option<String>,
}

/// The node's running state: loaded identity, storage, and the long-lived
/// handles every facade/sync call needs (SPEC_FULL §10).
pub struct Peer {
    pub key: PeerKey,
    pub node_config: config::NodeConfig,
    pub storage: Arc<storage::StorageProvider>,
    pub resolver: Arc<SpaceResolver>,
    pub coordinator: Arc<dyn CoordinatorClient>,
    pub utm: Arc<Utm>,
    pub sync_engine: Arc<SyncEngine>,
    pub events: Arc<EventBroker>,
    pub view_store: SqlitePool,
    projector: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Peer {
    /// Loads or generates the peer key, opens the local storage root, and
    /// wires the UTM and sync engine together through a shared
    /// [`SpaceResolver`] (resolving §9's cyclic-construction redesign point).
    /// Does not open any per-space storage or start any sync loop — that
    /// happens lazily (`get_or_open`) or explicitly (`run`/`start_space`).
    pub async fn init(config: PeerConfig) -> Result<Self, CoreError> {
        let key = PeerKey::load_or_generate(&config.peer_key_path)?;
        let storage = Arc::new(storage::StorageProvider::new(&config.data_dir));
        let resolver = Arc::new(SpaceResolver::new(storage.clone()));
        let utm = Arc::new(Utm::new(resolver.clone()));

        let coordinator: Arc<dyn CoordinatorClient> = match &config.coordinator_url {
            Some(url) => Arc::new(HttpCoordinatorClient::new(url.clone())),
            None => Arc::new(InMemoryCoordinator::default()),
        };
        let sync_client: Arc<dyn SpaceSyncClient> = match &config.relay_url {
            Some(url) => Arc::new(HttpSpaceSyncClient::new(url.clone())),
            None => Arc::new(InMemorySpaceSyncClient::default()),
        };
        let sync_engine = Arc::new(SyncEngine::new(sync_client, utm.clone()));

        let view_store_path = config.data_dir.join("view.db");
        std::fs::create_dir_all(&config.data_dir)?;
        let view_store = SqlitePool::connect(&format!("sqlite://{}?mode=rwc", view_store_path.display()))
            .await
            .map_err(CoreError::from)?;
        db::run_migrations(&view_store).await?;

        Ok(Peer {
            key,
            node_config: config.node_config,
            storage,
            resolver,
            coordinator,
            utm,
            sync_engine,
            events: Arc::new(EventBroker::default()),
            view_store,
            projector: Mutex::new(None),
        })
    }

    /// Starts the projector/update-listener task (C14) and the per-space
    /// sync loop for every space already on disk (spec §4.9: "created once
    /// per space on Init"). Idempotent: a second call is a no-op for
    /// whichever pieces are already running. Returns the space ids sync was
    /// started for.
    pub async fn run(&self) -> Vec<String> {
        let mut projector = self.projector.lock().await;
        if projector.is_none() {
            let (closing_tx, closing_rx) = watch::channel(false);
            let handle = tokio::spawn(events::run_projector_loop(
                self.view_store.clone(),
                self.events.clone(),
                self.utm.clone(),
                self.storage.clone(),
                closing_rx,
            ));
            *projector = Some((closing_tx, handle));
        }
        drop(projector);

        let space_ids = self.storage.list_space_ids().await;
        for space_id in &space_ids {
            self.sync_engine.start_space(space_id).await;
        }
        space_ids
    }

    /// Starts sync for one additional space (e.g. right after it's created
    /// or joined, instead of waiting for the next `run`).
    pub async fn start_space_sync(&self, space_id: &str) {
        self.sync_engine.start_space(space_id).await;
    }

    /// Cancels every running sync loop and the projector task, waits for
    /// them to drain in-flight work (spec §5), then closes the view store
    /// pool.
    pub async fn close(self) {
        self.sync_engine.close().await;
        if let Some((closing_tx, handle)) = self.projector.lock().await.take() {
            let _ = closing_tx.send(true);
            let _ = handle.await;
        }
        self.view_store.close().await;
    }
}

impl From<KeyError> for CoreError {
    fn from(e: KeyError) -> Self {
        CoreError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
id: peer-1
network_id: matou-dev
nodes:
  - peer_id: relay1
    addresses: ["https://relay1.example.com"]
    types: [coordinator, tree, file]
"#;

    #[tokio::test]
    async fn init_run_and_close_is_clean_with_no_spaces() {
        let base = std::env::temp_dir().join(format!("matou-peer-{}", uuid::Uuid::new_v4()));
        let peer = Peer::init(PeerConfig {
            data_dir: base.clone(),
            node_config: config::NodeConfig::from_yaml_str(SAMPLE_CONFIG).unwrap(),
            peer_key_path: base.join("peer.key"),
            coordinator_url: None,
            relay_url: None,
        })
        .await
        .unwrap();

        let started = peer.run().await;
        assert!(started.is_empty());
        peer.run().await; // idempotent: must not spawn a second projector task

        peer.close().await;
    }

    #[tokio::test]
    async fn init_twice_with_the_same_key_path_reuses_the_identity() {
        let base = std::env::temp_dir().join(format!("matou-peer-{}", uuid::Uuid::new_v4()));
        let key_path = base.join("peer.key");
        let node_config = config::NodeConfig::from_yaml_str(SAMPLE_CONFIG).unwrap();

        let peer1 = Peer::init(PeerConfig {
            data_dir: base.clone(),
            node_config: node_config.clone(),
            peer_key_path: key_path.clone(),
            coordinator_url: None,
            relay_url: None,
        })
        .await
        .unwrap();
        let peer_id1 = peer1.key.peer_id();
        peer1.close().await;

        let peer2 = Peer::init(PeerConfig {
            data_dir: base,
            node_config,
            peer_key_path: key_path,
            coordinator_url: None,
            relay_url: None,
        })
        .await
        .unwrap();
        assert_eq!(peer_id1, peer2.key.peer_id());
        peer2.close().await;
    }
}
