//! Update listener + event broker (C14).
//!
//! Read side of the data flow (spec §2): once the sync service (C12) applies
//! a remote head to a tree (C7), this module decrypts the tree's changes,
//! projects them into the view store ([`crate::db`]), and emits a
//! [`ChangeEvent`] so callers holding a subscription don't have to poll.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::error::CoreError;
use crate::state::{self, StateError};
use crate::storage::StorageProvider;
use crate::tree::{ObjectTree, TreeError};
use crate::utm::Utm;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("view store error: {0}")]
    Db(#[from] crate::db::DbError),
}

impl From<EventsError> for CoreError {
    fn from(e: EventsError) -> Self {
        match e {
            EventsError::Tree(e) => e.into(),
            EventsError::State(e) => e.into(),
            EventsError::Db(e) => e.into(),
        }
    }
}

/// Emitted once per tree whose projection changed. Subscribers see the new
/// version, not the diff — callers needing field-level detail re-read the
/// object through [`crate::facades`].
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub space_id: String,
    pub object_id: String,
    pub object_type: String,
    pub version: u32,
}

/// Broadcasts [`ChangeEvent`]s to every live subscriber. Lagging subscribers
/// drop old events rather than block the projector (`broadcast`'s usual
/// trade-off); a subscriber that falls behind can re-read current state from
/// [`crate::db`] instead of replaying missed events.
pub struct EventBroker {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBroker { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is the common case between peer startup and the first
        // subscriber; that's not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Projects a tree's current changes into the view store and emits the
/// resulting [`ChangeEvent`] (spec §2 read-side data flow). Called by the
/// sync engine (C12) after it applies a remote head, and by local writers
/// right after their own `add_content` so the view store never lags the
/// object's own tree.
pub async fn project_and_publish(
    pool: &sqlx::SqlitePool,
    broker: &EventBroker,
    utm: &Utm,
    space_id: &str,
    tree: &ObjectTree,
    object_id: &str,
    object_type: &str,
) -> Result<(), EventsError> {
    let changes = tree.iterate_root().await?;
    let state = state::build_state(changes, object_id.to_string(), object_type.to_string())?;

    crate::db::upsert_object(pool, space_id, &state).await?;
    utm.register_sync_status(space_id, |status| status.heads_applied += 1).await;

    broker.publish(ChangeEvent {
        space_id: space_id.to_string(),
        object_id: state.object_id.clone(),
        object_type: state.object_type.clone(),
        version: state.version,
    });
    Ok(())
}

/// How often the projector sweep re-checks every indexed tree for a new
/// version (spec §10's "projector/update-listener task"; no inbound queue
/// drives it, unlike the sync engine's head-diff loop, so a fixed interval
/// stands in for "whenever a write or a sync apply occurs").
pub const PROJECTOR_INTERVAL: Duration = Duration::from_secs(2);

/// Runs the projector sweep until `closing` reports `true`, following the
/// same `tokio::select!` + `watch<bool>` cancellation idiom as
/// [`crate::sync::engine::SyncEngine`]. One tick visits every space, every
/// indexed tree in that space, and projects it; a tree whose on-disk state
/// hasn't changed since the last sweep re-projects a no-op upsert, which is
/// cheap relative to re-deriving "did this change" some other way.
pub async fn run_projector_loop(
    pool: sqlx::SqlitePool,
    broker: Arc<EventBroker>,
    utm: Arc<Utm>,
    storage: Arc<StorageProvider>,
    mut closing: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PROJECTOR_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *closing.borrow() {
                    break;
                }
                for space_id in storage.list_space_ids().await {
                    for (tree_id, indexed) in utm.get_trees_for_space(&space_id).await {
                        let tree = match utm.get_tree(&space_id, &tree_id).await {
                            Ok(tree) => tree,
                            Err(_) => continue,
                        };
                        if let Err(e) = project_and_publish(
                            &pool, &broker, &utm, &space_id, &tree, &indexed.object_id, &indexed.object_type,
                        ).await {
                            log::warn!("projector: failed to project tree {tree_id} in space {space_id}: {e}");
                        }
                    }
                }
            }
            _ = closing.changed() => {
                if *closing.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facades::{FacadeError, ObjectManager};
    use crate::storage::{CreateSpacePayload, StorageProvider};
    use crate::tree::AllowAll;
    use crate::utm::SpaceResolver;
    use p2panda_core::PrivateKey;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn fresh() -> (Utm, sqlx::SqlitePool, String, PrivateKey) {
        let (utm, pool, space_id, signing_key, _storage) = fresh_with_storage().await;
        (utm, pool, space_id, signing_key)
    }

    async fn fresh_with_storage() -> (Utm, sqlx::SqlitePool, String, PrivateKey, Arc<StorageProvider>) {
        let base = std::env::temp_dir().join(format!("matou-events-{}", uuid::Uuid::new_v4()));
        let storage = Arc::new(StorageProvider::new(&base));
        let resolver = Arc::new(SpaceResolver::new(storage.clone()));
        let signing_key = PrivateKey::new();
        resolver
            .create_space(CreateSpacePayload { space_id: "space1".into(), signing_key: signing_key.clone() })
            .await
            .unwrap();
        let pool = crate::db::open_in_memory().await.unwrap();
        (Utm::new(resolver), pool, "space1".to_string(), signing_key, storage)
    }

    #[tokio::test]
    async fn projecting_a_tree_updates_view_store_and_emits_event() -> Result<(), FacadeError> {
        let (utm, pool, space_id, signing_key) = fresh().await;
        let manager = ObjectManager::new(&utm);
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), json!("hello"));
        manager.create_object(&space_id, "obj1", "note", fields, &signing_key, &AllowAll).await?;

        let tree = utm.get_tree_for_object(&space_id, "obj1").await.unwrap();
        let broker = EventBroker::new(8);
        let mut subscriber = broker.subscribe();

        project_and_publish(&pool, &broker, &utm, &space_id, &tree, "obj1", "note").await.unwrap();

        let event = subscriber.try_recv().unwrap();
        assert_eq!(event.object_id, "obj1");
        assert_eq!(event.version, 1);

        let row = crate::db::get_object(&pool, &space_id, "obj1").await.unwrap().unwrap();
        assert_eq!(row.fields.get("title"), Some(&json!("hello")));

        let status = utm.get_sync_status(&space_id).await;
        assert_eq!(status.heads_applied, 1);
        Ok(())
    }

    #[tokio::test]
    async fn subscribers_added_after_publish_do_not_see_past_events() {
        let (utm, pool, space_id, signing_key) = fresh().await;
        let manager = ObjectManager::new(&utm);
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), json!("hello"));
        manager.create_object(&space_id, "obj1", "note", fields, &signing_key, &AllowAll).await.unwrap();
        let tree = utm.get_tree_for_object(&space_id, "obj1").await.unwrap();

        let broker = EventBroker::new(8);
        project_and_publish(&pool, &broker, &utm, &space_id, &tree, "obj1", "note").await.unwrap();

        let mut late_subscriber = broker.subscribe();
        assert!(late_subscriber.try_recv().is_err());
    }

    #[tokio::test]
    async fn projector_loop_picks_up_a_locally_written_object_and_stops_on_close() {
        let (utm, pool, space_id, signing_key, storage) = fresh_with_storage().await;
        let utm = Arc::new(utm);
        let manager = ObjectManager::new(&utm);
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), json!("hello"));
        manager.create_object(&space_id, "obj1", "note", fields, &signing_key, &AllowAll).await.unwrap();

        let broker = Arc::new(EventBroker::new(8));
        let mut subscriber = broker.subscribe();
        let (closing_tx, closing_rx) = watch::channel(false);

        let handle = tokio::spawn(run_projector_loop(pool.clone(), broker.clone(), utm.clone(), storage, closing_rx));

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(event) = subscriber.try_recv() {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("projector loop should emit an event within 5s");
        assert_eq!(event.object_id, "obj1");

        closing_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
