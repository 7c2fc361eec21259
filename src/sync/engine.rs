//! Sync engine (C12): owns one head-diff loop per space, each running on
//! its own `tokio::spawn`'d task, started on `Init` and torn down on
//! `Close` (spec §4.9 "created once per space on Init, torn down on
//! Close"). Cancellation follows the teacher's channel-based coordination
//! idiom (`network.rs`'s topic subscription guards): a `tokio::sync::watch<bool>`
//! "closing" flag per space, checked at the top of every cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use crate::sync::client::SpaceSyncClient;
use crate::sync::status::StatusTracker;
use crate::sync::worker::{TreeSyncer, WorkItem};
use crate::utm::Utm;

/// How often a space's `HeadSync` round runs (spec §4.9: "≈ 5 s").
pub const HEAD_SYNC_INTERVAL: Duration = Duration::from_secs(5);

struct SpaceLoop {
    closing: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Drives per-space sync loops. Holds the pieces every loop needs
/// (`SpaceSyncClient`, `Utm`) so `Peer` only has to construct one of these
/// and call `start_space`/`close` — matching SPEC_FULL §10's "`SyncEngine`
/// handle" held by `Peer`.
pub struct SyncEngine {
    client: Arc<dyn SpaceSyncClient>,
    utm: Arc<Utm>,
    loops: RwLock<HashMap<String, SpaceLoop>>,
}

impl SyncEngine {
    pub fn new(client: Arc<dyn SpaceSyncClient>, utm: Arc<Utm>) -> Self {
        SyncEngine { client, utm, loops: RwLock::new(HashMap::new()) }
    }

    /// Starts the head-diff loop for `space_id`. Idempotent: calling it
    /// again while a loop is already running for that space is a no-op.
    pub async fn start_space(&self, space_id: &str) {
        if self.loops.read().await.contains_key(space_id) {
            return;
        }

        let (closing_tx, mut closing_rx) = watch::channel(false);
        let client = self.client.clone();
        let utm = self.utm.clone();
        let space_id_owned = space_id.to_string();

        let handle = tokio::spawn(async move {
            let syncer = TreeSyncer::new(client.clone(), utm.clone());
            let mut ticker = tokio::time::interval(HEAD_SYNC_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *closing_rx.borrow() {
                            break;
                        }
                        run_head_sync_cycle(&space_id_owned, &client, &utm, &syncer).await;
                    }
                    _ = closing_rx.changed() => {
                        if *closing_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.loops.write().await.insert(space_id.to_string(), SpaceLoop { closing: closing_tx, handle });
    }

    /// Signals the space's loop to stop and awaits it, draining any cycle
    /// already in flight (spec §5: "worker pools drain their inbound
    /// channels on close").
    pub async fn close_space(&self, space_id: &str) {
        if let Some(space_loop) = self.loops.write().await.remove(space_id) {
            let _ = space_loop.closing.send(true);
            let _ = space_loop.handle.await;
        }
    }

    /// Closes every running space loop (called from `Peer::close`).
    pub async fn close(&self) {
        let space_ids: Vec<String> = self.loops.read().await.keys().cloned().collect();
        for space_id in space_ids {
            self.close_space(&space_id).await;
        }
    }
}

async fn run_head_sync_cycle(
    space_id: &str,
    client: &Arc<dyn SpaceSyncClient>,
    utm: &Arc<Utm>,
    syncer: &TreeSyncer,
) {
    let tracker = StatusTracker::new(utm);
    let mut local_heads: HashMap<String, Vec<String>> = HashMap::new();
    for (tree_id, _) in utm.get_trees_for_space(space_id).await {
        if let Ok(tree) = utm.get_tree(space_id, &tree_id).await {
            if let Ok(heads) = tree.heads().await {
                local_heads.insert(tree_id, heads.iter().map(|h| h.to_hex()).collect());
            }
        }
    }

    let diff = match client.head_sync(space_id, &local_heads).await {
        Ok(diff) => diff,
        Err(_) => return,
    };

    let mut seen = HashSet::new();
    let missing: Vec<WorkItem> = diff
        .missing
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .map(|tree_id| WorkItem { tree_id, peer_id: "relay".to_string() })
        .collect();
    let existing: Vec<WorkItem> = diff
        .existing
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .map(|tree_id| WorkItem { tree_id, peer_id: "relay".to_string() })
        .collect();

    for item in missing.iter().chain(existing.iter()) {
        tracker.heads_receive(space_id, &item.peer_id, &item.tree_id).await;
    }

    syncer.sync_batch(space_id, missing, existing).await;
}
