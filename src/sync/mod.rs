//! Sync protocol glue (C12, spec §4.9): head-diff driven fetching of
//! missing/changed trees from relay peers, with a worker-pool tree syncer,
//! per-space peer manager, and a sync status tracker feeding the UTM's
//! counters (see [`crate::utm::SyncStatus`]).

pub mod client;
pub mod engine;
pub mod peer_manager;
pub mod status;
pub mod worker;

pub use client::{HeadDiff, HttpSpaceSyncClient, InMemorySpaceSyncClient, RemoteChange, SpaceSyncClient, SyncClientError};
pub use engine::SyncEngine;
pub use peer_manager::PeerManager;
pub use status::StatusTracker;
pub use worker::{TreeSyncer, WorkItem};
