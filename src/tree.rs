//! Object tree (C7).
//!
//! A signed, optionally-encrypted Merkle DAG of change records backing one
//! logical object. Built directly on the space's [`SpaceStore`]: each author
//! keeps their own append-only log (keyed by `tree_id` as the p2panda log
//! id), and the tree's DAG structure comes from `Header::previous` recording
//! the heads known at the time of the append — so a change can reference
//! tips written by *other* authors, not just its own backlink.
//! `get_log_heights` gives the set of authors that have ever written into a
//! tree, so the tree doesn't need to track that set itself.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use p2panda_core::{Body, Hash, Header, PrivateKey, PublicKey};
use p2panda_store::{LogStore, OperationStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::crypto::{self, CryptoError};
use crate::error::CoreError;
use crate::storage::SpaceStore;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("unauthorized: signer does not have write permission")]
    Unauthorized,
    #[error("stale prev — heads changed since this change was prepared")]
    StalePrev,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("no read key available for this tree")]
    NoReadKey,
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("root change not found for tree {0}")]
    RootNotFound(String),
}

impl From<TreeError> for CoreError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::Unauthorized => CoreError::unauthorized(e.to_string()),
            TreeError::StalePrev => CoreError::conflict(e.to_string()),
            TreeError::NoReadKey => CoreError::Internal(e.to_string()),
            _ => CoreError::Internal(e.to_string()),
        }
    }
}

/// Known root `change_type` values (spec §3). A tree whose root carries any
/// other string is stored but not classifiable by the UTM index (spec §4.6).
pub mod change_types {
    pub const PROFILE: &str = "matou.profile.v1";
    pub const CREDENTIAL: &str = "matou.credential.v1";
    pub const NOTICE: &str = "matou.notice.v1";
    pub const INTERACTION: &str = "matou.interaction.v1";
    pub const CHAT: &str = "matou.chat.v1";
    pub const OBJECT: &str = "matou.object.v1";

    pub const ALL: &[&str] = &[PROFILE, CREDENTIAL, NOTICE, INTERACTION, CHAT, OBJECT];
}

/// Unencrypted root metadata (spec §3: "Used to classify trees without the
/// read key").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePayloadMeta {
    pub object_id: String,
    pub object_type: String,
}

/// What's actually stored as the `Body` of every change, root or not. The
/// root's `payload` is always plaintext; non-root payloads are ciphertext
/// when `is_encrypted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangeEnvelope {
    /// `Some` only on the root change.
    change_type: Option<String>,
    /// `Some` only on the root change; CBOR-encoded [`ChangePayloadMeta`].
    change_payload: Option<Vec<u8>>,
    payload: Vec<u8>,
    is_encrypted: bool,
    is_snapshot: bool,
    data_type: String,
    timestamp: u64,
}

/// A decoded, decrypted change ready for state replay.
pub struct DecodedChange {
    pub hash: Hash,
    pub author: PublicKey,
    pub is_snapshot: bool,
    pub data_type: String,
    pub timestamp: u64,
    pub plaintext: Vec<u8>,
}

/// Parameters for [`ObjectTree::add_content`] (spec §4.4).
pub struct AddContentParams {
    pub data: Vec<u8>,
    pub signing_key: PrivateKey,
    pub is_snapshot: bool,
    pub should_be_encrypted: bool,
    pub timestamp: Option<u64>,
    pub data_type: String,
}

/// Result of [`ObjectTree::add_content`].
pub struct AddContentResult {
    pub heads: Vec<Hash>,
    pub change_hash: Hash,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the unix epoch")
        .as_micros() as u64
}

/// Checks write permission for a signer before an append is accepted. The
/// tree itself has no notion of ACL state; the caller (UTM / typed facades)
/// supplies this so tree.rs stays free of C11's consensus-client plumbing.
pub trait WritePermissionCheck: Send + Sync {
    fn can_write(&self, signer: &PublicKey) -> bool;
}

/// Trivial permission check used by tests and by code paths that defer the
/// permission decision to an outer layer.
pub struct AllowAll;
impl WritePermissionCheck for AllowAll {
    fn can_write(&self, _signer: &PublicKey) -> bool {
        true
    }
}

pub struct ObjectTree {
    tree_id: String,
    store: Arc<Mutex<SpaceStore>>,
    /// Read key obtained from ACL state at tree-build time. `None` means the
    /// tree was built before this peer held any read key (spec §4.4: a
    /// joiner not yet synced); `iterate_root` then fails with `no_read_key`.
    read_key: Option<[u8; 32]>,
    write_lock: Mutex<()>,
}

impl ObjectTree {
    /// Build a tree handle over an existing log. Every author that has ever
    /// appended to `tree_id` is discovered on demand via `get_log_heights`,
    /// so no caller-supplied author set is needed (spec §4.4: "building a
    /// fresh tree on each read is required").
    pub fn open(tree_id: String, store: Arc<Mutex<SpaceStore>>, read_key: Option<[u8; 32]>) -> Self {
        ObjectTree {
            tree_id,
            store,
            read_key,
            write_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.tree_id
    }

    /// Serializes mutating operations and multi-change reads (spec §4.4).
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub fn unlock(&self, guard: tokio::sync::MutexGuard<'_, ()>) {
        drop(guard);
    }

    /// Create the root change for a brand-new tree. `change_payload` is
    /// never encrypted (spec §3). The tree id is minted from the root's own
    /// content hash once it's been signed.
    pub async fn create_root(
        store: Arc<Mutex<SpaceStore>>,
        signing_key: &PrivateKey,
        change_type: &str,
        change_payload: ChangePayloadMeta,
        read_key: [u8; 32],
        data: Vec<u8>,
        should_be_encrypted: bool,
        data_type: String,
    ) -> Result<(Self, Hash), TreeError> {
        let payload = if should_be_encrypted {
            crypto::encrypt_with_read_key(&read_key, &data)?
        } else {
            data
        };
        let payload_meta = crate::codec::encode_cbor(&change_payload).map_err(|e| TreeError::Storage(e.to_string()))?;

        let envelope = ChangeEnvelope {
            change_type: Some(change_type.to_string()),
            change_payload: Some(payload_meta),
            payload,
            is_encrypted: should_be_encrypted,
            is_snapshot: true,
            data_type,
            timestamp: now_micros(),
        };

        // p2panda logs are keyed by (author, log_id); the tree's own log id
        // is the content hash of its root, so the hash must be computed
        // before the log id used to insert it is known.
        let hash = {
            let mut guard = store.lock().await;
            let hash = compute_change_hash(signing_key, &envelope)?;
            insert_under_log_id(&mut guard, signing_key, &hash.to_hex(), &envelope, vec![], 0, None).await?;
            hash
        };

        let tree_id = hash.to_hex();

        let tree = ObjectTree {
            tree_id,
            store,
            read_key: Some(read_key),
            write_lock: Mutex::new(()),
        };

        Ok((tree, hash))
    }

    /// `add_content` (spec §4.4): validates signer against ACL, encrypts if
    /// required, appends, updates heads, persists.
    pub async fn add_content(
        &self,
        params: AddContentParams,
        current_heads: Vec<Hash>,
        permission_check: &dyn WritePermissionCheck,
    ) -> Result<AddContentResult, TreeError> {
        let signer = params.signing_key.public_key();
        if !permission_check.can_write(&signer) {
            return Err(TreeError::Unauthorized);
        }

        let payload = if params.should_be_encrypted {
            let read_key = self.read_key.ok_or(TreeError::NoReadKey)?;
            crypto::encrypt_with_read_key(&read_key, &params.data)?
        } else {
            params.data
        };

        let envelope = ChangeEnvelope {
            change_type: None,
            change_payload: None,
            payload,
            is_encrypted: params.should_be_encrypted,
            is_snapshot: params.is_snapshot,
            data_type: params.data_type,
            timestamp: params.timestamp.unwrap_or_else(now_micros),
        };

        let mut store = self.store.lock().await;

        let latest = store
            .latest_operation(&signer, &self.tree_id)
            .await
            .map_err(|e| TreeError::Storage(e.to_string()))?;
        let (seq_num, backlink) = match latest {
            Some((prev_header, _)) => (prev_header.seq_num + 1, Some(prev_header.hash())),
            None => (0, None),
        };

        insert_under_log_id(&mut store, &params.signing_key, &self.tree_id, &envelope, current_heads, seq_num, backlink)
            .await?;
        let hash = store
            .latest_operation(&signer, &self.tree_id)
            .await
            .map_err(|e| TreeError::Storage(e.to_string()))?
            .map(|(h, _)| h.hash())
            .ok_or_else(|| TreeError::Storage("just-inserted operation vanished".into()))?;

        Ok(AddContentResult {
            heads: vec![hash],
            change_hash: hash,
        })
    }

    /// The DAG tips across every author that has appended to this tree.
    pub async fn heads(&self) -> Result<Vec<Hash>, TreeError> {
        let mut store = self.store.lock().await;
        let heights = store
            .get_log_heights(&self.tree_id)
            .await
            .map_err(|e| TreeError::Storage(e.to_string()))?;

        let mut heads = Vec::new();
        for (author, _tip_seq) in heights {
            if let Some((header, _)) = store
                .latest_operation(&author, &self.tree_id)
                .await
                .map_err(|e| TreeError::Storage(e.to_string()))?
            {
                heads.push(header.hash());
            }
        }
        Ok(heads)
    }

    /// The raw root-change header bytes (`header() → raw_root_bytes` in spec
    /// wording — identifies and authenticates the tree).
    pub async fn header(&self) -> Result<Vec<u8>, TreeError> {
        let (header_bytes, _) = self.root_record().await?;
        Ok(header_bytes)
    }

    async fn root_record(&self) -> Result<(Vec<u8>, ChangeEnvelope), TreeError> {
        let mut store = self.store.lock().await;
        let heights = store
            .get_log_heights(&self.tree_id)
            .await
            .map_err(|e| TreeError::Storage(e.to_string()))?;

        for (author, _) in heights {
            let log = store
                .get_log(&author, &self.tree_id, None)
                .await
                .map_err(|e| TreeError::Storage(e.to_string()))?;
            let Some(log) = log else { continue };
            if let Some((header, Some(body))) = log.into_iter().find(|(h, _)| h.seq_num == 0) {
                let envelope: ChangeEnvelope =
                    crate::codec::decode_cbor(&body.to_bytes()).map_err(|e| TreeError::Storage(e.to_string()))?;
                if envelope.change_type.is_some() {
                    return Ok((header.to_bytes(), envelope));
                }
            }
        }
        Err(TreeError::RootNotFound(self.tree_id.clone()))
    }

    /// Root classification metadata, readable without the read key (spec
    /// §4.6 `build_space_index`).
    pub async fn root_classification(&self) -> Result<(String, ChangePayloadMeta), TreeError> {
        let (_, envelope) = self.root_record().await?;
        let change_type = envelope.change_type.ok_or_else(|| TreeError::RootNotFound(self.tree_id.clone()))?;
        let meta_bytes = envelope.change_payload.ok_or_else(|| TreeError::RootNotFound(self.tree_id.clone()))?;
        let meta: ChangePayloadMeta = crate::codec::decode_cbor(&meta_bytes).map_err(|e| TreeError::Storage(e.to_string()))?;
        Ok((change_type, meta))
    }

    /// Topological traversal from the root, decrypting every change with
    /// the tree's read key. Unparseable changes are skipped rather than
    /// aborting the whole traversal (spec §4.4).
    pub async fn iterate_root(&self) -> Result<Vec<DecodedChange>, TreeError> {
        let read_key = self.read_key.ok_or(TreeError::NoReadKey)?;
        let mut store = self.store.lock().await;

        let heights = store
            .get_log_heights(&self.tree_id)
            .await
            .map_err(|e| TreeError::Storage(e.to_string()))?;

        let mut all: Vec<(Header<()>, Vec<u8>)> = Vec::new();
        for (author, _) in heights {
            let log = store
                .get_log(&author, &self.tree_id, None)
                .await
                .map_err(|e| TreeError::Storage(e.to_string()))?;
            let Some(log) = log else { continue };
            for (header, body) in log {
                if let Some(body) = body {
                    all.push((header, body.to_bytes()));
                }
            }
        }
        drop(store);

        // p2panda headers don't expose a total order across authors; the
        // space's read semantics only need a stable, causally-consistent
        // ordering, so changes are replayed root-first then by timestamp.
        all.sort_by_key(|(h, _)| h.timestamp);

        let mut out = Vec::new();
        for (header, body_bytes) in all {
            let envelope: ChangeEnvelope = match crate::codec::decode_cbor(&body_bytes) {
                Ok(e) => e,
                Err(_) => continue,
            };

            let plaintext = if envelope.is_encrypted {
                match crypto::decrypt_with_read_key(&read_key, &envelope.payload) {
                    Ok(p) => p,
                    Err(_) => continue,
                }
            } else {
                envelope.payload
            };

            out.push(DecodedChange {
                hash: header.hash(),
                author: header.public_key,
                is_snapshot: envelope.is_snapshot,
                data_type: envelope.data_type,
                timestamp: envelope.timestamp,
                plaintext,
            });
        }

        Ok(out)
    }

    /// Applies a header/body pair fetched from a peer (spec §4.9 tree
    /// syncer: "get_tree ... triggers a remote tree fetch ... the tree is
    /// ... synced with the peer"). Duplicate inserts are tolerated by the
    /// underlying store, so re-applying an already-known change is a no-op.
    pub async fn ingest_remote_change(&self, header_bytes: &[u8], body_bytes: Vec<u8>) -> Result<Hash, TreeError> {
        let header: Header<()> = Header::try_from(header_bytes).map_err(|e| TreeError::Storage(e.to_string()))?;
        let body = Body::new(&body_bytes);
        let hash = header.hash();

        let mut store = self.store.lock().await;
        store
            .insert_operation(hash, &header, Some(&body), header_bytes, &self.tree_id)
            .await
            .map_err(|e| TreeError::Storage(e.to_string()))?;
        Ok(hash)
    }
}

fn compute_change_hash(signing_key: &PrivateKey, envelope: &ChangeEnvelope) -> Result<Hash, TreeError> {
    let body_bytes = crate::codec::encode_cbor(envelope).map_err(|e| TreeError::Storage(e.to_string()))?;
    let body = Body::new(&body_bytes);
    let mut header: Header<()> = Header {
        version: 1,
        public_key: signing_key.public_key(),
        signature: None,
        payload_size: body.size(),
        payload_hash: Some(body.hash()),
        timestamp: envelope.timestamp,
        seq_num: 0,
        backlink: None,
        previous: vec![],
        extensions: (),
    };
    header.sign(signing_key);
    Ok(header.hash())
}

#[allow(clippy::too_many_arguments)]
async fn insert_under_log_id(
    store: &mut SpaceStore,
    signing_key: &PrivateKey,
    log_id: &str,
    envelope: &ChangeEnvelope,
    previous_heads: Vec<Hash>,
    seq_num: u64,
    backlink: Option<Hash>,
) -> Result<Hash, TreeError> {
    let body_bytes = crate::codec::encode_cbor(envelope).map_err(|e| TreeError::Storage(e.to_string()))?;
    let body = Body::new(&body_bytes);

    let mut header: Header<()> = Header {
        version: 1,
        public_key: signing_key.public_key(),
        signature: None,
        payload_size: body.size(),
        payload_hash: Some(body.hash()),
        timestamp: envelope.timestamp,
        seq_num,
        backlink,
        previous: previous_heads,
        extensions: (),
    };
    header.sign(signing_key);

    let hash = header.hash();
    let header_bytes = header.to_bytes();

    store
        .insert_operation(hash, &header, Some(&body), &header_bytes, &log_id.to_string())
        .await
        .map_err(|e| TreeError::Storage(e.to_string()))?;

    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CreateSpacePayload, StorageProvider};

    async fn fresh_store() -> Arc<Mutex<SpaceStore>> {
        let base = std::env::temp_dir().join(format!("matou-tree-{}", uuid::Uuid::new_v4()));
        let provider = StorageProvider::new(&base);
        let storage = provider
            .create_space_storage(CreateSpacePayload {
                space_id: "space1".into(),
                signing_key: PrivateKey::new(),
            })
            .await
            .unwrap();
        storage.store.clone()
    }

    #[tokio::test]
    async fn create_root_then_add_content_and_iterate() {
        let store = fresh_store().await;
        let signing_key = PrivateKey::new();
        let read_key = crypto::random_key_256();

        let (tree, root_hash) = ObjectTree::create_root(
            store,
            &signing_key,
            change_types::OBJECT,
            ChangePayloadMeta { object_id: "obj1".into(), object_type: "note".into() },
            read_key,
            b"{}".to_vec(),
            false,
            "matou.object.v1".into(),
        )
        .await
        .unwrap();

        assert_eq!(tree.id(), root_hash.to_hex());

        let (change_type, meta) = tree.root_classification().await.unwrap();
        assert_eq!(change_type, change_types::OBJECT);
        assert_eq!(meta.object_id, "obj1");

        let heads = tree.heads().await.unwrap();
        assert_eq!(heads.len(), 1);

        let result = tree
            .add_content(
                AddContentParams {
                    data: br#"{"op":"set","field":"title","value":"hi"}"#.to_vec(),
                    signing_key: signing_key.clone(),
                    is_snapshot: false,
                    should_be_encrypted: true,
                    timestamp: None,
                    data_type: "matou.object.v1".into(),
                },
                heads,
                &AllowAll,
            )
            .await
            .unwrap();
        assert_eq!(result.heads.len(), 1);

        let changes = tree.iterate_root().await.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].is_snapshot);
    }

    struct DenyAll;
    impl WritePermissionCheck for DenyAll {
        fn can_write(&self, _signer: &PublicKey) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn add_content_rejects_unauthorized_signer() {
        let store = fresh_store().await;
        let signing_key = PrivateKey::new();
        let read_key = crypto::random_key_256();

        let (tree, _) = ObjectTree::create_root(
            store,
            &signing_key,
            change_types::OBJECT,
            ChangePayloadMeta { object_id: "obj1".into(), object_type: "note".into() },
            read_key,
            b"{}".to_vec(),
            false,
            "matou.object.v1".into(),
        )
        .await
        .unwrap();

        let err = tree
            .add_content(
                AddContentParams {
                    data: b"x".to_vec(),
                    signing_key,
                    is_snapshot: false,
                    should_be_encrypted: false,
                    timestamp: None,
                    data_type: "matou.object.v1".into(),
                },
                vec![],
                &DenyAll,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Unauthorized));
    }

    #[tokio::test]
    async fn iterate_root_without_read_key_fails() {
        let store = fresh_store().await;
        let signing_key = PrivateKey::new();
        let read_key = crypto::random_key_256();

        let (tree, root_hash) = ObjectTree::create_root(
            store.clone(),
            &signing_key,
            change_types::OBJECT,
            ChangePayloadMeta { object_id: "obj1".into(), object_type: "note".into() },
            read_key,
            b"{}".to_vec(),
            false,
            "matou.object.v1".into(),
        )
        .await
        .unwrap();

        let keyless = ObjectTree::open(root_hash.to_hex(), store, None);
        assert!(keyless.iterate_root().await.is_err());
        let _ = tree;
    }
}
