//! Space key set (C2).
//!
//! Every space owns a bundle of keys distinct from the peer identity: a
//! signing key (defaults to the peer's own key), a random master key and
//! metadata key, and a random 256-bit symmetric read key — the only key
//! that decrypts object-tree change bodies (spec §3).

use std::fs;
use std::path::Path;

use p2panda_core::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::random_key_256;
use crate::error::CoreError;

#[derive(Debug, Error)]
pub enum SpaceKeysError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Distinct from a plain "not found" — the space exists (storage was
    /// opened successfully) but this peer never held the read key locally,
    /// because it joined remotely and the key lives only in ACL state.
    #[error("space exists but no local key set — read key must come from ACL state")]
    NoLocalKeys,
    #[error("malformed key bytes: {0}")]
    Encoding(String),
}

impl From<SpaceKeysError> for CoreError {
    fn from(e: SpaceKeysError) -> Self {
        match e {
            SpaceKeysError::NoLocalKeys => CoreError::not_found(e.to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

/// On-disk representation of a space's key bundle (`keys.json`, spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSpaceKeys {
    signing_key_hex: String,
    master_key_hex: String,
    metadata_key_hex: String,
    read_key_hex: String,
}

#[derive(Debug, Clone)]
pub struct SpaceKeySet {
    pub signing_key: PrivateKey,
    pub master_key: PrivateKey,
    pub metadata_key: PrivateKey,
    pub read_key: [u8; 32],
}

impl SpaceKeySet {
    /// Mint a fresh key set for a newly created space. `signing_key`
    /// defaults to the peer's own key unless a different one is provided
    /// (spec §4.2: "signing_key = peer_priv or provided").
    pub fn generate(signing_key: PrivateKey) -> Self {
        SpaceKeySet {
            signing_key,
            master_key: PrivateKey::new(),
            metadata_key: PrivateKey::new(),
            read_key: random_key_256(),
        }
    }

    pub fn master_public_key(&self) -> PublicKey {
        self.master_key.public_key()
    }

    pub fn metadata_public_key(&self) -> PublicKey {
        self.metadata_key.public_key()
    }

    pub fn persist(&self, keys_json_path: impl AsRef<Path>) -> Result<(), SpaceKeysError> {
        let persisted = PersistedSpaceKeys {
            signing_key_hex: self.signing_key.to_hex(),
            master_key_hex: self.master_key.to_hex(),
            metadata_key_hex: self.metadata_key.to_hex(),
            read_key_hex: hex::encode(self.read_key),
        };
        let json = serde_json::to_vec_pretty(&persisted)?;
        fs::write(keys_json_path, json)?;
        Ok(())
    }

    /// Load a persisted key set. Returns [`SpaceKeysError::NoLocalKeys`] if
    /// `keys_json_path` does not exist — the caller should then fall back to
    /// recovering the read key from ACL state (a remotely-joined space).
    pub fn load(keys_json_path: impl AsRef<Path>) -> Result<Self, SpaceKeysError> {
        let path = keys_json_path.as_ref();
        if !path.exists() {
            return Err(SpaceKeysError::NoLocalKeys);
        }
        let bytes = fs::read(path)?;
        let persisted: PersistedSpaceKeys = serde_json::from_slice(&bytes)?;
        decode(persisted)
    }
}

fn decode(p: PersistedSpaceKeys) -> Result<SpaceKeySet, SpaceKeysError> {
    let from_hex = |s: &str| -> Result<[u8; 32], SpaceKeysError> {
        let bytes = hex::decode(s).map_err(|e| SpaceKeysError::Encoding(e.to_string()))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| SpaceKeysError::Encoding("expected 32 bytes".to_string()))
    };

    Ok(SpaceKeySet {
        signing_key: PrivateKey::from_bytes(&from_hex(&p.signing_key_hex)?),
        master_key: PrivateKey::from_bytes(&from_hex(&p.master_key_hex)?),
        metadata_key: PrivateKey::from_bytes(&from_hex(&p.metadata_key_hex)?),
        read_key: from_hex(&p.read_key_hex)?,
    })
}

/// 64-bit FNV-1a hash of the space id, used by relays for sharding
/// (spec §3: "Replication key: 64-bit FNV-derived value used by relays for
/// sharding").
pub fn replication_key(space_id: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in space_id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("matou-spacekeys-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keys.json");

        let signing = PrivateKey::new();
        let keys = SpaceKeySet::generate(signing.clone());
        keys.persist(&path).unwrap();

        let loaded = SpaceKeySet::load(&path).unwrap();
        assert_eq!(loaded.signing_key.to_hex(), signing.to_hex());
        assert_eq!(loaded.read_key, keys.read_key);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_keys_file_is_distinct_no_local_keys_error() {
        let dir = std::env::temp_dir().join(format!("matou-spacekeys-missing-{}", uuid::Uuid::new_v4()));
        let path = dir.join("keys.json");
        let err = SpaceKeySet::load(&path).unwrap_err();
        assert!(matches!(err, SpaceKeysError::NoLocalKeys));
    }

    #[test]
    fn replication_key_is_deterministic() {
        let a = replication_key("space-abc");
        let b = replication_key("space-abc");
        let c = replication_key("space-xyz");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
