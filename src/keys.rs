//! Peer-key manager (C1).
//!
//! Loads or generates the node's long-lived Ed25519 signing identity,
//! optionally derived deterministically from a BIP-39 recovery phrase plus
//! an integer index (so one mnemonic can derive many distinct peer keys,
//! e.g. for multi-profile setups).

use std::fs;
use std::path::Path;

use bip39::Mnemonic;
use hkdf::Hkdf;
use p2panda_core::{PrivateKey, PublicKey};
use sha2::Sha256;
use thiserror::Error;

use crate::error::CoreError;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("invalid private key bytes")]
    InvalidPrivateKey,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KeyError> for CoreError {
    fn from(e: KeyError) -> Self {
        CoreError::Internal(e.to_string())
    }
}

/// A loaded or generated peer identity.
pub struct PeerKey {
    pub private_key: PrivateKey,
    /// Set only when this key was derived from a mnemonic, so callers can
    /// display it once on first setup. Never persisted alongside the key.
    pub mnemonic: Option<String>,
}

impl PeerKey {
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    /// Base58 encoding of the raw public key bytes — the peer's stable id.
    pub fn peer_id(&self) -> String {
        bs58::encode(self.public_key().to_bytes()).into_string()
    }

    /// Generate a brand-new keypair with a fresh 24-word BIP-39 mnemonic.
    pub fn generate() -> Self {
        let mnemonic = Mnemonic::generate(24).expect("24-word mnemonic generation is infallible");
        Self::from_mnemonic_and_index(&mnemonic, 0)
    }

    /// Derive deterministically from an existing mnemonic phrase and an
    /// integer index (spec §4.1: "recovery phrase + integer index").
    pub fn from_phrase(phrase: &str, index: u32) -> Result<Self, KeyError> {
        let mnemonic = phrase
            .parse::<Mnemonic>()
            .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
        Ok(Self::from_mnemonic_and_index(&mnemonic, index))
    }

    fn from_mnemonic_and_index(mnemonic: &Mnemonic, index: u32) -> Self {
        let seed = mnemonic.to_seed("");
        let hk = Hkdf::<Sha256>::new(Some(&index.to_be_bytes()), &seed);
        let mut key_bytes = [0u8; 32];
        hk.expand(b"matou:peer-key:v1", &mut key_bytes)
            .expect("HKDF output length is valid");

        PeerKey {
            private_key: PrivateKey::from_bytes(&key_bytes),
            mnemonic: Some(mnemonic.words().collect::<Vec<_>>().join(" ")),
        }
    }

    /// Load the raw 32-byte key from `path`, or return `Ok(None)` if absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, KeyError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Some(PeerKey {
            private_key: PrivateKey::from_bytes(&key_bytes),
            mnemonic: None,
        }))
    }

    /// Persist the raw key bytes to `path` with owner-only permissions
    /// (spec §4.1: "Persists raw key bytes with owner-only file permissions").
    /// Reinitialization (overwriting an existing key) is atomic: written to a
    /// temp file first, then renamed into place.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), KeyError> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, self.private_key.to_bytes())?;
        set_owner_only_permissions(&tmp_path)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load the key at `path` if present, otherwise generate and persist a
    /// fresh one. This is the common `init_core`-style entry point.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        if let Some(key) = Self::load(&path)? {
            return Ok(key);
        }
        let key = Self::generate();
        key.persist(&path)?;
        Ok(key)
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), std::io::Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<(), std::io::Error> {
    Ok(())
}
