//! Shared Curve25519 / AEAD helpers.
//!
//! Two distinct uses in this crate:
//!
//! - **Envelope encryption**: the space read key (and other short secrets)
//!   is encrypted under a *recipient's* Ed25519 public key via ECDH on the
//!   Montgomery form, exactly as the ACL invariant in spec §3 requires
//!   ("the read key is never transmitted in plaintext — it is always
//!   encrypted under one of {owner pubkey, invite pubkey, joiner pubkey}").
//! - **Symmetric content encryption**: object-tree change bodies are
//!   encrypted directly under the space's 256-bit read key (spec §3,
//!   ObjectTree invariants: "the change body is AES-encrypted under the
//!   space read key at the time of writing").

use chacha20poly1305::{
    aead::Aead, AeadCore, ChaCha20Poly1305, KeyInit, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("envelope too short or malformed")]
    InvalidEnvelope,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("AEAD encryption failed")]
    Encrypt,
    #[error("AEAD decryption failed — wrong key or tampered ciphertext")]
    Decrypt,
}

/// Convert a 32-byte Ed25519 seed to an X25519 static secret.
/// Uses SHA-512/clamp derivation (RFC 7748 §5).
pub fn ed25519_seed_to_x25519(seed_bytes: &[u8; 32]) -> StaticSecret {
    use sha2::Digest;
    let hash = sha2::Sha512::digest(seed_bytes);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    StaticSecret::from(key)
}

/// Convert a 32-byte Ed25519 compressed public key to X25519 Montgomery form.
pub fn ed25519_pubkey_to_x25519(pubkey_bytes: &[u8; 32]) -> X25519Public {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY(*pubkey_bytes);
    let point = compressed
        .decompress()
        .unwrap_or(curve25519_dalek::EdwardsPoint::default());
    X25519Public::from(point.to_montgomery().to_bytes())
}

/// Derive a 32-byte AEAD key from an X25519 shared secret + ephemeral pk.
/// Using the ephemeral pk as salt binds the key to this specific exchange.
pub fn derive_aead_key(shared: &[u8; 32], ephemeral_pk: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral_pk), shared);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key).expect("HKDF output length is valid");
    key
}

// ─── Envelope encryption (read-key distribution) ─────────────────────────────

const ENVELOPE_VERSION: u8 = 0x01;
const EPK_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const MIN_ENVELOPE_LEN: usize = 1 + EPK_LEN + NONCE_LEN + 16;
const HKDF_INFO: &[u8] = b"matou:read-key-envelope:v1";

/// Encrypt `plaintext` (typically the 32-byte space read key) so that only
/// the holder of `recipient_pk_bytes`'s Ed25519 seed can recover it.
///
/// Wire format: `VERSION[1] | ephemeral_pk[32] | nonce[24] | ciphertext`.
pub fn seal_to_pubkey(
    plaintext: &[u8],
    recipient_pk_bytes: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let recipient_x25519 = ed25519_pubkey_to_x25519(recipient_pk_bytes);

    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient_x25519);
    let aead_key = derive_aead_key(shared.as_bytes(), ephemeral_public.as_bytes(), HKDF_INFO);

    let cipher = XChaCha20Poly1305::new_from_slice(&aead_key).map_err(|_| CryptoError::Encrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(1 + EPK_LEN + NONCE_LEN + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an envelope produced by [`seal_to_pubkey`] using the recipient's
/// raw 32-byte Ed25519 private key seed.
pub fn open_from_seed(
    envelope: &[u8],
    recipient_seed_bytes: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(CryptoError::InvalidEnvelope);
    }
    if envelope[0] != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope[0]));
    }

    let epk_bytes: [u8; 32] = envelope[1..33].try_into().unwrap();
    let nonce_bytes: [u8; 24] = envelope[33..57].try_into().unwrap();
    let ciphertext = &envelope[57..];

    let ephemeral_public = X25519Public::from(epk_bytes);
    let recipient_x25519 = ed25519_seed_to_x25519(recipient_seed_bytes);
    let shared = recipient_x25519.diffie_hellman(&ephemeral_public);
    let aead_key = derive_aead_key(shared.as_bytes(), &epk_bytes, HKDF_INFO);

    let cipher = XChaCha20Poly1305::new_from_slice(&aead_key).map_err(|_| CryptoError::Decrypt)?;
    let nonce = XNonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

// ─── Symmetric content encryption (object tree change bodies) ───────────────

const CONTENT_NONCE_LEN: usize = 12;

/// Encrypt a change body directly under the space's 256-bit read key.
/// Wire format: `nonce[12] | ciphertext`.
pub fn encrypt_with_read_key(read_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(read_key).map_err(|_| CryptoError::Encrypt)?;
    let mut nonce_bytes = [0u8; CONTENT_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(CONTENT_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_with_read_key(read_key: &[u8; 32], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < CONTENT_NONCE_LEN {
        return Err(CryptoError::InvalidEnvelope);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(read_key).map_err(|_| CryptoError::Decrypt)?;
    let nonce = chacha20poly1305::Nonce::from_slice(&envelope[..CONTENT_NONCE_LEN]);
    cipher
        .decrypt(nonce, &envelope[CONTENT_NONCE_LEN..])
        .map_err(|_| CryptoError::Decrypt)
}

/// Generate a fresh random 256-bit symmetric key (space read key / master
/// key material).
pub fn random_key_256() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_ed25519_keypair() -> ([u8; 32], [u8; 32]) {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();
        (seed, *verifying.as_bytes())
    }

    #[test]
    fn seal_and_open_read_key_roundtrip() {
        let (seed, pubkey) = random_ed25519_keypair();
        let read_key = random_key_256();
        let envelope = seal_to_pubkey(&read_key, &pubkey).unwrap();
        let recovered = open_from_seed(&envelope, &seed).unwrap();
        assert_eq!(recovered, read_key.to_vec());
    }

    #[test]
    fn wrong_recipient_seed_fails() {
        let (_seed, pubkey) = random_ed25519_keypair();
        let (wrong_seed, _) = random_ed25519_keypair();
        let envelope = seal_to_pubkey(b"secret-read-key-material-here!!", &pubkey).unwrap();
        assert!(open_from_seed(&envelope, &wrong_seed).is_err());
    }

    #[test]
    fn content_encrypt_decrypt_roundtrip() {
        let key = random_key_256();
        let plaintext = b"{\"op\":\"set\",\"field\":\"title\",\"value\":\"hello\"}";
        let ciphertext = encrypt_with_read_key(&key, plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        let decrypted = decrypt_with_read_key(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn content_wrong_key_fails() {
        let key = random_key_256();
        let other = random_key_256();
        let ciphertext = encrypt_with_read_key(&key, b"hello").unwrap();
        assert!(decrypt_with_read_key(&other, &ciphertext).is_err());
    }
}
