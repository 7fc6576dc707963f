//! Transfer keys: generation, encoding, fingerprints, and HKDF subkeys

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 256-bit chunk encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct TransferKey {
    bytes: [u8; KEY_SIZE],
}

impl TransferKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Parse a base64-encoded key (surrounding whitespace is ignored).
    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let mut decoded = B64
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("transfer key is not valid base64: {e}"))?;

        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            anyhow::bail!("transfer key has wrong size: {len} bytes (expected {KEY_SIZE})");
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self::from_bytes(bytes))
    }

    pub fn to_base64(&self) -> String {
        B64.encode(self.bytes)
    }

    /// Non-secret identifier of this key, stored with a session so a resume
    /// with a different key is refused instead of failing every chunk.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::derive_key("ferry transfer key fingerprint v1", &self.bytes);
        blake3::Hash::from(digest).to_hex()[..16].to_string()
    }

    /// Derive the key used to compute synthetic chunk nonces.
    pub fn nonce_key(&self) -> anyhow::Result<[u8; KEY_SIZE]> {
        hkdf_derive(&self.bytes, b"ferry-chunk-nonce")
    }
}

impl Drop for TransferKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit transfer key.
pub fn generate_transfer_key() -> TransferKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    TransferKey::from_bytes(bytes)
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> anyhow::Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}
