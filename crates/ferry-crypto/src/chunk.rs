//! Deterministic per-chunk XChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [24 bytes: synthetic nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! nonce = BLAKE3-keyed(nonce_key, sequence_be || plaintext)[..24]
//! AAD   = sequence (8 bytes, big-endian) || BLAKE3(transfer_id) (32 bytes)
//! ```
//!
//! The nonce is a function of the plaintext, so encrypting the same chunk
//! twice yields identical bytes. A nonce only repeats for an identical
//! (sequence, plaintext) pair, in which case the ciphertext is identical too.
//! The AAD binds each chunk to its position and transfer, so slots cannot be
//! swapped between positions or sessions.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroize;

use crate::keys::TransferKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Chunk cipher bound to one transfer.
pub struct ChunkCipher {
    cipher: XChaCha20Poly1305,
    nonce_key: [u8; KEY_SIZE],
    transfer_tag: [u8; 32],
}

impl ChunkCipher {
    pub fn new(key: &TransferKey, transfer_id: &str) -> anyhow::Result<Self> {
        Ok(Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            nonce_key: key.nonce_key()?,
            transfer_tag: *blake3::hash(transfer_id.as_bytes()).as_bytes(),
        })
    }

    /// Encrypt one chunk. Returns `[24-byte nonce][ciphertext][16-byte tag]`.
    pub fn encrypt_chunk(&self, sequence: u64, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let nonce_bytes = self.synthetic_nonce(sequence, plaintext);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let aad = self.build_aad(sequence);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow::anyhow!("chunk encryption failed: {e}"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt one chunk produced by `encrypt_chunk` with the same sequence.
    pub fn decrypt_chunk(&self, sequence: u64, encrypted: &[u8]) -> anyhow::Result<Vec<u8>> {
        if encrypted.len() < NONCE_SIZE + TAG_SIZE {
            anyhow::bail!(
                "encrypted chunk too short: {} bytes (minimum {})",
                encrypted.len(),
                NONCE_SIZE + TAG_SIZE
            );
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);
        let aad = self.build_aad(sequence);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                anyhow::anyhow!(
                    "chunk decryption failed: invalid key, corrupted data, or wrong sequence/transfer"
                )
            })
    }

    fn synthetic_nonce(&self, sequence: u64, plaintext: &[u8]) -> [u8; NONCE_SIZE] {
        let mut hasher = blake3::Hasher::new_keyed(&self.nonce_key);
        hasher.update(&sequence.to_be_bytes());
        hasher.update(plaintext);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&hasher.finalize().as_bytes()[..NONCE_SIZE]);
        nonce
    }

    /// AAD: sequence (8 bytes BE) || BLAKE3(transfer_id) (32 bytes)
    fn build_aad(&self, sequence: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(8 + 32);
        aad.extend_from_slice(&sequence.to_be_bytes());
        aad.extend_from_slice(&self.transfer_tag);
        aad
    }
}

impl Drop for ChunkCipher {
    fn drop(&mut self) {
        self.nonce_key.zeroize();
    }
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("nonce_key", &"[REDACTED]")
            .finish()
    }
}
