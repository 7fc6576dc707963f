//! ferry-crypto: chunk encryption for transformed transfers
//!
//! Pipeline position: read chunk → zstd compress → **encrypt** → BLAKE3 hash → write
//!
//! Expected chunk digests are computed once, before the transfer starts, and
//! compared against the digest of the bytes produced at transfer time. The
//! cipher therefore has to be deterministic, so nonces are synthetic:
//! ```text
//! Transfer Key (256-bit, random or Argon2id from passphrase)
//!   ├── Nonce Key (HKDF-SHA256, info="ferry-chunk-nonce")
//!   │   └── nonce = BLAKE3-keyed(nonce_key, sequence || plaintext)[..24]
//!   └── Chunk AEAD: XChaCha20-Poly1305 (key=transfer_key, AAD=sequence||BLAKE3(transfer_id))
//! ```

pub mod chunk;
pub mod kdf;
pub mod keys;

pub use chunk::ChunkCipher;
pub use kdf::{derive_transfer_key, generate_salt, KdfParams, SALT_SIZE};
pub use keys::{generate_transfer_key, TransferKey};

/// Size of a transfer key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes an encrypted chunk adds on top of its plaintext
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
