//! Key derivation: Argon2id passphrase → transfer key

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::keys::TransferKey;
use crate::KEY_SIZE;

/// Salt length for passphrase-derived keys
pub const SALT_SIZE: usize = 16;

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Random salt for a new passphrase-keyed transfer. Stored with the session
/// (it does not need to be secret) so a resume re-derives the same key.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit transfer key from a passphrase and salt using Argon2id.
pub fn derive_transfer_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> anyhow::Result<TransferKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;

    Ok(TransferKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_transfer_key(&passphrase, &salt, &fast_params()).unwrap();
        let key2 = derive_transfer_key(&passphrase, &salt, &fast_params()).unwrap();

        assert_eq!(
            key1.as_bytes(),
            key2.as_bytes(),
            "KDF must be deterministic"
        );
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; SALT_SIZE];

        let key1 =
            derive_transfer_key(&SecretString::from("passphrase-a"), &salt, &fast_params()).unwrap();
        let key2 =
            derive_transfer_key(&SecretString::from("passphrase-b"), &salt, &fast_params()).unwrap();

        assert_ne!(key1.fingerprint(), key2.fingerprint());
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from("same-passphrase");

        let key1 = derive_transfer_key(&passphrase, &[1u8; SALT_SIZE], &fast_params()).unwrap();
        let key2 = derive_transfer_key(&passphrase, &[2u8; SALT_SIZE], &fast_params()).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different salts must produce different keys"
        );
    }

    #[test]
    fn test_salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
