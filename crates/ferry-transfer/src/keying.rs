//! Transfer key sources and the key bookkeeping stored with each session

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use ferry_core::{FerryError, FerryResult};
use ferry_crypto::{derive_transfer_key, generate_salt, KdfParams, TransferKey, SALT_SIZE};
use secrecy::SecretString;

use crate::model::TransferSession;

/// Metadata key holding the fingerprint of the key a session was encrypted with
pub const META_KEY_FINGERPRINT: &str = "key_fingerprint";
/// Metadata key holding the base64 Argon2id salt of a passphrase-keyed session
pub const META_KDF_SALT: &str = "kdf_salt";

/// Where a manager gets chunk encryption keys from.
#[derive(Debug, Clone, Default)]
pub enum KeySource {
    /// No key: sessions that ask for encryption are rejected.
    #[default]
    None,
    /// One fixed key for every session.
    Key(TransferKey),
    /// A passphrase stretched with Argon2id under a per-session random salt.
    Passphrase {
        passphrase: Arc<SecretString>,
        params: KdfParams,
    },
}

impl KeySource {
    pub fn passphrase(passphrase: SecretString, params: KdfParams) -> Self {
        KeySource::Passphrase {
            passphrase: Arc::new(passphrase),
            params,
        }
    }

    /// Key for a new session, recording its fingerprint (and salt) in `metadata`.
    ///
    /// Passphrase derivation is deliberately slow; call from a blocking context.
    pub fn key_for_new_session(
        &self,
        metadata: &mut BTreeMap<String, serde_json::Value>,
    ) -> FerryResult<TransferKey> {
        let key = match self {
            KeySource::None => return Err(FerryError::MissingKey),
            KeySource::Key(key) => key.clone(),
            KeySource::Passphrase { passphrase, params } => {
                let salt = generate_salt();
                let key = derive_transfer_key(passphrase, &salt, params)?;
                metadata.insert(META_KDF_SALT.into(), B64.encode(salt).into());
                key
            }
        };
        metadata.insert(META_KEY_FINGERPRINT.into(), key.fingerprint().into());
        Ok(key)
    }

    /// Key for an existing session, or `None` if it is not encrypted.
    ///
    /// Fails if this source cannot reproduce the key the session was started with.
    pub fn key_for_session(&self, session: &TransferSession) -> FerryResult<Option<TransferKey>> {
        if !session.enable_encryption {
            return Ok(None);
        }

        let key = match self {
            KeySource::None => return Err(FerryError::MissingKey),
            KeySource::Key(key) => key.clone(),
            KeySource::Passphrase { passphrase, params } => {
                let encoded = session.metadata_str(META_KDF_SALT).ok_or_else(|| {
                    FerryError::Config("session was not keyed from a passphrase".into())
                })?;
                let salt = decode_salt(encoded)?;
                derive_transfer_key(passphrase, &salt, params)?
            }
        };

        match session.metadata_str(META_KEY_FINGERPRINT) {
            Some(expected) if expected != key.fingerprint() => Err(FerryError::Config(format!(
                "transfer key fingerprint {} does not match session key {expected}",
                key.fingerprint()
            ))),
            _ => Ok(Some(key)),
        }
    }
}

fn decode_salt(encoded: &str) -> FerryResult<[u8; SALT_SIZE]> {
    let bytes = B64
        .decode(encoded)
        .map_err(|e| FerryError::Config(format!("kdf_salt is not valid base64: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| FerryError::Config(format!("kdf_salt must be {SALT_SIZE} bytes")))
}
