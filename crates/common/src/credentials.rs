//! Encrypted credential storage
//!
//! Credentials are sealed with ChaCha20-Poly1305 under a server-held key and
//! persisted as opaque blobs. The entry name is bound as associated data, so a
//! blob copied under another name fails to open.
//!
//! Blob layout: `version (1) || nonce (12) || ciphertext+tag`.

use crate::db::Database;
use crate::types::validate_name;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Length of the server-held key in bytes
pub const KEY_LEN: usize = 32;

const BLOB_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 1 + NONCE_LEN;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Credential '{0}' not found")]
    KeyNotFound(String),

    #[error("Credential decryption failed")]
    DecryptionFailed,

    #[error("Credential encryption failed")]
    EncryptionFailed,

    #[error("Invalid credential key: {0}")]
    InvalidKey(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Credential key file error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::Error> for CredentialError {
    fn from(e: crate::Error) -> Self {
        match e {
            crate::Error::Validation(msg) => CredentialError::Validation(msg),
            crate::Error::Database(e) => CredentialError::Storage(e),
            crate::Error::Io(e) => CredentialError::Io(e),
            other => CredentialError::Validation(other.to_string()),
        }
    }
}

/// Symmetric key used to seal stored credentials
#[derive(Clone)]
pub struct CredentialKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl CredentialKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Parse a key from 64 hex characters
    pub fn from_hex(encoded: &str) -> Result<Self, CredentialError> {
        let decoded = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| CredentialError::InvalidKey(format!("invalid hex: {}", e)))?,
        );
        if decoded.len() != KEY_LEN {
            return Err(CredentialError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            )));
        }
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.bytes[..]))
    }

    /// Load a key file written by [`CredentialKey::save`]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let content = Zeroizing::new(tokio::fs::read_to_string(path).await?);
        Self::from_hex(&content)
    }

    /// Save the key as hex, readable by the owner only
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), CredentialError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut content = self.to_hex();
        content.push('\n');
        tokio::fs::write(path, content.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        Ok(())
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.bytes[..]))
    }
}

impl fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialKey(<redacted>)")
    }
}

/// Encrypt `plaintext` for the entry `name`
pub fn seal(key: &CredentialKey, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: name.as_bytes(),
            },
        )
        .map_err(|_| CredentialError::EncryptionFailed)?;

    let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`seal`] for the same entry name.
///
/// Any mismatch (key, name, version, truncation, tampering) is `DecryptionFailed`.
pub fn open(key: &CredentialKey, name: &str, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
    if blob.len() <= HEADER_LEN || blob[0] != BLOB_VERSION {
        return Err(CredentialError::DecryptionFailed);
    }

    let nonce = Nonce::from_slice(&blob[1..HEADER_LEN]);
    key.cipher()
        .decrypt(
            nonce,
            Payload {
                msg: &blob[HEADER_LEN..],
                aad: name.as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CredentialError::DecryptionFailed)
}

/// Persistent store of encrypted credentials
#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
    key: Arc<CredentialKey>,
}

impl CredentialStore {
    pub fn new(db: Database, key: CredentialKey) -> Self {
        Self {
            db,
            key: Arc::new(key),
        }
    }

    /// Encrypt and persist `plaintext` under `name`, replacing any previous entry.
    /// Returns the stored blob.
    pub fn store(&self, name: &str, plaintext: &str) -> Result<Vec<u8>, CredentialError> {
        validate_name("credential name", name)?;
        if plaintext.is_empty() {
            return Err(CredentialError::Validation(
                "credential must not be empty".to_string(),
            ));
        }

        let blob = seal(&self.key, name, plaintext.as_bytes())?;
        let now = chrono::Utc::now().timestamp();

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO credentials (name, blob, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(name) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
            params![name, blob, now],
        )?;

        debug!("Stored credential {}", name);
        Ok(blob)
    }

    /// Decrypt the credential stored under `name`
    pub fn retrieve(&self, name: &str) -> Result<Zeroizing<String>, CredentialError> {
        let blob: Option<Vec<u8>> = {
            let conn = self.db.connection();
            let conn = conn.lock();
            let blob = conn
                .query_row(
                    "SELECT blob FROM credentials WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            blob
        };

        let blob = blob.ok_or_else(|| CredentialError::KeyNotFound(name.to_string()))?;
        let plaintext = open(&self.key, name, &blob)?;
        let text = std::str::from_utf8(&plaintext).map_err(|_| CredentialError::DecryptionFailed)?;
        Ok(Zeroizing::new(text.to_owned()))
    }

    pub fn contains(&self, name: &str) -> Result<bool, CredentialError> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM credentials WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn remove(&self, name: &str) -> Result<bool, CredentialError> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let rows = conn.execute("DELETE FROM credentials WHERE name = ?1", params![name])?;
        if rows > 0 {
            debug!("Removed credential {}", name);
        }
        Ok(rows > 0)
    }

    /// Names of all stored credentials, sorted
    pub fn names(&self) -> Result<Vec<String>, CredentialError> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM credentials ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
