// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sync credentials: the decrypted form handed to protocol clients, the
//! encrypted form kept on disk, and the cipher between them.
//!
//! User name and password are encrypted with AES-256-GCM under a random key
//! kept in the local store (misc key `syncKey`). Each ciphertext is the
//! 96-bit nonce followed by the sealed bytes, base64 encoded.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{CredentialError, SyncError};
use crate::protocol::ProtocolKind;
use crate::store::{LocalStore, partial_path};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Name of the credentials file inside a data directory
pub const CREDENTIALS_FILENAME: &str = "creds.json";

/// Decrypted credentials for one sync server
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub protocol: ProtocolKind,
    pub server: String,
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        protocol: ProtocolKind,
        server: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            server: server.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    /// Value of the `Authorization` header for HTTP Basic auth
    pub fn basic_auth_header(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.user, self.password));
        format!("Basic {token}")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("protocol", &self.protocol)
            .field("server", &self.server)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credentials as persisted: server in clear, user and password sealed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCredentials {
    pub server: String,
    pub login_name: String,
    pub app_password: String,
}

/// Generate a fresh base64 encoded cipher key
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// AES-256-GCM cipher for credential fields
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn from_base64_key(key: &str) -> Result<Self, CredentialError> {
        let key = STANDARD
            .decode(key.trim())
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

        if key.len() != KEY_SIZE {
            return Err(CredentialError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, text: &str) -> Result<String, CredentialError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), text.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        Ok(STANDARD.encode([nonce.as_slice(), ciphertext.as_slice()].concat()))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, CredentialError> {
        let data = STANDARD
            .decode(encrypted)
            .map_err(|_| CredentialError::Decrypt("invalid base64".into()))?;

        if data.len() < NONCE_SIZE {
            return Err(CredentialError::Decrypt("ciphertext too short".into()));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt("authentication failed".into()))?;

        String::from_utf8(plaintext).map_err(|_| CredentialError::Decrypt("invalid UTF-8".into()))
    }

    pub fn seal(&self, credentials: &Credentials) -> Result<EncryptedCredentials, CredentialError> {
        Ok(EncryptedCredentials {
            server: credentials.server.clone(),
            login_name: self.encrypt(&credentials.user)?,
            app_password: self.encrypt(&credentials.password)?,
        })
    }

    pub fn open(
        &self,
        protocol: ProtocolKind,
        sealed: &EncryptedCredentials,
    ) -> Result<Credentials, CredentialError> {
        Ok(Credentials {
            protocol,
            server: sealed.server.clone(),
            user: self.decrypt(&sealed.login_name)?,
            password: self.decrypt(&sealed.app_password)?,
        })
    }
}

/// Opaque storage of encrypted credentials, one entry per protocol
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, protocol: ProtocolKind) -> Result<Option<EncryptedCredentials>, CredentialError>;

    async fn save(&self, protocol: ProtocolKind, credentials: EncryptedCredentials) -> Result<(), CredentialError>;

    async fn remove(&self, protocol: ProtocolKind) -> Result<(), CredentialError>;

    /// The protocol with stored credentials, Nextcloud taking precedence
    async fn active_protocol(&self) -> Result<Option<ProtocolKind>, CredentialError> {
        for protocol in ProtocolKind::ALL {
            if self.load(protocol).await?.is_some() {
                return Ok(Some(protocol));
            }
        }
        Ok(None)
    }
}

/// Credentials kept in a JSON file keyed by protocol name
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

type CredentialFile = BTreeMap<ProtocolKind, EncryptedCredentials>;

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CREDENTIALS_FILENAME))
    }

    async fn read(&self) -> Result<CredentialFile, CredentialError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                CredentialError::JsonParseFailed {
                    path: self.path.clone(),
                    source: e,
                }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CredentialFile::new()),
            Err(e) => Err(CredentialError::ReadFailed {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Write through a `.partial` sibling renamed over the file, so a crash
    /// mid-write keeps the previous credentials
    async fn write(&self, file: &CredentialFile) -> Result<(), CredentialError> {
        let json = serde_json::to_string(file)?;
        let partial = partial_path(&self.path);

        tokio::fs::write(&partial, json)
            .await
            .map_err(|e| CredentialError::WriteFailed {
                path: partial.clone(),
                source: e,
            })?;

        tokio::fs::rename(&partial, &self.path)
            .await
            .map_err(|e| CredentialError::WriteFailed {
                path: self.path.clone(),
                source: e,
            })
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, protocol: ProtocolKind) -> Result<Option<EncryptedCredentials>, CredentialError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.remove(&protocol))
    }

    async fn save(&self, protocol: ProtocolKind, credentials: EncryptedCredentials) -> Result<(), CredentialError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.insert(protocol, credentials);
        self.write(&file).await
    }

    async fn remove(&self, protocol: ProtocolKind) -> Result<(), CredentialError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        if file.remove(&protocol).is_some() {
            self.write(&file).await?;
        }
        Ok(())
    }
}

/// Encrypt and persist credentials, creating the cipher key on first use.
///
/// Fails with [`CredentialError::AlreadyLoggedIn`] while another protocol
/// holds credentials.
pub async fn store_credentials<S, K>(
    store: &S,
    credential_store: &K,
    credentials: &Credentials,
) -> Result<(), CredentialError>
where
    S: LocalStore + ?Sized,
    K: CredentialStore + ?Sized,
{
    if let Some(active) = credential_store.active_protocol().await?
        && active != credentials.protocol
    {
        return Err(CredentialError::AlreadyLoggedIn(active.to_string()));
    }

    let key = match store.sync_key().await? {
        Some(key) => key,
        None => {
            let key = generate_key();
            store.set_sync_key(&key).await?;
            key
        }
    };

    let cipher = CredentialCipher::from_base64_key(&key)?;
    credential_store
        .save(credentials.protocol, cipher.seal(credentials)?)
        .await?;

    info!(protocol = %credentials.protocol, server = %credentials.server, "Stored sync credentials");
    Ok(())
}

/// Load and decrypt the credentials of the active protocol
pub async fn load_credentials<S, K>(store: &S, credential_store: &K) -> Result<Credentials, SyncError>
where
    S: LocalStore + ?Sized,
    K: CredentialStore + ?Sized,
{
    let Some(protocol) = credential_store.active_protocol().await? else {
        return Err(SyncError::NotLoggedIn);
    };
    let Some(sealed) = credential_store.load(protocol).await? else {
        return Err(SyncError::NotLoggedIn);
    };

    let Some(key) = store.sync_key().await? else {
        return Err(SyncError::MissingCipherKey);
    };

    // A blob that no longer opens under the stored key means the key was
    // replaced or damaged; either way the user has to log in again.
    CredentialCipher::from_base64_key(&key)
        .and_then(|cipher| cipher.open(protocol, &sealed))
        .map_err(|_| SyncError::MissingCipherKey)
}

/// Forget the credentials of the active protocol, returning which it was
pub async fn clear_credentials<K>(credential_store: &K) -> Result<Option<ProtocolKind>, CredentialError>
where
    K: CredentialStore + ?Sized,
{
    let active = credential_store.active_protocol().await?;
    if let Some(protocol) = active {
        credential_store.remove(protocol).await?;
        info!(%protocol, "Removed sync credentials");
    }
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::tempdir;

    fn gpodder() -> Credentials {
        Credentials::new(ProtocolKind::Gpodder, "https://gpodder.example.com", "alice", "secret")
    }

    #[test]
    fn cipher_round_trip_uses_fresh_nonces() {
        let cipher = CredentialCipher::from_base64_key(&generate_key()).unwrap();

        let first = cipher.encrypt("alice").unwrap();
        let second = cipher.encrypt("alice").unwrap();

        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first).unwrap(), "alice");
        assert_eq!(cipher.decrypt(&second).unwrap(), "alice");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let sealed = CredentialCipher::from_base64_key(&generate_key())
            .unwrap()
            .encrypt("alice")
            .unwrap();
        let other = CredentialCipher::from_base64_key(&generate_key()).unwrap();

        assert!(matches!(other.decrypt(&sealed), Err(CredentialError::Decrypt(_))));
    }

    #[test]
    fn short_keys_are_rejected() {
        let result = CredentialCipher::from_base64_key(&STANDARD.encode([1u8; 16]));
        assert!(matches!(result, Err(CredentialError::InvalidKey(_))));
        assert!(CredentialCipher::from_base64_key("%%%").is_err());
    }

    #[test]
    fn debug_output_hides_password() {
        let debug = format!("{:?}", gpodder());
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn basic_auth_header_encodes_user_and_password() {
        assert_eq!(gpodder().basic_auth_header(), "Basic YWxpY2U6c2VjcmV0");
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let creds = FileCredentialStore::in_dir(dir.path());

        store_credentials(&store, &creds, &gpodder()).await.unwrap();

        assert!(store.sync_key().await.unwrap().is_some());
        let on_disk = std::fs::read_to_string(dir.path().join("creds.json")).unwrap();
        assert!(!on_disk.contains("secret"));
        assert!(on_disk.contains("gpodder"));

        let loaded = load_credentials(&store, &creds).await.unwrap();
        assert_eq!(loaded, gpodder());
    }

    #[tokio::test]
    async fn interrupted_write_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let creds = FileCredentialStore::in_dir(dir.path());
        store_credentials(&store, &creds, &gpodder()).await.unwrap();
        assert!(!dir.path().join("creds.json.partial").exists());

        std::fs::create_dir(dir.path().join("creds.json.partial")).unwrap();
        let updated = Credentials::new(ProtocolKind::Gpodder, "https://gpodder.example.com", "alice", "new");
        let err = store_credentials(&store, &creds, &updated).await.unwrap_err();
        assert!(matches!(err, CredentialError::WriteFailed { .. }));

        assert_eq!(load_credentials(&store, &creds).await.unwrap(), gpodder());
    }

    #[tokio::test]
    async fn load_without_credentials_is_not_logged_in() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let creds = FileCredentialStore::in_dir(dir.path());

        let err = load_credentials(&store, &creds).await.unwrap_err();
        assert!(matches!(err, SyncError::NotLoggedIn));
    }

    #[tokio::test]
    async fn load_without_key_is_missing_cipher_key() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let creds = FileCredentialStore::in_dir(dir.path());
        store_credentials(&store, &creds, &gpodder()).await.unwrap();

        let fresh_store = MemoryStore::new();
        let err = load_credentials(&fresh_store, &creds).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingCipherKey));

        fresh_store.set_sync_key("not base64!").await.unwrap();
        let err = load_credentials(&fresh_store, &creds).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingCipherKey));
    }

    #[tokio::test]
    async fn second_protocol_requires_logout() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let creds = FileCredentialStore::in_dir(dir.path());
        store_credentials(&store, &creds, &gpodder()).await.unwrap();

        let nextcloud = Credentials::new(ProtocolKind::Nextcloud, "https://cloud.example.com", "bob", "pw");
        let err = store_credentials(&store, &creds, &nextcloud).await.unwrap_err();
        assert!(matches!(err, CredentialError::AlreadyLoggedIn(_)));

        assert_eq!(clear_credentials(&creds).await.unwrap(), Some(ProtocolKind::Gpodder));
        store_credentials(&store, &creds, &nextcloud).await.unwrap();
        assert_eq!(creds.active_protocol().await.unwrap(), Some(ProtocolKind::Nextcloud));
    }

    #[tokio::test]
    async fn relogin_to_same_protocol_replaces_entry() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let creds = FileCredentialStore::in_dir(dir.path());
        store_credentials(&store, &creds, &gpodder()).await.unwrap();

        let updated = Credentials::new(ProtocolKind::Gpodder, "https://gpodder.example.com", "alice", "new");
        store_credentials(&store, &creds, &updated).await.unwrap();

        assert_eq!(load_credentials(&store, &creds).await.unwrap().password, "new");
    }
}
