//! Encrypted credential vault
//!
//! A locked/unlocked KV store persisted as one blob: PBKDF2-HMAC-SHA256
//! derives the key from the operator password and a stored salt, AES-256-GCM
//! seals the serialized entries with a random nonce prepended. Reads while
//! locked fail with "vault locked" and are never cached; the derived key is
//! zeroed on lock.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::sync::Mutex;
use tracing::info;

use super::storage::{Store, StoreError, VaultBlob};

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault locked")]
    Locked,

    #[error("vault password incorrect")]
    BadPassword,

    #[error("vault crypto failure: {0}")]
    Crypto(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Inner {
    key: Option<[u8; KEY_LEN]>,
    salt: Vec<u8>,
    entries: HashMap<String, String>,
}

pub struct Vault {
    store: Arc<dyn Store>,
    inner: Mutex<Inner>,
}

impl Vault {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner {
                key: None,
                salt: Vec::new(),
                entries: HashMap::new(),
            }),
        }
    }

    fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).expect("iterations nonzero"),
            salt,
            password.as_bytes(),
            &mut key,
        );
        key
    }

    fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| VaultError::Crypto("bad key length".into()))?;
        let sealing = LessSafeKey::new(unbound);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| VaultError::Crypto("nonce generation failed".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| VaultError::Crypto("seal failed".into()))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn open(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>, VaultError> {
        if data.len() < NONCE_LEN {
            return Err(VaultError::Crypto("blob too short".into()));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| VaultError::Crypto("bad key length".into()))?;
        let opening = LessSafeKey::new(unbound);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&data[..NONCE_LEN]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = data[NONCE_LEN..].to_vec();
        let plaintext = opening
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| VaultError::BadPassword)?;
        Ok(plaintext.to_vec())
    }

    /// Unlock with the operator password. A fresh store gets a new salt and
    /// an empty entry set; an existing blob must decrypt or the password is
    /// rejected.
    pub async fn unlock(&self, password: &str) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().await;

        match self.store.get_vault_blob().await? {
            Some(blob) => {
                let salt = BASE64
                    .decode(&blob.salt_b64)
                    .map_err(|e| VaultError::Crypto(format!("bad salt encoding: {e}")))?;
                let data = BASE64
                    .decode(&blob.data_b64)
                    .map_err(|e| VaultError::Crypto(format!("bad blob encoding: {e}")))?;
                let key = Self::derive_key(password, &salt);
                let plaintext = Self::open(&key, &data)?;
                let entries: HashMap<String, String> = serde_json::from_slice(&plaintext)
                    .map_err(|e| VaultError::Crypto(format!("bad vault content: {e}")))?;
                inner.key = Some(key);
                inner.salt = salt;
                inner.entries = entries;
            }
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                SystemRandom::new()
                    .fill(&mut salt)
                    .map_err(|_| VaultError::Crypto("salt generation failed".into()))?;
                let key = Self::derive_key(password, &salt);
                inner.key = Some(key);
                inner.salt = salt;
                inner.entries = HashMap::new();
                Self::persist(&self.store, &inner).await?;
            }
        }
        info!(entries = inner.entries.len(), "vault unlocked");
        Ok(())
    }

    /// Lock the vault and zero the derived key.
    pub async fn lock(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(key) = inner.key.as_mut() {
            key.iter_mut().for_each(|b| *b = 0);
        }
        inner.key = None;
        inner.entries.clear();
        info!("vault locked");
    }

    pub async fn is_unlocked(&self) -> bool {
        self.inner.lock().await.key.is_some()
    }

    pub async fn get(&self, name: &str) -> Result<Option<String>, VaultError> {
        let inner = self.inner.lock().await;
        if inner.key.is_none() {
            return Err(VaultError::Locked);
        }
        Ok(inner.entries.get(name).cloned())
    }

    pub async fn put(&self, name: &str, value: &str) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().await;
        if inner.key.is_none() {
            return Err(VaultError::Locked);
        }
        inner.entries.insert(name.to_string(), value.to_string());
        Self::persist(&self.store, &inner).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().await;
        if inner.key.is_none() {
            return Err(VaultError::Locked);
        }
        inner.entries.remove(name);
        Self::persist(&self.store, &inner).await
    }

    /// Snapshot of the unlocked content.
    pub async fn export(&self) -> Result<HashMap<String, String>, VaultError> {
        let inner = self.inner.lock().await;
        if inner.key.is_none() {
            return Err(VaultError::Locked);
        }
        Ok(inner.entries.clone())
    }

    /// Replace the unlocked content; `import(export())` is the identity.
    pub async fn import(&self, entries: HashMap<String, String>) -> Result<(), VaultError> {
        let mut inner = self.inner.lock().await;
        if inner.key.is_none() {
            return Err(VaultError::Locked);
        }
        inner.entries = entries;
        Self::persist(&self.store, &inner).await
    }

    async fn persist(store: &Arc<dyn Store>, inner: &Inner) -> Result<(), VaultError> {
        let key = inner.key.as_ref().ok_or(VaultError::Locked)?;
        let plaintext = serde_json::to_vec(&inner.entries)
            .map_err(|e| VaultError::Crypto(format!("serialize failed: {e}")))?;
        let sealed = Self::seal(key, &plaintext)?;
        store
            .put_vault_blob(&VaultBlob {
                salt_b64: BASE64.encode(&inner.salt),
                data_b64: BASE64.encode(sealed),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sqlite_storage::SqliteStore;

    async fn vault() -> Vault {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        Vault::new(store)
    }

    #[tokio::test]
    async fn locked_reads_fail() {
        let vault = vault().await;
        let err = vault.get("anything").await.unwrap_err();
        assert_eq!(err.to_string(), "vault locked");
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let vault = vault().await;
        vault.unlock("hunter2").await.unwrap();
        vault.put("provider:openai", "sk-test").await.unwrap();

        assert_eq!(
            vault.get("provider:openai").await.unwrap().as_deref(),
            Some("sk-test")
        );

        // Re-unlock from the persisted blob.
        vault.lock().await;
        assert!(vault.get("provider:openai").await.is_err());
        vault.unlock("hunter2").await.unwrap();
        assert_eq!(
            vault.get("provider:openai").await.unwrap().as_deref(),
            Some("sk-test")
        );
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let vault = vault().await;
        vault.unlock("correct").await.unwrap();
        vault.put("k", "v").await.unwrap();
        vault.lock().await;

        let err = vault.unlock("wrong").await.unwrap_err();
        assert!(matches!(err, VaultError::BadPassword));
        assert!(!vault.is_unlocked().await);
    }

    #[tokio::test]
    async fn export_import_is_identity() {
        let vault = vault().await;
        vault.unlock("pw").await.unwrap();
        vault.put("a", "1").await.unwrap();
        vault.put("b", "2").await.unwrap();

        let exported = vault.export().await.unwrap();
        vault.import(exported.clone()).await.unwrap();
        assert_eq!(vault.export().await.unwrap(), exported);
    }
}
