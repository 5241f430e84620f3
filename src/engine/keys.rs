//! API-key issuance and validation
//!
//! Keys look like `tokenhub_` + 64 hex chars (32 random bytes). The store
//! keeps bcrypt(SHA-256(plaintext)) and a short display prefix; the
//! plaintext is returned exactly once at generation or rotation time.
//!
//! Validation bcrypt-compares against enabled records, with a short-lived
//! in-memory cache keyed on the plaintext so the hot path skips bcrypt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::models::{ApiKeyRecord, AuditLogEntry};

use super::events::{Event, EventBus, EventKind};
use super::storage::{Store, StoreError, WriteJob, WriteQueue};

pub const KEY_PREFIX: &str = "tokenhub_";
const KEY_HEX_LEN: usize = 64;
const PREFIX_HEX_LEN: usize = 8;
const ID_HEX_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid api key")]
    Invalid,

    #[error("api key expired")]
    Expired,

    #[error("api key not found")]
    NotFound,

    #[error("hashing failed: {0}")]
    Hash(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters for a new key.
#[derive(Debug, Clone, Default)]
pub struct NewKey {
    pub name: String,
    pub scopes: Vec<String>,
    pub rotation_days: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub monthly_budget_usd: f64,
    pub rps_override: i32,
}

struct CachedKey {
    record: ApiKeyRecord,
    inserted_at: Instant,
}

pub struct ApiKeyManager {
    store: Arc<dyn Store>,
    queue: Arc<WriteQueue>,
    cache: DashMap<String, CachedKey>,
    cache_ttl: Duration,
    bcrypt_cost: u32,
}

impl ApiKeyManager {
    pub const CACHE_TTL: Duration = Duration::from_secs(300);
    pub const BCRYPT_COST: u32 = 10;

    pub fn new(store: Arc<dyn Store>, queue: Arc<WriteQueue>) -> Self {
        Self {
            store,
            queue,
            cache: DashMap::new(),
            cache_ttl: Self::CACHE_TTL,
            bcrypt_cost: Self::BCRYPT_COST,
        }
    }

    /// Lower the bcrypt cost; tests use this to stay fast.
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    fn hash_preimage(plaintext: &str) -> String {
        let digest = Sha256::digest(plaintext.as_bytes());
        hex_encode(&digest)
    }

    /// Issue a new key. Returns the plaintext (shown exactly once) and the
    /// persisted record.
    pub async fn generate(&self, params: NewKey) -> Result<(String, ApiKeyRecord), KeyError> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex = hex_encode(&bytes);
        debug_assert_eq!(hex.len(), KEY_HEX_LEN);

        let plaintext = format!("{KEY_PREFIX}{hex}");
        let key_hash = bcrypt::hash(Self::hash_preimage(&plaintext), self.bcrypt_cost)
            .map_err(|e| KeyError::Hash(e.to_string()))?;

        let record = ApiKeyRecord {
            id: hex[..ID_HEX_LEN].to_string(),
            key_hash,
            prefix: format!("{KEY_PREFIX}{}", &hex[..PREFIX_HEX_LEN]),
            name: params.name,
            scopes: serde_json::to_string(&params.scopes).unwrap_or_else(|_| "[]".into()),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: params.expires_at,
            rotation_days: params.rotation_days,
            monthly_budget_usd: params.monthly_budget_usd,
            rps_override: params.rps_override,
            enabled: true,
        };
        self.store.insert_api_key(&record).await?;
        self.queue.enqueue(WriteJob::Audit(AuditLogEntry::new(
            "system",
            "api_key.generate",
            format!("id={} name={}", record.id, record.name),
        )));
        info!(key_id = %record.id, name = %record.name, "api key issued");
        Ok((plaintext, record))
    }

    /// Validate a bearer token. Hot path is a cache hit on the plaintext;
    /// misses walk enabled records and bcrypt-compare.
    pub async fn validate(&self, token: &str) -> Result<ApiKeyRecord, KeyError> {
        if !token.starts_with(KEY_PREFIX) || token.len() != KEY_PREFIX.len() + KEY_HEX_LEN {
            return Err(KeyError::Invalid);
        }

        let now = Utc::now();
        if let Some(cached) = self.cache.get(token) {
            if cached.inserted_at.elapsed() < self.cache_ttl {
                if cached.record.is_expired(now) {
                    return Err(KeyError::Expired);
                }
                return Ok(cached.record.clone());
            }
            drop(cached);
            self.cache.remove(token);
        }

        let preimage = Self::hash_preimage(token);
        let display_prefix = &token[..KEY_PREFIX.len() + PREFIX_HEX_LEN];
        let keys = self.store.list_api_keys(true).await?;
        for record in keys {
            // The display prefix is derived from the plaintext, so records
            // with a different prefix can never verify.
            if record.prefix != display_prefix {
                continue;
            }
            match bcrypt::verify(&preimage, &record.key_hash) {
                Ok(true) => {
                    if record.is_expired(now) {
                        return Err(KeyError::Expired);
                    }
                    self.queue.enqueue(WriteJob::TouchKey {
                        id: record.id.clone(),
                        at: now,
                    });
                    self.cache.insert(
                        token.to_string(),
                        CachedKey {
                            record: record.clone(),
                            inserted_at: Instant::now(),
                        },
                    );
                    return Ok(record);
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(key_id = %record.id, error = %e, "bcrypt verify failed");
                    continue;
                }
            }
        }
        Err(KeyError::Invalid)
    }

    /// Replace a key's secret. The record id is stable; hash and prefix
    /// change, and any cached entries for the old plaintext are dropped.
    pub async fn rotate(&self, id: &str) -> Result<String, KeyError> {
        let mut record = self.store.get_api_key(id).await?.ok_or(KeyError::NotFound)?;

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex = hex_encode(&bytes);
        let plaintext = format!("{KEY_PREFIX}{hex}");

        record.key_hash = bcrypt::hash(Self::hash_preimage(&plaintext), self.bcrypt_cost)
            .map_err(|e| KeyError::Hash(e.to_string()))?;
        record.prefix = format!("{KEY_PREFIX}{}", &hex[..PREFIX_HEX_LEN]);
        record.created_at = Utc::now();
        self.store.update_api_key(&record).await?;

        self.invalidate_record(id);
        self.queue.enqueue(WriteJob::Audit(AuditLogEntry::new(
            "system",
            "api_key.rotate",
            format!("id={id}"),
        )));
        info!(key_id = %id, "api key rotated");
        Ok(plaintext)
    }

    /// Disable every enabled key whose rotation interval has elapsed.
    /// Returns how many were disabled.
    pub async fn enforce_rotation(&self, bus: &EventBus) -> Result<usize, KeyError> {
        let now = Utc::now();
        let keys = self.store.list_api_keys(true).await?;
        let mut disabled = 0usize;

        for mut record in keys {
            if !record.rotation_due(now) {
                continue;
            }
            record.enabled = false;
            self.store.update_api_key(&record).await?;
            self.invalidate_record(&record.id);
            bus.publish(Event::new(
                EventKind::KeyRotationExpired,
                serde_json::json!({
                    "key_id": record.id,
                    "name": record.name,
                    "rotation_days": record.rotation_days,
                }),
            ));
            self.queue.enqueue(WriteJob::Audit(AuditLogEntry::new(
                "system",
                "api_key.rotation_expired",
                format!("id={} rotation_days={}", record.id, record.rotation_days),
            )));
            warn!(key_id = %record.id, "api key disabled: rotation interval elapsed");
            disabled += 1;
        }
        Ok(disabled)
    }

    fn invalidate_record(&self, id: &str) {
        self.cache.retain(|_, cached| cached.record.id != id);
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sqlite_storage::SqliteStore;

    async fn manager() -> (ApiKeyManager, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.migrate().await.unwrap();
        let queue = WriteQueue::new(64);
        let manager = ApiKeyManager::new(store.clone(), queue).with_bcrypt_cost(4);
        (manager, store)
    }

    #[tokio::test]
    async fn issued_plaintext_validates_to_originating_record() {
        let (manager, _) = manager().await;
        let (plaintext, record) = manager
            .generate(NewKey {
                name: "ci".into(),
                scopes: vec!["chat".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(plaintext.starts_with(KEY_PREFIX));
        assert_eq!(plaintext.len(), KEY_PREFIX.len() + 64);
        assert_eq!(record.prefix, &plaintext[..17]);

        let validated = manager.validate(&plaintext).await.unwrap();
        assert_eq!(validated.id, record.id);

        // Cached second validation returns the same record.
        let validated = manager.validate(&plaintext).await.unwrap();
        assert_eq!(validated.id, record.id);
    }

    #[tokio::test]
    async fn unissued_strings_fail_with_invalid() {
        let (manager, _) = manager().await;
        manager
            .generate(NewKey {
                name: "ci".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = manager.validate("not-a-key").await.unwrap_err();
        assert!(matches!(err, KeyError::Invalid));

        let fake = format!("{KEY_PREFIX}{}", "a".repeat(64));
        let err = manager.validate(&fake).await.unwrap_err();
        assert!(matches!(err, KeyError::Invalid));
    }

    #[tokio::test]
    async fn expired_key_fails_validation() {
        let (manager, store) = manager().await;
        let (plaintext, mut record) = manager
            .generate(NewKey {
                name: "ci".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        record.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.update_api_key(&record).await.unwrap();

        let err = manager.validate(&plaintext).await.unwrap_err();
        assert!(matches!(err, KeyError::Expired));
    }

    #[tokio::test]
    async fn rotate_invalidates_old_plaintext() {
        let (manager, _) = manager().await;
        let (old_plaintext, record) = manager
            .generate(NewKey {
                name: "ci".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        // Prime the cache, then rotate.
        manager.validate(&old_plaintext).await.unwrap();
        let new_plaintext = manager.rotate(&record.id).await.unwrap();
        assert_ne!(old_plaintext, new_plaintext);

        assert!(matches!(
            manager.validate(&old_plaintext).await.unwrap_err(),
            KeyError::Invalid
        ));
        let validated = manager.validate(&new_plaintext).await.unwrap();
        assert_eq!(validated.id, record.id);
    }

    #[tokio::test]
    async fn enforce_rotation_disables_overdue_keys() {
        let (manager, store) = manager().await;
        let (_, mut record) = manager
            .generate(NewKey {
                name: "stale".into(),
                rotation_days: 7,
                ..Default::default()
            })
            .await
            .unwrap();
        record.created_at = Utc::now() - chrono::Duration::days(8);
        store.update_api_key(&record).await.unwrap();

        manager
            .generate(NewKey {
                name: "fresh".into(),
                rotation_days: 7,
                ..Default::default()
            })
            .await
            .unwrap();

        let bus = EventBus::new();
        let mut sub = bus.subscribe(4);
        let disabled = manager.enforce_rotation(&bus).await.unwrap();
        assert_eq!(disabled, 1);

        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::KeyRotationExpired);
        assert_eq!(event.detail["key_id"], serde_json::json!(record.id));

        let stored = store.get_api_key(&record.id).await.unwrap().unwrap();
        assert!(!stored.enabled);
    }
}
