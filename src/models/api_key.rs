//! Persisted API-key records
//!
//! The plaintext key (`tokenhub_` + 64 hex chars) is shown exactly once at
//! generation time and never persisted. What the store keeps is a bcrypt hash
//! of the SHA-256 of the plaintext, plus the 17-char display prefix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted API key. `key_hash` is bcrypt(SHA-256(plaintext)).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// First 16 hex chars of the key's random bytes.
    pub id: String,
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    /// `tokenhub_` + first 8 hex chars; safe to display.
    pub prefix: String,
    pub name: String,
    /// JSON array of scope strings; empty or `[]` means allow-all.
    pub scopes: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// 0 disables automatic rotation enforcement.
    pub rotation_days: i64,
    /// 0 means unlimited.
    pub monthly_budget_usd: f64,
    /// -1 unlimited, 0 global default, N requests/second.
    pub rps_override: i32,
    pub enabled: bool,
}

impl ApiKeyRecord {
    /// Parsed scope list; `None` means allow-all.
    pub fn scope_list(&self) -> Option<Vec<String>> {
        if self.scopes.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<Vec<String>>(&self.scopes) {
            Ok(list) if list.is_empty() => None,
            Ok(list) => Some(list),
            // A malformed scopes string denies everything rather than
            // silently widening access.
            Err(_) => Some(Vec::new()),
        }
    }

    /// Whether the key grants `scope`.
    pub fn allows_scope(&self, scope: &str) -> bool {
        match self.scope_list() {
            None => true,
            Some(list) => list.iter().any(|s| s == scope),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at < now)
    }

    /// Whether the rotation interval has elapsed.
    pub fn rotation_due(&self, now: DateTime<Utc>) -> bool {
        self.rotation_days > 0
            && self.created_at + chrono::Duration::days(self.rotation_days) < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(scopes: &str) -> ApiKeyRecord {
        ApiKeyRecord {
            id: "0123456789abcdef".into(),
            key_hash: "$2b$10$hash".into(),
            prefix: "tokenhub_01234567".into(),
            name: "test".into(),
            scopes: scopes.into(),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: None,
            rotation_days: 0,
            monthly_budget_usd: 0.0,
            rps_override: 0,
            enabled: true,
        }
    }

    #[test]
    fn empty_scopes_allow_all() {
        assert!(record("").allows_scope("chat"));
        assert!(record("[]").allows_scope("plan"));
    }

    #[test]
    fn scoped_key_denies_other_scopes() {
        let k = record(r#"["plan"]"#);
        assert!(k.allows_scope("plan"));
        assert!(!k.allows_scope("chat"));
    }

    #[test]
    fn malformed_scopes_deny() {
        assert!(!record("not json").allows_scope("chat"));
    }

    #[test]
    fn rotation_due_after_interval() {
        let mut k = record("");
        k.rotation_days = 30;
        k.created_at = Utc::now() - chrono::Duration::days(31);
        assert!(k.rotation_due(Utc::now()));
        k.created_at = Utc::now() - chrono::Duration::days(29);
        assert!(!k.rotation_due(Utc::now()));
    }
}
