//! Encrypted per-mailbox credential persistence

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crypto::TokenCipher;
use crate::error::Result;
use crate::models::CredentialRecord;
use crate::store::KvStore;

pub const CREDENTIAL_KEY_PREFIX: &str = "gmail:credentials:";

/// Default retention window; every save resets it
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Secret-free view of one stored credential
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub email: String,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: Option<bool>,
}

impl CredentialSummary {
    pub fn describe(email: &str, record: &CredentialRecord, now: DateTime<Utc>) -> Self {
        Self {
            email: email.to_string(),
            has_access_token: !record.access_token.is_empty(),
            has_refresh_token: !record.refresh_token.is_empty(),
            expires_at: record
                .expires_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            is_expired: record.is_expired_at(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialOverview {
    pub credentials_found: usize,
    pub credentials: Vec<CredentialSummary>,
}

#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KvStore>,
    cipher: TokenCipher,
    ttl: Duration,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KvStore>, cipher: TokenCipher) -> Self {
        Self::with_ttl(store, cipher, DEFAULT_CREDENTIAL_TTL)
    }

    pub fn with_ttl(store: Arc<dyn KvStore>, cipher: TokenCipher, ttl: Duration) -> Self {
        Self { store, cipher, ttl }
    }

    pub fn key(email: &str) -> String {
        format!("{}{}", CREDENTIAL_KEY_PREFIX, email)
    }

    /// Encrypt and persist, resetting the retention window
    pub async fn save(&self, email: &str, record: &CredentialRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let encrypted = self.cipher.encrypt(&json)?;
        self.store.set_ex(&Self::key(email), &encrypted, self.ttl).await?;
        debug!("Saved credentials for {}", email);
        Ok(())
    }

    /// Records failing decryption or parsing are logged and treated as absent
    pub async fn get(&self, email: &str) -> Result<Option<CredentialRecord>> {
        let Some(raw) = self.store.get(&Self::key(email)).await? else {
            return Ok(None);
        };
        Ok(self.open(email, &raw))
    }

    /// Every mailbox with a readable credential; unreadable records are skipped
    pub async fn list_all(&self) -> Result<Vec<(String, CredentialRecord)>> {
        let keys = self.store.keys_with_prefix(CREDENTIAL_KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            let email = key.trim_start_matches(CREDENTIAL_KEY_PREFIX).to_string();
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                // Expired between the scan and the read
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read credentials for {}: {}", email, e);
                    continue;
                }
            };
            if let Some(record) = self.open(&email, &raw) {
                records.push((email, record));
            }
        }

        debug!("Loaded {} stored credentials", records.len());
        Ok(records)
    }

    /// Introspection of every readable credential, without secrets
    pub async fn overview(&self) -> Result<CredentialOverview> {
        let now = Utc::now();
        let credentials: Vec<CredentialSummary> = self
            .list_all()
            .await?
            .iter()
            .map(|(email, record)| CredentialSummary::describe(email, record, now))
            .collect();
        Ok(CredentialOverview {
            credentials_found: credentials.len(),
            credentials,
        })
    }

    fn open(&self, email: &str, raw: &str) -> Option<CredentialRecord> {
        let json = match self.cipher.decrypt(raw) {
            Ok(json) => json,
            Err(e) => {
                warn!("Discarding credentials for {}: {}", email, e);
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Discarding malformed credentials for {}: {}", email, e);
                None
            }
        }
    }
}
