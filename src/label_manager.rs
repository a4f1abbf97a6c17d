//! Label map caching and management-label creation
//!
//! The name↔id map for a mailbox is cached in the key-value store for an hour
//! and invalidated whenever a label is created.
//!
//! Known race: `ensure_labels_exist` creates missing labels concurrently and
//! takes no lock. Two invocations that both observe a label as missing will
//! both create it, so the label can exist twice under the same display name.
//! Creation is therefore at-least-once; lookups resolve to whichever copy the
//! provider lists first.

use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{GmailClient, LabelInfo};
use crate::error::{Result, TriageError};
use crate::models::EmailLabel;
use crate::store::KvStore;

pub const DEFAULT_LABEL_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Bidirectional label mapping for one mailbox.
/// Name keys are stored lowercase since Gmail label names are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    by_id: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl LabelMap {
    pub fn from_labels(labels: &[LabelInfo]) -> Self {
        let mut map = Self::default();
        for label in labels {
            map.insert(&label.id, &label.name);
        }
        map
    }

    fn insert(&mut self, id: &str, name: &str) {
        self.by_id.insert(id.to_string(), name.to_string());
        // First listed copy wins when duplicates exist
        self.by_name
            .entry(name.to_lowercase())
            .or_insert_with(|| id.to_string());
    }

    pub fn id_for(&self, name: &str) -> Option<&str> {
        self.by_name.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn name_for(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(String::as_str)
    }

    /// Attach display names to label IDs; unknown IDs keep the ID as name
    pub fn resolve(&self, labels: &[EmailLabel]) -> Vec<EmailLabel> {
        labels
            .iter()
            .map(|label| EmailLabel {
                id: label.id.clone(),
                name: self.name_for(&label.id).unwrap_or(&label.id).to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn to_labels(&self) -> Vec<LabelInfo> {
        let mut labels: Vec<LabelInfo> = self
            .by_id
            .iter()
            .map(|(id, name)| LabelInfo {
                id: id.clone(),
                name: name.clone(),
            })
            .collect();
        labels.sort_by(|a, b| a.id.cmp(&b.id));
        labels
    }
}

/// Manages the label cache and label creation for one mailbox
pub struct LabelManager {
    client: Arc<dyn GmailClient>,
    store: Arc<dyn KvStore>,
    mailbox: String,
    ttl: Duration,
}

impl LabelManager {
    pub fn new(client: Arc<dyn GmailClient>, store: Arc<dyn KvStore>, mailbox: &str) -> Self {
        Self::with_ttl(client, store, mailbox, DEFAULT_LABEL_CACHE_TTL)
    }

    pub fn with_ttl(
        client: Arc<dyn GmailClient>,
        store: Arc<dyn KvStore>,
        mailbox: &str,
        ttl: Duration,
    ) -> Self {
        Self {
            client,
            store,
            mailbox: mailbox.to_string(),
            ttl,
        }
    }

    pub fn cache_key(mailbox: &str) -> String {
        format!("gmail-labels:{}", mailbox)
    }

    /// Load the label map, from cache when fresh, otherwise from the provider
    pub async fn label_map(&self) -> Result<LabelMap> {
        let key = Self::cache_key(&self.mailbox);

        if let Some(cached) = self.store.get(&key).await? {
            match serde_json::from_str::<Vec<LabelInfo>>(&cached) {
                Ok(labels) => {
                    debug!("Label cache hit for {} ({} labels)", self.mailbox, labels.len());
                    return Ok(LabelMap::from_labels(&labels));
                }
                Err(e) => warn!("Ignoring corrupt label cache for {}: {}", self.mailbox, e),
            }
        }

        let labels = self.client.list_labels().await?;
        let map = LabelMap::from_labels(&labels);
        self.store
            .set_ex(&key, &serde_json::to_string(&map.to_labels())?, self.ttl)
            .await?;

        info!("Loaded {} labels for {}", map.len(), self.mailbox);
        Ok(map)
    }

    /// Drop the cached map so the next lookup sees newly created labels
    pub async fn invalidate(&self) -> Result<()> {
        self.store.del(&Self::cache_key(&self.mailbox)).await
    }

    /// Resolve each name to a label ID, creating the missing ones.
    ///
    /// Returns a name → id map covering every requested name.
    pub async fn ensure_labels_exist(&self, names: &[String]) -> Result<HashMap<String, String>> {
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(TriageError::ConfigError(
                "label names must not be empty".to_string(),
            ));
        }

        let map = self.label_map().await?;
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();

        for name in names {
            match map.id_for(name) {
                Some(id) => {
                    resolved.insert(name.clone(), id.to_string());
                }
                None => missing.push(name.clone()),
            }
        }

        if missing.is_empty() {
            return Ok(resolved);
        }

        info!("Creating labels {:?} for {}", missing, self.mailbox);
        let created = try_join_all(missing.iter().map(|name| async move {
            let id = self.client.create_label(name).await?;
            Ok::<_, TriageError>((name.clone(), id))
        }))
        .await;

        // Invalidate even on partial failure: some creations may have landed
        self.invalidate().await?;

        resolved.extend(created?);
        Ok(resolved)
    }

    /// Resolve label names through the cached map
    pub async fn resolve(&self, labels: &[EmailLabel]) -> Result<Vec<EmailLabel>> {
        Ok(self.label_map().await?.resolve(labels))
    }
}
