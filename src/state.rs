//! Processed-message markers
//!
//! A marker per (mailbox, message id) records that classification and label
//! reconciliation already happened. While the marker lives the pipeline skips
//! the message entirely, even when the provider returns it again.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::store::KvStore;

pub const DEFAULT_PROCESSED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone)]
pub struct ProcessedSet {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ProcessedSet {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_ttl(store, DEFAULT_PROCESSED_TTL)
    }

    pub fn with_ttl(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn key(mailbox: &str, message_id: &str) -> String {
        format!("processed:{}:{}", mailbox, message_id)
    }

    pub async fn is_processed(&self, mailbox: &str, message_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get(&Self::key(mailbox, message_id))
            .await?
            .is_some())
    }

    pub async fn mark_processed(&self, mailbox: &str, message_id: &str) -> Result<()> {
        self.store
            .set_ex(&Self::key(mailbox, message_id), "1", self.ttl)
            .await?;
        debug!("Marked {} processed for {}", message_id, mailbox);
        Ok(())
    }
}
