//! Delivery ledger for deduplicating re-delivered events.
//!
//! Bus delivery is at-least-once. Each processed delivery is recorded under
//! a key derived from the run, the status it carried and the stage it
//! triggered, together with a hash of its normalized content. A later
//! delivery with the same key and the same content is a duplicate; the same
//! key with different content is new work (e.g. a re-draft after a failed
//! validation).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A recorded delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Hash of the normalized delivery content.
    pub content_hash: String,
    /// Unix timestamp when the entry was recorded.
    pub recorded_at: f64,
    /// Unix timestamp when the entry expires.
    pub expires_at: Option<f64>,
}

impl LedgerEntry {
    /// Creates an entry recorded now.
    #[must_use]
    pub fn new(content_hash: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            recorded_at: unix_now(),
            expires_at: None,
        }
    }

    /// Sets the retention.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.recorded_at + ttl.as_secs_f64());
        self
    }

    /// Returns true if the entry has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| unix_now() >= expires_at)
    }
}

/// Storage backend for the ledger.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Gets an unexpired entry by key.
    async fn get(&self, key: &str) -> Option<LedgerEntry>;

    /// Records an entry, replacing any previous one.
    async fn record(&self, key: &str, entry: LedgerEntry);

    /// Removes an entry.
    async fn forget(&self, key: &str);

    /// Clears all entries.
    async fn clear(&self);
}

/// In-memory ledger.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryLedger {
    entries: Arc<Mutex<HashMap<String, LedgerEntry>>>,
}

impl InMemoryDeliveryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryDeliveryLedger {
    async fn get(&self, key: &str) -> Option<LedgerEntry> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(LedgerEntry::is_expired) {
            entries.remove(key);
            return None;
        }
        entries.get(key).cloned()
    }

    async fn record(&self, key: &str, entry: LedgerEntry) {
        self.entries.lock().insert(key.to_string(), entry);
    }

    async fn forget(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    async fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Derives the ledger key of a delivery.
#[must_use]
pub fn delivery_key(portal_run_id: &str, status: &str, stage: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(portal_run_id.as_bytes());
    hasher.update(b"|");
    hasher.update(status.as_bytes());
    hasher.update(b"|");
    hasher.update(stage.as_bytes());
    format!("delivery:{}", hex::encode(&hasher.finalize()[..16]))
}

/// Hashes normalized delivery content.
///
/// `serde_json` maps are ordered, so equal values hash equally regardless
/// of the key order they arrived in.
#[must_use]
pub fn hash_content(content: &serde_json::Value) -> String {
    let json = serde_json::to_string(content).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Result of a ledger check.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryCheck {
    /// Never seen; process.
    New,
    /// Same key with different content; process.
    ContentChanged {
        /// Hash recorded for the earlier delivery.
        previous_hash: String,
    },
    /// Same key and content; drop.
    Duplicate(LedgerEntry),
}

impl DeliveryCheck {
    /// Returns true if the delivery should be dropped.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Checks a delivery against the ledger.
pub async fn check_delivery(ledger: &dyn DeliveryLedger, key: &str, content_hash: &str) -> DeliveryCheck {
    match ledger.get(key).await {
        None => DeliveryCheck::New,
        Some(entry) if entry.content_hash == content_hash => DeliveryCheck::Duplicate(entry),
        Some(entry) => DeliveryCheck::ContentChanged {
            previous_hash: entry.content_hash,
        },
    }
}
