//! Per-user storage accounting.
//!
//! After every flush the owner's aggregate consumption is recomputed from the
//! document records and written as a single usage row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::storage::{DocumentRepository, SledStore, StorageResult, StorageUsage};

#[async_trait]
pub trait UsageAccountant: Send + Sync {
    /// Recompute and persist the owner's totals as of `timestamp`
    async fn recompute(&self, owner_id: &str, timestamp: DateTime<Utc>) -> StorageResult<StorageUsage>;
}

/// Sums sizes across the owner's live documents in a [`SledStore`]
pub struct StoreUsageAccountant {
    store: Arc<SledStore>,
}

impl StoreUsageAccountant {
    pub fn new(store: Arc<SledStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UsageAccountant for StoreUsageAccountant {
    async fn recompute(&self, owner_id: &str, timestamp: DateTime<Utc>) -> StorageResult<StorageUsage> {
        let documents = self.store.list_owned(owner_id).await?;

        let usage = StorageUsage {
            uid: owner_id.to_string(),
            object_storage_bytes: documents.iter().map(|d| d.storage_size).sum(),
            vector_storage_bytes: documents.iter().map(|d| d.vector_size).sum(),
            document_count: documents.len() as u64,
            synced_at: timestamp.timestamp_millis(),
        };
        self.store.save_usage(&usage)?;

        debug!(
            "Usage for {}: {} object bytes, {} vector bytes",
            owner_id, usage.object_storage_bytes, usage.vector_storage_bytes
        );
        Ok(usage)
    }
}
