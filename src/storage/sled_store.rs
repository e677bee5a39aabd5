//! Sled-backed storage for blobs, document records, users and usage rows.
//!
//! One database holds four trees:
//! - `objects`: raw blobs addressed by storage key
//! - `documents`: bincode [`DocumentRecord`]s keyed by document id
//! - `users`: bincode [`UserRecord`]s keyed by uid
//! - `usage`: bincode [`StorageUsage`] rows keyed by uid

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use super::{
    DocumentPatch, DocumentRecord, DocumentRepository, ObjectStat, ObjectStore, StorageConfig,
    StorageError, StorageResult, StorageUsage, UserRecord,
};

/// Tree names for different data types
const TREE_OBJECTS: &str = "objects";
const TREE_DOCUMENTS: &str = "documents";
const TREE_USERS: &str = "users";
const TREE_USAGE: &str = "usage";

/// Sled-based implementation of [`ObjectStore`] and [`DocumentRepository`]
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    objects: Tree,
    documents: Tree,
    users: Tree,
    usage: Tree,
}

impl SledStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        Self::from_db(db)
    }

    /// Open a throwaway in-memory store
    pub fn temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let objects = db.open_tree(TREE_OBJECTS)?;
        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let users = db.open_tree(TREE_USERS)?;
        let usage = db.open_tree(TREE_USAGE)?;

        Ok(Self {
            db: Arc::new(db),
            objects,
            documents,
            users,
            usage,
        })
    }

    /// Provision a document record. The gateway itself never creates records.
    pub fn insert_document(&self, record: &DocumentRecord) -> StorageResult<()> {
        let bytes = bincode::serialize(record)?;
        let previous = self.documents.compare_and_swap(
            record.document_id.as_bytes(),
            None as Option<&[u8]>,
            Some(bytes),
        )?;
        previous.map_err(|_| StorageError::AlreadyExists(record.document_id.clone()))
    }

    /// Mark a document as deleted without removing its blobs
    pub fn soft_delete_document(&self, document_id: &str) -> StorageResult<()> {
        let mut record = self
            .load_record(document_id)?
            .ok_or_else(|| StorageError::DocumentNotFound(document_id.to_string()))?;
        record.deleted_at = Some(chrono::Utc::now().timestamp_millis());
        self.documents
            .insert(document_id.as_bytes(), bincode::serialize(&record)?)?;
        Ok(())
    }

    /// Read a record regardless of its deletion state
    pub fn load_record(&self, document_id: &str) -> StorageResult<Option<DocumentRecord>> {
        match self.documents.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn insert_user(&self, user: &UserRecord) -> StorageResult<()> {
        self.users
            .insert(user.uid.as_bytes(), bincode::serialize(user)?)?;
        Ok(())
    }

    pub fn remove_user(&self, uid: &str) -> StorageResult<()> {
        self.users.remove(uid.as_bytes())?;
        Ok(())
    }

    pub fn save_usage(&self, usage: &StorageUsage) -> StorageResult<()> {
        self.usage
            .insert(usage.uid.as_bytes(), bincode::serialize(usage)?)?;
        Ok(())
    }

    pub fn get_usage(&self, uid: &str) -> StorageResult<Option<StorageUsage>> {
        match self.usage.get(uid.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            object_count: self.objects.len(),
            document_count: self.documents.len(),
            user_count: self.users.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

#[async_trait]
impl ObjectStore for SledStore {
    async fn fetch(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.objects.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn store(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        self.objects.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<ObjectStat> {
        match self.objects.get(key.as_bytes())? {
            Some(value) => Ok(ObjectStat {
                size: value.len() as u64,
            }),
            None => Err(StorageError::ObjectNotFound(key.to_string())),
        }
    }
}

#[async_trait]
impl DocumentRepository for SledStore {
    async fn find_document(&self, document_id: &str) -> StorageResult<Option<DocumentRecord>> {
        Ok(self.load_record(document_id)?.filter(|r| !r.is_deleted()))
    }

    async fn find_user(&self, uid: &str) -> StorageResult<Option<UserRecord>> {
        match self.users.get(uid.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_document(
        &self,
        document_id: &str,
        patch: &DocumentPatch,
    ) -> StorageResult<DocumentRecord> {
        let key = document_id.as_bytes();

        // Read-modify-CAS so a concurrent writer never loses fields
        loop {
            let current = self
                .documents
                .get(key)?
                .ok_or_else(|| StorageError::DocumentNotFound(document_id.to_string()))?;
            let mut record: DocumentRecord = bincode::deserialize(&current)?;
            if record.is_deleted() {
                return Err(StorageError::DocumentNotFound(document_id.to_string()));
            }
            record.apply(patch);

            let next = bincode::serialize(&record)?;
            if self
                .documents
                .compare_and_swap(key, Some(current), Some(next))?
                .is_ok()
            {
                return Ok(record);
            }
        }
    }

    async fn list_owned(&self, owner_id: &str) -> StorageResult<Vec<DocumentRecord>> {
        let mut records = Vec::new();
        for item in self.documents.iter() {
            let (_, value) = item?;
            let record: DocumentRecord = bincode::deserialize(&value)?;
            if record.owner_id == owner_id && !record.is_deleted() {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub object_count: usize,
    pub document_count: usize,
    pub user_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for SledStore {
    fn drop(&mut self) {
        // Only the last handle flushes; clones share the same Db
        if Arc::strong_count(&self.db) == 1 {
            let _ = self.db.flush();
        }
    }
}
