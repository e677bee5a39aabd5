//! Storage layer: blob persistence and document/user records.
//!
//! The gateway talks to storage only through the [`ObjectStore`] and
//! [`DocumentRepository`] traits. [`SledStore`] implements both on top of a
//! single embedded Sled database.

mod sled_store;

pub use sled_store::{SledStore, StorageStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Kind of collaborative entity, derived from the id prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Rich text document: projected, indexed and previewed on every flush
    Document,
    /// Canvas: only the CRDT state and title are persisted
    Canvas,
}

impl DocumentKind {
    pub const DOCUMENT_PREFIX: &'static str = "d-";
    pub const CANVAS_PREFIX: &'static str = "c-";

    /// Infer the kind from a document id, `None` for unknown prefixes
    pub fn from_document_id(document_id: &str) -> Option<Self> {
        if document_id.starts_with(Self::DOCUMENT_PREFIX) {
            Some(DocumentKind::Document)
        } else if document_id.starts_with(Self::CANVAS_PREFIX) {
            Some(DocumentKind::Canvas)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Document => "document",
            DocumentKind::Canvas => "canvas",
        }
    }
}

/// Durable record describing a collaboratively edited document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub kind: DocumentKind,
    pub owner_id: String,
    pub project_id: Option<String>,
    pub title: String,
    /// Blob key of the markdown projection, assigned on first flush
    pub content_storage_key: Option<String>,
    /// Blob key of the binary CRDT state, assigned on first flush
    pub state_storage_key: Option<String>,
    pub content_preview: Option<String>,
    pub storage_size: u64,
    pub vector_size: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl DocumentRecord {
    /// Create a fresh record. The kind is inferred from the id prefix and
    /// falls back to a plain document.
    pub fn new(document_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let document_id = document_id.into();
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            kind: DocumentKind::from_document_id(&document_id).unwrap_or(DocumentKind::Document),
            document_id,
            owner_id: owner_id.into(),
            project_id: None,
            title: String::new(),
            content_storage_key: None,
            state_storage_key: None,
            content_preview: None,
            storage_size: 0,
            vector_size: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Apply a patch in place, bumping `updated_at`
    pub fn apply(&mut self, patch: &DocumentPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(key) = &patch.content_storage_key {
            self.content_storage_key = Some(key.clone());
        }
        if let Some(key) = &patch.state_storage_key {
            self.state_storage_key = Some(key.clone());
        }
        if let Some(preview) = &patch.content_preview {
            self.content_preview = Some(preview.clone());
        }
        if let Some(size) = patch.storage_size {
            self.storage_size = size;
        }
        if let Some(size) = patch.vector_size {
            self.vector_size = size;
        }
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

/// Partial update of a [`DocumentRecord`]; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub content_storage_key: Option<String>,
    pub state_storage_key: Option<String>,
    pub content_preview: Option<String>,
    pub storage_size: Option<u64>,
    pub vector_size: Option<u64>,
}

impl DocumentPatch {
    pub fn is_empty(&self) -> bool {
        self == &DocumentPatch::default()
    }
}

/// A user known to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uid: String,
    pub name: String,
    pub email: Option<String>,
}

impl UserRecord {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            email: None,
        }
    }
}

/// Aggregate storage consumption of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub uid: String,
    pub object_storage_bytes: u64,
    pub vector_storage_bytes: u64,
    pub document_count: u64,
    /// Unix millis of the flush that triggered the recompute
    pub synced_at: i64,
}

/// Result of a blob stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
}

/// Binary blob persistence addressed by opaque keys
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a blob, `None` when the key does not exist
    async fn fetch(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write (or overwrite) a blob
    async fn store(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Size of a stored blob; missing keys are an error
    async fn stat(&self, key: &str) -> StorageResult<ObjectStat>;
}

/// Document and user records
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Look up a live document; soft-deleted records are reported as absent
    async fn find_document(&self, document_id: &str) -> StorageResult<Option<DocumentRecord>>;

    async fn find_user(&self, uid: &str) -> StorageResult<Option<UserRecord>>;

    /// Apply a partial patch keyed by document id and return the new record
    async fn update_document(
        &self,
        document_id: &str,
        patch: &DocumentPatch,
    ) -> StorageResult<DocumentRecord>;

    /// Every live document owned by `owner_id`
    async fn list_owned(&self, owner_id: &str) -> StorageResult<Vec<DocumentRecord>>;
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/gateway.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}
