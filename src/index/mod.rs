//! Index fan-out targets.
//!
//! Every flush pushes the projected markdown to a full-text [`SearchIndex`]
//! and a [`VectorIndex`]. Both are optional: when a backend is not
//! configured the disabled implementations accept everything and report a
//! zero footprint.

pub mod search;
pub mod vector;

pub use search::{DisabledSearchIndex, ElasticsearchIndex};
pub use vector::{chunk_markdown, DisabledVectorIndex, QdrantVectorIndex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::UserRecord;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{backend} returned {status}: {body}")]
    Status {
        backend: &'static str,
        status: u16,
        body: String,
    },

    #[error("Unexpected response from {0}: {1}")]
    InvalidResponse(&'static str, String),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Full-text search entry for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub id: String,
    pub project_id: Option<String>,
    pub uid: String,
    pub title: String,
    pub content: String,
    /// RFC 3339 timestamp of the flush
    pub updated_at: String,
}

/// Metadata attached to every vector chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMetadata {
    pub node_type: String,
    pub title: String,
    pub doc_id: String,
}

/// Content to be chunked, embedded and indexed
#[derive(Debug, Clone, PartialEq)]
pub struct VectorDocument {
    pub page_content: String,
    pub metadata: VectorMetadata,
}

/// Storage footprint reported by the vector index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexedSize {
    pub size: u64,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the entry for `document.id`
    async fn upsert(&self, document: &SearchDocument) -> IndexResult<()>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace every chunk of the document and report the new footprint
    async fn index(&self, owner: &UserRecord, document: &VectorDocument) -> IndexResult<IndexedSize>;
}

/// Map a non-success response into [`IndexError::Status`]
pub(crate) async fn check_status(
    backend: &'static str,
    response: reqwest::Response,
) -> IndexResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IndexError::Status {
        backend,
        status: status.as_u16(),
        body,
    })
}
