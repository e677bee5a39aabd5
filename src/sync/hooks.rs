//! Persistence hooks invoked by the sync engine.

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::CollabContext;
use crate::index::IndexError;
use crate::storage::{DocumentRecord, StorageError, StorageUsage};

/// Load and flush callbacks for one document's CRDT state
#[async_trait]
pub trait DocumentHooks: Send + Sync {
    /// Last persisted state, `None` to start from an empty document.
    /// Never fails: read errors are logged and treated as no prior state.
    async fn fetch(&self, context: &CollabContext) -> Option<Vec<u8>>;

    /// Persist `state` and refresh everything derived from it
    async fn store(&self, context: &CollabContext, state: &[u8]) -> Result<FlushOutcome, FlushError>;
}

/// Critical flush failures. The engine keeps the document dirty and retries.
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("failed to write {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to stat {key}: {source}")]
    Stat {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("search index upsert failed: {0}")]
    Search(#[source] IndexError),

    #[error("vector index update failed: {0}")]
    Vector(#[source] IndexError),

    #[error("metadata commit failed: {0}")]
    Commit(#[source] StorageError),
}

/// Result of a step whose failure must not fail the enclosing operation
#[derive(Debug, Clone, PartialEq)]
pub enum BestEffort<T> {
    Completed(T),
    Failed(String),
}

impl<T> BestEffort<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, BestEffort::Completed(_))
    }

    pub fn completed(&self) -> Option<&T> {
        match self {
            BestEffort::Completed(value) => Some(value),
            BestEffort::Failed(_) => None,
        }
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for BestEffort<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => BestEffort::Completed(value),
            Err(e) => BestEffort::Failed(e.to_string()),
        }
    }
}

/// What a successful flush committed
#[derive(Debug, Clone)]
pub struct FlushOutcome {
    /// Record as returned by the metadata commit
    pub document: DocumentRecord,
    pub usage: BestEffort<StorageUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_effort_from_result() {
        let ok: BestEffort<u32> = Ok::<_, StorageError>(7).into();
        assert_eq!(ok.completed(), Some(&7));

        let failed: BestEffort<u32> = Err::<u32, _>(StorageError::Backend("down".into())).into();
        assert!(!failed.is_completed());
        assert_eq!(failed, BestEffort::Failed("Storage backend error: down".into()));
    }

    #[test]
    fn test_flush_error_names_key() {
        let err = FlushError::Write {
            key: "state/d-1".into(),
            source: StorageError::Backend("disk full".into()),
        };
        assert!(err.to_string().contains("state/d-1"));
    }
}
