//! CRDT synchronization.
//!
//! - `document` / `projection`: the Automerge document and its markdown view
//! - `protocol`: binary frames exchanged over the WebSocket
//! - `hooks` / `persistence`: load and flush callbacks
//! - `server`: rooms, peers and the debounced flush scheduler

pub mod document;
pub mod hooks;
pub mod persistence;
pub mod projection;
pub mod protocol;
pub mod server;

pub use document::CanvasDocument;
pub use hooks::{BestEffort, DocumentHooks, FlushError, FlushOutcome};
pub use persistence::PersistenceHooks;
pub use server::{SyncServer, SyncServerConfig};

use thiserror::Error;

/// Unique identifier for a document (the room key)
pub type DocumentId = String;

/// Unique identifier for one connection
pub type PeerId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Document not active: {0}")]
    DocumentNotActive(DocumentId),

    #[error("Document is full: {0}")]
    DocumentFull(DocumentId),

    #[error("Invalid update: {0}")]
    InvalidUpdate(#[from] document::DocumentError),

    #[error("Flush failed: {0}")]
    Flush(#[from] FlushError),
}
