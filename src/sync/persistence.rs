//! Fetch and store hooks backed by the object store, indices, metadata
//! repository and usage accountant.
//!
//! A document flush runs:
//! 1. project the state to markdown
//! 2. resolve storage keys (deterministic, derived from the document id)
//! 3. write the markdown and the state blob concurrently
//! 4. build a patch with only the changed fields
//! 5. stat both blobs for `storage_size` while, concurrently,
//! 6. the search and vector indices are refreshed
//! 7. commit the patch
//! 8. recompute the owner's usage (best effort)
//!
//! Canvases only persist their state blob and title.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::hooks::{BestEffort, DocumentHooks, FlushError, FlushOutcome};
use super::projection::{project, raw_title};
use crate::auth::CollabContext;
use crate::config::DEFAULT_PREVIEW_LENGTH;
use crate::index::{SearchDocument, SearchIndex, VectorDocument, VectorIndex, VectorMetadata};
use crate::storage::{DocumentKind, DocumentPatch, DocumentRecord, DocumentRepository, ObjectStore};
use crate::usage::UsageAccountant;

/// Blob key of a document's markdown projection
pub fn content_storage_key(document_id: &str) -> String {
    format!("doc/{}.txt", document_id)
}

/// Blob key of a document's binary CRDT state
pub fn state_storage_key(document_id: &str) -> String {
    format!("state/{}", document_id)
}

/// [`DocumentHooks`] wired to the storage, index and usage backends
pub struct PersistenceHooks {
    objects: Arc<dyn ObjectStore>,
    repository: Arc<dyn DocumentRepository>,
    search: Arc<dyn SearchIndex>,
    vectors: Arc<dyn VectorIndex>,
    usage: Arc<dyn UsageAccountant>,
    preview_length: usize,
}

impl PersistenceHooks {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        repository: Arc<dyn DocumentRepository>,
        search: Arc<dyn SearchIndex>,
        vectors: Arc<dyn VectorIndex>,
        usage: Arc<dyn UsageAccountant>,
    ) -> Self {
        Self {
            objects,
            repository,
            search,
            vectors,
            usage,
            preview_length: DEFAULT_PREVIEW_LENGTH,
        }
    }

    pub fn with_preview_length(mut self, preview_length: usize) -> Self {
        self.preview_length = preview_length;
        self
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), FlushError> {
        self.objects
            .store(key, bytes)
            .await
            .map_err(|source| FlushError::Write {
                key: key.to_string(),
                source,
            })
    }

    async fn size_of(&self, key: &str) -> Result<u64, FlushError> {
        self.objects
            .stat(key)
            .await
            .map(|stat| stat.size)
            .map_err(|source| FlushError::Stat {
                key: key.to_string(),
                source,
            })
    }

    async fn commit(
        &self,
        context: &CollabContext,
        patch: DocumentPatch,
    ) -> Result<FlushOutcome, FlushError> {
        let document = self
            .repository
            .update_document(context.document_id(), &patch)
            .await
            .map_err(FlushError::Commit)?;

        let owner = &context.identity.uid;
        let usage: BestEffort<_> = self.usage.recompute(owner, Utc::now()).await.into();
        if let BestEffort::Failed(reason) = &usage {
            warn!("Usage sync failed for {} after flushing {}: {}", owner, context.document_id(), reason);
        }

        Ok(FlushOutcome { document, usage })
    }

    async fn store_document(
        &self,
        context: &CollabContext,
        state: &[u8],
    ) -> Result<FlushOutcome, FlushError> {
        let record = &context.document;
        let projection = project(state);

        let content_key = record
            .content_storage_key
            .clone()
            .unwrap_or_else(|| content_storage_key(&record.document_id));
        let state_key = record
            .state_storage_key
            .clone()
            .unwrap_or_else(|| state_storage_key(&record.document_id));

        tokio::try_join!(
            self.write(&content_key, projection.markdown.as_bytes()),
            self.write(&state_key, state),
        )?;

        let mut patch = key_patch(record, Some(&content_key), &state_key);
        let preview = projection.preview(self.preview_length);
        if record.content_preview.as_deref() != Some(preview.as_str()) {
            patch.content_preview = Some(preview);
        }
        let title = sync_title(record, projection.title.as_deref(), &mut patch);

        let sizes = async {
            tokio::try_join!(self.size_of(&content_key), self.size_of(&state_key))
        };
        let search_document = SearchDocument {
            id: record.document_id.clone(),
            project_id: record.project_id.clone(),
            uid: record.owner_id.clone(),
            title: title.clone(),
            content: projection.markdown.clone(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let vector_document = VectorDocument {
            page_content: projection.markdown.clone(),
            metadata: VectorMetadata {
                node_type: record.kind.as_str().to_string(),
                title,
                doc_id: record.document_id.clone(),
            },
        };
        let fan_out = async {
            tokio::try_join!(
                async { self.search.upsert(&search_document).await.map_err(FlushError::Search) },
                async {
                    self.vectors
                        .index(&context.identity, &vector_document)
                        .await
                        .map_err(FlushError::Vector)
                },
            )
        };

        let ((content_size, state_size), ((), indexed)) = tokio::try_join!(sizes, fan_out)?;
        patch.storage_size = Some(content_size + state_size);
        patch.vector_size = Some(indexed.size);

        debug!("Committing {} for {}: {:?}", record.kind.as_str(), record.document_id, patch);
        self.commit(context, patch).await
    }

    async fn store_canvas(
        &self,
        context: &CollabContext,
        state: &[u8],
    ) -> Result<FlushOutcome, FlushError> {
        let record = &context.document;
        let title = raw_title(state);

        let state_key = record
            .state_storage_key
            .clone()
            .unwrap_or_else(|| state_storage_key(&record.document_id));

        self.write(&state_key, state).await?;

        let mut patch = key_patch(record, None, &state_key);
        sync_title(record, title.as_deref(), &mut patch);
        patch.storage_size = Some(self.size_of(&state_key).await?);

        debug!("Committing canvas {}: {:?}", record.document_id, patch);
        self.commit(context, patch).await
    }
}

/// Patch carrying storage keys that were assigned by this flush
fn key_patch(record: &DocumentRecord, content_key: Option<&str>, state_key: &str) -> DocumentPatch {
    let mut patch = DocumentPatch::default();
    if record.content_storage_key.is_none() {
        patch.content_storage_key = content_key.map(str::to_string);
    }
    if record.state_storage_key.is_none() {
        patch.state_storage_key = Some(state_key.to_string());
    }
    patch
}

/// Record a changed title in the patch and return the effective title
fn sync_title(record: &DocumentRecord, crdt_title: Option<&str>, patch: &mut DocumentPatch) -> String {
    match crdt_title {
        Some(title) if title != record.title => {
            patch.title = Some(title.to_string());
            title.to_string()
        }
        _ => record.title.clone(),
    }
}

#[async_trait]
impl DocumentHooks for PersistenceHooks {
    async fn fetch(&self, context: &CollabContext) -> Option<Vec<u8>> {
        let key = context.document.state_storage_key.as_deref()?;

        match self.objects.fetch(key).await {
            Ok(Some(state)) => {
                debug!("Fetched {} bytes of state from {}", state.len(), key);
                Some(state)
            }
            Ok(None) => {
                warn!("State blob {} missing for {}", key, context.document_id());
                None
            }
            Err(e) => {
                error!("Fetch state failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn store(&self, context: &CollabContext, state: &[u8]) -> Result<FlushOutcome, FlushError> {
        let result = match context.document.kind {
            DocumentKind::Document => self.store_document(context, state).await,
            DocumentKind::Canvas => self.store_canvas(context, state).await,
        };

        match &result {
            Ok(outcome) => info!(
                "Stored {} ({} bytes, vector {} bytes)",
                context.document_id(),
                outcome.document.storage_size,
                outcome.document.vector_size
            ),
            Err(e) => error!(
                "Store failed for {} (state key {}): {}",
                context.document_id(),
                context
                    .document
                    .state_storage_key
                    .clone()
                    .unwrap_or_else(|| state_storage_key(context.document_id())),
                e
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexError, IndexResult, IndexedSize};
    use crate::storage::{
        ObjectStat, SledStore, StorageError, StorageResult, StorageUsage, UserRecord,
    };
    use crate::sync::document::CanvasDocument;
    use crate::usage::StoreUsageAccountant;
    use chrono::DateTime;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSearch {
        calls: Mutex<Vec<SearchDocument>>,
    }

    #[async_trait]
    impl SearchIndex for RecordingSearch {
        async fn upsert(&self, document: &SearchDocument) -> IndexResult<()> {
            self.calls.lock().push(document.clone());
            Ok(())
        }
    }

    struct RecordingVectors {
        calls: Mutex<Vec<VectorDocument>>,
        size: u64,
        fail: bool,
    }

    impl RecordingVectors {
        fn new(size: u64) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                size,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl VectorIndex for RecordingVectors {
        async fn index(&self, _owner: &UserRecord, document: &VectorDocument) -> IndexResult<IndexedSize> {
            self.calls.lock().push(document.clone());
            if self.fail {
                return Err(IndexError::InvalidResponse("embeddings", "boom".into()));
            }
            Ok(IndexedSize { size: self.size })
        }
    }

    /// Sled objects with switchable failures
    struct FlakyObjects {
        inner: SledStore,
        fail_fetch: bool,
        fail_write_prefix: Option<&'static str>,
    }

    #[async_trait]
    impl ObjectStore for FlakyObjects {
        async fn fetch(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            if self.fail_fetch {
                return Err(StorageError::Backend("connection reset".into()));
            }
            self.inner.fetch(key).await
        }

        async fn store(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
            if let Some(prefix) = self.fail_write_prefix {
                if key.starts_with(prefix) {
                    return Err(StorageError::Backend("bucket unavailable".into()));
                }
            }
            self.inner.store(key, bytes).await
        }

        async fn stat(&self, key: &str) -> StorageResult<ObjectStat> {
            self.inner.stat(key).await
        }
    }

    /// Repository that remembers every patch it was asked to apply
    struct RecordingRepository {
        inner: SledStore,
        patches: Mutex<Vec<DocumentPatch>>,
    }

    #[async_trait]
    impl DocumentRepository for RecordingRepository {
        async fn find_document(&self, document_id: &str) -> StorageResult<Option<DocumentRecord>> {
            self.inner.find_document(document_id).await
        }

        async fn find_user(&self, uid: &str) -> StorageResult<Option<UserRecord>> {
            self.inner.find_user(uid).await
        }

        async fn update_document(
            &self,
            document_id: &str,
            patch: &DocumentPatch,
        ) -> StorageResult<DocumentRecord> {
            self.patches.lock().push(patch.clone());
            self.inner.update_document(document_id, patch).await
        }

        async fn list_owned(&self, owner_id: &str) -> StorageResult<Vec<DocumentRecord>> {
            self.inner.list_owned(owner_id).await
        }
    }

    struct FailingUsage;

    #[async_trait]
    impl UsageAccountant for FailingUsage {
        async fn recompute(&self, _owner_id: &str, _timestamp: DateTime<Utc>) -> StorageResult<StorageUsage> {
            Err(StorageError::Backend("billing offline".into()))
        }
    }

    struct Harness {
        store: SledStore,
        search: Arc<RecordingSearch>,
        vectors: Arc<RecordingVectors>,
        repository: Arc<RecordingRepository>,
        hooks: PersistenceHooks,
    }

    impl Harness {
        fn build(objects: FlakyObjects, vectors: RecordingVectors, usage: Option<Arc<dyn UsageAccountant>>) -> Self {
            let store = objects.inner.clone();
            let search = Arc::new(RecordingSearch::default());
            let vectors = Arc::new(vectors);
            let repository = Arc::new(RecordingRepository {
                inner: store.clone(),
                patches: Mutex::new(Vec::new()),
            });
            let usage: Arc<dyn UsageAccountant> = match usage {
                Some(usage) => usage,
                None => Arc::new(StoreUsageAccountant::new(Arc::new(store.clone()))),
            };
            let hooks = PersistenceHooks::new(
                Arc::new(objects),
                repository.clone(),
                search.clone(),
                vectors.clone(),
                usage,
            );
            Self {
                store,
                search,
                vectors,
                repository,
                hooks,
            }
        }

        fn new() -> Self {
            Self::build(objects(SledStore::temporary().unwrap()), RecordingVectors::new(64), None)
        }

        fn context(&self, document_id: &str) -> CollabContext {
            let user = UserRecord::new("u-1", "Ada");
            self.store.insert_user(&user).unwrap();
            let record = DocumentRecord::new(document_id, "u-1").with_title("Notes");
            self.store.insert_document(&record).unwrap();
            CollabContext::new(user, record)
        }
    }

    fn objects(store: SledStore) -> FlakyObjects {
        FlakyObjects {
            inner: store,
            fail_fetch: false,
            fail_write_prefix: None,
        }
    }

    fn state_with(content: &str) -> Vec<u8> {
        let mut doc = CanvasDocument::new();
        doc.replace_content(content).unwrap();
        doc.save()
    }

    #[tokio::test]
    async fn test_fetch_without_state_key_is_none() {
        let harness = Harness::new();
        let context = harness.context("d-1");

        assert!(harness.hooks.fetch(&context).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_error_is_swallowed() {
        let store = SledStore::temporary().unwrap();
        store.store("state/d-1", b"bytes").await.unwrap();
        let harness = Harness::build(
            FlakyObjects {
                fail_fetch: true,
                ..objects(store)
            },
            RecordingVectors::new(0),
            None,
        );
        let mut context = harness.context("d-1");
        context.document.state_storage_key = Some("state/d-1".into());

        assert!(harness.hooks.fetch(&context).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_returns_exact_stored_bytes() {
        let harness = Harness::new();
        let context = harness.context("d-1");
        let state = state_with("hello world");

        let outcome = harness.hooks.store(&context, &state).await.unwrap();
        let refreshed = context.with_document(outcome.document);

        assert_eq!(harness.hooks.fetch(&refreshed).await, Some(state));
    }

    #[tokio::test]
    async fn test_first_flush_persists_everything() {
        let harness = Harness::new();
        let context = harness.context("d-1");
        let state = state_with("hello world");

        let outcome = harness.hooks.store(&context, &state).await.unwrap();
        let document = &outcome.document;

        assert_eq!(document.content_storage_key.as_deref(), Some("doc/d-1.txt"));
        assert_eq!(document.state_storage_key.as_deref(), Some("state/d-1"));
        assert_eq!(document.content_preview.as_deref(), Some("hello world"));
        assert_eq!(document.vector_size, 64);

        let content = harness.store.fetch("doc/d-1.txt").await.unwrap().unwrap();
        assert_eq!(content, b"hello world");
        assert_eq!(harness.store.fetch("state/d-1").await.unwrap(), Some(state));

        let search = harness.search.calls.lock();
        assert_eq!(search.len(), 1);
        assert_eq!(search[0].content, "hello world");
        assert_eq!(search[0].uid, "u-1");

        let vectors = harness.vectors.calls.lock();
        assert_eq!(vectors[0].metadata.node_type, "document");
        assert_eq!(vectors[0].metadata.title, "Notes");
        assert_eq!(vectors[0].metadata.doc_id, "d-1");

        let usage = outcome.usage.completed().unwrap();
        assert_eq!(usage.object_storage_bytes, document.storage_size);
        assert_eq!(usage.vector_storage_bytes, 64);
    }

    #[tokio::test]
    async fn test_storage_size_matches_stats() {
        let harness = Harness::new();
        let context = harness.context("d-1");

        let outcome = harness.hooks.store(&context, &state_with("sizing")).await.unwrap();

        let content = harness.store.stat("doc/d-1.txt").await.unwrap().size;
        let state = harness.store.stat("state/d-1").await.unwrap().size;
        assert_eq!(outcome.document.storage_size, content + state);
    }

    #[tokio::test]
    async fn test_concurrent_first_flushes_share_keys() {
        let harness = Harness::new();
        let context = harness.context("d-1");
        let a = state_with("first");
        let b = state_with("second");

        let (left, right) = tokio::join!(
            harness.hooks.store(&context, &a),
            harness.hooks.store(&context, &b)
        );
        let (left, right) = (left.unwrap(), right.unwrap());

        assert_eq!(left.document.state_storage_key, right.document.state_storage_key);
        assert_eq!(left.document.content_storage_key, right.document.content_storage_key);

        let record = harness.store.load_record("d-1").unwrap().unwrap();
        assert_eq!(record.state_storage_key.as_deref(), Some("state/d-1"));
        assert_eq!(record.content_storage_key.as_deref(), Some("doc/d-1.txt"));
        assert_eq!(harness.store.stats().object_count, 2);
    }

    #[tokio::test]
    async fn test_unchanged_preview_is_not_patched() {
        let harness = Harness::new();
        let context = harness.context("d-1");
        let state = state_with("same text");

        let first = harness.hooks.store(&context, &state).await.unwrap();
        let context = context.with_document(first.document);
        harness.hooks.store(&context, &state).await.unwrap();

        let patches = harness.repository.patches.lock();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].content_preview.as_deref(), Some("same text"));
        assert!(patches[1].content_preview.is_none());
        assert!(patches[1].state_storage_key.is_none());
        assert!(patches[1].content_storage_key.is_none());
        assert!(patches[1].storage_size.is_some());
    }

    #[tokio::test]
    async fn test_preview_is_truncated() {
        let harness = Harness::new();
        let context = harness.context("d-1");
        let long = "x".repeat(DEFAULT_PREVIEW_LENGTH + 100);

        let outcome = harness.hooks.store(&context, &state_with(&long)).await.unwrap();

        let preview = outcome.document.content_preview.unwrap();
        assert_eq!(preview.chars().count(), DEFAULT_PREVIEW_LENGTH);
        assert_eq!(harness.search.calls.lock()[0].content.len(), long.len());
    }

    #[tokio::test]
    async fn test_write_failure_fails_flush() {
        let harness = Harness::build(
            FlakyObjects {
                fail_write_prefix: Some("state/"),
                ..objects(SledStore::temporary().unwrap())
            },
            RecordingVectors::new(0),
            None,
        );
        let context = harness.context("d-1");

        let err = harness.hooks.store(&context, &state_with("x")).await.unwrap_err();

        assert!(matches!(err, FlushError::Write { ref key, .. } if key == "state/d-1"));
        assert!(harness.repository.patches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_vector_failure_fails_flush() {
        let mut vectors = RecordingVectors::new(0);
        vectors.fail = true;
        let harness = Harness::build(objects(SledStore::temporary().unwrap()), vectors, None);
        let context = harness.context("d-1");

        let err = harness.hooks.store(&context, &state_with("x")).await.unwrap_err();

        assert!(matches!(err, FlushError::Vector(_)));
        let record = harness.store.load_record("d-1").unwrap().unwrap();
        assert!(record.state_storage_key.is_none());
    }

    #[tokio::test]
    async fn test_usage_failure_does_not_fail_flush() {
        let harness = Harness::build(
            objects(SledStore::temporary().unwrap()),
            RecordingVectors::new(0),
            Some(Arc::new(FailingUsage)),
        );
        let context = harness.context("d-1");

        let outcome = harness.hooks.store(&context, &state_with("x")).await.unwrap();

        assert!(matches!(outcome.usage, BestEffort::Failed(_)));
        assert!(outcome.document.state_storage_key.is_some());
    }

    #[tokio::test]
    async fn test_title_is_synced_from_state() {
        let harness = Harness::new();
        let context = harness.context("d-1");
        let mut doc = CanvasDocument::new();
        doc.replace_content("body").unwrap();
        doc.set_title("Renamed").unwrap();

        let outcome = harness.hooks.store(&context, &doc.save()).await.unwrap();

        assert_eq!(outcome.document.title, "Renamed");
        assert_eq!(harness.vectors.calls.lock()[0].metadata.title, "Renamed");
        assert_eq!(harness.search.calls.lock()[0].title, "Renamed");
    }

    #[tokio::test]
    async fn test_canvas_flush_skips_indices() {
        let harness = Harness::new();
        let context = harness.context("c-1");
        let mut doc = CanvasDocument::new();
        doc.set_title("Board").unwrap();
        let state = doc.save();

        let outcome = harness.hooks.store(&context, &state).await.unwrap();

        assert_eq!(outcome.document.title, "Board");
        assert_eq!(outcome.document.state_storage_key.as_deref(), Some("state/c-1"));
        assert!(outcome.document.content_storage_key.is_none());
        assert_eq!(outcome.document.storage_size, state.len() as u64);
        assert!(harness.search.calls.lock().is_empty());
        assert!(harness.vectors.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_canvas_blank_title_clears_record() {
        let harness = Harness::new();
        let context = harness.context("c-1");
        let mut doc = CanvasDocument::new();
        doc.set_title("").unwrap();

        let outcome = harness.hooks.store(&context, &doc.save()).await.unwrap();

        assert_eq!(outcome.document.title, "");
        let patches = harness.repository.patches.lock();
        assert_eq!(patches[0].title.as_deref(), Some(""));
    }
}
