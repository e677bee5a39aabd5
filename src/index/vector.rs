//! Qdrant-backed vector index.
//!
//! Re-indexing a document replaces all of its chunks: the markdown is split
//! into chunks of at most `chunk_size` characters, embedded through an
//! OpenAI-compatible `/embeddings` endpoint, the previous points for the
//! document are deleted and the new points upserted.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{check_status, IndexError, IndexResult, IndexedSize, VectorDocument, VectorIndex};
use crate::config::VectorConfig;
use crate::storage::UserRecord;

const QDRANT: &str = "qdrant";
const EMBEDDINGS: &str = "embeddings";

/// Bytes per stored vector component (f32)
const BYTES_PER_DIMENSION: u64 = 4;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

pub struct QdrantVectorIndex {
    client: Client,
    config: VectorConfig,
    collection_ready: OnceCell<()>,
}

impl QdrantVectorIndex {
    pub fn new(config: VectorConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            collection_ready: OnceCell::new(),
        }
    }

    fn collection_url(&self, path: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.config.qdrant_url.trim_end_matches('/'),
            self.config.collection,
            path
        )
    }

    async fn embed(&self, chunks: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.config.embeddings_url.trim_end_matches('/'));
        let mut request = self.client.post(url).json(&json!({
            "model": self.config.embeddings_model,
            "input": chunks,
        }));
        if let Some(key) = &self.config.embeddings_api_key {
            request = request.bearer_auth(key);
        }

        let response = check_status(EMBEDDINGS, request.send().await?).await?;
        let mut body: EmbeddingResponse = response.json().await?;
        if body.data.len() != chunks.len() {
            return Err(IndexError::InvalidResponse(
                EMBEDDINGS,
                format!("expected {} embeddings, got {}", chunks.len(), body.data.len()),
            ));
        }
        body.data.sort_by_key(|item| item.index);
        Ok(body.data.into_iter().map(|item| item.embedding).collect())
    }

    /// Create the collection on first use, sized to the embedding dimension
    async fn ensure_collection(&self, dimension: usize) -> IndexResult<()> {
        self.collection_ready
            .get_or_try_init(|| async {
                let response = self.client.get(self.collection_url("")).send().await?;
                if response.status() == StatusCode::NOT_FOUND {
                    let response = self
                        .client
                        .put(self.collection_url(""))
                        .json(&json!({ "vectors": { "size": dimension, "distance": "Cosine" } }))
                        .send()
                        .await?;
                    check_status(QDRANT, response).await?;
                    info!("Created vector collection {}", self.config.collection);
                } else {
                    check_status(QDRANT, response).await?;
                }
                Ok::<(), IndexError>(())
            })
            .await?;
        Ok(())
    }

    async fn delete_document_points(&self, owner: &str, doc_id: &str) -> IndexResult<()> {
        let response = self
            .client
            .post(self.collection_url("/points/delete?wait=true"))
            .json(&json!({
                "filter": {
                    "must": [
                        { "key": "uid", "match": { "value": owner } },
                        { "key": "docId", "match": { "value": doc_id } }
                    ]
                }
            }))
            .send()
            .await?;

        // Nothing to delete before the collection exists
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(QDRANT, response).await?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn index(&self, owner: &UserRecord, document: &VectorDocument) -> IndexResult<IndexedSize> {
        let doc_id = &document.metadata.doc_id;
        let chunks = chunk_markdown(&document.page_content, self.config.chunk_size);

        self.delete_document_points(&owner.uid, doc_id).await?;
        if chunks.is_empty() {
            return Ok(IndexedSize::default());
        }

        let embeddings = self.embed(&chunks).await?;
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        self.ensure_collection(dimension).await?;

        let mut size = 0u64;
        let mut points = Vec::with_capacity(chunks.len());
        for (seq, (chunk, vector)) in chunks.iter().zip(embeddings).enumerate() {
            let payload = json!({
                "uid": owner.uid,
                "nodeType": document.metadata.node_type,
                "title": document.metadata.title,
                "docId": doc_id,
                "seq": seq,
                "content": chunk,
            });
            size += vector.len() as u64 * BYTES_PER_DIMENSION + payload.to_string().len() as u64;
            points.push(json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "vector": vector,
                "payload": payload,
            }));
        }

        let response = self
            .client
            .put(self.collection_url("/points?wait=true"))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check_status(QDRANT, response).await?;

        debug!("Indexed {} chunks for {} ({} bytes)", chunks.len(), doc_id, size);
        Ok(IndexedSize { size })
    }
}

/// Accepts every document and reports no footprint
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledVectorIndex;

#[async_trait]
impl VectorIndex for DisabledVectorIndex {
    async fn index(&self, _owner: &UserRecord, document: &VectorDocument) -> IndexResult<IndexedSize> {
        debug!("Vector indexing disabled, skipping {}", document.metadata.doc_id);
        Ok(IndexedSize::default())
    }
}

/// Split markdown into chunks of at most `chunk_size` characters.
///
/// Paragraphs are packed greedily; a paragraph that does not fit on its own
/// is split on line breaks and, failing that, hard-split by characters.
/// Blank input yields no chunks.
pub fn chunk_markdown(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut pieces = Vec::new();
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if paragraph.chars().count() <= chunk_size {
            pieces.push(paragraph.to_string());
            continue;
        }
        for line in paragraph.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            if line.chars().count() <= chunk_size {
                pieces.push(line.to_string());
            } else {
                let chars: Vec<char> = line.chars().collect();
                pieces.extend(chars.chunks(chunk_size).map(|c| c.iter().collect::<String>()));
            }
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for piece in pieces {
        let piece_len = piece.chars().count();
        let joined_len = if current.is_empty() { piece_len } else { current_len + 2 + piece_len };
        if joined_len > chunk_size && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(&piece);
        current_len += piece_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
