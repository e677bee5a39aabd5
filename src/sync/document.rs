//! Automerge document wrapper for collaborative canvases and documents.
//!
//! Schema at the document root:
//! - `content`: Text CRDT holding markdown source
//! - `blocks`: optional List of block maps (`type`, `text`, `level`, `language`)
//! - `title`: optional Text CRDT
//!
//! A fresh server-side document is left empty so the first client's saved
//! state defines the structure instead of racing it with a second root.

use automerge::{
    transaction::Transactable, ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc,
    ScalarValue, Value, ROOT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Document corruption: {0}")]
    Corruption(String),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Keys used in the Automerge document structure
mod keys {
    pub const CONTENT: &str = "content";
    pub const BLOCKS: &str = "blocks";
    pub const TITLE: &str = "title";

    // Block keys
    pub const TYPE: &str = "type";
    pub const TEXT: &str = "text";
    pub const LEVEL: &str = "level";
    pub const LANGUAGE: &str = "language";
}

/// One structured block of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub kind: String,
    pub text: String,
    pub level: Option<i64>,
    pub language: Option<String>,
}

impl Block {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
            level: None,
            language: None,
        }
    }

    pub fn heading(level: i64, text: impl Into<String>) -> Self {
        Self {
            level: Some(level),
            ..Self::new("heading", text)
        }
    }

    pub fn code(language: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            ..Self::new("code", text)
        }
    }
}

/// Collaborative document backed by an Automerge CRDT
pub struct CanvasDocument {
    doc: AutoCommit,
}

impl Default for CanvasDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasDocument {
    /// Create a new empty document
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    /// Create a document with a specific actor ID
    pub fn with_actor(actor_id: &[u8]) -> Self {
        Self {
            doc: AutoCommit::new().with_actor(ActorId::from(actor_id)),
        }
    }

    /// Load a document from binary Automerge data
    pub fn load(data: &[u8]) -> DocumentResult<Self> {
        let doc = AutoCommit::load(data)?;
        Ok(Self { doc })
    }

    /// Save the full document to binary format
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Changes made since the last save, as an update other peers can apply
    pub fn save_incremental(&mut self) -> Vec<u8> {
        self.doc.save_incremental()
    }

    /// Merge a client update: a saved document or an incremental chunk.
    /// Returns the number of ops applied.
    pub fn apply_update(&mut self, update: &[u8]) -> DocumentResult<usize> {
        Ok(self.doc.load_incremental(update)?)
    }

    /// Get current document heads
    pub fn heads(&mut self) -> Vec<ChangeHash> {
        self.doc.get_heads()
    }

    /// Markdown source held in the `content` text
    pub fn content(&self) -> DocumentResult<String> {
        match self.text_obj(&ROOT, keys::CONTENT)? {
            Some(text_id) => Ok(self.doc.text(&text_id)?),
            None => Ok(String::new()),
        }
    }

    /// Title text, `None` when never set
    pub fn title(&self) -> DocumentResult<Option<String>> {
        match self.text_obj(&ROOT, keys::TITLE)? {
            Some(text_id) => Ok(Some(self.doc.text(&text_id)?)),
            None => Ok(None),
        }
    }

    pub fn set_title(&mut self, title: &str) -> DocumentResult<()> {
        let text_id = self.ensure_text(keys::TITLE)?;
        self.replace_text(&text_id, title)
    }

    /// Rewrite the `content` text. Returns false when it already matched.
    pub fn replace_content(&mut self, markdown: &str) -> DocumentResult<bool> {
        let text_id = self.ensure_text(keys::CONTENT)?;
        if self.doc.text(&text_id)? == markdown {
            return Ok(false);
        }
        self.replace_text(&text_id, markdown)?;
        Ok(true)
    }

    /// Structured blocks, `None` when the document has no block list
    pub fn blocks(&self) -> DocumentResult<Option<Vec<Block>>> {
        let list_id = match self.doc.get(ROOT, keys::BLOCKS)? {
            Some((Value::Object(ObjType::List), id)) => id,
            Some(_) => {
                return Err(DocumentError::Corruption("blocks is not a list".into()));
            }
            None => return Ok(None),
        };

        let len = self.doc.length(&list_id);
        let mut blocks = Vec::with_capacity(len);
        for i in 0..len {
            if let Some((Value::Object(ObjType::Map), block_id)) = self.doc.get(&list_id, i)? {
                blocks.push(Block {
                    kind: self
                        .get_string_prop(&block_id, keys::TYPE)?
                        .unwrap_or_else(|| "paragraph".to_string()),
                    text: self.get_text_prop(&block_id, keys::TEXT)?.unwrap_or_default(),
                    level: self.get_int_prop(&block_id, keys::LEVEL)?,
                    language: self.get_string_prop(&block_id, keys::LANGUAGE)?,
                });
            }
        }
        Ok(Some(blocks))
    }

    /// Append a block, creating the block list on first use
    pub fn push_block(&mut self, block: &Block) -> DocumentResult<()> {
        let list_id = match self.doc.get(ROOT, keys::BLOCKS)? {
            Some((Value::Object(ObjType::List), id)) => id,
            _ => self.doc.put_object(ROOT, keys::BLOCKS, ObjType::List)?,
        };

        let len = self.doc.length(&list_id);
        let block_id = self.doc.insert_object(&list_id, len, ObjType::Map)?;
        self.doc.put(&block_id, keys::TYPE, block.kind.as_str())?;
        let text_id = self.doc.put_object(&block_id, keys::TEXT, ObjType::Text)?;
        self.doc.splice_text(&text_id, 0, 0, &block.text)?;
        if let Some(level) = block.level {
            self.doc.put(&block_id, keys::LEVEL, level)?;
        }
        if let Some(language) = &block.language {
            self.doc.put(&block_id, keys::LANGUAGE, language.as_str())?;
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn text_obj(&self, obj_id: &ObjId, prop: &str) -> DocumentResult<Option<ObjId>> {
        match self.doc.get(obj_id, prop)? {
            Some((Value::Object(ObjType::Text), id)) => Ok(Some(id)),
            Some(_) => Err(DocumentError::Corruption(format!("{} is not text", prop))),
            None => Ok(None),
        }
    }

    fn ensure_text(&mut self, prop: &str) -> DocumentResult<ObjId> {
        match self.text_obj(&ROOT, prop)? {
            Some(id) => Ok(id),
            None => Ok(self.doc.put_object(ROOT, prop, ObjType::Text)?),
        }
    }

    fn replace_text(&mut self, text_id: &ObjId, value: &str) -> DocumentResult<()> {
        let current_len = self.doc.length(text_id);
        self.doc.splice_text(text_id, 0, current_len as isize, value)?;
        Ok(())
    }

    /// Text stored either as a Text CRDT or a plain string scalar
    fn get_text_prop(&self, obj_id: &ObjId, prop: &str) -> DocumentResult<Option<String>> {
        match self.doc.get(obj_id, prop)? {
            Some((Value::Object(ObjType::Text), text_id)) => Ok(Some(self.doc.text(&text_id)?)),
            Some((Value::Scalar(s), _)) => match s.as_ref() {
                ScalarValue::Str(text) => Ok(Some(text.to_string())),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn get_string_prop(&self, obj_id: &ObjId, prop: &str) -> DocumentResult<Option<String>> {
        if let Some((Value::Scalar(s), _)) = self.doc.get(obj_id, prop)? {
            if let ScalarValue::Str(text) = s.as_ref() {
                return Ok(Some(text.to_string()));
            }
        }
        Ok(None)
    }

    fn get_int_prop(&self, obj_id: &ObjId, prop: &str) -> DocumentResult<Option<i64>> {
        if let Some((Value::Scalar(s), _)) = self.doc.get(obj_id, prop)? {
            match s.as_ref() {
                ScalarValue::Int(n) => return Ok(Some(*n)),
                ScalarValue::Uint(n) => return Ok(i64::try_from(*n).ok()),
                _ => {}
            }
        }
        Ok(None)
    }
}
