//! Markdown projection of CRDT state, used for previews and indexing.

use tracing::warn;

use super::document::{Block, CanvasDocument, DocumentResult};

/// Derived plain-text view of one document state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub markdown: String,
    pub title: Option<String>,
}

impl Projection {
    /// First `limit` characters of the markdown
    pub fn preview(&self, limit: usize) -> String {
        truncate_chars(&self.markdown, limit)
    }
}

/// Project binary state. Unreadable state projects to an empty document.
pub fn project(state: &[u8]) -> Projection {
    match CanvasDocument::load(state).and_then(|doc| project_document(&doc)) {
        Ok(projection) => projection,
        Err(e) => {
            warn!("Failed to project document state ({} bytes): {}", state.len(), e);
            Projection::default()
        }
    }
}

/// Structured blocks win over the raw `content` text when present
pub fn project_document(doc: &CanvasDocument) -> DocumentResult<Projection> {
    let markdown = match doc.blocks()? {
        Some(blocks) if !blocks.is_empty() => render_blocks(&blocks),
        _ => doc.content()?,
    };
    let title = doc.title()?.filter(|t| !t.trim().is_empty());
    Ok(Projection { markdown, title })
}

/// Title exactly as stored in the state, blank included. Canvases mirror it
/// to the record as is.
pub fn raw_title(state: &[u8]) -> Option<String> {
    match CanvasDocument::load(state).and_then(|doc| doc.title()) {
        Ok(title) => title,
        Err(e) => {
            warn!("Failed to read title from state ({} bytes): {}", state.len(), e);
            None
        }
    }
}

fn is_list_item(block: &Block) -> bool {
    matches!(block.kind.as_str(), "bullet" | "ordered" | "task")
}

/// Render blocks as markdown. Consecutive list items share one list.
pub fn render_blocks(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut ordinal = 0;
    let mut previous: Option<&Block> = None;

    for block in blocks {
        if let Some(prev) = previous {
            let same_list = is_list_item(prev) && is_list_item(block);
            out.push_str(if same_list { "\n" } else { "\n\n" });
        }
        if block.kind != "ordered" {
            ordinal = 0;
        }

        match block.kind.as_str() {
            "heading" => {
                let level = block.level.unwrap_or(1).clamp(1, 6) as usize;
                out.push_str(&"#".repeat(level));
                out.push(' ');
                out.push_str(&block.text);
            }
            "code" => {
                out.push_str("```");
                out.push_str(block.language.as_deref().unwrap_or(""));
                out.push('\n');
                out.push_str(&block.text);
                out.push_str("\n```");
            }
            "quote" => {
                let quoted: Vec<String> = block.text.lines().map(|l| format!("> {}", l)).collect();
                out.push_str(&quoted.join("\n"));
            }
            "bullet" => {
                out.push_str("- ");
                out.push_str(&block.text);
            }
            "task" => {
                out.push_str("- [ ] ");
                out.push_str(&block.text);
            }
            "ordered" => {
                ordinal += 1;
                out.push_str(&format!("{}. {}", ordinal, block.text));
            }
            "divider" => out.push_str("---"),
            _ => out.push_str(&block.text),
        }
        previous = Some(block);
    }
    out
}

/// Truncate to at most `limit` characters without splitting a code point
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
