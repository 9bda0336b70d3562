use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// One block of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// Human-readable text.
    Text { text: String },
    /// Structured payload for programmatic consumers.
    Json { json: Value },
}

/// The envelope every tool call resolves to.
///
/// `content` is never empty. An error result holds exactly one text block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

impl ToolResult {
    /// A summary followed by its structured payload.
    pub fn success(summary: impl Into<String>, payload: Value) -> Self {
        Self {
            content: vec![
                ContentBlock::Text {
                    text: summary.into(),
                },
                ContentBlock::Json { json: payload },
            ],
            is_error: false,
        }
    }

    pub fn error(err: &ToolError) -> Self {
        Self {
            content: vec![ContentBlock::Text {
                text: format!("[{}] {}", err.classification(), err),
            }],
            is_error: true,
        }
    }

    /// All text blocks joined by newlines.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Json { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The first structured payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Json { json } => Some(json),
            ContentBlock::Text { .. } => None,
        })
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::error(&err)
    }
}
