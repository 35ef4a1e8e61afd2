//! Structural view of a document's rich-text content.
//!
//! The tree mirrors the editor's JSON document shape (`type`, `attrs`,
//! `content`, `text`, `marks`) so it can be produced from the live replica
//! or deserialized from editor JSON alike.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod images;
pub mod markdown;

pub use images::{collect_referenced_image_ids, effective_image_source, extract_image_id_from_source};
pub use markdown::{normalize_for_export, render_markdown};

/// A node of the rich-text content tree
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentNode {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

/// Inline formatting attached to a text node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, JsonValue>,
}

impl ContentNode {
    /// An empty document
    pub fn doc(content: Vec<ContentNode>) -> Self {
        Self {
            kind: "doc".to_string(),
            content,
            ..Default::default()
        }
    }

    pub fn element(kind: impl Into<String>, attrs: Map<String, JsonValue>) -> Self {
        Self {
            kind: kind.into(),
            attrs,
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>, marks: Vec<Mark>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            marks,
            ..Default::default()
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == "text"
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(JsonValue::as_str)
    }

    pub fn attr_bool(&self, name: &str) -> bool {
        self.attrs
            .get(name)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Visit this node and all descendants depth-first, parents before children
    pub fn walk<F>(&self, visitor: &mut F)
    where
        F: FnMut(&ContentNode),
    {
        visitor(self);
        for child in &self.content {
            child.walk(visitor);
        }
    }

    /// Concatenated text of all descendant text nodes
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.walk(&mut |node| {
            if let Some(text) = &node.text {
                out.push_str(text);
            }
        });
        out
    }
}
