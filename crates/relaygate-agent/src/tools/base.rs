//! Tool trait — the abstract interface every agent tool must implement.
//!
//! The `Tool` trait all tool implementations satisfy.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use relaygate_core::types::{ImageRef, ToolDefinition};

// ─────────────────────────────────────────────
// ToolOutput
// ─────────────────────────────────────────────

/// A single block of a multimodal tool result.
///
/// `Image` carries a filesystem path rather than inline bytes: tools that
/// produce images (chiefly `read_file` on an image attachment) already have
/// the file on disk, so there is nothing to re-encode until the content is
/// actually sent to an LLM.
#[derive(Clone, Debug, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Image { path: String, mime: String },
}

/// The result of a tool call: plain text, or a multimodal list of blocks.
///
/// Most tools only ever produce `Text`. `Blocks` exists for tools whose
/// result legitimately carries an image (e.g. reading an image file back
/// to the agent) — the caller decides how to fold that into the message
/// history (see `ContextBuilder::add_tool_output`).
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolOutput {
    /// Build a plain-text output.
    pub fn text(s: impl Into<String>) -> Self {
        ToolOutput::Text(s.into())
    }

    /// Collapse to a single string: text blocks are concatenated, image
    /// blocks become a `[image: <filename>]` marker.
    pub fn flatten(&self) -> String {
        match self {
            ToolOutput::Text(t) => t.clone(),
            ToolOutput::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    match block {
                        ContentBlock::Text(t) => out.push_str(t),
                        ContentBlock::Image { path, .. } => {
                            let name = std::path::Path::new(path)
                                .file_name()
                                .and_then(|f| f.to_str())
                                .unwrap_or(path);
                            out.push_str(&format!("[image: {name}]"));
                        }
                    }
                }
                out
            }
        }
    }

    /// Whether the flattened text contains `pat`.
    pub fn contains(&self, pat: &str) -> bool {
        self.flatten().contains(pat)
    }

    /// Image references carried by this output, if any.
    pub fn image_refs(&self) -> Vec<ImageRef> {
        match self {
            ToolOutput::Text(_) => Vec::new(),
            ToolOutput::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Image { path, mime } => Some(ImageRef {
                        path: path.clone(),
                        mime: mime.clone(),
                    }),
                    ContentBlock::Text(_) => None,
                })
                .collect(),
        }
    }
}

impl PartialEq<&str> for ToolOutput {
    fn eq(&self, other: &&str) -> bool {
        self.flatten() == *other
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        ToolOutput::Text(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        ToolOutput::Text(s.to_string())
    }
}

// ─────────────────────────────────────────────
// Tool trait
// ─────────────────────────────────────────────

/// Every agent tool implements this trait.
///
/// The agent loop discovers tools via `name()`, sends their schemas to the LLM
/// via `to_definition()`, and dispatches calls via `execute()`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used by the LLM to call this tool (e.g. `"read_file"`).
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters (as a `serde_json::Value`).
    ///
    /// Must be `{"type": "object", "properties": {...}, "required": [...]}`.
    fn parameters(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// Returns either plain text or a multimodal block list (the LLM reads
    /// a flattened/text form unless the caller handles blocks specially).
    /// On failure, return an `Err` — the registry will catch it and
    /// convert to an error string for the LLM.
    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<ToolOutput>;

    /// Build the `ToolDefinition` sent to the LLM.
    ///
    /// Default implementation — rarely needs overriding.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

// ─────────────────────────────────────────────
// Param helpers
// ─────────────────────────────────────────────

/// Extract a required `String` param, returning a user-friendly error.
pub fn require_string(params: &HashMap<String, Value>, key: &str) -> anyhow::Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

/// Extract an optional `String` param.
pub fn optional_string(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Extract an optional integer param.
pub fn optional_i64(params: &HashMap<String, Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Extract an optional boolean param (defaults to `false` if absent).
pub fn optional_bool(params: &HashMap<String, Value>, key: &str) -> bool {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_string_present() {
        let mut params = HashMap::new();
        params.insert("path".into(), json!("/tmp/foo.txt"));
        assert_eq!(require_string(&params, "path").unwrap(), "/tmp/foo.txt");
    }

    #[test]
    fn test_require_string_missing() {
        let params = HashMap::new();
        assert!(require_string(&params, "path").is_err());
    }

    #[test]
    fn test_require_string_wrong_type() {
        let mut params = HashMap::new();
        params.insert("path".into(), json!(42));
        assert!(require_string(&params, "path").is_err());
    }

    #[test]
    fn test_optional_string() {
        let mut params = HashMap::new();
        params.insert("mode".into(), json!("markdown"));
        assert_eq!(optional_string(&params, "mode"), Some("markdown".into()));
        assert_eq!(optional_string(&params, "other"), None);
    }

    #[test]
    fn test_optional_i64() {
        let mut params = HashMap::new();
        params.insert("count".into(), json!(5));
        assert_eq!(optional_i64(&params, "count"), Some(5));
        assert_eq!(optional_i64(&params, "missing"), None);
    }

    #[test]
    fn test_optional_bool() {
        let mut params = HashMap::new();
        params.insert("force".into(), json!(true));
        assert!(optional_bool(&params, "force"));
        assert!(!optional_bool(&params, "missing"));
    }

    /// Verify the default `to_definition()` produces the right shape.
    #[tokio::test]
    async fn test_to_definition_default() {
        struct DummyTool;

        #[async_trait]
        impl Tool for DummyTool {
            fn name(&self) -> &str { "dummy" }
            fn description(&self) -> &str { "A test tool" }
            fn parameters(&self) -> Value {
                json!({
                    "type": "object",
                    "properties": {
                        "msg": { "type": "string" }
                    },
                    "required": ["msg"]
                })
            }
            async fn execute(&self, _params: HashMap<String, Value>) -> anyhow::Result<ToolOutput> {
                Ok(ToolOutput::text("ok"))
            }
        }

        let def = DummyTool.to_definition();
        assert_eq!(def.function.name, "dummy");
        assert_eq!(def.function.description, "A test tool");
        assert_eq!(def.tool_type, "function");
    }
}
