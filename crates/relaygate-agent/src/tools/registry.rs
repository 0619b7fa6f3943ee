//! Tool Registry — thread-safe store mapping tool names to implementations.
//!
//! The agent loop registers tools here and dispatches LLM tool-call requests
//! by name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relaygate_core::types::ToolDefinition;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::base::{require_string, Tool, ToolOutput};

/// Tools safe to hand to a sub-agent: no meta-tools (`message`, `spawn`)
/// that could let a sub-agent message channels directly or spawn further
/// sub-agents.
pub const SAFE_TOOL_NAMES: &[&str] = &[
    "read_file",
    "write_file",
    "edit_file",
    "list_dir",
    "exec",
    "web_search",
    "web_fetch",
];

/// Check that every requested tool name is in `safe`. Returns the unknown
/// names (in the order they were requested) on failure.
pub fn validate_allowed_tools(requested: &[String], safe: &[&str]) -> Result<(), Vec<String>> {
    let unknown: Vec<String> = requested
        .iter()
        .filter(|n| !safe.contains(&n.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(unknown)
    }
}

// ─────────────────────────────────────────────
// deliver_result sentinel
// ─────────────────────────────────────────────

/// Sentinel tool a sub-agent calls to deliver its final result and end the
/// task, rather than relying on plain-text output alone. Shares an
/// `Arc<AsyncMutex<Option<String>>>` handle with whoever drives the
/// sub-agent's loop, so that loop can detect delivery without inspecting
/// tool-call history.
pub struct DeliverResultTool {
    result: Arc<AsyncMutex<Option<String>>>,
}

impl DeliverResultTool {
    /// Build a new sentinel tool, returning it alongside the shared handle
    /// the caller polls for the delivered result.
    pub fn new() -> (Arc<Self>, Arc<AsyncMutex<Option<String>>>) {
        let result = Arc::new(AsyncMutex::new(None));
        (
            Arc::new(Self {
                result: result.clone(),
            }),
            result,
        )
    }
}

#[async_trait]
impl Tool for DeliverResultTool {
    fn name(&self) -> &str {
        "deliver_result"
    }

    fn description(&self) -> &str {
        "Call this when the task is complete to deliver the final result. \
         This ends the task — no further tool calls will run after it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "The final result or answer for this task"
                }
            },
            "required": ["result"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<ToolOutput> {
        let result = require_string(&params, "result")?;
        let mut guard = self.result.lock().await;
        *guard = Some(result.clone());
        Ok(ToolOutput::text(format!("Result delivered: {result}")))
    }
}

// ─────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────

/// Stores tools keyed by name and dispatches calls.
///
/// Owns `Arc<dyn Tool>` so tools can be shared across threads.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        info!(tool = tool.name(), "registered tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name. Returns the removed tool, if any.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        let removed = self.tools.remove(name);
        if removed.is_some() {
            info!(tool = name, "unregistered tool");
        }
        removed
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the LLM-facing definitions for all registered tools.
    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool by name with the given parameters, flattened to text.
    ///
    /// Errors are always surfaced as tool-result strings: the LLM always gets a
    /// `String` back, even on failure. Callers that need to preserve a
    /// multimodal result (e.g. an image a tool read from disk) should use
    /// `execute_full` instead.
    pub async fn execute(&self, name: &str, params: HashMap<String, serde_json::Value>) -> String {
        self.execute_full(name, params).await.flatten()
    }

    /// Execute a tool by name, preserving a multimodal result as `ToolOutput`.
    ///
    /// Errors are converted to a `ToolOutput::Text` error message rather than
    /// propagated, for the same reason as `execute`: the LLM must always get
    /// some tool-result content back, never a broken turn.
    pub async fn execute_full(
        &self,
        name: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> ToolOutput {
        let tool = match self.tools.get(name) {
            Some(t) => t,
            None => {
                warn!(tool = name, "tool not found");
                return ToolOutput::text(format!("Error: Tool '{name}' not found"));
            }
        };

        match tool.execute(params).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                ToolOutput::text(format!("Error executing {name}: {e}"))
            }
        }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
