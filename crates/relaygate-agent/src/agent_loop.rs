//! Agent loop — the LLM ↔ tool-calling main loop.
//!
//! The Think/Act/Observe agent loop state machine.
//! Receives inbound messages, builds context, calls the LLM, dispatches
//! tool calls, and publishes outbound responses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info};

use relaygate_core::bus::queue::MessageBus;
use relaygate_core::bus::types::{InboundMessage, OutboundMessage};
use relaygate_core::session::manager::SessionManager;
use relaygate_core::types::{Message, ToolCall};
use relaygate_providers::fallback::{FallbackConfig, FallbackController};
use relaygate_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::cache::{CacheConfig, CacheManager};
use crate::compactor::Compactor;
use crate::context::ContextBuilder;
use crate::subagent::SubagentManager;
use crate::tools::message::MessageTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// Default maximum LLM ↔ tool iterations per user message.
const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Configuration for the exec tool.
#[derive(Clone, Debug)]
pub struct ExecToolConfig {
    /// Timeout in seconds (default 60).
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The main agent loop: polls the message bus, calls the LLM, dispatches tools.
pub struct AgentLoop {
    /// Message bus for inbound/outbound messages.
    bus: Arc<MessageBus>,
    /// LLM provider.
    provider: Arc<dyn LlmProvider>,
    /// Workspace root.
    workspace: PathBuf,
    /// Model to use (overrides provider default if set).
    model: String,
    /// Max LLM ↔ tool iterations per message.
    max_iterations: usize,
    /// LLM request config (temperature, max_tokens).
    request_config: LlmRequestConfig,
    /// Tool registry.
    tools: ToolRegistry,
    /// Context builder.
    context: ContextBuilder,
    /// Session manager.
    sessions: SessionManager,
    /// Reference to the message tool (for set_context).
    message_tool: Arc<MessageTool>,
    /// Spawn tool reference (for set_context).
    spawn_tool: Arc<SpawnTool>,
    /// Subagent manager (also held by SpawnTool; exposed via
    /// `subagent_manager()` for callers outside the loop, e.g. isolated
    /// cron jobs).
    subagent_manager: Arc<SubagentManager>,
    /// Provider-fallback controller. Every LLM call in this loop routes
    /// through it instead of calling `provider` directly.
    fallback: Arc<FallbackController>,
    /// Secondary provider promoted to when the fallback controller trips.
    secondary_provider: Option<Arc<dyn LlmProvider>>,
    /// Token-budget accounting for the in-flight message list.
    cache: CacheManager,
    /// LLM-driven history summarizer, invoked once the cache manager's
    /// high-water mark is crossed.
    compactor: Compactor,
    /// When set, publish each Think-phase's non-empty text content as an
    /// intermediate outbound before continuing the loop.
    stream_steps: bool,
    /// Cooperative cancellation flag, checked between loop states.
    stop: Arc<AtomicBool>,
}

impl AgentLoop {
    /// Create a new agent loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        model: Option<String>,
        max_iterations: Option<usize>,
        request_config: Option<LlmRequestConfig>,
        brave_api_key: Option<String>,
        exec_config: Option<ExecToolConfig>,
        restrict_to_workspace: bool,
        session_manager: Option<SessionManager>,
        agent_name: Option<String>,
        fallback: Option<Arc<FallbackController>>,
        secondary_provider: Option<Arc<dyn LlmProvider>>,
        cache_config: Option<CacheConfig>,
        stream_steps: bool,
    ) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        let max_iterations = max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        let request_config = request_config.unwrap_or_default();
        let exec_config = exec_config.unwrap_or_default();
        let agent_name = agent_name.unwrap_or_else(|| "Relaygate".into());
        let sessions =
            session_manager.unwrap_or_else(|| SessionManager::new(None).expect("failed to create session manager"));
        let fallback = fallback.unwrap_or_else(|| {
            Arc::new(FallbackController::new(None, None, FallbackConfig::default()))
        });
        let cache = CacheManager::new(cache_config.unwrap_or_default());
        let compactor = Compactor::new(
            fallback.clone(),
            provider.clone(),
            secondary_provider.clone(),
            model.clone(),
        );

        let context = ContextBuilder::new(&workspace, &agent_name);

        // Build tool registry
        let mut tools = ToolRegistry::new();
        let allowed_dir = if restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(ExecTool::new(
            workspace.clone(),
            Some(exec_config.timeout),
            restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(brave_api_key.clone())));
        tools.register(Arc::new(WebFetchTool::new()));

        let message_tool = Arc::new(MessageTool::new(None));
        tools.register(message_tool.clone());

        // Subagent manager + spawn tool
        let subagent_manager = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model.clone(),
            brave_api_key,
            exec_config,
            restrict_to_workspace,
            request_config.clone(),
            fallback.clone(),
            secondary_provider.clone(),
        ));

        let spawn_tool = Arc::new(SpawnTool::new(subagent_manager.clone()));
        tools.register(spawn_tool.clone());

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = max_iterations,
            "agent loop initialized"
        );

        Self {
            bus,
            provider,
            workspace,
            model,
            max_iterations,
            request_config,
            tools,
            context,
            sessions,
            message_tool,
            spawn_tool,
            subagent_manager,
            fallback,
            secondary_provider,
            cache,
            compactor,
            stream_steps,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cooperative cancellation of the in-flight (or next) turn.
    ///
    /// Checked between Think/Act/Observe transitions; does not roll back
    /// tool calls or intermediate outbounds already produced.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Clear a previously requested cancellation so the loop can run again.
    pub fn reset_stop(&self) {
        self.stop.store(false, Ordering::Relaxed);
    }

    /// Run the event loop: poll inbound messages and process them.
    ///
    /// This runs indefinitely until the inbound channel is closed.
    pub async fn run(&self) {
        info!("agent loop started, waiting for messages");
        loop {
            match self.bus.consume_inbound().await {
                Some(msg) => {
                    let session_key = msg.session_key();
                    debug!(session_key = %session_key, "received message");

                    // Route system messages (from subagents) vs regular messages
                    let result = if msg.channel == "system" && msg.sender_id == "subagent" {
                        self.process_system_message(&msg).await
                    } else {
                        self.process_message(&msg).await
                    };

                    match result {
                        Ok(response) => {
                            if let Err(e) = self.bus.publish_outbound(response).await {
                                error!(error = %e, "failed to publish outbound message");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, session_key = %session_key, "message processing error");
                            let err_msg = OutboundMessage::new(
                                &msg.channel,
                                &msg.chat_id,
                                &format!("I encountered an error: {e}"),
                            );
                            let _ = self.bus.publish_outbound(err_msg).await;
                        }
                    }
                }
                None => {
                    info!("inbound channel closed, agent loop exiting");
                    break;
                }
            }
        }
    }

    /// Process a single inbound message → outbound response.
    ///
    /// This is the core agent logic:
    /// 1. Get/create session, load history
    /// 2. Build context messages
    /// 3. LLM ↔ tool loop
    /// 4. Save session, return response
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let session_key = msg.session_key();

        // Set message tool context for this conversation
        self.message_tool
            .set_context(&msg.channel, &msg.chat_id)
            .await;

        // Set spawn tool context for this conversation
        self.spawn_tool
            .set_context(&msg.channel, &msg.chat_id)
            .await;

        // Get session history
        let history = self.sessions.get_history(&session_key, 50);

        // Build LLM messages
        let media_paths: Vec<String> = msg.media.iter().map(|m| m.path.clone()).collect();
        let mut messages = self.context.build_messages(
            &history,
            &msg.content,
            &media_paths,
            &msg.channel,
            &msg.chat_id,
        );

        // Get tool definitions
        let tool_defs = self.tools.get_definitions();

        // Agent loop: LLM ↔ tool calling
        let mut final_content: Option<String> = None;
        let mut cancelled = false;

        for iteration in 0..self.max_iterations {
            if self.stop.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }

            debug!(iteration = iteration, "LLM call");

            // Think: typing indicator at the start of every LLM call.
            let mut typing = OutboundMessage::new(&msg.channel, &msg.chat_id, "");
            typing.metadata.insert("chat_action".into(), "typing".into());
            let _ = self.bus.publish_outbound(typing).await;

            let (response, _used_fallback, _error_note) = self
                .fallback
                .call(
                    Some(&session_key),
                    &messages,
                    Some(&tool_defs),
                    &self.model,
                    self.provider.as_ref(),
                    self.secondary_provider.as_deref(),
                    &self.request_config,
                )
                .await;

            if response.is_error() {
                final_content = Some(format!(
                    "I hit a problem talking to the model: {}",
                    response.content.unwrap_or_else(|| "unknown error".into())
                ));
                break;
            }

            if response.has_tool_calls() {
                // A Think that produced text alongside tool calls is
                // streamed as an intermediate outbound before Act runs.
                if self.stream_steps {
                    if let Some(text) = response.content.as_ref().filter(|c| !c.is_empty()) {
                        let mut intermediate =
                            OutboundMessage::new(&msg.channel, &msg.chat_id, text.as_str());
                        intermediate
                            .metadata
                            .insert("intermediate".into(), "true".into());
                        let _ = self.bus.publish_outbound(intermediate).await;
                    }
                }

                // Add assistant message with tool calls
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(
                    &mut messages,
                    response.content.clone(),
                    tool_calls.clone(),
                );

                if response.is_truncated() {
                    // The response was cut off mid tool-call — don't execute
                    // anything against possibly-incomplete arguments. Tell the
                    // model what happened and loop back to Think.
                    for tc in &tool_calls {
                        ContextBuilder::add_tool_result(
                            &mut messages,
                            &tc.id,
                            "Error: response was cut off before this tool call could be completed.",
                        );
                    }
                    continue;
                }

                if self.stop.load(Ordering::Relaxed) {
                    cancelled = true;
                    break;
                }

                // Execute each tool call
                for tc in &tool_calls {
                    let params: HashMap<String, serde_json::Value> = serde_json::from_str(
                        &relaygate_providers::adapt::recover_truncated_arguments(&tc.function.arguments),
                    )
                    .unwrap_or_default();

                    info!(
                        tool = %tc.function.name,
                        iteration = iteration,
                        "executing tool call"
                    );

                    let result = self.tools.execute(&tc.function.name, params).await;

                    debug!(
                        tool = %tc.function.name,
                        result_len = result.len(),
                        "tool result"
                    );

                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }

                if self.cache.should_compact(&messages) {
                    if let Some(compacted) =
                        self.compactor.compact(&session_key, &messages).await
                    {
                        messages = compacted;
                    }
                }
            } else {
                // No tool calls → final answer
                final_content = response.content;
                break;
            }
        }

        if cancelled {
            self.sessions
                .add_message(&session_key, Message::user(&msg.content));
            return Ok(OutboundMessage::new(
                &msg.channel,
                &msg.chat_id,
                "Cancelled.",
            ));
        }

        // If we exhausted iterations without a final answer
        let content = final_content
            .unwrap_or_else(|| "I've completed processing but have no response to give.".into());

        // Save conversation to session
        self.sessions
            .add_message(&session_key, Message::user(&msg.content));
        self.sessions
            .add_message(&session_key, Message::assistant(&content));

        Ok(OutboundMessage::new(&msg.channel, &msg.chat_id, &content))
    }

    /// Process a system message (from a subagent or cron).
    ///
    /// Parses the original `channel:chat_id` from `msg.chat_id`,
    /// loads the original session, runs a full LLM call to summarize
    /// the result, and routes the response back to the correct channel.
    async fn process_system_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        info!(
            sender = %msg.sender_id,
            chat_id = %msg.chat_id,
            "processing system message"
        );

        // Parse origin from chat_id format "channel:chat_id"
        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => {
                return Err(anyhow::anyhow!(
                    "Invalid system message chat_id format: {}",
                    msg.chat_id
                ));
            }
        };

        let session_key = format!("{origin_channel}:{origin_chat_id}");

        // Set tools context to the original channel/chat
        self.message_tool
            .set_context(&origin_channel, &origin_chat_id)
            .await;
        self.spawn_tool
            .set_context(&origin_channel, &origin_chat_id)
            .await;

        // Load the original session
        let history = self.sessions.get_history(&session_key, 50);

        // Build messages with the subagent result as the "user" message
        let mut messages =
            self.context
                .build_messages(&history, &msg.content, &[], &origin_channel, &origin_chat_id);

        let tool_defs = self.tools.get_definitions();
        let mut final_content: Option<String> = None;

        for iteration in 0..self.max_iterations {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            debug!(iteration = iteration, "system message LLM call");

            let (response, _used_fallback, _error_note) = self
                .fallback
                .call(
                    Some(&session_key),
                    &messages,
                    Some(&tool_defs),
                    &self.model,
                    self.provider.as_ref(),
                    self.secondary_provider.as_deref(),
                    &self.request_config,
                )
                .await;

            if response.is_error() {
                final_content = Some(format!(
                    "I hit a problem talking to the model: {}",
                    response.content.unwrap_or_else(|| "unknown error".into())
                ));
                break;
            }

            if response.has_tool_calls() {
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(
                    &mut messages,
                    response.content.clone(),
                    tool_calls.clone(),
                );

                if response.is_truncated() {
                    for tc in &tool_calls {
                        ContextBuilder::add_tool_result(
                            &mut messages,
                            &tc.id,
                            "Error: response was cut off before this tool call could be completed.",
                        );
                    }
                    continue;
                }

                for tc in &tool_calls {
                    let params: HashMap<String, serde_json::Value> = serde_json::from_str(
                        &relaygate_providers::adapt::recover_truncated_arguments(&tc.function.arguments),
                    )
                    .unwrap_or_default();
                    let result = self.tools.execute(&tc.function.name, params).await;
                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }

                if self.cache.should_compact(&messages) {
                    if let Some(compacted) =
                        self.compactor.compact(&session_key, &messages).await
                    {
                        messages = compacted;
                    }
                }
            } else {
                final_content = response.content;
                break;
            }
        }

        let content = final_content
            .unwrap_or_else(|| "I've completed processing but have no response to give.".into());

        // Save to the original session
        self.sessions
            .add_message(&session_key, Message::user(&msg.content));
        self.sessions
            .add_message(&session_key, Message::assistant(&content));

        // Route response to the original channel/chat
        Ok(OutboundMessage::new(
            &origin_channel,
            &origin_chat_id,
            &content,
        ))
    }

    /// Direct processing mode (CLI entry point).
    ///
    /// Wraps text into an `InboundMessage` on the "cli" channel and processes.
    pub async fn process_direct(&self, text: &str) -> Result<String> {
        let msg = InboundMessage::new("cli", "user", "direct", text);
        let response = self.process_message(&msg).await?;
        Ok(response.content)
    }

    /// Get a reference to the tool registry (for testing/extension).
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get a handle to the sub-agent manager, so callers outside the loop
    /// (e.g. the cron dispatcher running an isolated-mode job) can spawn a
    /// restricted session and get its result delivered through the same
    /// announcement pathway as a normal sub-agent task.
    pub fn subagent_manager(&self) -> Arc<SubagentManager> {
        self.subagent_manager.clone()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
