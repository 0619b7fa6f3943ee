//! LLM-driven compaction of a session's message history.
//!
//! Triggered by [`crate::cache::CacheManager::should_compact`]: once the
//! token estimate crosses the high-water mark, the oldest prefix of the
//! history is summarised by the model itself and replaced with a single
//! synthetic system message, keeping a verbatim tail so the most recent
//! tool-call/result pair is never split across the boundary.

use std::sync::Arc;

use relaygate_core::types::Message;
use relaygate_providers::fallback::FallbackController;
use relaygate_providers::traits::{LlmProvider, LlmRequestConfig};
use tracing::{info, warn};

use crate::cache::CacheManager;

/// Trailing messages kept verbatim across a compaction. Large enough to
/// keep the current turn's tool-call/result pair intact even when the
/// assistant made several calls before replying.
const MIN_KEEP_TAIL: usize = 6;

const SUMMARY_SYSTEM_PROMPT: &str = "You are compacting an agent's conversation history to \
free up context space. Summarize the conversation below into a concise paragraph that \
preserves: the user's goals, decisions made, facts established, and the state of any \
in-progress work. Omit pleasantries and routine tool chatter. Write only the summary, \
with no preamble.";

/// Summarises an over-budget message prefix via an LLM call routed through
/// the same fallback controller the agent loop itself uses.
pub struct Compactor {
    fallback: Arc<FallbackController>,
    provider: Arc<dyn LlmProvider>,
    secondary: Option<Arc<dyn LlmProvider>>,
    model: String,
    request_config: LlmRequestConfig,
}

impl Compactor {
    pub fn new(
        fallback: Arc<FallbackController>,
        provider: Arc<dyn LlmProvider>,
        secondary: Option<Arc<dyn LlmProvider>>,
        model: String,
    ) -> Self {
        Self {
            fallback,
            provider,
            secondary,
            model,
            request_config: LlmRequestConfig::default(),
        }
    }

    /// Pick the index at which the verbatim tail begins. Keeps at least
    /// `min_keep` trailing messages, then walks the boundary back over any
    /// `Tool` message so a tool-call/tool-result pair is never split (the
    /// assistant's tool-call message must stay paired with its result).
    fn compaction_boundary(messages: &[Message], min_keep: usize) -> usize {
        if messages.len() <= min_keep {
            return 0;
        }
        let mut boundary = messages.len() - min_keep;
        while boundary > 0 && matches!(messages[boundary], Message::Tool { .. }) {
            boundary -= 1;
        }
        boundary
    }

    /// Attempt to compact `messages`. Returns the replacement list on
    /// success. On an empty prefix, an LLM error, or an empty summary, the
    /// history is left untouched and `None` is returned — compaction is a
    /// best-effort space reclaim, never a source of lost conversation.
    pub async fn compact(&self, session_key: &str, messages: &[Message]) -> Option<Vec<Message>> {
        let boundary = Self::compaction_boundary(messages, MIN_KEEP_TAIL);
        if boundary == 0 {
            return None;
        }

        let tail = &messages[boundary..];
        // Images in the prefix being summarised cost tokens the summariser
        // doesn't need to spend on; flush them before submitting.
        let prefix = CacheManager::flush_tool_results_before(messages, boundary);
        let prefix = &prefix[..boundary];

        let mut summarization_messages = vec![Message::system(SUMMARY_SYSTEM_PROMPT)];
        summarization_messages.extend_from_slice(prefix);
        summarization_messages.push(Message::user(
            "Summarize the conversation above in one paragraph.",
        ));

        let (response, _used_fallback, _note) = self
            .fallback
            .call(
                None,
                &summarization_messages,
                None,
                &self.model,
                self.provider.as_ref(),
                self.secondary.as_deref().map(|p| p as &dyn LlmProvider),
                &self.request_config,
            )
            .await;

        if response.is_error() {
            warn!(
                session_key,
                error = ?response.content,
                "compaction LLM call failed, leaving session history untouched"
            );
            return None;
        }

        let summary = response.content.unwrap_or_default();
        if summary.trim().is_empty() {
            warn!(session_key, "compaction produced an empty summary, leaving session history untouched");
            return None;
        }

        let mut new_messages = Vec::with_capacity(tail.len() + 1);
        new_messages.push(Message::system(format!(
            "# Summary of earlier conversation\n\n{}",
            summary.trim()
        )));
        new_messages.extend_from_slice(tail);

        info!(
            session_key,
            dropped = prefix.len(),
            kept = tail.len(),
            "compacted session history"
        );
        Some(new_messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaygate_core::types::LlmResponse;
    use relaygate_providers::fallback::FallbackConfig;
    use std::sync::Mutex as StdMutex;

    struct MockProvider {
        responses: StdMutex<Vec<LlmResponse>>,
    }

    impl MockProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: StdMutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[relaygate_core::types::ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                LlmResponse::error("no more mock responses")
            } else {
                responses.remove(0)
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            "mock"
        }
    }

    fn make_compactor(responses: Vec<LlmResponse>) -> Compactor {
        let fallback = Arc::new(FallbackController::new(None, None, FallbackConfig::default()));
        let provider: Arc<dyn LlmProvider> = Arc::new(MockProvider::new(responses));
        Compactor::new(fallback, provider, None, "mock-model".to_string())
    }

    fn long_history(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("message {i}"))).collect()
    }

    #[test]
    fn test_compaction_boundary_short_history_no_compaction() {
        let messages = long_history(3);
        assert_eq!(Compactor::compaction_boundary(&messages, 6), 0);
    }

    #[test]
    fn test_compaction_boundary_keeps_min_tail() {
        let messages = long_history(20);
        let boundary = Compactor::compaction_boundary(&messages, 6);
        assert_eq!(boundary, 14);
    }

    #[test]
    fn test_compaction_boundary_does_not_split_tool_pair() {
        let mut messages = long_history(10);
        // Put a lone tool message right where the naive boundary would land.
        messages.insert(4, Message::tool_result("call_1", "result"));
        let boundary = Compactor::compaction_boundary(&messages, 6);
        assert!(!matches!(messages[boundary], Message::Tool { .. }));
    }

    #[tokio::test]
    async fn test_compact_success_replaces_prefix_with_summary() {
        let compactor = make_compactor(vec![LlmResponse {
            content: Some("User asked about X, we did Y.".to_string()),
            tool_calls: vec![],
            finish_reason: Some("stop".to_string()),
            usage: None,
            reasoning_content: None,
        }]);
        let messages = long_history(20);
        let result = compactor.compact("cli:user", &messages).await;
        assert!(result.is_some());
        let new_messages = result.unwrap();
        assert_eq!(new_messages.len(), 1 + 6);
        match &new_messages[0] {
            Message::System { content } => assert!(content.contains("User asked about X")),
            _ => panic!("expected summary system message first"),
        }
    }

    #[tokio::test]
    async fn test_compact_short_history_returns_none() {
        let compactor = make_compactor(vec![]);
        let messages = long_history(3);
        assert!(compactor.compact("cli:user", &messages).await.is_none());
    }

    #[tokio::test]
    async fn test_compact_llm_error_leaves_history_untouched() {
        let compactor = make_compactor(vec![LlmResponse::error("boom")]);
        let messages = long_history(20);
        assert!(compactor.compact("cli:user", &messages).await.is_none());
    }

    #[tokio::test]
    async fn test_compact_empty_summary_leaves_history_untouched() {
        let compactor = make_compactor(vec![LlmResponse {
            content: Some("   ".to_string()),
            tool_calls: vec![],
            finish_reason: Some("stop".to_string()),
            usage: None,
            reasoning_content: None,
        }]);
        let messages = long_history(20);
        assert!(compactor.compact("cli:user", &messages).await.is_none());
    }
}
