//! Cache manager — token-budget accounting and the high-water-mark check
//! that triggers compaction, plus the tool-result image flush that is
//! orthogonal to summarisation.
//!
//! Token estimation is a heuristic (`content.len() / 4`), not an exact
//! tokenizer count. It only needs to be monotone in message length: good
//! enough to decide "are we getting close to the budget", not to bill usage.

use relaygate_core::types::{ContentPart, Message, MessageContent};

/// Tunables for session token-budget accounting.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Token budget estimated from the serialized message list.
    pub max_context_tokens: usize,
    /// Fraction of `max_context_tokens` that triggers compaction.
    pub high_water_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 100_000,
            high_water_ratio: 0.8,
        }
    }
}

/// Per-session token accounting. Stateless beyond its config — callers pass
/// the message list in on every check, so there's nothing to keep in sync
/// with the session store.
pub struct CacheManager {
    config: CacheConfig,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    /// Rough token estimate for a message list: total content length / 4.
    /// Monotone in message length, which is all compaction triggering needs.
    pub fn estimate_tokens(messages: &[Message]) -> usize {
        messages.iter().map(message_char_len).sum::<usize>() / 4
    }

    /// The token count at which compaction should trigger.
    pub fn high_water_mark(&self) -> usize {
        (self.config.max_context_tokens as f64 * self.config.high_water_ratio) as usize
    }

    /// Whether `messages` has crossed the high-water mark.
    pub fn should_compact(&self, messages: &[Message]) -> bool {
        Self::estimate_tokens(messages) >= self.high_water_mark()
    }

    /// Downgrade multimodal tool-result messages before `boundary` to
    /// text-only, discarding their image blocks outright (unlike
    /// `relaygate_providers::adapt::downgrade_tool_result_images`, which
    /// re-injects the images as a synthetic user message for provider
    /// compatibility — this one is a one-way budget reclaim for history
    /// that's aging out of the active window, not a wire-format fixup).
    pub fn flush_tool_results_before(messages: &[Message], boundary: usize) -> Vec<Message> {
        messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                if i < boundary {
                    flush_one(m)
                } else {
                    m.clone()
                }
            })
            .collect()
    }

    /// Flush every multimodal tool result in the list, regardless of age.
    /// Used on explicit request (e.g. before handing history to a provider
    /// known to reject tool-role images outright).
    pub fn flush_all_tool_results(messages: &[Message]) -> Vec<Message> {
        messages.iter().map(flush_one).collect()
    }
}

fn flush_one(m: &Message) -> Message {
    match m {
        Message::Tool {
            content: MessageContent::Parts(parts),
            tool_call_id,
            image_refs,
        } if !image_refs.is_empty() => {
            let text: String = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" ");
            Message::Tool {
                content: MessageContent::Text(text),
                tool_call_id: tool_call_id.clone(),
                image_refs: Vec::new(),
            }
        }
        other => other.clone(),
    }
}

/// Character length of a message's content, counting image data-URI length
/// too (a real cost driver, and it keeps the estimate monotone with respect
/// to the payload actually sent to the provider).
fn message_char_len(m: &Message) -> usize {
    match m {
        Message::System { content } => content.len(),
        Message::User { content, .. } => content_len(content),
        Message::Assistant {
            content,
            tool_calls,
            reasoning_content,
        } => {
            let mut len = content.as_deref().map(str::len).unwrap_or(0);
            len += reasoning_content.as_deref().map(str::len).unwrap_or(0);
            if let Some(calls) = tool_calls {
                for tc in calls {
                    len += tc.function.name.len() + tc.function.arguments.len();
                }
            }
            len
        }
        Message::Tool { content, .. } => content_len(content),
    }
}

fn content_len(content: &MessageContent) -> usize {
    match content {
        MessageContent::Text(text) => text.len(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.len(),
                ContentPart::ImageUrl { image_url } => image_url.url.len(),
            })
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_core::types::{ImageRef, ImageUrl};

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(CacheManager::estimate_tokens(&[]), 0);
    }

    #[test]
    fn test_estimate_tokens_monotone_in_length() {
        let short = vec![Message::user("hi")];
        let long = vec![Message::user("hi ".repeat(1000))];
        assert!(CacheManager::estimate_tokens(&long) > CacheManager::estimate_tokens(&short));
    }

    #[test]
    fn test_high_water_mark() {
        let cache = CacheManager::new(CacheConfig {
            max_context_tokens: 1000,
            high_water_ratio: 0.8,
        });
        assert_eq!(cache.high_water_mark(), 800);
    }

    #[test]
    fn test_should_compact_false_under_budget() {
        let cache = CacheManager::new(CacheConfig {
            max_context_tokens: 100_000,
            high_water_ratio: 0.8,
        });
        let messages = vec![Message::user("hello")];
        assert!(!cache.should_compact(&messages));
    }

    #[test]
    fn test_should_compact_true_over_budget() {
        let cache = CacheManager::new(CacheConfig {
            max_context_tokens: 40,
            high_water_ratio: 0.5,
        });
        // 40 * 0.5 = 20 tokens -> 80 chars trips it
        let messages = vec![Message::user("x".repeat(200))];
        assert!(cache.should_compact(&messages));
    }

    #[test]
    fn test_flush_tool_results_before_boundary_only() {
        let old_tool = Message::Tool {
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "found it".into(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/png;base64,AAAA".into(),
                        detail: None,
                    },
                },
            ]),
            tool_call_id: "call_1".into(),
            image_refs: vec![ImageRef {
                path: "/tmp/old.png".into(),
                mime: "image/png".into(),
            }],
        };
        let recent_tool = old_tool.clone();
        let messages = vec![old_tool, Message::user("more"), recent_tool];

        let flushed = CacheManager::flush_tool_results_before(&messages, 2);

        match &flushed[0] {
            Message::Tool {
                content: MessageContent::Text(text),
                image_refs,
                ..
            } => {
                assert!(text.contains("found it"));
                assert!(image_refs.is_empty());
            }
            _ => panic!("expected message 0 to be flushed to text"),
        }
        // Message at/after the boundary is untouched (still multipart).
        match &flushed[2] {
            Message::Tool {
                content: MessageContent::Parts(_),
                image_refs,
                ..
            } => assert!(!image_refs.is_empty()),
            _ => panic!("expected message 2 to remain multipart"),
        }
    }

    #[test]
    fn test_flush_all_tool_results() {
        let tool = Message::Tool {
            content: MessageContent::Parts(vec![ContentPart::Text {
                text: "result text".into(),
            }]),
            tool_call_id: "call_1".into(),
            image_refs: vec![ImageRef {
                path: "/tmp/a.png".into(),
                mime: "image/png".into(),
            }],
        };
        let flushed = CacheManager::flush_all_tool_results(&[tool]);
        match &flushed[0] {
            Message::Tool {
                content: MessageContent::Text(text),
                image_refs,
                ..
            } => {
                assert_eq!(text, "result text");
                assert!(image_refs.is_empty());
            }
            _ => panic!("expected flushed text tool message"),
        }
    }

    #[test]
    fn test_flush_leaves_text_only_tool_messages_untouched() {
        let tool = Message::tool_result("call_1", "plain result");
        let flushed = CacheManager::flush_all_tool_results(&[tool.clone()]);
        assert_eq!(flushed[0], tool);
    }
}
