//! Provider-specific message adaptations applied by the fallback wrapper
//! before each dispatch: vision stripping, prompt-cache markers, tool-result
//! image downgrades, and truncated tool-call argument recovery.
//!
//! Per-provider wire formats themselves stay inside
//! [`crate::http_provider::HttpProvider`] — these functions only reshape
//! the abstract `Message` list before it gets there.

use regex::Regex;
use relaygate_core::types::{ContentPart, ImageRef, Message, MessageContent};

/// Models known not to support vision input. Anything not listed here is
/// assumed to support images — mirrors `model_supports_vision`'s
/// "unknown models default to True" fallback.
const NO_VISION_MODELS: &[&str] = &[
    "deepseek-chat",
    "deepseek-reasoner",
    "moonshot-v1-8k",
    "moonshot-v1-32k",
    "moonshot-v1-128k",
];

/// Whether `model` is known to support vision input.
pub fn model_supports_vision(model: &str) -> bool {
    !NO_VISION_MODELS.iter().any(|m| model.contains(m))
}

/// For models without vision capability, strip image parts from user
/// messages and leave a short text placeholder in their place.
pub fn strip_vision_if_unsupported(messages: &[Message], model: &str) -> Vec<Message> {
    if model_supports_vision(model) {
        return messages.to_vec();
    }

    messages
        .iter()
        .cloned()
        .map(|m| match m {
            Message::User {
                content: MessageContent::Parts(parts),
                image_refs,
            } => {
                let mut text = String::new();
                let mut image_count = 0usize;
                for part in parts {
                    match part {
                        ContentPart::Text { text: t } => text.push_str(&t),
                        ContentPart::ImageUrl { .. } => image_count += 1,
                    }
                }
                if image_count > 0 {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(&format!("[{image_count} image(s) omitted: model has no vision support]"));
                }
                Message::User {
                    content: MessageContent::Text(text),
                    image_refs,
                }
            }
            other => other,
        })
        .collect()
}

/// Downgrade image content carried by tool-result messages to a text
/// placeholder, re-injecting the removed images as a synthetic user
/// message immediately after so providers that reject images in a
/// `tool` role still let the model see them.
pub fn downgrade_tool_result_images(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        match message {
            Message::Tool {
                content,
                tool_call_id,
                image_refs,
            } if !image_refs.is_empty() => {
                out.push(Message::Tool {
                    content: content.clone(),
                    tool_call_id: tool_call_id.clone(),
                    image_refs: Vec::new(),
                });
                out.push(reinjected_image_message(image_refs));
            }
            other => out.push(other.clone()),
        }
    }

    out
}

fn reinjected_image_message(image_refs: &[ImageRef]) -> Message {
    let mut parts = Vec::new();
    for r in image_refs {
        if let Ok(data) = std::fs::read(&r.path) {
            let b64 = base64_encode(&data);
            parts.push(ContentPart::ImageUrl {
                image_url: relaygate_core::types::ImageUrl {
                    url: format!("data:{};base64,{}", r.mime, b64),
                    detail: None,
                },
            });
        }
    }
    parts.push(ContentPart::Text {
        text: "(images from the preceding tool result)".to_string(),
    });
    Message::User {
        content: MessageContent::Parts(parts),
        image_refs: Vec::new(),
    }
}

/// Strip internal underscore-prefixed metadata keys (`_image_path`,
/// `_mime_type`, ...) from a JSON value before it is sent to a provider.
/// Recurses into objects and arrays; leaves scalars untouched.
pub fn strip_underscore_keys(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.retain(|k, _| !k.starts_with('_'));
            for v in map.values_mut() {
                strip_underscore_keys(v);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items.iter_mut() {
                strip_underscore_keys(v);
            }
        }
        _ => {}
    }
}

/// Best-effort recovery of a truncated tool-call-argument JSON string.
///
/// When a provider cuts generation off mid-argument-string, `arguments` is
/// not valid JSON. Rather than discard it, pull out whatever top-level
/// string fields look complete via regex, and preserve the trailing
/// (possibly-truncated) field under its original name so no content is
/// silently dropped.
pub fn recover_truncated_arguments(arguments: &str) -> String {
    if serde_json::from_str::<serde_json::Value>(arguments).is_ok() {
        return arguments.to_string();
    }

    let field_re = Regex::new(r#""([A-Za-z0-9_]+)"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap();
    let mut recovered = serde_json::Map::new();
    let mut last_end = 0;

    for cap in field_re.captures_iter(arguments) {
        let key = cap[1].to_string();
        let val = cap[2].replace("\\\"", "\"").replace("\\n", "\n");
        recovered.insert(key, serde_json::Value::String(val));
        last_end = cap.get(0).map(|m| m.end()).unwrap_or(last_end);
    }

    // Anything after the last fully-matched field is a truncated tail —
    // attribute it to a trailing open field if one is recognizable.
    if let Some(tail_key_start) = arguments[last_end..].find('"') {
        let tail = &arguments[last_end + tail_key_start..];
        if let Some(colon) = tail.find(':') {
            let key = tail[1..colon.saturating_sub(1).max(1)]
                .trim_matches('"')
                .to_string();
            let value_start = colon + 1;
            let raw_value = tail[value_start..].trim().trim_start_matches('"');
            if !key.is_empty() && !raw_value.is_empty() {
                recovered
                    .entry(key)
                    .or_insert_with(|| serde_json::Value::String(raw_value.to_string()));
            }
        }
    }

    serde_json::Value::Object(recovered).to_string()
}

/// Whether a provider error message signals the Gemini free-tier cache
/// storage rate limit, which is retried once with all cache markers
/// stripped rather than treated as a normal fallback-triggering failure.
pub fn is_gemini_cache_storage_limit_error(message: &str) -> bool {
    message.contains("TotalCachedContentStorageTokensPerModelFreeTier")
}

/// Models known to honor an Anthropic-style `cache_control` marker on
/// request content. Unknown models default to `false` — unlike vision,
/// caching support is the exception rather than the rule, so we only
/// spend the marker where it is known to be read.
const CACHE_CAPABLE_MODELS: &[&str] = &["claude", "anthropic"];

/// Whether `model` is known to read prompt-cache markers.
pub fn model_supports_prompt_caching(model: &str) -> bool {
    let lower = model.to_lowercase();
    CACHE_CAPABLE_MODELS.iter().any(|m| lower.contains(m))
}

/// The ephemeral cache-control marker value injected at cache boundaries.
pub fn cache_control_marker() -> serde_json::Value {
    serde_json::json!({"type": "ephemeral"})
}

/// Indices of the two cache boundaries the wrapper marks before dispatch:
/// the system prompt (if the first message is `system`), and a sliding
/// boundary on the last tool-result message, falling back to the
/// second-to-last user message when there is no tool result yet.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CacheBoundaries {
    pub system_index: Option<usize>,
    pub sliding_index: Option<usize>,
}

/// Compute the cache boundary indices for a message list, per spec.md
/// §4.5: "Prompt caching markers injected at the system-prompt boundary
/// and at a sliding boundary on the last tool-result (or the 2nd-to-last
/// user message, fallback)."
pub fn cache_boundaries(messages: &[Message]) -> CacheBoundaries {
    let system_index = messages
        .first()
        .filter(|m| matches!(m, Message::System { .. }))
        .map(|_| 0);

    let last_tool_index = messages
        .iter()
        .rposition(|m| matches!(m, Message::Tool { .. }));

    let sliding_index = last_tool_index.or_else(|| {
        let user_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| matches!(m, Message::User { .. }))
            .map(|(i, _)| i)
            .collect();
        user_indices.len().checked_sub(2).map(|i| user_indices[i])
    });

    CacheBoundaries {
        system_index,
        sliding_index,
    }
}

/// Inject `cache_control` into a serialized chat-completion request body
/// at the boundaries `cache_boundaries` identified. Operates on the
/// already-`serde_json`-serialized request so the abstract [`Message`]
/// type (shared by every provider) never has to carry a field most
/// providers ignore.
///
/// System messages serialize as a plain string `content`; the marker is
/// attached at message level for both system and tool/user boundaries,
/// since `HttpProvider` speaks the OpenAI-compatible shape rather than
/// Anthropic's native content-block array.
pub fn inject_cache_markers(request_body: &mut serde_json::Value, boundaries: &CacheBoundaries) {
    let Some(messages) = request_body.get_mut("messages").and_then(|v| v.as_array_mut()) else {
        return;
    };
    for idx in [boundaries.system_index, boundaries.sliding_index]
        .into_iter()
        .flatten()
    {
        if let Some(msg) = messages.get_mut(idx).and_then(|v| v.as_object_mut()) {
            msg.insert("cache_control".to_string(), cache_control_marker());
        }
    }
}

/// Strip any `cache_control` keys from a serialized request body — used
/// for the single no-cache retry after a Gemini free-tier cache-storage
/// rate-limit error.
pub fn strip_cache_markers(request_body: &mut serde_json::Value) {
    strip_underscore_or_named_key(request_body, "cache_control");
}

fn strip_underscore_or_named_key(value: &mut serde_json::Value, key: &str) {
    match value {
        serde_json::Value::Object(map) => {
            map.remove(key);
            for v in map.values_mut() {
                strip_underscore_or_named_key(v, key);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items.iter_mut() {
                strip_underscore_or_named_key(v, key);
            }
        }
        _ => {}
    }
}

fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = if chunk.len() > 1 { chunk[1] as u32 } else { 0 };
        let b2 = if chunk.len() > 2 { chunk[2] as u32 } else { 0 };
        let n = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[((n >> 18) & 0x3f) as usize] as char);
        out.push(ALPHABET[((n >> 12) & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[((n >> 6) & 0x3f) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(n & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}
