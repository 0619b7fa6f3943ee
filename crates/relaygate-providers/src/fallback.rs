//! Process-wide provider-fallback controller.
//!
//! Promotes a secondary provider after consecutive primary failures, probes
//! the primary periodically, and is the single call site every LLM
//! call-site (agent loop, sub-agent manager, compactor) routes through.
//!
//! State is passed explicitly rather than living on a module global, so it
//! can be unit-tested without process-wide side effects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use relaygate_core::bus::queue::MessageBus;
use relaygate_core::bus::types::OutboundMessage;
use relaygate_core::types::{LlmResponse, Message, ToolDefinition};

use crate::adapt;
use crate::traits::{LlmProvider, LlmRequestConfig};

/// Tunables for the fallback controller. Config-file-backed (see
/// `relaygate_core::config::schema::FallbackConfig`).
#[derive(Clone, Debug)]
pub struct FallbackConfig {
    /// Consecutive primary failures required before entering fallback mode.
    pub threshold: u32,
    /// Seconds to wait before re-probing the primary once in fallback mode.
    pub probe_interval_secs: u64,
    /// Per-call I/O deadline.
    pub call_timeout_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            probe_interval_secs: 300,
            call_timeout_secs: 120,
        }
    }
}

/// Tracks primary/fallback provider state for automatic failover.
#[derive(Clone, Debug)]
pub struct FallbackState {
    pub consecutive_failures: u32,
    pub fallback_mode: bool,
    last_primary_probe: Instant,
}

impl Default for FallbackState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            fallback_mode: false,
            last_primary_probe: Instant::now(),
        }
    }
}

impl FallbackState {
    /// Record a successful primary call. Returns `true` if this exits
    /// fallback mode (i.e. the call was serving while still marked as
    /// being in fallback).
    pub fn record_primary_success(&mut self) -> bool {
        let was_fallback = self.fallback_mode;
        self.consecutive_failures = 0;
        self.fallback_mode = false;
        was_fallback
    }

    /// Record a primary failure. Returns `true` if this crosses `threshold`
    /// and triggers fallback-mode entry.
    pub fn record_primary_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures += 1;
        if !self.fallback_mode && self.consecutive_failures >= threshold {
            self.fallback_mode = true;
            return true;
        }
        false
    }

    /// Whether enough time has passed to try the primary provider again.
    /// Always `true` outside fallback mode.
    pub fn should_probe_primary(&self, interval_secs: u64) -> bool {
        if !self.fallback_mode {
            return true;
        }
        self.last_primary_probe.elapsed() >= Duration::from_secs(interval_secs)
    }

    /// Mark the current time as the last primary probe attempt.
    pub fn mark_primary_probed(&mut self) {
        self.last_primary_probe = Instant::now();
    }

    /// Whether the state is at its default — used to decide whether the
    /// on-disk file needs writing at all.
    pub fn is_default(&self) -> bool {
        self.consecutive_failures == 0 && !self.fallback_mode
    }
}

/// The two fields actually persisted to `fallback_state.json`. The probe
/// clock is a process-local `Instant` and is not meaningful across a
/// restart, so it resets (a fresh probe becomes immediately eligible once
/// the probe interval has elapsed from process start).
#[derive(Serialize, Deserialize)]
struct FallbackStateFile {
    consecutive_failures: u32,
    fallback_mode: bool,
}

/// Single entry point for every LLM call site. Consults and mutates a
/// shared [`FallbackState`], applies provider adaptations, and funnels
/// both primary and secondary calls through the same per-call timeout.
pub struct FallbackController {
    state: Arc<Mutex<FallbackState>>,
    config: FallbackConfig,
    state_path: Option<PathBuf>,
    bus: Option<Arc<MessageBus>>,
}

impl FallbackController {
    pub fn new(
        state_path: Option<PathBuf>,
        bus: Option<Arc<MessageBus>>,
        config: FallbackConfig,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(FallbackState::default())),
            config,
            state_path,
            bus,
        }
    }

    /// Load persisted state from `state_path`, if present and parseable.
    /// Absence or a parse failure silently falls back to defaults.
    pub async fn load(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let Ok(raw) = tokio::fs::read_to_string(path).await else {
            return;
        };
        let Ok(parsed) = serde_json::from_str::<FallbackStateFile>(&raw) else {
            warn!(path = %path.display(), "fallback state file unparseable, using defaults");
            return;
        };
        let mut state = self.state.lock().await;
        state.consecutive_failures = parsed.consecutive_failures;
        state.fallback_mode = parsed.fallback_mode;
    }

    async fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let state = self.state.lock().await;
        if state.is_default() {
            return;
        }
        let file = FallbackStateFile {
            consecutive_failures: state.consecutive_failures,
            fallback_mode: state.fallback_mode,
        };
        drop(state);

        let Ok(body) = serde_json::to_string_pretty(&file) else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "failed to create fallback state directory");
                return;
            }
        }
        let tmp_path = path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp_path, body).await {
            warn!(error = %e, "failed to write fallback state temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            warn!(error = %e, "failed to rename fallback state temp file");
        }
    }

    async fn notify(&self, channel: &str, chat_id: &str, text: &str) {
        if let Some(bus) = &self.bus {
            let msg = OutboundMessage::new(channel, chat_id, text);
            if let Err(e) = bus.publish_outbound(msg).await {
                warn!(error = %e, "failed to publish fallback notification");
            }
        }
    }

    async fn dispatch(
        &self,
        provider: &dyn LlmProvider,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> LlmResponse {
        let adapted = adapt::strip_vision_if_unsupported(messages, model);
        let adapted = adapt::downgrade_tool_result_images(&adapted);

        let timeout = Duration::from_secs(self.config.call_timeout_secs);
        match tokio::time::timeout(timeout, provider.chat(&adapted, tools, model, config)).await {
            Ok(response) => {
                if response.is_error()
                    && adapt::is_gemini_cache_storage_limit_error(
                        response.content.as_deref().unwrap_or(""),
                    )
                {
                    // Single retry with all cache markers stripped.
                    let mut no_cache_config = config.clone();
                    no_cache_config.enable_prompt_cache = false;
                    return provider
                        .chat(&adapted, tools, model, &no_cache_config)
                        .await;
                }
                response
            }
            Err(_) => LlmResponse::error(format!(
                "{} call timed out after {}s",
                provider.display_name(),
                self.config.call_timeout_secs
            )),
        }
    }

    /// Route one LLM call through the fallback state machine.
    ///
    /// `session_key` is `"{channel}:{chat_id}"` (see
    /// `InboundMessage::session_key`) and is used only to target the
    /// mode-transition notification at the right chat; pass `None` for
    /// call sites with no single originating chat (e.g. the compactor).
    pub async fn call(
        &self,
        session_key: Option<&str>,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        primary: &dyn LlmProvider,
        secondary: Option<&dyn LlmProvider>,
        config: &LlmRequestConfig,
    ) -> (LlmResponse, bool, Option<String>) {
        let should_try_primary = {
            let state = self.state.lock().await;
            state.should_probe_primary(self.config.probe_interval_secs)
        };

        if should_try_primary {
            {
                let mut state = self.state.lock().await;
                state.mark_primary_probed();
            }
            let response = self.dispatch(primary, messages, tools, model, config).await;

            if !response.is_error() {
                let exited_fallback = {
                    let mut state = self.state.lock().await;
                    state.record_primary_success()
                };
                self.persist().await;
                if exited_fallback {
                    info!("primary provider recovered, exiting fallback mode");
                    if let Some(key) = session_key {
                        if let Some((channel, chat_id)) = key.split_once(':') {
                            self.notify(
                                channel,
                                chat_id,
                                &format!("({} is back — switched off the fallback model.)", primary.display_name()),
                            )
                            .await;
                        }
                    }
                }
                return (response, false, None);
            }

            let error_note = response.content.clone();
            let entered_fallback = {
                let mut state = self.state.lock().await;
                state.record_primary_failure(self.config.threshold)
            };
            self.persist().await;
            if entered_fallback {
                warn!(
                    threshold = self.config.threshold,
                    "primary provider failing repeatedly, entering fallback mode"
                );
                if let Some(key) = session_key {
                    if let Some((channel, chat_id)) = key.split_once(':') {
                        self.notify(
                            channel,
                            chat_id,
                            "(The primary model is having trouble — switching to a backup model for now.)",
                        )
                        .await;
                    }
                }
            }

            let Some(secondary) = secondary else {
                return (response, false, error_note);
            };
            let fallback_response = self.dispatch(secondary, messages, tools, model, config).await;
            if fallback_response.is_error() {
                return (fallback_response, true, error_note);
            }
            return (fallback_response, true, error_note);
        }

        // Already in fallback mode and not yet due to re-probe the primary.
        let Some(secondary) = secondary else {
            let response = self.dispatch(primary, messages, tools, model, config).await;
            return (response, false, None);
        };
        let response = self.dispatch(secondary, messages, tools, model, config).await;
        (response, true, None)
    }
}
