//! Core types, bus, session store, config, and utilities shared by every
//! other relaygate crate.
//!
//! - **types**: `Message`, `LlmResponse`, tool-call descriptors — the typed
//!   vocabulary every provider and the agent loop speak.
//! - **bus**: the in-process pub/sub fabric connecting channels to the
//!   orchestrator.
//! - **session**: per-`(channel, chat_id)` append-only conversation history,
//!   with image dehydration on write.
//! - **config**: the gateway's on-disk configuration schema and loader.
//! - **heartbeat**: periodic liveness/maintenance tick.
//! - **utils**: path resolution and small string helpers.

pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod session;
pub mod types;
pub mod utils;

pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use config::Config;
pub use session::SessionManager;
pub use types::{LlmResponse, Message, MessageContent};
