//! In-process pub/sub message bus connecting channels to the orchestrator.

pub mod queue;
pub mod types;

pub use queue::MessageBus;
pub use types::{InboundMessage, OutboundMessage};
