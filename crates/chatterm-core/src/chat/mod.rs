//! Conversational state: messages and the turn state machine

pub mod aggregator;
pub mod message;

pub use aggregator::{TurnAggregator, TurnEvent, TurnMode, TurnPhase};
pub use message::{Message, MessageId, MessageRole, ToolBlock};
