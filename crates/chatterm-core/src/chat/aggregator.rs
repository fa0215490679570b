//! Turn Aggregator
//!
//! Owns the ordered message list and decides where each piece of classified
//! output lands. The list only ever grows or mutates its last element:
//!
//! ```text
//!            submit_user                 result / submit_user / close
//!   Idle ─────────────────> UserTurn ──> AssistantStreaming ─────────────> Idle
//!     │                                        ^
//!     └── raw text / assistant event ──────────┘
//! ```

use chrono::Utc;
use tracing::{debug, trace};

use super::message::{Message, MessageId, MessageRole, ToolBlock};
use crate::stream::{ContentBlock, StructuredEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// No message is streaming
    Idle,
    /// Last message is the user's. `submit_user` opens the assistant turn
    /// before returning, so this phase is never observed between calls.
    UserTurn,
    /// Last message is an assistant message still receiving content
    AssistantStreaming,
}

/// Where the current assistant turn gets its content from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    Freeform,
    Structured,
}

/// Change to the message list, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Appended(Message),
    Updated(Message),
    Closed(Message),
    Cleared,
}

impl TurnEvent {
    pub fn message(&self) -> Option<&Message> {
        match self {
            TurnEvent::Appended(m) | TurnEvent::Updated(m) | TurnEvent::Closed(m) => Some(m),
            TurnEvent::Cleared => None,
        }
    }
}

pub struct TurnAggregator {
    messages: Vec<Message>,
    /// Plain-text content of the current assistant turn
    output_buffer: String,
    buffered_lines: usize,
    mode: TurnMode,
    tool_active: bool,
    next_id: u64,
    last_timestamp: i64,
    events: Vec<TurnEvent>,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            output_buffer: String::new(),
            buffered_lines: 0,
            mode: TurnMode::Freeform,
            tool_active: false,
            next_id: 1,
            last_timestamp: 0,
            events: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn phase(&self) -> TurnPhase {
        match self.messages.last() {
            Some(m) if m.is_user() => TurnPhase::UserTurn,
            Some(m) if m.is_streaming => TurnPhase::AssistantStreaming,
            _ => TurnPhase::Idle,
        }
    }

    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    pub fn is_structured_turn(&self) -> bool {
        self.mode == TurnMode::Structured
    }

    pub fn tool_active(&self) -> bool {
        self.tool_active
    }

    pub fn set_tool_active(&mut self, active: bool) {
        self.tool_active = active;
    }

    /// Close the current turn and start a new one for `text`, stored as typed.
    pub fn submit_user(&mut self, text: &str) {
        self.close_open_turn();

        let message = self.new_message(MessageRole::User, text.to_string(), false);
        debug!(id = %message.id, len = message.content.len(), "user turn");
        self.messages.push(message.clone());
        self.push_event(TurnEvent::Appended(message));

        self.mode = TurnMode::Freeform;
        self.open_assistant(String::new());
    }

    /// Apply a structured event. Returns false if it was ignored.
    pub fn on_structured_event(&mut self, event: StructuredEvent) -> bool {
        match event {
            StructuredEvent::Unrecognized { event_type } => {
                trace!(?event_type, "ignoring unrecognized structured event");
                false
            }
            StructuredEvent::Assistant { blocks } => {
                let index = match self.open_index() {
                    Some(index) => index,
                    None => self.open_assistant(String::new()),
                };
                if self.mode == TurnMode::Freeform {
                    // raw text seen so far was the tool's echo
                    self.output_buffer.clear();
                    self.buffered_lines = 0;
                    self.messages[index].content.clear();
                    self.mode = TurnMode::Structured;
                }

                let message = &mut self.messages[index];
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => message.content.push_str(&text),
                        ContentBlock::ToolUse { id, name, input } => {
                            debug!(id = %message.id, tool = %name, "tool block");
                            message.blocks.push(ToolBlock {
                                id,
                                name,
                                payload: input,
                            });
                        }
                    }
                }
                let snapshot = message.clone();
                self.push_event(TurnEvent::Updated(snapshot));
                true
            }
            StructuredEvent::Result(info) => {
                debug!(is_error = info.is_error, subtype = ?info.subtype, "turn result");
                self.mode = TurnMode::Structured;
                self.close_open_turn();
                true
            }
        }
    }

    /// Apply one line of plain text. Ignored once the turn is structured.
    pub fn on_raw_text(&mut self, text: &str) {
        if self.mode == TurnMode::Structured {
            trace!("raw text suppressed in structured turn");
            return;
        }

        let blank = text.trim().is_empty();
        match self.open_index() {
            Some(index) => {
                if blank && self.buffered_lines == 0 {
                    return;
                }
                if self.buffered_lines > 0 {
                    self.output_buffer.push('\n');
                }
                self.output_buffer.push_str(text);
                self.buffered_lines += 1;

                let message = &mut self.messages[index];
                message.content.clone_from(&self.output_buffer);
                let snapshot = message.clone();
                self.push_event(TurnEvent::Updated(snapshot));
            }
            None => {
                if blank {
                    return;
                }
                self.open_assistant(text.to_string());
            }
        }
    }

    /// Close the streaming message, if any.
    pub fn close_open_turn(&mut self) {
        if let Some(index) = self.open_index() {
            let message = &mut self.messages[index];
            message.is_streaming = false;
            debug!(id = %message.id, len = message.content.len(), "assistant turn closed");
            let snapshot = message.clone();
            self.push_event(TurnEvent::Closed(snapshot));
        }
    }

    /// Forget every message and accumulator. The tool flag is left alone.
    pub fn clear_session(&mut self) {
        debug!(messages = self.messages.len(), "clearing session");
        self.messages.clear();
        self.output_buffer.clear();
        self.buffered_lines = 0;
        self.mode = TurnMode::Freeform;
        self.next_id = 1;
        self.last_timestamp = 0;
        self.events.clear();
        self.events.push(TurnEvent::Cleared);
    }

    /// Drop the output buffer of the open turn without touching its content.
    pub fn discard_buffer(&mut self) {
        self.output_buffer.clear();
        self.buffered_lines = 0;
    }

    /// Events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<TurnEvent> {
        std::mem::take(&mut self.events)
    }

    // ========== Internals ==========

    fn open_index(&self) -> Option<usize> {
        match self.messages.last() {
            Some(m) if m.is_streaming => Some(self.messages.len() - 1),
            _ => None,
        }
    }

    /// Open a streaming assistant message seeded with `content`.
    fn open_assistant(&mut self, content: String) -> usize {
        self.buffered_lines = usize::from(!content.is_empty());
        self.output_buffer.clone_from(&content);

        let message = self.new_message(MessageRole::Assistant, content, true);
        debug!(id = %message.id, "assistant turn opened");
        self.messages.push(message.clone());
        self.push_event(TurnEvent::Appended(message));
        self.messages.len() - 1
    }

    fn new_message(&mut self, role: MessageRole, content: String, is_streaming: bool) -> Message {
        let id = MessageId::new(self.next_id);
        self.next_id += 1;

        let timestamp = Utc::now().timestamp_millis().max(self.last_timestamp);
        self.last_timestamp = timestamp;

        Message {
            id,
            role,
            content,
            blocks: Vec::new(),
            is_streaming,
            timestamp,
        }
    }

    /// Record an event, folding it into the previous one for the same
    /// message where the consumer would only see the latest snapshot.
    fn push_event(&mut self, event: TurnEvent) {
        let folds = match (self.events.last(), &event) {
            (Some(TurnEvent::Appended(prev)), TurnEvent::Updated(next))
            | (Some(TurnEvent::Updated(prev)), TurnEvent::Updated(next) | TurnEvent::Closed(next)) => {
                prev.id == next.id
            }
            _ => false,
        };
        if !folds {
            self.events.push(event);
            return;
        }

        // an update to a message the consumer has not seen yet is still an append
        let event = match event {
            TurnEvent::Updated(m) if matches!(self.events.last(), Some(TurnEvent::Appended(_))) => {
                TurnEvent::Appended(m)
            }
            other => other,
        };
        if let Some(last) = self.events.last_mut() {
            *last = event;
        }
    }
}

impl Default for TurnAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ResultInfo;
    use serde_json::json;

    fn text_event(text: &str) -> StructuredEvent {
        StructuredEvent::Assistant {
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    fn assert_single_streaming_last(agg: &TurnAggregator) {
        let streaming: Vec<usize> = agg
            .messages()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_streaming)
            .map(|(i, _)| i)
            .collect();
        assert!(streaming.len() <= 1);
        if let Some(&i) = streaming.first() {
            assert_eq!(i, agg.messages().len() - 1);
            assert!(agg.messages()[i].is_assistant());
        }
    }

    #[test]
    fn test_submit_user_opens_assistant_turn() {
        let mut agg = TurnAggregator::new();
        assert_eq!(agg.phase(), TurnPhase::Idle);

        agg.submit_user("  hello  ");
        let messages = agg.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "  hello  ");
        assert!(!messages[0].is_streaming);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "");
        assert!(messages[1].is_streaming);
        assert_eq!(agg.phase(), TurnPhase::AssistantStreaming);
        assert!(messages[0].timestamp <= messages[1].timestamp);
    }

    #[test]
    fn test_raw_lines_join_with_newline() {
        let mut agg = TurnAggregator::new();
        agg.submit_user("ls");
        agg.on_raw_text("");
        agg.on_raw_text("a.txt");
        agg.on_raw_text("");
        agg.on_raw_text("b.txt");
        assert_eq!(agg.messages()[1].content, "a.txt\n\nb.txt");
        assert_single_streaming_last(&agg);
    }

    #[test]
    fn test_raw_text_opens_turn_when_idle() {
        let mut agg = TurnAggregator::new();
        agg.on_raw_text("   ");
        assert!(agg.messages().is_empty());

        agg.on_raw_text("banner");
        agg.on_raw_text("second");
        assert_eq!(agg.messages().len(), 1);
        assert_eq!(agg.messages()[0].content, "banner\nsecond");
        assert!(agg.messages()[0].is_streaming);
    }

    #[test]
    fn test_raw_text_after_closed_turn_opens_new_one() {
        let mut agg = TurnAggregator::new();
        agg.on_raw_text("first");
        agg.close_open_turn();
        agg.on_raw_text("second");
        assert_eq!(agg.messages().len(), 2);
        assert_eq!(agg.messages()[0].content, "first");
        assert!(!agg.messages()[0].is_streaming);
        assert_eq!(agg.messages()[1].content, "second");
        assert_single_streaming_last(&agg);
    }

    #[test]
    fn test_structured_turn_suppresses_raw_text() {
        let mut agg = TurnAggregator::new();
        agg.submit_user("hi");
        agg.on_raw_text("echo before");
        assert!(agg.on_structured_event(text_event("Hello")));
        agg.on_raw_text("late raw text");

        let assistant = &agg.messages()[1];
        assert_eq!(assistant.content, "Hello");
        assert!(agg.is_structured_turn());

        // a new user turn resets the mode
        agg.submit_user("again");
        assert_eq!(agg.mode(), TurnMode::Freeform);
        agg.on_raw_text("raw reply");
        assert_eq!(agg.messages()[3].content, "raw reply");
    }

    #[test]
    fn test_first_structured_event_replaces_echoed_command() {
        let mut agg = TurnAggregator::new();
        agg.submit_user("explain");
        agg.on_raw_text("$ claude -p explain");
        assert_eq!(agg.messages()[1].content, "$ claude -p explain");

        agg.on_structured_event(text_event("Here is"));
        agg.on_structured_event(StructuredEvent::Result(ResultInfo::default()));

        let assistant = &agg.messages()[1];
        assert_eq!(assistant.content, "Here is");
        assert!(!assistant.is_streaming);
        assert_eq!(agg.messages().len(), 2);
    }

    #[test]
    fn test_assistant_then_result() {
        let mut agg = TurnAggregator::new();
        agg.on_structured_event(text_event("Hi"));
        agg.on_structured_event(StructuredEvent::Result(ResultInfo::default()));

        assert_eq!(agg.messages().len(), 1);
        assert_eq!(agg.messages()[0].content, "Hi");
        assert!(!agg.messages()[0].is_streaming);
        assert_eq!(agg.phase(), TurnPhase::Idle);
    }

    #[test]
    fn test_tool_blocks_attached() {
        let mut agg = TurnAggregator::new();
        agg.submit_user("read it");
        agg.on_structured_event(StructuredEvent::Assistant {
            blocks: vec![
                ContentBlock::Text { text: "Reading".into() },
                ContentBlock::ToolUse {
                    id: Some("t1".into()),
                    name: "Read".into(),
                    input: json!({"path": "x"}),
                },
            ],
        });
        let assistant = &agg.messages()[1];
        assert_eq!(assistant.content, "Reading");
        assert_eq!(assistant.blocks.len(), 1);
        assert_eq!(assistant.blocks[0].name, "Read");
        assert_eq!(assistant.blocks[0].id.as_deref(), Some("t1"));
        assert_eq!(assistant.blocks[0].payload, json!({"path": "x"}));
    }

    #[test]
    fn test_unrecognized_event_changes_nothing() {
        let mut agg = TurnAggregator::new();
        agg.submit_user("x");
        agg.take_events();
        assert!(!agg.on_structured_event(StructuredEvent::Unrecognized { event_type: None }));
        assert_eq!(agg.mode(), TurnMode::Freeform);
        assert!(agg.take_events().is_empty());
    }

    #[test]
    fn test_submit_closes_previous_turn_untouched() {
        let mut agg = TurnAggregator::new();
        agg.submit_user("one");
        agg.on_raw_text("partial answer");
        agg.submit_user("two");

        let messages = agg.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "partial answer");
        assert!(!messages[1].is_streaming);
        assert_single_streaming_last(&agg);
    }

    #[test]
    fn test_clear_session_restarts_ids() {
        let mut agg = TurnAggregator::new();
        agg.submit_user("hello");
        agg.on_raw_text("world");
        agg.clear_session();
        assert!(agg.messages().is_empty());
        assert_eq!(agg.phase(), TurnPhase::Idle);
        assert_eq!(agg.take_events(), vec![TurnEvent::Cleared]);

        agg.submit_user("x");
        assert_eq!(agg.messages()[0].id, MessageId::new(1));
        assert_eq!(agg.messages()[1].id, MessageId::new(2));
        assert_eq!(agg.messages()[1].content, "");
    }

    #[test]
    fn test_events_are_coalesced() {
        let mut agg = TurnAggregator::new();
        agg.submit_user("q");
        agg.on_raw_text("a");
        agg.on_raw_text("b");
        let events = agg.take_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TurnEvent::Appended(m) if m.is_user()));
        match &events[1] {
            TurnEvent::Appended(m) => assert_eq!(m.content, "a\nb"),
            other => panic!("unexpected event {:?}", other),
        }

        agg.on_raw_text("c");
        agg.close_open_turn();
        let events = agg.take_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TurnEvent::Closed(m) => {
                assert_eq!(m.content, "a\nb\nc");
                assert!(!m.is_streaming);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
