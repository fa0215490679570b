//! Structured events emitted as line-delimited JSON by agent processes
//!
//! Parsed field by field from `serde_json::Value` so that partial or
//! unexpected shapes degrade to [`StructuredEvent::Unrecognized`] instead of
//! failing the whole line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content block attached to an assistant event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        input: Value,
    },
}

/// Payload of a `result` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructuredEvent {
    /// `type: "assistant"` or `type: "message"`
    Assistant { blocks: Vec<ContentBlock> },
    /// `type: "result"`: the assistant turn is complete
    Result(ResultInfo),
    /// Valid JSON object of a shape we do not act on
    Unrecognized { event_type: Option<String> },
}

impl StructuredEvent {
    /// Interpret a parsed JSON value.
    pub fn from_value(value: &Value) -> Self {
        let event_type = value.get("type").and_then(|t| t.as_str());
        match event_type {
            Some("assistant") => Self::assistant(value),
            Some("message") => {
                let role = value
                    .get("role")
                    .or_else(|| value.get("message").and_then(|m| m.get("role")))
                    .and_then(|r| r.as_str());
                match role {
                    Some(role) if role != "assistant" => Self::unrecognized(event_type),
                    _ => Self::assistant(value),
                }
            }
            Some("result") => StructuredEvent::Result(ResultInfo {
                subtype: value.get("subtype").and_then(|s| s.as_str()).map(String::from),
                is_error: value.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false),
                result: value.get("result").and_then(|r| r.as_str()).map(String::from),
            }),
            _ => Self::unrecognized(event_type),
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, StructuredEvent::Unrecognized { .. })
    }

    fn assistant(value: &Value) -> Self {
        // `message` may be an object holding `content`, or the block list itself
        let content = match value.get("message") {
            Some(Value::Array(_)) => value.get("message"),
            Some(message) => message.get("content").or_else(|| value.get("content")),
            None => value.get("content"),
        };
        let blocks = content.map(parse_blocks).unwrap_or_default();
        StructuredEvent::Assistant { blocks }
    }

    fn unrecognized(event_type: Option<&str>) -> Self {
        StructuredEvent::Unrecognized {
            event_type: event_type.map(String::from),
        }
    }
}

/// Blocks from an array of block objects or a bare string.
fn parse_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(text) => vec![ContentBlock::Text { text: text.clone() }],
        Value::Array(items) => items.iter().filter_map(parse_block).collect(),
        _ => Vec::new(),
    }
}

fn parse_block(block: &Value) -> Option<ContentBlock> {
    if let Value::String(text) = block {
        return Some(ContentBlock::Text { text: text.clone() });
    }

    let block_type = block.get("type").and_then(|t| t.as_str());
    if block_type == Some("text") {
        let text = block.get("text").and_then(|t| t.as_str())?;
        return Some(ContentBlock::Text {
            text: text.to_string(),
        });
    }

    let name = block.get("name").and_then(|n| n.as_str())?;
    Some(ContentBlock::ToolUse {
        id: block.get("id").and_then(|i| i.as_str()).map(String::from),
        name: name.to_string(),
        input: block.get("input").cloned().unwrap_or(Value::Null),
    })
}
