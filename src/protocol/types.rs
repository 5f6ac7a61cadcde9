//! Shapes of the newline-delimited JSON objects the assistant subprocess
//! writes to stdout when run with `--output-format stream-json --verbose`.
//!
//! Unknown fields are tolerated everywhere: the assistant's wire format is
//! not a contract we control, so every struct here carries its leftovers in
//! an `extra` map rather than failing to parse.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// One line of the assistant's stdout stream, tagged by `"type"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    System(SystemEvent),
    Assistant(AssistantMessage),
    User(UserToolResult),
    Result(SessionResult),
}

/// Start-of-session marker, emitted once before any assistant content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum SystemEvent {
    Init(InitEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitEvent {
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// One assistant turn: a list of content blocks, each either prose or a tool
/// invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub message: AssistantMessageBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessageBody {
    pub content: Vec<AssistantContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: HashMap<String, Value>,
    },
    #[serde(other)]
    Other,
}

/// A user-role message carrying tool results, keyed back to the tool use by id.
#[derive(Debug, Clone, Deserialize)]
pub struct UserToolResult {
    pub message: UserToolResultBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserToolResultBody {
    pub content: Vec<ToolResultBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, deserialize_with = "deserialize_tool_result_text")]
    pub text: String,
}

/// Tool result `content` is either a plain string or a nested array of blocks
/// with their own `text` fields; flatten either shape down to one string.
fn deserialize_tool_result_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(flatten_tool_result_text(&value))
}

fn flatten_tool_result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| flatten_tool_result_text(item))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Terminal line marking the end of the session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionResult {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
}
