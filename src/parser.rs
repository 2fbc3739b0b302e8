use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length, in characters, of a tool invocation description.
pub const DESCRIPTION_MAX_CHARS: usize = 100;

/// Lines-changed figure recorded for every `Edit`. Session logs carry no diff size,
/// so this is a fixed approximation rather than a measurement.
pub const EDIT_LINES_PLACEHOLDER: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    UserMessage,
    AssistantMessage,
    Other,
}

impl EntryKind {
    fn from_type(kind: Option<&str>) -> Self {
        match kind {
            Some("user") => Self::UserMessage,
            Some("assistant") => Self::AssistantMessage,
            _ => Self::Other,
        }
    }

    pub fn role(self) -> Option<&'static str> {
        match self {
            Self::UserMessage => Some("user"),
            Self::AssistantMessage => Some("assistant"),
            Self::Other => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    fn from_value(value: &Value) -> Self {
        let counter = |key: &str| value.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        Self {
            input_tokens: counter("input_tokens"),
            output_tokens: counter("output_tokens"),
            cache_creation_input_tokens: counter("cache_creation_input_tokens"),
            cache_read_input_tokens: counter("cache_read_input_tokens"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Write,
    Edit,
}

impl FileOperation {
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "Write" => Some(Self::Write),
            "Edit" => Some(Self::Edit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Edit => "edit",
        }
    }

    pub fn lines_changed(self) -> u64 {
        match self {
            Self::Write => 0,
            Self::Edit => EDIT_LINES_PLACEHOLDER,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub input: Value,
    pub description: String,
}

impl ToolInvocation {
    fn from_block(block: &Value) -> Option<Self> {
        if block.get("type").and_then(|v| v.as_str()) != Some("tool_use") {
            return None;
        }
        let name = block
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let input = block.get("input").cloned().unwrap_or(Value::Null);
        let description = truncate_chars(&input.to_string(), DESCRIPTION_MAX_CHARS);
        Some(Self {
            name,
            input,
            description,
        })
    }

    /// The file touched by this invocation, for `Write`/`Edit` with a concrete path.
    pub fn file_edit(&self) -> Option<(&str, FileOperation)> {
        let operation = FileOperation::from_tool_name(&self.name)?;
        let path = self
            .input
            .get("file_path")
            .and_then(|v| v.as_str())
            .filter(|path| !path.is_empty())?;
        Some((path, operation))
    }
}

/// One decoded session log record.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub timestamp: Option<DateTime<Utc>>,
    pub content_length: u64,
    pub usage: Option<TokenUsage>,
    pub tool_invocations: Vec<ToolInvocation>,
}

impl LogEntry {
    pub fn is_message(&self) -> bool {
        self.kind != EntryKind::Other
    }
}

pub fn parse_line(line: &str) -> Result<LogEntry, DecodeError> {
    let value: Value = serde_json::from_str(line)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    let kind = EntryKind::from_type(value.get("type").and_then(|v| v.as_str()));
    let timestamp = value
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp);
    let message = value.get("message");
    let content = message.and_then(|m| m.get("content")).filter(|c| !c.is_null());

    let content_length = content
        .map(|c| c.to_string().chars().count() as u64)
        .unwrap_or(0);

    let usage = match kind {
        EntryKind::AssistantMessage => message
            .and_then(|m| m.get("usage"))
            .filter(|u| u.is_object())
            .map(TokenUsage::from_value),
        _ => None,
    };

    let tool_invocations = content
        .and_then(|c| c.as_array())
        .map(|blocks| blocks.iter().filter_map(ToolInvocation::from_block).collect())
        .unwrap_or_default();

    Ok(LogEntry {
        kind,
        timestamp,
        content_length,
        usage,
        tool_invocations,
    })
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
