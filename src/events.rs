use crate::parser::{FileOperation, LogEntry, TokenUsage};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub session_id: String,
    pub role: String,
    pub content_length: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolUsageEvent {
    pub session_id: String,
    pub tool_name: String,
    pub description: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileEditEvent {
    pub session_id: String,
    pub file_path: String,
    pub operation: FileOperation,
    pub lines_changed: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub usage: TokenUsage,
    pub timestamp: DateTime<Utc>,
}

/// Session metadata. `None` fields leave the stored value untouched on upsert.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_errors: Option<u64>,
}

/// Everything the ingestion pipeline hands to a sink, tagged the way the log API
/// expects (`{"type": "tool_usage", ...}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UsageEvent {
    Message(MessageEvent),
    ToolUsage(ToolUsageEvent),
    FileEdit(FileEditEvent),
    TokenUsage(TokenUsageEvent),
    Session(SessionRecord),
}

impl UsageEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Message(e) => &e.session_id,
            Self::ToolUsage(e) => &e.session_id,
            Self::FileEdit(e) => &e.session_id,
            Self::TokenUsage(e) => &e.session_id,
            Self::Session(e) => &e.session_id,
        }
    }
}

/// Expands one entry into its events, in the order they are appended: the
/// message, its token usage, then each tool use followed by its file edit.
pub fn entry_events(
    entry: &LogEntry,
    session_id: &str,
    ingested_at: DateTime<Utc>,
) -> Vec<UsageEvent> {
    let timestamp = entry.timestamp.unwrap_or(ingested_at);
    let mut events = Vec::with_capacity(2 + entry.tool_invocations.len() * 2);

    if let Some(role) = entry.kind.role() {
        events.push(UsageEvent::Message(MessageEvent {
            session_id: session_id.to_string(),
            role: role.to_string(),
            content_length: entry.content_length,
            timestamp,
        }));
    }

    if let Some(usage) = entry.usage {
        events.push(UsageEvent::TokenUsage(TokenUsageEvent {
            session_id: session_id.to_string(),
            usage,
            timestamp,
        }));
    }

    for tool in &entry.tool_invocations {
        events.push(UsageEvent::ToolUsage(ToolUsageEvent {
            session_id: session_id.to_string(),
            tool_name: tool.name.clone(),
            description: tool.description.clone(),
            success: true,
            timestamp,
        }));
        if let Some((file_path, operation)) = tool.file_edit() {
            events.push(UsageEvent::FileEdit(FileEditEvent {
                session_id: session_id.to_string(),
                file_path: file_path.to_string(),
                operation,
                lines_changed: operation.lines_changed(),
                timestamp,
            }));
        }
    }

    events
}

/// Storage form of a timestamp: fixed-width UTC so text ordering is time ordering
/// and the first ten characters are the calendar date.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
