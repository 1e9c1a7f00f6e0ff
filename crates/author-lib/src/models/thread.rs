// Thread and message data models
// Persisted conversation records, scoped to a project directory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name given to threads created without one
pub const DEFAULT_THREAD_NAME: &str = "New conversation";

/// Longest name derived from a prompt, excluding the ellipsis
const DERIVED_NAME_MAX_CHARS: usize = 50;

// ============================================================================
// Core Entities
// ============================================================================

/// Thread entity - a resumable conversation in one project
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Owning project directory
    pub project_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Bumped on every message append
    pub last_activity: DateTime<Utc>,
    pub message_count: i64,
}

impl Thread {
    pub fn new(project_id: impl Into<String>, name: Option<String>) -> Self {
        let now = Utc::now();
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_THREAD_NAME.to_string());
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            name,
            created_at: now,
            last_activity: now,
            message_count: 0,
        }
    }
}

/// Message entity - immutable once persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub project_id: String,
    pub role: MessageRole,
    /// Text, or JSON for tool invocations and tool results
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(thread: &Thread, role: MessageRole, content: impl Into<String>) -> Self {
        Self::for_thread(&thread.id, &thread.project_id, role, content)
    }

    pub fn for_thread(
        thread_id: &str,
        project_id: &str,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            project_id: project_id.to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Message author role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    ToolInvocation,
    ToolResult,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::ToolInvocation => "tool-invocation",
            MessageRole::ToolResult => "tool-result",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool-invocation" => Ok(MessageRole::ToolInvocation),
            "tool-result" => Ok(MessageRole::ToolResult),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// Derive a thread name from the first prompt
///
/// Whitespace is collapsed. Long prompts are cut on a word boundary and
/// suffixed with "...".
pub fn thread_name_from_prompt(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_THREAD_NAME.to_string();
    }
    if collapsed.chars().count() <= DERIVED_NAME_MAX_CHARS {
        return collapsed;
    }

    let cut: String = collapsed.chars().take(DERIVED_NAME_MAX_CHARS).collect();
    let head = match cut.rfind(' ') {
        Some(idx) if idx > 0 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{}...", head.trim_end())
}
