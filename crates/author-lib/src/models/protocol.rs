// Agent wire protocol
// JSON messages exchanged with the agent runtime over its WebSocket

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent instruction set the runtime is bound to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorMode {
    #[default]
    Fiction,
    NonFiction,
    Academic,
}

impl AuthorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorMode::Fiction => "fiction",
            AuthorMode::NonFiction => "non-fiction",
            AuthorMode::Academic => "academic",
        }
    }
}

impl std::fmt::Display for AuthorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuthorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fiction" => Ok(AuthorMode::Fiction),
            "non-fiction" | "nonfiction" => Ok(AuthorMode::NonFiction),
            "academic" => Ok(AuthorMode::Academic),
            _ => Err(format!("Invalid author mode: {}", s)),
        }
    }
}

/// Lifecycle status reported on tool frames
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Status of one task-list entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Client -> runtime
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Init {
        project_path: String,
        author_mode: AuthorMode,
    },
    ChangeProject {
        project_path: String,
    },
    ChangeMode {
        mode: AuthorMode,
    },
    GetMode,
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Init { .. } => "init",
            ClientMessage::ChangeProject { .. } => "change_project",
            ClientMessage::ChangeMode { .. } => "change_mode",
            ClientMessage::GetMode => "get_mode",
            ClientMessage::Message { .. } => "message",
        }
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Failed to encode {}: {}", self.kind(), e))
    }
}

// ============================================================================
// Runtime -> client
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoEntry {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "initialized")]
    Initialized {
        project_path: String,
        #[serde(default)]
        author_mode: AuthorMode,
    },
    #[serde(rename = "project_changed")]
    ProjectChanged { project_path: String },
    #[serde(rename = "mode_changed")]
    ModeChanged { mode: AuthorMode },
    #[serde(rename = "current_mode")]
    CurrentMode { mode: AuthorMode },
    #[serde(rename = "stream-start")]
    StreamStart,
    #[serde(rename = "stream-chunk")]
    StreamChunk {
        #[serde(default)]
        content: String,
        #[serde(
            default,
            rename = "fullContent",
            skip_serializing_if = "Option::is_none"
        )]
        full_content: Option<String>,
    },
    #[serde(rename = "tool-call")]
    ToolCall {
        tool: String,
        #[serde(default)]
        args: Value,
        id: String,
        #[serde(default)]
        status: ToolStatus,
    },
    #[serde(rename = "tool-result")]
    ToolResult {
        id: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        status: ToolStatus,
    },
    #[serde(rename = "todos")]
    Todos {
        #[serde(default)]
        data: Vec<TodoEntry>,
    },
    #[serde(rename = "files")]
    Files {
        #[serde(default)]
        data: Vec<String>,
    },
    #[serde(rename = "complete")]
    Complete {
        #[serde(
            default,
            rename = "fullContent",
            skip_serializing_if = "Option::is_none"
        )]
        full_content: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: String,
    },
    /// Frame types this client does not understand
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse one JSON frame
    pub fn parse(frame: &str) -> Result<Self, String> {
        serde_json::from_str(frame).map_err(|e| format!("Malformed agent frame: {}", e))
    }

    /// True for frames that end a streamed response
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerMessage::Complete { .. } | ServerMessage::Error { .. })
    }
}
