// Typed events
// Agent streaming events, thread lifecycle notifications and the envelope
// that carries both across the host boundary

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::protocol::{AuthorMode, TaskStatus, ToolStatus};
use super::thread::{Message, Thread};

/// Agent connection lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Transport open, no project bound yet
    Connected,
    Ready,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Ready => "ready",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskItem {
    pub text: String,
    pub status: TaskStatus,
}

/// Why a stream or request failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// Reported by the runtime
    Agent,
    /// Connection dropped mid-stream
    Transport,
    Cancelled,
}

/// Events emitted by the agent client
///
/// Stream events carry the stream id and the thread the prompt was sent for,
/// so listeners never have to correlate them separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    StreamStart {
        stream_id: String,
        thread_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StreamChunk {
        stream_id: String,
        thread_id: Option<String>,
        delta: String,
        cumulative: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        stream_id: String,
        thread_id: Option<String>,
        id: String,
        name: String,
        args: Value,
        status: ToolStatus,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        stream_id: String,
        thread_id: Option<String>,
        id: String,
        status: ToolStatus,
        result: Value,
    },
    #[serde(rename_all = "camelCase")]
    TaskListUpdate {
        stream_id: String,
        thread_id: Option<String>,
        items: Vec<TaskItem>,
    },
    #[serde(rename_all = "camelCase")]
    FilesUpdate {
        stream_id: String,
        thread_id: Option<String>,
        paths: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    StreamEnd {
        stream_id: String,
        thread_id: Option<String>,
        full_content: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        stream_id: Option<String>,
        thread_id: Option<String>,
        kind: AgentErrorKind,
        message: String,
    },
    ConnectionState {
        state: ConnectionState,
    },
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
    },
    ConnectionLost {
        attempts: u32,
    },
    #[serde(rename_all = "camelCase")]
    ScopeBound {
        project_path: String,
        mode: AuthorMode,
    },
    ModeChanged {
        mode: AuthorMode,
    },
}

impl AgentEvent {
    /// Stream this event belongs to, if any
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            AgentEvent::StreamStart { stream_id, .. }
            | AgentEvent::StreamChunk { stream_id, .. }
            | AgentEvent::ToolCall { stream_id, .. }
            | AgentEvent::ToolResult { stream_id, .. }
            | AgentEvent::TaskListUpdate { stream_id, .. }
            | AgentEvent::FilesUpdate { stream_id, .. }
            | AgentEvent::StreamEnd { stream_id, .. } => Some(stream_id),
            AgentEvent::Error { stream_id, .. } => stream_id.as_deref(),
            _ => None,
        }
    }

    /// True for `stream-end` and stream-scoped `error`
    pub fn is_terminal(&self) -> bool {
        match self {
            AgentEvent::StreamEnd { .. } => true,
            AgentEvent::Error { stream_id, .. } => stream_id.is_some(),
            _ => false,
        }
    }
}

/// Thread lifecycle notifications from the thread manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ThreadEvent {
    ThreadCreated {
        thread: Thread,
    },
    #[serde(rename_all = "camelCase")]
    ThreadRenamed {
        thread_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    ThreadDeleted {
        thread_id: String,
    },
    MessageSaved {
        message: Message,
    },
}

/// Everything that crosses the presentation boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "channel", content = "event", rename_all = "snake_case")]
pub enum ForwardedEvent {
    Agent(AgentEvent),
    Thread(ThreadEvent),
}

impl From<AgentEvent> for ForwardedEvent {
    fn from(event: AgentEvent) -> Self {
        ForwardedEvent::Agent(event)
    }
}

impl From<ThreadEvent> for ForwardedEvent {
    fn from(event: ThreadEvent) -> Self {
        ForwardedEvent::Thread(event)
    }
}
