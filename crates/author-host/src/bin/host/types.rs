//! Host wire types
//!
//! One JSON object per line in each direction. Requests carry an optional
//! `id` that is echoed on the matching response; events carry none.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use author_lib::services::Scope;
use author_lib::{AuthorError, AuthorMode, ConnectionState, ForwardedEvent};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HostRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub command: HostCommand,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostCommand {
    CreateThread {
        project_id: String,
        #[serde(default)]
        name: Option<String>,
    },
    ListThreads {
        project_id: String,
    },
    GetThread {
        thread_id: String,
    },
    RenameThread {
        thread_id: String,
        name: String,
    },
    DeleteThread {
        thread_id: String,
    },
    GetThreadMessages {
        thread_id: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    OpenProject {
        project_id: String,
        #[serde(default)]
        mode: Option<AuthorMode>,
    },
    SendMessage {
        project_id: String,
        prompt: String,
        #[serde(default)]
        thread_id: Option<String>,
    },
    Cancel {
        stream_id: String,
    },
    ChangeMode {
        mode: AuthorMode,
    },
    GetMode,
    Status,
    Shutdown,
}

impl HostCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HostCommand::CreateThread { .. } => "create_thread",
            HostCommand::ListThreads { .. } => "list_threads",
            HostCommand::GetThread { .. } => "get_thread",
            HostCommand::RenameThread { .. } => "rename_thread",
            HostCommand::DeleteThread { .. } => "delete_thread",
            HostCommand::GetThreadMessages { .. } => "get_thread_messages",
            HostCommand::OpenProject { .. } => "open_project",
            HostCommand::SendMessage { .. } => "send_message",
            HostCommand::Cancel { .. } => "cancel",
            HostCommand::ChangeMode { .. } => "change_mode",
            HostCommand::GetMode => "get_mode",
            HostCommand::Status => "status",
            HostCommand::Shutdown => "shutdown",
        }
    }
}

/// Parse one input line. Failures come back as a ready-to-send response.
pub fn parse_request(line: &str) -> Result<HostRequest, HostResponse> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        HostResponse::failure(None, HostError::invalid(format!("Invalid JSON: {}", e)))
    })?;

    let id = value.get("id").and_then(Value::as_str).map(str::to_string);
    serde_json::from_value(value).map_err(|e| {
        HostResponse::failure(id, HostError::invalid(format!("Invalid command: {}", e)))
    })
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HostError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl HostError {
    fn invalid(message: String) -> Self {
        Self {
            code: "INVALID_REQUEST".to_string(),
            message,
            retryable: false,
        }
    }
}

impl From<&AuthorError> for HostError {
    fn from(error: &AuthorError) -> Self {
        Self {
            code: error.code().as_str().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HostResponse {
    pub id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HostError>,
}

impl HostResponse {
    pub fn success(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<String>, error: HostError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Snapshot returned by `status`
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connection: ConnectionState,
    pub scope: Option<Scope>,
    pub active_stream: Option<String>,
    pub backend_running: bool,
}

// ============================================================================
// Output envelope
// ============================================================================

/// Everything written to stdout
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostOutput {
    Response(HostResponse),
    Event(ForwardedEvent),
}

impl HostOutput {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
