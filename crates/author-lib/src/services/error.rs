// Author Service Error Types
// One taxonomy shared by the supervisor, agent client and thread manager

use thiserror::Error;

/// Author service error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthorError {
    /// Runtime did not pass its health check in time
    #[error("Agent service unavailable: no healthy response within {0} ms")]
    StartupTimeout(u64),

    /// Runtime exited before it became healthy
    #[error("Agent service exited during startup: {0}")]
    BackendExited(String),

    #[error("Failed to launch agent service: {0}")]
    SpawnFailed(String),

    #[error("Not connected to the agent service")]
    NotConnected,

    /// Connected but no project bound yet
    #[error("Agent connection is not ready (state: {0})")]
    NotReady(String),

    #[error("Another handshake is already in flight")]
    HandshakeInFlight,

    #[error("No acknowledgment for {0} within {1} ms")]
    InitializationTimeout(String, u64),

    #[error("Agent transport error: {0}")]
    Transport(String),

    /// Error reported by the runtime for one request
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Agent is busy: {0}")]
    Busy(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for AuthorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AuthorError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for AuthorError {
    fn from(err: serde_json::Error) -> Self {
        AuthorError::Transport(format!("Malformed payload: {}", err))
    }
}

impl From<std::io::Error> for AuthorError {
    fn from(err: std::io::Error) -> Self {
        AuthorError::SpawnFailed(err.to_string())
    }
}

/// Result type for Author operations
pub type AuthorResult<T> = Result<T, AuthorError>;

/// Error codes reported across the host boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorErrorCode {
    StartupTimeout,
    BackendExited,
    SpawnFailed,
    NotConnected,
    NotReady,
    HandshakeInFlight,
    InitializationTimeout,
    Transport,
    Agent,
    Validation,
    Busy,
    StreamNotFound,
    ThreadNotFound,
    Storage,
    Config,
}

impl AuthorErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorErrorCode::StartupTimeout => "BACKEND_STARTUP_TIMEOUT",
            AuthorErrorCode::BackendExited => "BACKEND_EXITED",
            AuthorErrorCode::SpawnFailed => "BACKEND_SPAWN_FAILED",
            AuthorErrorCode::NotConnected => "AGENT_NOT_CONNECTED",
            AuthorErrorCode::NotReady => "AGENT_NOT_READY",
            AuthorErrorCode::HandshakeInFlight => "AGENT_HANDSHAKE_IN_FLIGHT",
            AuthorErrorCode::InitializationTimeout => "AGENT_INIT_TIMEOUT",
            AuthorErrorCode::Transport => "AGENT_TRANSPORT_ERROR",
            AuthorErrorCode::Agent => "AGENT_ERROR",
            AuthorErrorCode::Validation => "VALIDATION_ERROR",
            AuthorErrorCode::Busy => "AGENT_BUSY",
            AuthorErrorCode::StreamNotFound => "STREAM_NOT_FOUND",
            AuthorErrorCode::ThreadNotFound => "THREAD_NOT_FOUND",
            AuthorErrorCode::Storage => "STORAGE_ERROR",
            AuthorErrorCode::Config => "CONFIG_ERROR",
        }
    }
}

impl AuthorError {
    pub fn code(&self) -> AuthorErrorCode {
        match self {
            AuthorError::StartupTimeout(_) => AuthorErrorCode::StartupTimeout,
            AuthorError::BackendExited(_) => AuthorErrorCode::BackendExited,
            AuthorError::SpawnFailed(_) => AuthorErrorCode::SpawnFailed,
            AuthorError::NotConnected => AuthorErrorCode::NotConnected,
            AuthorError::NotReady(_) => AuthorErrorCode::NotReady,
            AuthorError::HandshakeInFlight => AuthorErrorCode::HandshakeInFlight,
            AuthorError::InitializationTimeout(..) => AuthorErrorCode::InitializationTimeout,
            AuthorError::Transport(_) => AuthorErrorCode::Transport,
            AuthorError::Agent(_) => AuthorErrorCode::Agent,
            AuthorError::Validation(_) => AuthorErrorCode::Validation,
            AuthorError::Busy(_) => AuthorErrorCode::Busy,
            AuthorError::StreamNotFound(_) => AuthorErrorCode::StreamNotFound,
            AuthorError::ThreadNotFound(_) => AuthorErrorCode::ThreadNotFound,
            AuthorError::Storage(_) => AuthorErrorCode::Storage,
            AuthorError::Config(_) => AuthorErrorCode::Config,
        }
    }

    /// Whether the same call may succeed if simply repeated later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthorError::StartupTimeout(_)
                | AuthorError::InitializationTimeout(..)
                | AuthorError::Transport(_)
                | AuthorError::Busy(_)
                | AuthorError::HandshakeInFlight
        )
    }
}

impl From<AuthorError> for String {
    fn from(err: AuthorError) -> Self {
        err.to_string()
    }
}
