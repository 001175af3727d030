use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Errors raised by the research core (graph controller, session layer, orchestrator).
#[derive(Debug, Error)]
pub enum ResearchError {
    /// Malformed input. Surfaced immediately, never retried.
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// Another worker holds the session lock. Retry after backoff.
    #[error("Session {session_id} is locked by {locked_by} since {locked_at}")]
    SessionLocked {
        session_id: String,
        locked_by: String,
        locked_at: String,
    },

    /// Refinement would exceed the path's maximum depth.
    #[error("Path {path_id} is at depth {depth}, maximum depth is {max_depth}")]
    DepthExceeded {
        path_id: String,
        depth: u32,
        max_depth: u32,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The session reached a terminal status and accepts no further mutations.
    #[error("Session {session_id} is {status}; no further mutations accepted")]
    SessionClosed { session_id: String, status: String },

    /// A durable write failed. The operation did not take effect.
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StorageError),
}

impl ResearchError {
    /// Build a validation error for a named field.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ResearchError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build a not-found error for a path id.
    pub fn path_not_found(path_id: impl Into<String>) -> Self {
        ResearchError::NotFound {
            kind: "Path",
            id: path_id.into(),
        }
    }

    /// Build a not-found error for a session id.
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        ResearchError::NotFound {
            kind: "Session",
            id: session_id.into(),
        }
    }

    /// Whether the caller should retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResearchError::SessionLocked { .. })
    }
}

/// Errors reported by an external path executor.
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    #[error("Path execution failed: {message}")]
    Failed { message: String },

    #[error("Path execution timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    /// Lock contention, reported to the client with a retry hint.
    #[error("Session {session_id} is locked by {locked_by}; retry after {retry_after_seconds}s")]
    SessionLocked {
        session_id: String,
        locked_by: String,
        locked_at: String,
        retry_after_seconds: u64,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AppError> for McpError {
    fn from(err: AppError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

impl AppError {
    /// Whether this error is transient lock contention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Research(e) if e.is_retryable())
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for research core operations
pub type ResearchResult<T> = Result<T, ResearchError>;

/// Result type alias for path execution
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;
