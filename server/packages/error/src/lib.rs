use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NoPortAvailable,
    ReadinessTimeout,
    SessionCreateFailed,
    PromptSendFailed,
    TransportParseError,
    TransportConnectionError,
    WorkerSpawnError,
    ExecutionFailed,
    ProjectNotBound,
    WorkspaceError,
    InvalidConfig,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::NoPortAvailable => "urn:agent-relay:error:no_port_available",
            Self::ReadinessTimeout => "urn:agent-relay:error:readiness_timeout",
            Self::SessionCreateFailed => "urn:agent-relay:error:session_create_failed",
            Self::PromptSendFailed => "urn:agent-relay:error:prompt_send_failed",
            Self::TransportParseError => "urn:agent-relay:error:transport_parse_error",
            Self::TransportConnectionError => "urn:agent-relay:error:transport_connection_error",
            Self::WorkerSpawnError => "urn:agent-relay:error:worker_spawn_error",
            Self::ExecutionFailed => "urn:agent-relay:error:execution_failed",
            Self::ProjectNotBound => "urn:agent-relay:error:project_not_bound",
            Self::WorkspaceError => "urn:agent-relay:error:workspace_error",
            Self::InvalidConfig => "urn:agent-relay:error:invalid_config",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::NoPortAvailable => "No Port Available",
            Self::ReadinessTimeout => "Readiness Timeout",
            Self::SessionCreateFailed => "Session Create Failed",
            Self::PromptSendFailed => "Prompt Send Failed",
            Self::TransportParseError => "Transport Parse Error",
            Self::TransportConnectionError => "Transport Connection Error",
            Self::WorkerSpawnError => "Worker Spawn Error",
            Self::ExecutionFailed => "Execution Failed",
            Self::ProjectNotBound => "Project Not Bound",
            Self::WorkspaceError => "Workspace Error",
            Self::InvalidConfig => "Invalid Config",
        }
    }

    /// Whether the error was raised by the backend after the execution started,
    /// as opposed to a failure while setting it up.
    pub fn is_terminal_backend_error(&self) -> bool {
        matches!(
            self,
            Self::ExecutionFailed | Self::TransportParseError | Self::TransportConnectionError
        )
    }
}

/// Errors produced while spawning workers, managing sessions and driving executions.
///
/// Every variant carries owned strings so the error can travel through
/// lifecycle callbacks and be cloned into several subscribers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("no available ports in range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },
    #[error("service at port {port} failed to become ready within {timeout_ms}ms")]
    ReadinessTimeout { port: u16, timeout_ms: u64 },
    #[error("failed to create session: {message}")]
    SessionCreateFailed { message: String },
    #[error("failed to send prompt to session {session_id}: {message}")]
    PromptSendFailed { session_id: String, message: String },
    #[error("failed to parse event: {message}")]
    TransportParse { message: String },
    #[error("event stream connection error: {message}")]
    TransportConnection { message: String },
    #[error("failed to spawn worker `{program}`: {message}")]
    WorkerSpawn { program: String, message: String },
    #[error("{message}")]
    ExecutionFailed { message: String },
    #[error("no project bound to channel {channel_id}")]
    ProjectNotBound { channel_id: String },
    #[error("workspace error: {message}")]
    Workspace { message: String },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::NoPortAvailable { .. } => ErrorType::NoPortAvailable,
            Self::ReadinessTimeout { .. } => ErrorType::ReadinessTimeout,
            Self::SessionCreateFailed { .. } => ErrorType::SessionCreateFailed,
            Self::PromptSendFailed { .. } => ErrorType::PromptSendFailed,
            Self::TransportParse { .. } => ErrorType::TransportParseError,
            Self::TransportConnection { .. } => ErrorType::TransportConnectionError,
            Self::WorkerSpawn { .. } => ErrorType::WorkerSpawnError,
            Self::ExecutionFailed { .. } => ErrorType::ExecutionFailed,
            Self::ProjectNotBound { .. } => ErrorType::ProjectNotBound,
            Self::Workspace { .. } => ErrorType::WorkspaceError,
            Self::InvalidConfig { .. } => ErrorType::InvalidConfig,
        }
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    pub fn transport_connection(message: impl Into<String>) -> Self {
        Self::TransportConnection {
            message: message.into(),
        }
    }
}
