//! Updater error taxonomy — distinguishes error kinds so hosts can decide
//! what to surface, retry, or silently log.

use thiserror::Error;

/// Errors produced by the controller and backends.
#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("an update check is already running")]
    AlreadyRunning,

    #[error("maintenance tool not found at '{path}'")]
    ToolNotFound { path: String },

    #[error("backend is not initialized")]
    NotInitialized,

    #[error("maintenance tool failed: {message}")]
    ProcessFailed { message: String },

    #[error("invalid update list in maintenance tool output: {message}")]
    ParseFailed { message: String },

    #[error("schedule delay of {seconds}s overflows the millisecond timer range")]
    ScheduleOverflow { seconds: u32 },

    #[error("operation '{operation}' is not supported by this backend")]
    Unsupported { operation: &'static str },
}

impl UpdaterError {
    /// Machine-readable error code for host IPC surfaces.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::ProcessFailed { .. } => "PROCESS_FAILED",
            Self::ParseFailed { .. } => "PARSE_FAILED",
            Self::ScheduleOverflow { .. } => "SCHEDULE_OVERFLOW",
            Self::Unsupported { .. } => "UNSUPPORTED",
        }
    }

    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::ProcessFailed { .. })
    }

    /// JSON error envelope for host IPC surfaces.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}
