//! Stable error taxonomy for everything the runtime reports to callers.
//!
//! Internal fallible paths use `anyhow::Result`; errors that cross the public
//! boundary (execution responses, parse outcomes) are plain data so callers
//! can match on codes without unwinding.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SkillNotFound,
    InvalidMetadata,
    EntryMissing,
    ParseFailed,
    InvalidParameters,
    PermissionDenied,
    QueueFull,
    Timeout,
    Oom,
    SandboxFailed,
    RuntimeError,
    ProviderError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SkillNotFound => "skill_not_found",
            ErrorCode::InvalidMetadata => "invalid_metadata",
            ErrorCode::EntryMissing => "entry_missing",
            ErrorCode::ParseFailed => "parse_failed",
            ErrorCode::InvalidParameters => "invalid_parameters",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Oom => "oom",
            ErrorCode::SandboxFailed => "sandbox_failed",
            ErrorCode::RuntimeError => "runtime_error",
            ErrorCode::ProviderError => "provider_error",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorCode::QueueFull)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error record carried inside an `ExecutionResponse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            stack: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ExecutionError {}
