use studio_process::ServiceId;

use crate::support::truncate_utf8;

const MAX_MESSAGE_BYTES: usize = 8 * 1024;
const MAX_HINT_BYTES: usize = 2 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Executable or script missing, permission denied, bad working directory.
    #[error("failed to spawn {service}: {message}")]
    Spawn { service: ServiceId, message: String },

    /// Alive, but never answered its health check within the attempt budget.
    #[error("{service} did not become ready after {attempts} attempts: {last_error}")]
    ReadinessTimeout {
        service: ServiceId,
        attempts: u32,
        last_error: String,
    },

    /// Exited on its own with a nonzero code or a signal.
    #[error("{service} exited unexpectedly: {message}")]
    CrashExit {
        service: ServiceId,
        code: Option<i32>,
        message: String,
    },

    /// A stop request overtook the start.
    #[error("start of {service} was cancelled by a stop request")]
    Cancelled { service: ServiceId },
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::UnknownService(_) => "unknown_service",
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::ReadinessTimeout { .. } => "readiness_timeout",
            SupervisorError::CrashExit { .. } => "crash_exit",
            SupervisorError::Cancelled { .. } => "cancelled",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            SupervisorError::Spawn { service, .. } => Some(format!(
                "Check that the {service} executable is installed and its script path exists."
            )),
            SupervisorError::ReadinessTimeout { service, .. } => Some(format!(
                "{service} is still running; it may be slow to load. Check its log output."
            )),
            SupervisorError::CrashExit { service, .. } => {
                Some(format!("See the {service} log lines just before the exit."))
            }
            SupervisorError::UnknownService(_) | SupervisorError::Cancelled { .. } => None,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string(), self.hint())
    }
}

/// Error shape delivered to the UI.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }
}
