use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

/// Logical service supervised by the studio.
///
/// NOTE: This is a closed set. The agent maps each id to a spawn spec; the UI
/// never sends commands or paths.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceId {
    Overlay,
    Backend,
    Frontend,
    VoiceChanger,
}

impl ServiceId {
    pub const ALL: [ServiceId; 4] = [
        ServiceId::Overlay,
        ServiceId::Backend,
        ServiceId::Frontend,
        ServiceId::VoiceChanger,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceId::Overlay => "overlay",
            ServiceId::Backend => "backend",
            ServiceId::Frontend => "frontend",
            ServiceId::VoiceChanger => "voice-changer",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service: {0}")]
pub struct UnknownServiceId(pub String);

impl FromStr for ServiceId {
    type Err = UnknownServiceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('_', "-");
        ServiceId::ALL
            .into_iter()
            .find(|id| id.as_str() == key)
            .ok_or_else(|| UnknownServiceId(s.to_string()))
    }
}

/// Identifies one spawn of a service. A new run id is minted on every start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub id: ServiceId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub run_id: Option<RunId>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// One line of child output (or an agent note about a child).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub source: ServiceId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(source: ServiceId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            source,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn service_id_parses_wire_names() {
        assert_eq!("voice-changer".parse::<ServiceId>().unwrap(), ServiceId::VoiceChanger);
        assert_eq!("VOICE_CHANGER".parse::<ServiceId>().unwrap(), ServiceId::VoiceChanger);
        assert_eq!(" overlay ".parse::<ServiceId>().unwrap(), ServiceId::Overlay);
        let err = "database".parse::<ServiceId>().unwrap_err();
        assert_eq!(err.to_string(), "unknown service: database");
    }

    #[test]
    fn service_id_serializes_kebab_case() {
        let s = serde_json::to_string(&ServiceId::VoiceChanger).unwrap();
        assert_eq!(s, "\"voice-changer\"");
        let st = serde_json::to_string(&ProcessState::NotStarted).unwrap();
        assert_eq!(st, "\"not-started\"");
    }
}
