use std::{fmt, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use studio_process::{ProcessState, ProcessStatus, ServiceId};

use crate::config::StudioConfig;
use crate::error::{ErrorPayload, SupervisorError};
use crate::events::{ControlEvent, EventSink};
use crate::log_router::LogRouter;
use crate::port_reclaim::PortReclaimer;
use crate::readiness::ReadinessProber;
use crate::supervisor::Supervisor;

pub const VOICE_CHANGER_VIEW: &str = "voice-changer";
pub const VOICE_TRAIN_VIEW: &str = "voice-train";

/// A UI command, by wire name (`start-overlay`, `open-voice-train`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start(ServiceId),
    Stop(ServiceId),
    Toggle(ServiceId),
    /// Start and wait for the voice changer, then hand its URL to the UI.
    StartVoiceChanger,
    /// Bring up backend and frontend, then hand the training UI URL to the UI.
    OpenVoiceTrain,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Start(id) => write!(f, "start-{id}"),
            ControlCommand::Stop(id) => write!(f, "stop-{id}"),
            ControlCommand::Toggle(id) => write!(f, "toggle-{id}"),
            ControlCommand::StartVoiceChanger => f.write_str("start-voice-changer"),
            ControlCommand::OpenVoiceTrain => f.write_str("open-voice-train"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for ControlCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        match raw.as_str() {
            "start-voice-changer" => return Ok(ControlCommand::StartVoiceChanger),
            "open-voice-train" => return Ok(ControlCommand::OpenVoiceTrain),
            _ => {}
        }

        let parsed = if let Some(rest) = raw.strip_prefix("start-") {
            rest.parse().map(ControlCommand::Start)
        } else if let Some(rest) = raw.strip_prefix("stop-") {
            rest.parse().map(ControlCommand::Stop)
        } else if let Some(rest) = raw.strip_prefix("toggle-") {
            rest.parse().map(ControlCommand::Toggle)
        } else {
            return Err(UnknownCommand(s.to_string()));
        };
        parsed.map_err(|_| UnknownCommand(s.to_string()))
    }
}

/// Result of one command, returned to the caller and mirrored as events.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CommandReply {
    pub command: String,
    pub ok: bool,
    pub status: Vec<ProcessStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Where dependent views point once their services are up.
#[derive(Debug, Clone)]
pub struct Views {
    pub voice_changer_url: String,
    pub frontend_url: String,
    /// Prebuilt training UI; its `index.html` wins over the dev server.
    pub frontend_dist: PathBuf,
}

impl Views {
    pub fn from_config(config: &StudioConfig) -> Self {
        Self {
            voice_changer_url: config.voice_changer_url(),
            frontend_url: config.frontend_url(),
            frontend_dist: config.frontend_dist(),
        }
    }
}

struct OverlayWatch {
    inner: Arc<dyn EventSink>,
}

impl EventSink for OverlayWatch {
    fn emit(&self, event: ControlEvent) {
        let closed = matches!(
            event,
            ControlEvent::ProcessStatus {
                source: ServiceId::Overlay,
                state: ProcessState::Stopped | ProcessState::Failed,
                pid: None,
                ..
            }
        );
        self.inner.emit(event);
        if closed {
            self.inner.emit(ControlEvent::OverlayClosed);
        }
    }
}

/// Adds `overlay-closed` after the overlay's final status of a run,
/// whether the user closed the window or it was stopped.
pub fn overlay_aware(sink: Arc<dyn EventSink>) -> Arc<dyn EventSink> {
    Arc::new(OverlayWatch { inner: sink })
}

/// The only entry point the UI uses.
#[derive(Clone)]
pub struct ControlSurface {
    supervisor: Supervisor,
    sink: Arc<dyn EventSink>,
    views: Views,
    shutdown_timeout: Duration,
}

impl ControlSurface {
    pub fn new(config: &StudioConfig, sink: Arc<dyn EventSink>) -> anyhow::Result<Self> {
        let sink = overlay_aware(sink);
        let log_dir = config.log_files.then(|| config.log_dir());
        let router = LogRouter::new(sink.clone(), config.log_max_lines, log_dir);
        let supervisor = Supervisor::new(
            config.services.clone(),
            sink.clone(),
            router,
            PortReclaimer::system(config.port_release_delay),
            ReadinessProber::new()?,
            config.stop_grace,
        );
        Ok(Self::with_supervisor(
            supervisor,
            sink,
            Views::from_config(config),
            config.shutdown_timeout,
        ))
    }

    /// `sink` should be the same (overlay-aware) sink the supervisor emits to.
    pub fn with_supervisor(
        supervisor: Supervisor,
        sink: Arc<dyn EventSink>,
        views: Views,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            sink,
            views,
            shutdown_timeout,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Runs `command` to completion. Failures come back in the reply and as
    /// a `<view>-error` event; they never escape as errors.
    pub async fn dispatch(&self, command: ControlCommand) -> CommandReply {
        let name = command.to_string();
        let (view, result) = match command {
            ControlCommand::Start(id) => (
                id.as_str(),
                self.supervisor.start(id).await.map(|st| (vec![st], None)),
            ),
            ControlCommand::Stop(id) => (
                id.as_str(),
                self.supervisor.stop(id).await.map(|st| (vec![st], None)),
            ),
            ControlCommand::Toggle(id) => (
                id.as_str(),
                self.supervisor.toggle(id).await.map(|st| (vec![st], None)),
            ),
            ControlCommand::StartVoiceChanger => (
                VOICE_CHANGER_VIEW,
                self.start_voice_changer()
                    .await
                    .map(|(st, url)| (vec![st], Some(url))),
            ),
            ControlCommand::OpenVoiceTrain => (
                VOICE_TRAIN_VIEW,
                self.open_voice_train()
                    .await
                    .map(|(st, url)| (st, Some(url))),
            ),
        };

        match result {
            Ok((status, url)) => {
                tracing::info!(command = %name, url = url.as_deref().unwrap_or(""), "command done");
                let announce = match command {
                    ControlCommand::Start(_) => {
                        status.iter().any(|st| st.state == ProcessState::Running)
                    }
                    ControlCommand::StartVoiceChanger | ControlCommand::OpenVoiceTrain => true,
                    ControlCommand::Stop(_) | ControlCommand::Toggle(_) => false,
                };
                if announce {
                    self.sink.emit(ControlEvent::Started {
                        view: view.to_string(),
                        url: url.clone(),
                    });
                }
                CommandReply {
                    command: name,
                    ok: true,
                    status,
                    url,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(command = %name, error = %e, "command failed");
                let payload = e.payload();
                self.sink.emit(ControlEvent::Error {
                    view: view.to_string(),
                    error: payload.clone(),
                });
                CommandReply {
                    command: name,
                    ok: false,
                    status: self.supervisor.list().await,
                    url: None,
                    error: Some(payload),
                }
            }
        }
    }

    /// Parses and runs a command by wire name.
    pub async fn dispatch_named(&self, name: &str) -> Result<CommandReply, UnknownCommand> {
        let command = name.parse()?;
        Ok(self.dispatch(command).await)
    }

    async fn start_voice_changer(&self) -> Result<(ProcessStatus, String), SupervisorError> {
        let st = self.require_running(ServiceId::VoiceChanger).await?;
        Ok((st, self.views.voice_changer_url.clone()))
    }

    async fn open_voice_train(&self) -> Result<(Vec<ProcessStatus>, String), SupervisorError> {
        let index = self.views.frontend_dist.join("index.html");
        let prebuilt = tokio::fs::metadata(&index)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);

        if !prebuilt {
            let status = self
                .ensure_ready(&[ServiceId::Backend, ServiceId::Frontend])
                .await?;
            return Ok((status, self.views.frontend_url.clone()));
        }

        // The built UI only needs the backend; the dev server is a bonus.
        let (backend, frontend) = tokio::join!(
            self.ensure_ready(&[ServiceId::Backend]),
            self.require_running(ServiceId::Frontend)
        );
        let mut status = backend?;
        match frontend {
            Ok(st) => status.push(st),
            Err(e) => tracing::warn!(error = %e, "dev server unavailable; using prebuilt assets"),
        }
        let url = reqwest::Url::from_file_path(&index)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("file://{}", index.display()));
        Ok((status, url))
    }

    async fn require_running(&self, id: ServiceId) -> Result<ProcessStatus, SupervisorError> {
        let st = self.supervisor.ensure_running(id).await?;
        if st.state == ProcessState::Running {
            return Ok(st);
        }
        Err(SupervisorError::CrashExit {
            service: id,
            code: st.exit_code,
            message: st
                .message
                .unwrap_or_else(|| format!("{id} is {:?}", st.state)),
        })
    }

    /// Brings every service in `ids` to `Running` concurrently. Fails with
    /// the first error in `ids` order; services already up stay up.
    pub async fn ensure_ready(&self, ids: &[ServiceId]) -> Result<Vec<ProcessStatus>, SupervisorError> {
        let results = join_all(ids.iter().map(|id| self.require_running(*id))).await;
        results.into_iter().collect()
    }

    pub async fn status(&self) -> Vec<ProcessStatus> {
        self.supervisor.list().await
    }

    pub async fn shutdown(&self) {
        tracing::info!(
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "stopping all services"
        );
        self.supervisor.shutdown(self.shutdown_timeout).await;
    }
}
