use studio_process::{LogEntry, ProcessState, ServiceId};
use tokio::sync::broadcast;

use crate::error::ErrorPayload;

/// Everything the core tells the UI.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlEvent {
    ProcessLog(LogEntry),
    ProcessStatus {
        source: ServiceId,
        state: ProcessState,
        pid: Option<u32>,
        exit_code: Option<i32>,
        message: Option<String>,
    },
    /// A requested view (`voice-changer`, `voice-train`, `overlay`) is ready.
    Started {
        view: String,
        url: Option<String>,
    },
    Error {
        view: String,
        error: ErrorPayload,
    },
    OverlayClosed,
}

impl ControlEvent {
    /// Event name on the UI channel, e.g. `process-log` or `voice-changer-started`.
    pub fn name(&self) -> String {
        match self {
            ControlEvent::ProcessLog(_) => "process-log".to_string(),
            ControlEvent::ProcessStatus { .. } => "process-status".to_string(),
            ControlEvent::Started { view, .. } => format!("{view}-started"),
            ControlEvent::Error { view, .. } => format!("{view}-error"),
            ControlEvent::OverlayClosed => "overlay-closed".to_string(),
        }
    }
}

/// Where the core publishes events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ControlEvent);
}

impl<F> EventSink for F
where
    F: Fn(ControlEvent) + Send + Sync,
{
    fn emit(&self, event: ControlEvent) {
        self(event)
    }
}

/// Fan-out to any number of UI subscribers. Slow subscribers lag and lose
/// the oldest events rather than blocking the supervisor.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ControlEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: ControlEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<ControlEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<ControlEvent> {
            self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub(crate) fn states(&self, id: ServiceId) -> Vec<ProcessState> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ControlEvent::ProcessStatus { source, state, .. } if source == id => {
                        Some(state)
                    }
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn logs(&self, id: ServiceId) -> Vec<LogEntry> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ControlEvent::ProcessLog(entry) if entry.source == id => Some(entry),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn names(&self) -> Vec<String> {
            self.events().iter().map(ControlEvent::name).collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: ControlEvent) {
            self.events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        }
    }
}
