//! Process orchestration core for the studio control panel: starts, probes,
//! stops and watches the overlay, backend, frontend and voice-changer
//! processes, and routes their output to the UI.

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod log_router;
pub mod port_reclaim;
pub mod readiness;
pub mod services;
pub mod supervisor;

mod support;

pub use config::StudioConfig;
pub use control::{CommandReply, ControlCommand, ControlSurface};
pub use error::{ErrorPayload, SupervisorError};
pub use events::{BroadcastSink, ControlEvent, EventSink};
pub use supervisor::Supervisor;
