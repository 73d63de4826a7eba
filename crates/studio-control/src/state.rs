use std::sync::Arc;

use studio_agent::{BroadcastSink, ControlSurface};

#[derive(Clone)]
pub struct AppState {
    pub surface: ControlSurface,
    pub events: BroadcastSink,
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(surface: ControlSurface, events: BroadcastSink, allowed_origins: Vec<String>) -> Self {
        Self {
            surface,
            events,
            allowed_origins: Arc::new(allowed_origins),
        }
    }
}
