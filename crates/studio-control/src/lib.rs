pub mod http;
pub mod security;
pub mod state;
pub mod telemetry;
