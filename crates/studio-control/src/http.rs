use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use studio_agent::ControlEvent;
use studio_process::{LogEntry, ServiceId};
use tokio::sync::broadcast::error::RecvError;
use tracing::Instrument;

use crate::security::{self, json_error};
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 1_000;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/logs/:service", get(logs))
        .route("/commands/:name", post(command))
        .route("/events", get(events_ws))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::origin_guard,
        ))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<AppState>) -> Response {
    Json(state.surface.status().await).into_response()
}

/// Runs the command to completion; `ok` in the body carries the outcome.
async fn command(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.surface.dispatch_named(&name).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => json_error(StatusCode::NOT_FOUND, e.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    cursor: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    service: ServiceId,
    lines: Vec<LogEntry>,
    next_cursor: u64,
}

async fn logs(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Response {
    let Ok(id) = service.parse::<ServiceId>() else {
        return json_error(StatusCode::NOT_FOUND, format!("unknown service: {service}"));
    };
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let (lines, next_cursor) = state
        .surface
        .supervisor()
        .tail_logs(id, q.cursor.unwrap_or(0), limit)
        .await;
    Json(LogsResponse {
        service: id,
        lines,
        next_cursor,
    })
    .into_response()
}

/// One message on the event socket.
#[derive(Debug, Serialize)]
pub struct EventFrame<'a> {
    pub event: String,
    pub payload: &'a ControlEvent,
}

pub fn encode_event(event: &ControlEvent) -> serde_json::Result<String> {
    serde_json::to_string(&EventFrame {
        event: event.name(),
        payload: event,
    })
}

async fn events_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| handle_events_socket(state, socket))
        .into_response()
}

async fn handle_events_socket(state: AppState, socket: WebSocket) {
    let span = tracing::info_span!("events_ws");
    async move {
        let mut events = state.events.subscribe();
        let (mut sender, mut receiver) = socket.split();
        tracing::debug!("event subscriber connected");

        loop {
            tokio::select! {
                ev = events.recv() => {
                    let ev = match ev {
                        Ok(ev) => ev,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event subscriber lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    let text = match encode_event(&ev) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to encode event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        let _ = sender.send(Message::Close(None)).await;
        tracing::debug!("event subscriber disconnected");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use studio_agent::{BroadcastSink, ControlSurface, StudioConfig};

    use super::*;

    struct TestApp {
        addr: SocketAddr,
        _root: tempfile::TempDir,
        task: tokio::task::JoinHandle<()>,
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    async fn spawn_app() -> TestApp {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().to_string_lossy().to_string();
        let config = StudioConfig::from_vars(|k| match k {
            "STUDIO_ROOT" => Some(root_path.clone()),
            "STUDIO_LOG_FILES" => Some("off".to_string()),
            "STUDIO_ALLOWED_ORIGINS" => Some("http://localhost:5173".to_string()),
            _ => None,
        });

        let events = BroadcastSink::new(64);
        let surface = ControlSurface::new(&config, std::sync::Arc::new(events.clone())).unwrap();
        let state = AppState::new(surface, events, config.allowed_origins.clone());

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        TestApp {
            addr,
            _root: root,
            task,
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = spawn_app().await;
        let resp = client()
            .get(format!("http://{}/healthz", app.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn status_lists_every_service_not_started() {
        let app = spawn_app().await;
        let body: serde_json::Value = client()
            .get(format!("http://{}/status", app.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 4);
        assert!(list.iter().all(|s| s["state"] == "not-started"));
    }

    #[tokio::test]
    async fn stop_of_idle_service_is_ok() {
        let app = spawn_app().await;
        let body: serde_json::Value = client()
            .post(format!("http://{}/commands/stop-overlay", app.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["command"], "stop-overlay");
        assert_eq!(body["status"][0]["state"], "not-started");
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let app = spawn_app().await;
        let resp = client()
            .post(format!("http://{}/commands/launch-rockets", app.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_for_unknown_service_is_not_found() {
        let app = spawn_app().await;
        let resp = client()
            .get(format!("http://{}/logs/database", app.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let body: serde_json::Value = client()
            .get(format!("http://{}/logs/backend?cursor=0&limit=5", app.addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["service"], "backend");
        assert_eq!(body["lines"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn foreign_origin_is_forbidden() {
        let app = spawn_app().await;
        let resp = client()
            .post(format!("http://{}/commands/stop-overlay", app.addr))
            .header("origin", "https://evil.example")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

        let ok = client()
            .get(format!("http://{}/status", app.addr))
            .header("origin", "http://localhost:5173")
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::OK);
    }

    #[test]
    fn event_frames_carry_wire_name_and_payload() {
        let ev = ControlEvent::Started {
            view: "voice-changer".to_string(),
            url: Some("http://localhost:18888/".to_string()),
        };
        let v: serde_json::Value = serde_json::from_str(&encode_event(&ev).unwrap()).unwrap();
        assert_eq!(v["event"], "voice-changer-started");
        assert_eq!(v["payload"]["url"], "http://localhost:18888/");
    }
}
