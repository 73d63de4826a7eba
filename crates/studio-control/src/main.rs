use std::{sync::Arc, time::Duration};

use anyhow::Context;
use studio_agent::{BroadcastSink, ControlSurface, StudioConfig};
use studio_control::{http, state::AppState, telemetry};

const EVENT_BUFFER: usize = 1024;
const HTTP_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = StudioConfig::load()?;
    let log_dir = config.log_files.then(|| config.log_dir());
    let _log_guard = telemetry::init(log_dir.as_deref())?;

    tracing::info!(
        root = %config.root.display(),
        data_dir = %config.data_dir.display(),
        "studio-control starting"
    );

    let events = BroadcastSink::new(EVENT_BUFFER);
    let surface = ControlSurface::new(&config, Arc::new(events.clone()))?;
    let state = AppState::new(surface.clone(), events, config.allowed_origins.clone());
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("bind {}", config.control_addr))?;
    tracing::info!(addr = %config.control_addr, "studio-control HTTP listening");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let early_exit = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            tracing::info!("shutdown requested");
            None
        }
        res = &mut server => Some(res),
    };

    // Stopping the children also cancels in-flight start commands, so
    // pending HTTP requests can finish.
    surface.shutdown().await;

    if let Some(res) = early_exit {
        res.context("HTTP server task")?
            .context("HTTP server")?;
        anyhow::bail!("HTTP server exited unexpectedly");
    }

    let _ = stop_tx.send(());
    match tokio::time::timeout(HTTP_DRAIN, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "HTTP server error during shutdown"),
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server task failed"),
        Err(_) => tracing::warn!("HTTP connections did not drain in time"),
    }

    tracing::info!("studio-control stopped");
    Ok(())
}
