//! HTTP front end for the streaming core: pod exec over WebSocket, watch and
//! log relays over SSE, and the minikube installer feed.

pub mod config;
pub mod kubectl;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::kubectl::Kubectl;
use crate::state::AppState;

/// State wired to the `kubectl` collaborators described by `config`.
pub fn build_state(config: &ServerConfig) -> Result<AppState> {
    let kubectl = Arc::new(Kubectl::from_config(config)?);
    Ok(AppState::new(
        kubectl.clone(),
        kubectl.clone(),
        kubectl.clone(),
        kubectl,
        config.app.installer_settings(),
    ))
}

/// Serves until SIGINT/SIGTERM, then waits up to `shutdown_grace` for open
/// streams before returning.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let mut state = build_state(&config)?;
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }
    let router = routes::build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "pier listening");

    let stop = CancellationToken::new();
    let mut server = tokio::spawn({
        let stop = stop.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }
    });

    tokio::select! {
        joined = &mut server => {
            return joined.context("server task panicked")?.context("server error");
        }
        _ = shutdown_signal() => {}
    }

    info!(grace_secs = config.shutdown_grace.as_secs(), "shutdown requested; draining connections");
    stop.cancel();
    match tokio::time::timeout(config.shutdown_grace, &mut server).await {
        Ok(joined) => joined.context("server task panicked")?.context("server error")?,
        Err(_) => {
            warn!("streams still open after the grace period; closing them");
            server.abort();
        }
    }
    info!("pier stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
