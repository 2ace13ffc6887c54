use std::convert::Infallible;

use axum::{extract::State, response::Response};
use pier_stream::ProgressPipe;
use futures_util::stream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{event_stream, json_event};
use crate::state::AppState;

/// Downloads, installs and starts minikube, streaming a progress update per
/// milestone. The last event always has `done: true`.
pub async fn stream_minikube_install(State(state): State<AppState>) -> Response {
    let listener_gone = CancellationToken::new();
    let (pipe, rx) = match state.install_plan() {
        Ok(plan) => {
            info!(artifact = %plan.artifact.display(), "minikube installation requested");
            ProgressPipe::new(plan, listener_gone.clone())
        }
        Err(err) => {
            warn!(error = %err, "cannot plan minikube installation");
            ProgressPipe::rejected(err.to_string(), listener_gone.clone())
        }
    };
    pipe.spawn();

    let guard = listener_gone.drop_guard();
    let updates = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|update| (update, rx)) });
    let stream = updates.map(move |update| {
        let _ = &guard;
        Ok::<_, Infallible>(json_event("message", &update))
    });
    event_stream(stream)
}
