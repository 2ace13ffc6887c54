use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
};
use metrics::{counter, decrement_gauge, increment_gauge};
use pier_stream::{build_command, validate, ExecRequest, ExecSession};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};
use uuid::Uuid;

use super::ApiError;
use crate::state::AppState;
use crate::ws::WsTransport;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ExecQuery {
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Option<String>,
    #[serde(default = "default_true")]
    stdin: bool,
    #[serde(default = "default_true")]
    stdout: bool,
    #[serde(default = "default_true")]
    stderr: bool,
    #[serde(default)]
    tty: bool,
}

impl ExecQuery {
    fn into_request(self, namespace: &str, pod: &str) -> Result<ExecRequest, ApiError> {
        validate::namespace(namespace)?;
        validate::resource_name(pod)?;
        let container = self
            .container
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ApiError::BadRequest("container query parameter is required".into()))?;
        let command = self
            .command
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ApiError::BadRequest("command query parameter is required".into()))?;
        Ok(ExecRequest {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container,
            command: build_command(&command, self.args.as_deref()),
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            tty: self.tty,
        })
    }
}

/// Validates the request, then upgrades to a WebSocket carrying the remote
/// command's stdin and output.
pub async fn exec_into_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<ExecQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let request = query.into_request(namespace.trim(), name.trim())?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| run_session(socket, state, request)))
}

async fn run_session(socket: WebSocket, state: AppState, request: ExecRequest) {
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "exec_session",
        %session_id,
        namespace = %request.namespace,
        pod = %request.pod,
        container = %request.container
    );
    async move {
        info!(command = ?request.command, tty = request.tty, "exec session attached");
        increment_gauge!("pier_exec_sessions_active", 1.0);

        // Cancelled when this future is dropped, e.g. on server shutdown.
        let scope = CancellationToken::new();
        let _scope_guard = scope.clone().drop_guard();

        let transport = Arc::new(WsTransport::new(socket));
        let session = ExecSession::new(transport, request);
        let outcome = session.run(state.executor.clone(), scope).await;

        decrement_gauge!("pier_exec_sessions_active", 1.0);
        counter!("pier_exec_sessions_total", 1, "outcome" => outcome.as_str());
    }
    .instrument(span)
    .await
}
