mod exec;
mod installer;
mod logs;
mod watch;

use std::convert::Infallible;

use axum::{
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::Stream;
use pier_stream::{ClusterError, StreamError};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/namespaces/:namespace/pods/:name/exec", get(exec::exec_into_pod))
        .route("/api/v1/namespaces/:namespace/pods/:name/logs", get(logs::stream_pod_logs))
        .route("/api/v1/namespaces/:namespace/watch/:kind", get(watch::watch_namespaced))
        .route("/api/v1/watch/:kind", get(watch::watch_cluster))
        .route("/api/v1/system/install-minikube", get(installer::stream_minikube_install))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}

/// Event stream with keep-alive comments; the client sees events in the
/// order the stream yields them.
pub(crate) fn event_stream<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    (
        [(header::CONNECTION, "keep-alive")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// JSON-encodes `payload` as a named event, or an `error` event if it cannot
/// be encoded.
pub(crate) fn json_event<T: Serialize>(name: &'static str, payload: &T) -> Event {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, event = name, "failed to encode event payload");
            Event::default()
                .event("error")
                .data(json!({ "error": format!("failed to encode {name} event") }).to_string())
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

#[derive(Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "cluster_unavailable", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = self.parts();
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Validation(msg) => ApiError::BadRequest(msg),
            StreamError::ExternalProcess(msg) => ApiError::BadGateway(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(msg) => ApiError::NotFound(msg),
            ClusterError::Conflict(msg) | ClusterError::AlreadyExists(msg) => ApiError::Conflict(msg),
            ClusterError::Unavailable(msg) => ApiError::BadGateway(msg),
            ClusterError::Command(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{self, Body};
    use axum::http::Request;
    use pier_stream::progress::{CommandSpec, InstallPlan, InstallerSettings, StartCommand};
    use pier_stream::testing::{EchoExecutor, MemoryObjectStore, ScriptedLogSource, ScriptedWatchSource};
    use pier_stream::{EventType, RawEvent, ResourceKind};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    #[derive(Default)]
    struct Fakes {
        watches: ScriptedWatchSource,
        objects: MemoryObjectStore,
        logs: ScriptedLogSource,
    }

    fn app(fakes: Fakes) -> Router {
        build_router(state(fakes))
    }

    fn state(fakes: Fakes) -> AppState {
        AppState::new(
            Arc::new(EchoExecutor),
            Arc::new(fakes.watches),
            Arc::new(fakes.objects),
            Arc::new(fakes.logs),
            InstallerSettings::default(),
        )
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = tokio::time::timeout(Duration::from_secs(5), body::to_bytes(response.into_body(), usize::MAX))
            .await
            .expect("body finished in time")
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    /// `(event name, data)` pairs from an SSE body, skipping keep-alives.
    fn sse_events(body: &str) -> Vec<(String, String)> {
        body.split("\n\n")
            .filter_map(|block| {
                let mut name = "message".to_string();
                let mut data = Vec::new();
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        name = value.trim().to_string();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push(value.trim_start().to_string());
                    }
                }
                (!data.is_empty()).then(|| (name, data.join("\n")))
            })
            .collect()
    }

    fn pod(name: &str) -> Value {
        json!({
            "kind": "Pod",
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"containers": [{"name": "app"}], "initContainers": [{"name": "init"}]},
            "status": {"phase": "Running"}
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = get(app(Fakes::default()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).expect("json"), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn exec_rejects_invalid_requests_before_upgrade() {
        let cases = [
            "/api/v1/namespaces/default/pods/web-0/exec?command=ls",
            "/api/v1/namespaces/default/pods/web-0/exec?container=app",
            "/api/v1/namespaces/Bad_NS/pods/web-0/exec?container=app&command=ls",
            "/api/v1/namespaces/default/pods/web_0/exec?container=app&command=ls",
        ];
        for uri in cases {
            let (status, body) = get(app(Fakes::default()), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}: {body}");
            let parsed: Value = serde_json::from_str(&body).expect("json error body");
            assert_eq!(parsed["error"], "bad_request");
        }
    }

    #[tokio::test]
    async fn watch_relays_events_in_order_then_closes() {
        let fakes = Fakes {
            watches: ScriptedWatchSource {
                events: vec![
                    RawEvent::new(EventType::Added, pod("web-0")),
                    RawEvent::new(EventType::Modified, pod("web-0")),
                ],
                ..ScriptedWatchSource::default()
            },
            ..Fakes::default()
        };
        let (status, body) = get(app(fakes), "/api/v1/namespaces/default/watch/pods").await;
        assert_eq!(status, StatusCode::OK);

        let events = sse_events(&body);
        assert_eq!(events.len(), 3, "{body}");
        let first: Value = serde_json::from_str(&events[0].1).expect("first");
        let second: Value = serde_json::from_str(&events[1].1).expect("second");
        assert_eq!(events[0].0, "message");
        assert_eq!(first["type"], "ADDED");
        assert_eq!(first["object"]["name"], "web-0");
        assert_eq!(first["error"], Value::Null);
        assert_eq!(second["type"], "MODIFIED");
        assert_eq!(events[2].0, "close");
        assert!(events.iter().all(|(name, _)| name != "error"));
    }

    #[tokio::test]
    async fn watch_surfaces_api_errors_as_envelopes() {
        let fakes = Fakes {
            watches: ScriptedWatchSource {
                events: vec![RawEvent::new(
                    EventType::Error,
                    json!({"kind": "Status", "message": "Expired", "code": 410}),
                )],
                ..ScriptedWatchSource::default()
            },
            ..Fakes::default()
        };
        let (_, body) = get(app(fakes), "/api/v1/watch/nodes").await;
        let events = sse_events(&body);
        let envelope: Value = serde_json::from_str(&events[0].1).expect("envelope");
        assert_eq!(envelope["type"], "ERROR");
        assert_eq!(envelope["object"], Value::Null);
        assert_eq!(envelope["error"], "K8s API Error: Expired (Code: 410)");
    }

    #[tokio::test]
    async fn watch_rejects_unknown_and_misplaced_kinds() {
        let (status, _) = get(app(Fakes::default()), "/api/v1/namespaces/default/watch/widgets").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(app(Fakes::default()), "/api/v1/namespaces/default/watch/nodes").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(app(Fakes::default()), "/api/v1/watch/pods").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn watch_subscription_failure_maps_to_status() {
        let fakes = Fakes {
            watches: ScriptedWatchSource {
                fail_with: Some(ClusterError::Unavailable("connection refused".into())),
                ..ScriptedWatchSource::default()
            },
            ..Fakes::default()
        };
        let (status, body) = get(app(fakes), "/api/v1/namespaces/default/watch/deployments").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY, "{body}");
    }

    fn log_fakes(lines: &[&str], failure: Option<&str>) -> Fakes {
        Fakes {
            objects: MemoryObjectStore::with_objects(ResourceKind::Pods, [pod("web-0")]),
            logs: ScriptedLogSource {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                failure: failure.map(str::to_string),
                ..ScriptedLogSource::default()
            },
            ..Fakes::default()
        }
    }

    #[tokio::test]
    async fn logs_validate_pod_container_and_tail() {
        let (status, _) = get(app(log_fakes(&[], None)), "/api/v1/namespaces/default/pods/web-0/logs").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(
            app(log_fakes(&[], None)),
            "/api/v1/namespaces/default/pods/missing/logs?container=app",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(
            app(log_fakes(&[], None)),
            "/api/v1/namespaces/default/pods/web-0/logs?container=nope",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(
            app(log_fakes(&[], None)),
            "/api/v1/namespaces/default/pods/web-0/logs?container=app&tailLines=0",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logs_stream_lines_then_error() {
        let (status, body) = get(
            app(log_fakes(&["starting", "listening on :80"], Some("stream reset"))),
            "/api/v1/namespaces/default/pods/web-0/logs?container=init&tailLines=10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let events = sse_events(&body);
        assert_eq!(
            events,
            vec![
                ("message".to_string(), "starting".to_string()),
                ("message".to_string(), "listening on :80".to_string()),
                ("error".to_string(), "stream reset".to_string()),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn installer_streams_until_done() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact: PathBuf = dir.path().join("minikube-test");
        let sh = |script: &str| {
            CommandSpec::new(
                "/bin/sh",
                ["-c".to_string(), script.to_string(), "sh".to_string(), artifact.display().to_string()],
            )
        };
        let plan = InstallPlan {
            artifact: artifact.clone(),
            download: sh("printf 'binary' > \"$1\""),
            install: sh("true"),
            install_target: dir.path().join("bin").join("minikube"),
            start: StartCommand::Fixed(sh("sleep 0.1; echo 'Done! kubectl is ready'")),
        };
        let app = build_router(state(Fakes::default()).with_install_plan(plan));
        let (status, body) = get(app, "/api/v1/system/install-minikube").await;
        assert_eq!(status, StatusCode::OK);

        let events = sse_events(&body);
        let last: Value = serde_json::from_str(&events.last().expect("events").1).expect("json");
        assert!(events.iter().all(|(name, _)| name == "message"));
        assert_eq!(last["done"], true);
        assert_eq!(last["step"], "finished");
        assert_eq!(last["progress"], 100);
        assert!(!artifact.exists());
    }
}
