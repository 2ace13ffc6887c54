use std::convert::Infallible;

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    response::{sse::Event, Response},
};
use metrics::{decrement_gauge, increment_gauge};
use pier_stream::logs::DEFAULT_TAIL_LINES;
use pier_stream::resources::pod_container_names;
use pier_stream::{validate, ClusterError, LogChunk, LogOptions, LogRelay, ResourceKind, SinkClosed, StreamSink};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{event_stream, ApiError};
use crate::state::AppState;

const SSE_BUFFER: usize = 64;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    timestamps: bool,
    #[serde(default)]
    tail_lines: Option<String>,
}

impl LogQuery {
    fn into_options(self) -> Result<LogOptions, ApiError> {
        let container = self
            .container
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ApiError::BadRequest("container query parameter is required".into()))?;
        let tail_lines = match self.tail_lines.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            None => DEFAULT_TAIL_LINES,
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ApiError::BadRequest(format!("tailLines must be a positive integer, got '{raw}'")))?,
        };
        Ok(LogOptions {
            container,
            follow: true,
            timestamps: self.timestamps,
            tail_lines,
        })
    }
}

/// Follows one container's logs. The pod must exist and declare the
/// container before the stream opens.
pub async fn stream_pod_logs(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let (namespace, name) = (namespace.trim(), name.trim());
    validate::namespace(namespace)?;
    validate::resource_name(name)?;
    let options = query.into_options()?;

    let pod = state
        .objects
        .get(ResourceKind::Pods, Some(namespace), name)
        .await
        .map_err(|err| match err {
            ClusterError::NotFound(_) => ApiError::NotFound(format!("pod {namespace}/{name} not found")),
            other => ApiError::from(other),
        })?;
    if !pod_container_names(&pod).iter().any(|c| c == &options.container) {
        return Err(ApiError::NotFound(format!(
            "container '{}' not found in pod {namespace}/{name}",
            options.container
        )));
    }

    let feed = state.logs.stream_logs(namespace, name, &options).await?;
    info!(%namespace, pod = %name, container = %options.container, tail_lines = options.tail_lines, "log stream opened");

    let request_done = CancellationToken::new();
    let (tx, rx) = mpsc::channel(SSE_BUFFER);
    tokio::spawn({
        let request_done = request_done.clone();
        async move {
            increment_gauge!("pier_watch_streams_active", 1.0);
            let mut sink = LogSink { tx };
            LogRelay::new(feed).run(&mut sink, request_done).await;
            decrement_gauge!("pier_watch_streams_active", 1.0);
        }
    });

    let guard = request_done.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok::<Event, Infallible>(event)
    });
    Ok(event_stream(stream))
}

struct LogSink {
    tx: mpsc::Sender<Event>,
}

#[async_trait]
impl StreamSink<LogChunk> for LogSink {
    async fn deliver(&mut self, chunk: LogChunk) -> Result<(), SinkClosed> {
        let event = match chunk {
            LogChunk::Line(line) => Event::default().data(line),
            LogChunk::Failed(message) => Event::default().event("error").data(message),
        };
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(container: Option<&str>, tail: Option<&str>) -> LogQuery {
        LogQuery {
            container: container.map(str::to_string),
            timestamps: false,
            tail_lines: tail.map(str::to_string),
        }
    }

    #[test]
    fn tail_lines_default_and_validation() {
        assert_eq!(query(Some("app"), None).into_options().expect("opts").tail_lines, 100);
        assert_eq!(query(Some("app"), Some("25")).into_options().expect("opts").tail_lines, 25);
        assert!(query(Some("app"), Some("0")).into_options().is_err());
        assert!(query(Some("app"), Some("-5")).into_options().is_err());
        assert!(query(Some("app"), Some("many")).into_options().is_err());
        assert!(query(None, None).into_options().is_err());
    }
}
