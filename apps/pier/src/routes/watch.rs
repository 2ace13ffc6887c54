use std::convert::Infallible;

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    response::{sse::Event, Response},
};
use metrics::{decrement_gauge, increment_gauge};
use pier_stream::{
    validate, PodSummary, RelayEnd, ResourceKind, ResourceSummary, SinkClosed, StreamSink, Subscription, WatchEvent,
    WatchObject, WatchRelay,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{event_stream, json_event, ApiError};
use crate::state::AppState;

/// Events buffered between the relay task and the HTTP body.
const SSE_BUFFER: usize = 16;

#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    #[serde(rename = "labelSelector", alias = "selector", default)]
    label_selector: Option<String>,
}

impl WatchQuery {
    fn selector(&self) -> Option<&str> {
        self.label_selector.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

fn parse_kind(kind: &str, namespaced: bool) -> Result<ResourceKind, ApiError> {
    let kind = ResourceKind::from_plural(kind)
        .ok_or_else(|| ApiError::NotFound(format!("unknown resource kind '{kind}'")))?;
    match (namespaced, kind.is_namespaced()) {
        (true, false) => Err(ApiError::BadRequest(format!(
            "{kind} are cluster-scoped; use /api/v1/watch/{kind}"
        ))),
        (false, true) => Err(ApiError::BadRequest(format!(
            "{kind} are namespaced; use /api/v1/namespaces/{{namespace}}/watch/{kind}"
        ))),
        _ => Ok(kind),
    }
}

pub async fn watch_namespaced(
    State(state): State<AppState>,
    Path((namespace, kind)): Path<(String, String)>,
    Query(query): Query<WatchQuery>,
) -> Result<Response, ApiError> {
    let namespace = namespace.trim();
    validate::namespace(namespace)?;
    let kind = parse_kind(&kind, true)?;
    open_watch(&state, kind, Some(namespace), query.selector()).await
}

pub async fn watch_cluster(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<WatchQuery>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind, false)?;
    open_watch(&state, kind, None, query.selector()).await
}

async fn open_watch(
    state: &AppState,
    kind: ResourceKind,
    namespace: Option<&str>,
    selector: Option<&str>,
) -> Result<Response, ApiError> {
    let subscription = state.watches.subscribe(kind, namespace, selector).await?;
    debug!(%kind, ?namespace, ?selector, "watch subscription opened");

    let request_done = CancellationToken::new();
    let (tx, rx) = mpsc::channel(SSE_BUFFER);
    match kind {
        ResourceKind::Pods => spawn_relay::<PodSummary>(kind, subscription, tx, request_done.clone()),
        _ => spawn_relay::<ResourceSummary>(kind, subscription, tx, request_done.clone()),
    }

    // The relay stops once the response body is dropped.
    let guard = request_done.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok::<Event, Infallible>(event)
    });
    Ok(event_stream(stream))
}

fn spawn_relay<T: WatchObject>(
    kind: ResourceKind,
    subscription: Subscription,
    tx: mpsc::Sender<Event>,
    request_done: CancellationToken,
) {
    tokio::spawn(async move {
        increment_gauge!("pier_watch_streams_active", 1.0);
        let mut sink = SseSink { tx: tx.clone() };
        let end = WatchRelay::<T>::new(kind, subscription)
            .run(&mut sink, request_done)
            .await;
        if end == RelayEnd::UpstreamClosed {
            let close = json_event("close", &json!({ "message": "watch channel closed" }));
            let _ = tx.send(close).await;
        }
        decrement_gauge!("pier_watch_streams_active", 1.0);
    });
}

struct SseSink {
    tx: mpsc::Sender<Event>,
}

#[async_trait]
impl<T: WatchObject> StreamSink<WatchEvent<T>> for SseSink {
    async fn deliver(&mut self, event: WatchEvent<T>) -> Result<(), SinkClosed> {
        self.tx
            .send(json_event("message", &event))
            .await
            .map_err(|_| SinkClosed)
    }
}
