//! Relays cluster change events from a subscription to an event-stream sink.

use std::marker::PhantomData;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::feed::{Feed, RelayEnd, StreamSink};
use crate::resources::{PodSummary, ResourceKind, ResourceSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Error => "ERROR",
        }
    }
}

/// An untranslated event as the subscription primitive produced it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: Value,
}

impl RawEvent {
    pub fn new(event_type: EventType, object: Value) -> Self {
        Self { event_type, object }
    }
}

pub type Subscription = Feed<RawEvent>;

/// Client-facing envelope. Exactly one of `object` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: Option<T>,
    pub error: Option<String>,
}

impl<T> WatchEvent<T> {
    pub fn object(event_type: EventType, object: T) -> Self {
        Self {
            event_type,
            object: Some(object),
            error: None,
        }
    }

    pub fn failed(event_type: EventType, error: impl Into<String>) -> Self {
        Self {
            event_type,
            object: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Typed summary a watch of a given kind pushes to clients.
pub trait WatchObject: Serialize + Send + Sized + 'static {
    fn from_object(kind: ResourceKind, object: &Value) -> Option<Self>;
}

impl WatchObject for PodSummary {
    fn from_object(_kind: ResourceKind, object: &Value) -> Option<Self> {
        PodSummary::from_object(object)
    }
}

impl WatchObject for ResourceSummary {
    fn from_object(kind: ResourceKind, object: &Value) -> Option<Self> {
        ResourceSummary::from_object(kind, object)
    }
}

/// Status objects become an API error envelope; anything that is neither the
/// expected kind nor a Status becomes a mismatch error.
pub fn translate<T: WatchObject>(kind: ResourceKind, raw: RawEvent) -> WatchEvent<T> {
    if raw.object.get("kind").and_then(Value::as_str) == Some("Status") {
        let message = raw
            .object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let code = raw.object.get("code").and_then(Value::as_i64).unwrap_or(0);
        return WatchEvent::failed(raw.event_type, format!("K8s API Error: {message} (Code: {code})"));
    }
    match T::from_object(kind, &raw.object) {
        Some(object) => WatchEvent::object(raw.event_type, object),
        None => WatchEvent::failed(
            raw.event_type,
            format!("event object is not a {} or Status", kind.kind_name()),
        ),
    }
}

pub struct WatchRelay<T> {
    kind: ResourceKind,
    subscription: Subscription,
    _object: PhantomData<fn() -> T>,
}

impl<T: WatchObject> WatchRelay<T> {
    pub fn new(kind: ResourceKind, subscription: Subscription) -> Self {
        Self {
            kind,
            subscription,
            _object: PhantomData,
        }
    }

    /// Forwards events in arrival order until the subscription ends, the sink
    /// refuses an event, or `request_done` fires. The subscription is stopped
    /// on every exit path.
    pub async fn run<S>(mut self, sink: &mut S, request_done: CancellationToken) -> RelayEnd
    where
        S: StreamSink<WatchEvent<T>> + ?Sized,
    {
        let kind = self.kind;
        let mut forwarded = 0u64;
        let end = loop {
            let raw = tokio::select! {
                biased;
                _ = request_done.cancelled() => break RelayEnd::ClientDisconnected,
                raw = self.subscription.next() => raw,
            };
            let Some(raw) = raw else {
                break RelayEnd::UpstreamClosed;
            };
            let event = translate::<T>(kind, raw);
            let event_type = event.event_type.as_str();
            counter!("pier_watch_events_total", 1, "kind" => kind.plural(), "type" => event_type);
            if event.is_error() {
                debug!(kind = %kind, error = ?event.error, "watch event carried an error");
            }
            if sink.deliver(event).await.is_err() {
                break RelayEnd::SinkClosed;
            }
            forwarded += 1;
        };
        self.subscription.stop();
        info!(kind = %kind, forwarded, end = end.as_str(), "watch relay finished");
        end
    }
}
