//! In-memory collaborators for exercising the streaming core without a
//! network or a cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::bridge::{Frame, FrameTransport, ReadOutcome, TransportError};
use crate::cluster::{object_name, ClusterError, LogSource, ObjectStore, WatchSource};
use crate::exec::{ExecError, ExecRequest, ExecStreams, Executor};
use crate::feed::feed;
use crate::logs::{LogFeed, LogOptions};
use crate::resources::ResourceKind;
use crate::watch::{RawEvent, Subscription};

/// Server half of an in-memory frame transport.
pub struct MemoryTransport {
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Result<Frame, TransportError>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    closes: Arc<AtomicUsize>,
}

/// Client half: what a browser would see.
pub struct MemoryClient {
    tx: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    closes: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn pair() -> (Arc<MemoryTransport>, MemoryClient) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(MemoryTransport {
            inbound: AsyncMutex::new(server_rx),
            outbound: Mutex::new(Some(server_tx)),
            closes: closes.clone(),
        });
        let client = MemoryClient {
            tx: client_tx,
            rx: client_rx,
            closes,
        };
        (transport, client)
    }
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn recv(&self) -> Option<Result<Frame, TransportError>> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().clone();
        match outbound {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed { code: None }),
            None => Err(TransportError::Closed { code: None }),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.outbound.lock().take();
    }
}

impl MemoryClient {
    pub fn send_text(&self, text: &str) {
        let _ = self.tx.send(Ok(Frame::Text(text.to_string())));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.tx.send(Ok(Frame::Binary(Bytes::from(data))));
    }

    /// Simulates the peer going away with the given close code.
    pub fn disconnect(&self, code: Option<u16>) {
        let _ = self.tx.send(Err(TransportError::Closed { code }));
    }

    /// Next frame written by the server, `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Copies stdin to stdout until input ends.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn exec(&self, _request: ExecRequest, streams: ExecStreams, cancel: CancellationToken) -> Result<(), ExecError> {
        let (Some(stdin), Some(stdout)) = (streams.stdin, streams.stdout) else {
            return Ok(());
        };
        let mut buf = [0u8; 1024];
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                outcome = stdin.read(&mut buf) => outcome,
            };
            match outcome.map_err(|err| ExecError::Stream(err.to_string()))? {
                ReadOutcome::Data(n) => {
                    stdout
                        .write(&buf[..n])
                        .await
                        .map_err(|err| ExecError::Stream(err.to_string()))?;
                }
                ReadOutcome::Empty => continue,
                ReadOutcome::Closed => return Ok(()),
            }
        }
    }
}

/// Writes a fixed output and then fails with the given message.
pub struct FailingExecutor {
    pub output: &'static str,
    pub message: &'static str,
}

#[async_trait]
impl Executor for FailingExecutor {
    async fn exec(&self, _request: ExecRequest, streams: ExecStreams, _cancel: CancellationToken) -> Result<(), ExecError> {
        if let Some(stdout) = streams.stdout {
            let _ = stdout.write(self.output.as_bytes()).await;
        }
        Err(ExecError::Stream(self.message.to_string()))
    }
}

/// Blocks until cancelled and records that it observed the cancellation.
#[derive(Default)]
pub struct HangingExecutor {
    pub cancelled: CancellationToken,
}

#[async_trait]
impl Executor for HangingExecutor {
    async fn exec(&self, _request: ExecRequest, _streams: ExecStreams, cancel: CancellationToken) -> Result<(), ExecError> {
        cancel.cancelled().await;
        self.cancelled.cancel();
        Err(ExecError::Cancelled)
    }
}

/// Hands out one pre-recorded event sequence per subscription, then closes
/// (or stays open when `hold_open` is set). `stopped` fires when the consumer
/// stops the subscription.
#[derive(Default)]
pub struct ScriptedWatchSource {
    pub events: Vec<RawEvent>,
    pub hold_open: bool,
    pub stopped: CancellationToken,
    pub fail_with: Option<ClusterError>,
}

#[async_trait]
impl WatchSource for ScriptedWatchSource {
    async fn subscribe(
        &self,
        _kind: ResourceKind,
        _namespace: Option<&str>,
        _selector: Option<&str>,
    ) -> Result<Subscription, ClusterError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        let (producer, subscription) = feed(self.events.len().max(1));
        let events = self.events.clone();
        let hold_open = self.hold_open;
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            for event in events {
                if !producer.send(event).await {
                    break;
                }
            }
            if hold_open {
                producer.stopped().await;
            }
            if producer.is_stopped() {
                stopped.cancel();
            }
        });
        Ok(subscription)
    }
}

type ObjectKey = (ResourceKind, String, String);

/// Object store over an in-memory map. Resource versions count up from 1 on
/// every write.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ObjectKey, Value>>,
}

impl MemoryObjectStore {
    /// Seeds the store; each object's namespace comes from its metadata.
    pub fn with_objects(kind: ResourceKind, objects: impl IntoIterator<Item = Value>) -> Self {
        let store = MemoryObjectStore::default();
        {
            let mut map = store.objects.lock();
            for object in objects {
                let namespace = object.pointer("/metadata/namespace").and_then(Value::as_str);
                if let Ok(name) = object_name(&object) {
                    map.insert(key(kind, namespace, name), object.clone());
                }
            }
        }
        store
    }
}

fn key(kind: ResourceKind, namespace: Option<&str>, name: &str) -> ObjectKey {
    let namespace = if kind.is_namespaced() {
        namespace.unwrap_or("default").to_string()
    } else {
        String::new()
    };
    (kind, namespace, name.to_string())
}

fn resource_version(object: &Value) -> Option<&str> {
    object.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

fn stamp(object: &Value, version: u64) -> Value {
    let mut object = object.clone();
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("resourceVersion".into(), Value::String(version.to_string()));
    }
    object
}

fn labels_match(object: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector.split(',').filter(|term| !term.is_empty()).all(|term| {
        let (label, wanted) = term.split_once('=').unwrap_or((term, ""));
        object
            .pointer(&format!("/metadata/labels/{}", label.trim()))
            .and_then(Value::as_str)
            == Some(wanted.trim())
    })
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<Value, ClusterError> {
        self.objects
            .lock()
            .get(&key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} \"{name}\" not found", kind.plural())))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError> {
        let objects = self.objects.lock();
        let mut items: Vec<(&str, &str, &Value)> = objects
            .iter()
            .filter_map(|((k, ns, name), object)| {
                let in_scope = namespace.map_or(true, |wanted| !kind.is_namespaced() || ns == wanted);
                (*k == kind && in_scope && labels_match(object, selector)).then(|| (ns.as_str(), name.as_str(), object))
            })
            .collect();
        items.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(items.into_iter().map(|(_, _, object)| object.clone()).collect())
    }

    async fn create(&self, kind: ResourceKind, namespace: Option<&str>, object: &Value) -> Result<Value, ClusterError> {
        let key = key(kind, namespace, object_name(object)?);
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("{} \"{}\" already exists", kind.plural(), key.2)));
        }
        let stored = stamp(object, 1);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, kind: ResourceKind, namespace: Option<&str>, object: &Value) -> Result<Value, ClusterError> {
        let key = key(kind, namespace, object_name(object)?);
        let mut objects = self.objects.lock();
        let current = objects
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("{} \"{}\" not found", kind.plural(), key.2)))?;
        let current_version = resource_version(current).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        if let Some(sent) = resource_version(object) {
            if sent != current_version.to_string() {
                return Err(ClusterError::Conflict(format!(
                    "the object has been modified; resourceVersion {sent} is stale"
                )));
            }
        }
        let stored = stamp(object, current_version + 1);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        self.objects
            .lock()
            .remove(&key(kind, namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("{} \"{name}\" not found", kind.plural())))
    }
}

/// Emits fixed lines, optionally followed by a read failure.
#[derive(Default)]
pub struct ScriptedLogSource {
    pub lines: Vec<String>,
    pub failure: Option<String>,
    pub stopped: CancellationToken,
}

#[async_trait]
impl LogSource for ScriptedLogSource {
    async fn stream_logs(&self, _namespace: &str, _pod: &str, _options: &LogOptions) -> Result<LogFeed, ClusterError> {
        let (producer, logs) = feed(self.lines.len() + 1);
        let lines = self.lines.clone();
        let failure = self.failure.clone();
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            for line in lines {
                if !producer.send(Ok(line)).await {
                    stopped.cancel();
                    return;
                }
            }
            if let Some(message) = failure {
                producer.send(Err(message)).await;
            } else {
                producer.stopped().await;
                stopped.cancel();
            }
        });
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str, app: &str) -> Value {
        json!({"kind": "Deployment", "metadata": {"name": name, "namespace": "default", "labels": {"app": app}}})
    }

    #[tokio::test]
    async fn memory_store_crud_follows_cluster_taxonomy() {
        let store = MemoryObjectStore::default();
        let kind = ResourceKind::Deployments;

        let created = store
            .create(kind, Some("default"), &deployment("web", "web"))
            .await
            .expect("create");
        assert_eq!(created["metadata"]["resourceVersion"], "1");
        assert!(matches!(
            store.create(kind, Some("default"), &deployment("web", "web")).await,
            Err(ClusterError::AlreadyExists(_))
        ));

        let updated = store.update(kind, Some("default"), &created).await.expect("update");
        assert_eq!(updated["metadata"]["resourceVersion"], "2");
        assert!(matches!(
            store.update(kind, Some("default"), &created).await,
            Err(ClusterError::Conflict(_))
        ));

        store
            .create(kind, Some("default"), &deployment("api", "api"))
            .await
            .expect("create api");
        let selected = store.list(kind, Some("default"), Some("app=api")).await.expect("list");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["metadata"]["name"], "api");
        assert_eq!(store.list(kind, None, None).await.expect("list all").len(), 2);

        store.delete(kind, Some("default"), "web").await.expect("delete");
        assert!(matches!(
            store.get(kind, Some("default"), "web").await,
            Err(ClusterError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(kind, Some("default"), "web").await,
            Err(ClusterError::NotFound(_))
        ));
    }
}
