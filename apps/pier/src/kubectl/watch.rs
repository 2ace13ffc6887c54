use std::time::Duration;

use async_trait::async_trait;
use pier_stream::{feed, ClusterError, EventType, FeedProducer, RawEvent, ResourceKind, Subscription, WatchSource};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, info, warn};

use super::{read_capped, take_pipes, Kubectl};

const WATCH_BUFFER: usize = 100;
const READ_CHUNK: usize = 16 * 1024;

/// Splits concatenated JSON documents (as printed by `kubectl get --watch
/// -o json`) out of an arbitrarily chunked byte stream.
#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    pending: Vec<u8>,
}

impl JsonStreamDecoder {
    /// Returns every document completed by `chunk`. A syntax error discards
    /// the buffered input and is returned after the documents before it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value, serde_json::Error>> {
        self.pending.extend_from_slice(chunk);
        let (mut decoded, consumed, failure) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.pending).into_iter::<Value>();
            let mut decoded = Vec::new();
            let mut failure = None;
            loop {
                match stream.next() {
                    Some(Ok(value)) => decoded.push(Ok(value)),
                    Some(Err(err)) if err.is_eof() => break,
                    Some(Err(err)) => {
                        failure = Some(err);
                        break;
                    }
                    None => break,
                }
            }
            (decoded, stream.byte_offset(), failure)
        };
        match failure {
            Some(err) => {
                self.pending.clear();
                decoded.push(Err(err));
            }
            None => {
                self.pending.drain(..consumed);
            }
        }
        decoded
    }

    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(|b| !b.is_ascii_whitespace())
    }
}

fn watch_args(kind: ResourceKind, namespace: Option<&str>, selector: Option<&str>) -> Vec<String> {
    let mut args = vec!["get".to_string(), kind.plural().to_string()];
    if let Some(namespace) = namespace.filter(|_| kind.is_namespaced()) {
        args.extend(["-n".to_string(), namespace.to_string()]);
    }
    if let Some(selector) = selector {
        args.extend(["-l".to_string(), selector.to_string()]);
    }
    args.extend(
        ["--watch", "--output-watch-events", "-o", "json"]
            .into_iter()
            .map(str::to_string),
    );
    args
}

/// Wraps a failure the way the API server reports one inside a watch.
fn failure_status(message: &str, code: u16) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": message,
        "code": code,
    })
}

#[async_trait]
impl WatchSource for Kubectl {
    async fn subscribe(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Subscription, ClusterError> {
        let mut child = self.spawn(watch_args(kind, namespace, selector))?;
        let (stdout, stderr) = take_pipes(&mut child)?;
        let (producer, subscription) = feed(WATCH_BUFFER);
        info!(%kind, ?namespace, ?selector, "kubectl watch started");
        tokio::spawn(pump_watch(child, stdout, stderr, producer, self.watch_timeout));
        Ok(subscription)
    }
}

enum WatchEnd {
    Stopped,
    TimedOut,
    Exited,
    Failed(String),
}

async fn pump_watch(
    mut child: Child,
    mut stdout: ChildStdout,
    stderr: ChildStderr,
    producer: FeedProducer<RawEvent>,
    timeout: Duration,
) {
    let stderr_task = tokio::spawn(read_capped(stderr));
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut decoder = JsonStreamDecoder::default();
    let mut buf = vec![0u8; READ_CHUNK];

    let end = 'pump: loop {
        let read = tokio::select! {
            biased;
            _ = producer.stopped() => break 'pump WatchEnd::Stopped,
            _ = &mut deadline => break 'pump WatchEnd::TimedOut,
            read = stdout.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break 'pump WatchEnd::Exited,
            Ok(n) => n,
            Err(err) => break 'pump WatchEnd::Failed(format!("watch stream read failed: {err}")),
        };
        for item in decoder.push(&buf[..n]) {
            let value = match item {
                Ok(value) => value,
                Err(err) => break 'pump WatchEnd::Failed(format!("malformed watch output: {err}")),
            };
            match serde_json::from_value::<RawEvent>(value) {
                Ok(event) => {
                    if !producer.send(event).await {
                        break 'pump WatchEnd::Stopped;
                    }
                }
                Err(err) => warn!(error = %err, "skipping unrecognized watch event"),
            }
        }
    };

    match end {
        WatchEnd::Stopped => {
            debug!("watch consumer stopped; killing kubectl");
            let _ = child.kill().await;
            stderr_task.abort();
        }
        WatchEnd::TimedOut => {
            info!(timeout_secs = timeout.as_secs(), "watch reached its time limit");
            let _ = child.kill().await;
            stderr_task.abort();
        }
        WatchEnd::Failed(message) => {
            let _ = child.kill().await;
            stderr_task.abort();
            warn!(error = %message, "watch stream failed");
            producer
                .send(RawEvent::new(EventType::Error, failure_status(&message, 500)))
                .await;
        }
        WatchEnd::Exited => {
            let status = child.wait().await;
            let stderr = stderr_task.await.unwrap_or_default();
            if decoder.has_pending() {
                warn!("watch output ended mid-document");
            }
            let failed = match status {
                Ok(status) if status.success() => None,
                Ok(status) if stderr.is_empty() => Some(format!("kubectl watch exited with {status}")),
                Ok(_) => Some(stderr),
                Err(err) => Some(format!("kubectl watch failed: {err}")),
            };
            if let Some(message) = failed {
                warn!(error = %message, "kubectl watch exited with an error");
                producer
                    .send(RawEvent::new(EventType::Error, failure_status(&message, 500)))
                    .await;
            }
        }
    }
}
