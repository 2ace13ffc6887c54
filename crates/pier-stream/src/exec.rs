//! One interactive remote-command execution attached to a client transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{DuplexBridge, FrameTransport, Readable, Writable};
use crate::cluster::ClusterError;
use crate::error::StreamError;

/// How long a cancelled exec primitive gets to wind down before its task is
/// aborted.
pub const EXEC_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

/// Byte streams handed to the exec primitive. A stream is absent when its
/// direction was not requested.
#[derive(Clone, Default)]
pub struct ExecStreams {
    pub stdin: Option<Arc<dyn Readable>>,
    pub stdout: Option<Arc<dyn Writable>>,
    pub stderr: Option<Arc<dyn Writable>>,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("execution cancelled")]
    Cancelled,
    #[error("failed to start remote command: {0}")]
    Spawn(String),
    #[error("remote command exited with status {0}")]
    ExitStatus(i32),
    #[error("stream error: {0}")]
    Stream(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// The remote-exec primitive. Must return promptly once `cancel` fires.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(&self, request: ExecRequest, streams: ExecStreams, cancel: CancellationToken) -> Result<(), ExecError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Completed,
    Failed(String),
    ClientDisconnected,
}

impl ExecOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecOutcome::Completed => "completed",
            ExecOutcome::Failed(_) => "failed",
            ExecOutcome::ClientDisconnected => "client_disconnected",
        }
    }

    pub fn error(&self) -> Option<StreamError> {
        match self {
            ExecOutcome::Completed => None,
            ExecOutcome::Failed(message) => Some(StreamError::ExternalProcess(message.clone())),
            ExecOutcome::ClientDisconnected => Some(StreamError::ClientDisconnected),
        }
    }
}

/// `"sh"` starts a bare shell; anything else is the command followed by its
/// comma-separated arguments.
pub fn build_command(command: &str, args: Option<&str>) -> Vec<String> {
    let command = command.trim();
    if command == "sh" {
        return vec!["sh".to_string()];
    }
    let mut argv = vec![command.to_string()];
    if let Some(args) = args.filter(|a| !a.is_empty()) {
        argv.extend(args.split(',').map(str::to_string));
    }
    argv
}

pub fn failure_message(err: &ExecError) -> String {
    format!("\r\n--- Command Execution Failed ---\r\nError: {err}\r\n")
}

pub struct ExecSession {
    request: ExecRequest,
    bridge: Arc<DuplexBridge>,
}

impl ExecSession {
    pub fn new(transport: Arc<dyn FrameTransport>, request: ExecRequest) -> Self {
        let bridge = DuplexBridge::new(transport, request.stdin, request.stdout || request.stderr);
        Self { request, bridge }
    }

    pub fn bridge(&self) -> &Arc<DuplexBridge> {
        &self.bridge
    }

    fn streams(&self) -> ExecStreams {
        let readable: Arc<dyn Readable> = self.bridge.clone();
        let writable: Arc<dyn Writable> = self.bridge.clone();
        ExecStreams {
            stdin: self.request.stdin.then(|| readable),
            stdout: self.request.stdout.then(|| writable.clone()),
            stderr: self.request.stderr.then(|| writable),
        }
    }

    /// Runs the exec primitive until it completes, the client goes away, or
    /// `request_scope` is cancelled. The bridge is closed on every path.
    pub async fn run(self, executor: Arc<dyn Executor>, request_scope: CancellationToken) -> ExecOutcome {
        let exec_scope = request_scope.child_token();
        let client_gone = self.bridge.client_gone();
        let streams = self.streams();

        let mut exec_task = tokio::spawn({
            let request = self.request.clone();
            let bridge = self.bridge.clone();
            let scope = exec_scope.clone();
            async move {
                let result = executor.exec(request, streams, scope.clone()).await;
                if let Err(err) = &result {
                    if !matches!(err, ExecError::Cancelled) && !scope.is_cancelled() {
                        if let Err(write_err) = bridge.write_text(failure_message(err)).await {
                            debug!(error = %write_err, "could not deliver exec failure to client");
                        }
                    }
                }
                bridge.close_input();
                result
            }
        });

        let outcome = tokio::select! {
            joined = &mut exec_task => match joined {
                Ok(Ok(())) => ExecOutcome::Completed,
                Ok(Err(ExecError::Cancelled)) => ExecOutcome::ClientDisconnected,
                Ok(Err(err)) => ExecOutcome::Failed(err.to_string()),
                Err(join_err) => ExecOutcome::Failed(format!("exec task failed: {join_err}")),
            },
            _ = request_scope.cancelled() => {
                debug!("request scope ended; cancelling exec");
                stop_exec(&exec_scope, exec_task).await;
                ExecOutcome::ClientDisconnected
            }
            _ = client_gone.cancelled() => {
                debug!("client disconnected; cancelling exec");
                stop_exec(&exec_scope, exec_task).await;
                ExecOutcome::ClientDisconnected
            }
        };

        self.bridge.close().await;
        match outcome.error() {
            Some(err) if err.is_failure() => warn!(
                namespace = %self.request.namespace,
                pod = %self.request.pod,
                container = %self.request.container,
                error = %err,
                "exec session failed"
            ),
            _ => info!(
                namespace = %self.request.namespace,
                pod = %self.request.pod,
                container = %self.request.container,
                outcome = outcome.as_str(),
                "exec session finished"
            ),
        }
        outcome
    }
}

async fn stop_exec(scope: &CancellationToken, mut task: tokio::task::JoinHandle<Result<(), ExecError>>) {
    scope.cancel();
    if tokio::time::timeout(EXEC_SHUTDOWN_GRACE, &mut task).await.is_err() {
        warn!("exec primitive ignored cancellation; aborting");
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Frame;
    use crate::testing::{EchoExecutor, FailingExecutor, HangingExecutor, MemoryTransport};
    use bytes::Bytes;

    fn request(stdin: bool) -> ExecRequest {
        ExecRequest {
            namespace: "default".into(),
            pod: "web-0".into(),
            container: "app".into(),
            command: vec!["sh".into()],
            stdin,
            stdout: true,
            stderr: true,
            tty: false,
        }
    }

    #[test]
    fn builds_commands() {
        assert_eq!(build_command("sh", Some("-c,ls")), vec!["sh"]);
        assert_eq!(build_command("ls", Some("-la,/tmp")), vec!["ls", "-la", "/tmp"]);
        assert_eq!(build_command("top", None), vec!["top"]);
        assert_eq!(build_command("top", Some("")), vec!["top"]);
    }

    #[tokio::test]
    async fn forwards_input_bytes_unmodified() {
        let (transport, mut client) = MemoryTransport::pair();
        let session = ExecSession::new(transport, request(true));
        let scope = CancellationToken::new();
        let run = tokio::spawn(session.run(Arc::new(EchoExecutor), scope.clone()));

        client.send_text("ls\n");
        let echoed = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("echo arrived");
        assert_eq!(echoed, Some(Frame::Binary(Bytes::from_static(b"ls\n"))));

        scope.cancel();
        let outcome = run.await.expect("session task");
        assert_eq!(outcome, ExecOutcome::ClientDisconnected);
        assert!(outcome.error().is_some_and(|err| !err.is_failure()));
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn delivers_failure_after_output() {
        let (transport, mut client) = MemoryTransport::pair();
        let session = ExecSession::new(transport, request(false));
        let executor = Arc::new(FailingExecutor {
            output: "partial",
            message: "container not running",
        });
        let outcome = session.run(executor, CancellationToken::new()).await;
        assert!(matches!(outcome, ExecOutcome::Failed(ref m) if m.contains("container not running")));
        assert!(outcome.error().is_some_and(|err| err.is_failure()));

        assert_eq!(client.recv().await, Some(Frame::Binary(Bytes::from_static(b"partial"))));
        match client.recv().await {
            Some(Frame::Text(text)) => {
                assert!(text.contains("--- Command Execution Failed ---"));
                assert!(text.contains("container not running"));
            }
            other => panic!("expected failure text, got {other:?}"),
        }
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn client_disconnect_cancels_exec_promptly() {
        let (transport, client) = MemoryTransport::pair();
        let session = ExecSession::new(transport, request(true));
        let executor = Arc::new(HangingExecutor::default());
        let observed = executor.cancelled.clone();
        let run = tokio::spawn(session.run(executor, CancellationToken::new()));

        client.disconnect(Some(crate::bridge::CLOSE_GOING_AWAY));
        let outcome = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("session ended in time")
            .expect("session task");
        assert_eq!(outcome, ExecOutcome::ClientDisconnected);
        assert!(observed.is_cancelled());
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn completes_when_input_ends() {
        let (transport, client) = MemoryTransport::pair();
        let session = ExecSession::new(transport, request(true));
        let bridge = session.bridge().clone();
        let run = tokio::spawn(session.run(Arc::new(EchoExecutor), CancellationToken::new()));
        client.send_text("exit\n");
        bridge.close_input();
        let outcome = run.await.expect("session task");
        assert_eq!(outcome, ExecOutcome::Completed);
    }
}
