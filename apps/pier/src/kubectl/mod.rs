//! Cluster collaborators backed by the `kubectl` binary.
//!
//! Every operation is one child process. Long-lived ones (exec, log follow,
//! watch) are killed when their consumer stops.

mod exec;
mod watch;

use std::ffi::{OsStr, OsString};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use pier_stream::cluster::object_name;
use pier_stream::logs::LogFeed;
use pier_stream::{feed, ClusterError, FeedProducer, LogOptions, LogSource, ObjectStore, ResourceKind};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use crate::config::{ServerConfig, DEFAULT_WATCH_TIMEOUT_SECS};

pub use watch::JsonStreamDecoder;

const LOG_BUFFER: usize = 100;
/// Upper bound on stderr kept for error messages.
const STDERR_LIMIT: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Kubectl {
    program: OsString,
    base_args: Vec<OsString>,
    watch_timeout: Duration,
}

impl Kubectl {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            watch_timeout: Duration::from_secs(DEFAULT_WATCH_TIMEOUT_SECS),
        }
    }

    /// `kubernetes.kubectl` may carry leading arguments, e.g.
    /// `minikube kubectl --`.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let mut words = config.app.kubernetes.kubectl.split_whitespace();
        let Some(program) = words.next() else {
            bail!("kubernetes.kubectl must name a program");
        };
        let mut kubectl = Kubectl::new(program)
            .with_args(words)
            .with_watch_timeout(config.watch_timeout);
        if let Some(path) = config.app.kubeconfig_path() {
            kubectl = kubectl.with_args([OsString::from("--kubeconfig"), path.into_os_string()]);
        }
        if let Some(context) = &config.app.kubernetes.context {
            kubectl = kubectl.with_args(["--context", context.as_str()]);
        }
        Ok(kubectl)
    }

    /// Arguments placed before every subcommand.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn<I, S>(&self, args: I) -> Result<Child, ClusterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command(args).spawn().map_err(|err| spawn_error(&self.program, err))
    }
}

fn spawn_error(program: &OsStr, err: std::io::Error) -> ClusterError {
    ClusterError::Command(format!("failed to run {}: {err}", program.to_string_lossy()))
}

fn take_pipes(child: &mut Child) -> Result<(ChildStdout, ChildStderr), ClusterError> {
    match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => Ok((stdout, stderr)),
        _ => Err(ClusterError::Command("kubectl output pipes unavailable".into())),
    }
}

/// Keeps the first `STDERR_LIMIT` bytes and drains the rest so the child
/// never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut limited = reader.take(STDERR_LIMIT);
    let mut bytes = Vec::new();
    if limited.read_to_end(&mut bytes).await.is_err() {
        return String::new();
    }
    let mut rest = limited.into_inner();
    if let Err(err) = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await {
        debug!(error = %err, "failed to drain kubectl stderr");
    }
    String::from_utf8_lossy(&bytes).trim().to_string()
}

fn get_args(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Vec<String> {
    let mut args = vec!["get".to_string(), kind.plural().to_string(), name.to_string()];
    args.extend(scope_args(kind, namespace));
    args.extend(["-o".to_string(), "json".to_string()]);
    args
}

fn logs_args(namespace: &str, pod: &str, options: &LogOptions) -> Vec<String> {
    let mut args = vec![
        "logs".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        pod.to_string(),
        "-c".to_string(),
        options.container.clone(),
        format!("--tail={}", options.tail_lines),
    ];
    if options.follow {
        args.push("-f".to_string());
    }
    if options.timestamps {
        args.push("--timestamps".to_string());
    }
    args
}

fn scope_args(kind: ResourceKind, namespace: Option<&str>) -> Vec<String> {
    match namespace.filter(|_| kind.is_namespaced()) {
        Some(namespace) => vec!["-n".to_string(), namespace.to_string()],
        None => Vec::new(),
    }
}

fn list_args(kind: ResourceKind, namespace: Option<&str>, selector: Option<&str>) -> Vec<String> {
    let mut args = vec!["get".to_string(), kind.plural().to_string()];
    match namespace {
        Some(_) => args.extend(scope_args(kind, namespace)),
        None if kind.is_namespaced() => args.push("--all-namespaces".to_string()),
        None => {}
    }
    if let Some(selector) = selector {
        args.extend(["-l".to_string(), selector.to_string()]);
    }
    args.extend(["-o".to_string(), "json".to_string()]);
    args
}

fn manifest_args(verb: &str, kind: ResourceKind, namespace: Option<&str>) -> Vec<String> {
    let mut args = vec![verb.to_string()];
    args.extend(scope_args(kind, namespace));
    args.extend(["-f", "-", "-o", "json"].into_iter().map(str::to_string));
    args
}

impl Kubectl {
    /// Runs one short-lived command, optionally feeding `manifest` on stdin,
    /// and returns its stdout. Failures are classified from stderr.
    async fn run(&self, args: Vec<String>, manifest: Option<&Value>) -> Result<Vec<u8>, ClusterError> {
        let mut cmd = self.command(&args);
        if manifest.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd.spawn().map_err(|err| spawn_error(&self.program, err))?;
        if let (Some(manifest), Some(mut stdin)) = (manifest, child.stdin.take()) {
            let body = serde_json::to_vec(manifest)
                .map_err(|err| ClusterError::Command(format!("cannot encode manifest: {err}")))?;
            stdin
                .write_all(&body)
                .await
                .map_err(|err| ClusterError::Command(format!("cannot write manifest to kubectl: {err}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| spawn_error(&self.program, err))?;
        if !output.status.success() {
            return Err(ClusterError::classify(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(output.stdout)
    }

    async fn run_json(&self, args: Vec<String>, manifest: Option<&Value>) -> Result<Value, ClusterError> {
        let stdout = self.run(args, manifest).await?;
        serde_json::from_slice(&stdout).map_err(|err| ClusterError::Command(format!("unreadable kubectl output: {err}")))
    }
}

#[async_trait]
impl ObjectStore for Kubectl {
    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<Value, ClusterError> {
        self.run_json(get_args(kind, namespace, name), None).await
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError> {
        let list = self.run_json(list_args(kind, namespace, selector), None).await?;
        match list.get("items") {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(ClusterError::Command(format!("kubectl returned no {} list", kind.plural()))),
        }
    }

    async fn create(&self, kind: ResourceKind, namespace: Option<&str>, object: &Value) -> Result<Value, ClusterError> {
        object_name(object)?;
        self.run_json(manifest_args("create", kind, namespace), Some(object)).await
    }

    async fn update(&self, kind: ResourceKind, namespace: Option<&str>, object: &Value) -> Result<Value, ClusterError> {
        object_name(object)?;
        self.run_json(manifest_args("replace", kind, namespace), Some(object)).await
    }

    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<(), ClusterError> {
        let mut args = vec!["delete".to_string(), kind.plural().to_string(), name.to_string()];
        args.extend(scope_args(kind, namespace));
        self.run(args, None).await.map(|_| ())
    }
}

#[async_trait]
impl LogSource for Kubectl {
    async fn stream_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> Result<LogFeed, ClusterError> {
        let mut child = self.spawn(logs_args(namespace, pod, options))?;
        let (stdout, stderr) = take_pipes(&mut child)?;
        let (producer, feed) = feed(LOG_BUFFER);
        tokio::spawn(pump_logs(child, stdout, stderr, producer));
        Ok(feed)
    }
}

async fn pump_logs(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    producer: FeedProducer<Result<String, String>>,
) {
    let stderr_task = tokio::spawn(read_capped(stderr));
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            biased;
            _ = producer.stopped() => None,
            line = lines.next_line() => Some(line),
        };
        match next {
            None => {
                debug!("log consumer stopped; killing kubectl");
                let _ = child.kill().await;
                stderr_task.abort();
                return;
            }
            Some(Ok(Some(line))) => {
                if !producer.send(Ok(line)).await {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return;
                }
            }
            Some(Ok(None)) => break,
            Some(Err(err)) => {
                let _ = child.kill().await;
                stderr_task.abort();
                producer.send(Err(format!("log stream read failed: {err}"))).await;
                return;
            }
        }
    }

    let status = child.wait().await;
    let stderr = stderr_task.await.unwrap_or_default();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => {
            let message = if stderr.is_empty() {
                format!("kubectl logs exited with {status}")
            } else {
                stderr
            };
            warn!(error = %message, "log stream ended with an error");
            producer.send(Err(message)).await;
        }
        Err(err) => {
            producer.send(Err(format!("kubectl logs failed: {err}"))).await;
        }
    }
}
