use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use pier_stream::{ExecError, ExecRequest, ExecStreams, Executor, ReadOutcome, Readable, Writable};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Kubectl;

const PUMP_BUFFER: usize = 8 * 1024;

fn exec_args(request: &ExecRequest) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-n".to_string(),
        request.namespace.clone(),
        request.pod.clone(),
        "-c".to_string(),
        request.container.clone(),
    ];
    if request.stdin {
        args.push("-i".to_string());
    }
    if request.tty {
        args.push("-t".to_string());
    }
    args.push("--".to_string());
    args.extend(request.command.iter().cloned());
    args
}

fn pipe_if(enabled: bool) -> Stdio {
    if enabled {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

#[async_trait]
impl Executor for Kubectl {
    async fn exec(&self, request: ExecRequest, streams: ExecStreams, cancel: CancellationToken) -> Result<(), ExecError> {
        let mut cmd = self.command(exec_args(&request));
        cmd.stdin(pipe_if(streams.stdin.is_some()))
            .stdout(pipe_if(streams.stdout.is_some()))
            .stderr(pipe_if(streams.stderr.is_some()));
        let mut child = cmd.spawn().map_err(|err| ExecError::Spawn(err.to_string()))?;

        let stdin_pump = child
            .stdin
            .take()
            .zip(streams.stdin)
            .map(|(pipe, source)| tokio::spawn(pump_stdin(source, pipe)));
        let output_pumps: Vec<_> = [
            child.stdout.take().map(|p| Box::new(p) as Box<dyn AsyncRead + Send + Unpin>),
            child.stderr.take().map(|p| Box::new(p) as Box<dyn AsyncRead + Send + Unpin>),
        ]
        .into_iter()
        .zip([streams.stdout, streams.stderr])
        .filter_map(|(pipe, sink)| Some(tokio::spawn(pump_output(pipe?, sink?))))
        .collect();

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status.map_err(|err| ExecError::Spawn(err.to_string()))?,
            None => {
                debug!("exec cancelled; killing kubectl");
                let _ = child.kill().await;
                if let Some(pump) = stdin_pump {
                    pump.abort();
                }
                for pump in output_pumps {
                    pump.abort();
                }
                return Err(ExecError::Cancelled);
            }
        };

        // Output already written by the remote command still reaches the
        // client after exit.
        for pump in output_pumps {
            let _ = pump.await;
        }
        if let Some(pump) = stdin_pump {
            pump.abort();
        }
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::ExitStatus(status.code().unwrap_or(-1)))
        }
    }
}

async fn pump_stdin(source: Arc<dyn Readable>, mut pipe: ChildStdin) {
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        match source.read(&mut buf).await {
            Ok(ReadOutcome::Data(n)) => {
                if pipe.write_all(&buf[..n]).await.is_err() || pipe.flush().await.is_err() {
                    break;
                }
            }
            Ok(ReadOutcome::Empty) => continue,
            Ok(ReadOutcome::Closed) | Err(_) => break,
        }
    }
    // Dropping the pipe delivers EOF to the remote command.
}

async fn pump_output(mut pipe: Box<dyn AsyncRead + Send + Unpin>, sink: Arc<dyn Writable>) {
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubectl::tests::scripted;
    use parking_lot::Mutex;
    use pier_stream::BridgeError;

    #[derive(Default)]
    struct Collect(Mutex<Vec<u8>>);

    #[async_trait]
    impl Writable for Collect {
        async fn write(&self, data: &[u8]) -> Result<usize, BridgeError> {
            self.0.lock().extend_from_slice(data);
            Ok(data.len())
        }
    }

    fn request(command: &[&str], stdin: bool, tty: bool) -> ExecRequest {
        ExecRequest {
            namespace: "default".into(),
            pod: "web-0".into(),
            container: "app".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            stdin,
            stdout: true,
            stderr: true,
            tty,
        }
    }

    #[test]
    fn exec_args_place_command_after_separator() {
        assert_eq!(
            exec_args(&request(&["ls", "-la"], true, true)),
            vec!["exec", "-n", "default", "web-0", "-c", "app", "-i", "-t", "--", "ls", "-la"]
        );
        assert_eq!(
            exec_args(&request(&["sh"], false, false)),
            vec!["exec", "-n", "default", "web-0", "-c", "app", "--", "sh"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_forwarded_and_exit_status_reported() {
        let stdout = Arc::new(Collect::default());
        let stderr = Arc::new(Collect::default());
        let streams = ExecStreams {
            stdin: None,
            stdout: Some(stdout.clone()),
            stderr: Some(stderr.clone()),
        };
        let kubectl = scripted("printf out; printf err >&2; exit 3");
        let result = kubectl
            .exec(request(&["true"], false, false), streams, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ExecError::ExitStatus(3))), "{result:?}");
        assert_eq!(stdout.0.lock().as_slice(), b"out");
        assert_eq!(stderr.0.lock().as_slice(), b"err");
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test(10)]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let kubectl = scripted("exec sleep 30");
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                kubectl
                    .exec(request(&["sleep"], false, false), ExecStreams::default(), cancel)
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        let result = task.await.expect("join");
        assert!(matches!(result, Err(ExecError::Cancelled)), "{result:?}");
    }
}
