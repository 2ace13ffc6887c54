use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::plan::CommandSpec;

/// Lines kept from a run for error refinement.
const CAPTURED_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

pub(crate) type SegmentHandler = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

pub(crate) struct RunOutput {
    pub status: ExitStatus,
    pub captured: String,
}

/// Runs `spec` to completion, feeding every output segment to `on_segment`
/// from one scanner task per stream. Both scanners have finished when this
/// returns. The child is not killed if the caller is dropped.
pub(crate) async fn run(spec: &CommandSpec, on_segment: SegmentHandler) -> io::Result<RunOutput> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    debug!(command = %spec.display(), pid = ?child.id(), "spawned external process");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_scan = tokio::spawn(scan(stdout, OutputStream::Stdout, on_segment.clone()));
    let stderr_scan = tokio::spawn(scan(stderr, OutputStream::Stderr, on_segment));

    let status = child.wait().await?;

    let mut captured = Vec::new();
    for scanner in [stdout_scan, stderr_scan] {
        match scanner.await {
            Ok(lines) => captured.extend(lines),
            Err(err) => warn!(error = %err, "output scanner task failed"),
        }
    }
    Ok(RunOutput {
        status,
        captured: captured.join("\n"),
    })
}

async fn scan<R>(reader: Option<R>, stream: OutputStream, on_segment: SegmentHandler) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept = VecDeque::new();
    let Some(reader) = reader else {
        return Vec::new();
    };
    let result = for_each_segment(reader, |segment| {
        on_segment(stream, segment);
        if kept.len() == CAPTURED_LINES {
            kept.pop_front();
        }
        kept.push_back(segment.to_string());
    })
    .await;
    if let Err(err) = result {
        warn!(?stream, error = %err, "reading process output failed");
    }
    kept.into()
}

/// Splits a byte stream on `\r` and `\n`, so carriage-return progress bars
/// yield one segment per redraw. Empty segments are skipped.
pub(crate) async fn for_each_segment<R, F>(mut reader: R, mut on_segment: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    on_segment(&String::from_utf8_lossy(&pending));
                    pending.clear();
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        on_segment(&String::from_utf8_lossy(&pending));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_on_carriage_returns_and_newlines() {
        let input: &[u8] = b"### 10.0%\r###### 20.0%\r\ndone\n\ntail";
        let mut segments = Vec::new();
        for_each_segment(input, |s| segments.push(s.to_string()))
            .await
            .expect("scan");
        assert_eq!(segments, vec!["### 10.0%", "###### 20.0%", "done", "tail"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_both_streams() {
        let spec = CommandSpec::new("/bin/sh", ["-c", "echo out; echo err 1>&2; exit 3"]);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handler: SegmentHandler = {
            let seen = seen.clone();
            Arc::new(move |stream, segment| seen.lock().push((stream, segment.to_string())))
        };
        let output = run(&spec, handler).await.expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert!(output.captured.contains("out"));
        assert!(output.captured.contains("err"));
        let seen = seen.lock();
        assert!(seen.contains(&(OutputStream::Stdout, "out".to_string())));
        assert!(seen.contains(&(OutputStream::Stderr, "err".to_string())));
    }
}
