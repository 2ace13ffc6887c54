use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::feed::{Feed, RelayEnd, StreamSink};

pub const DEFAULT_TAIL_LINES: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub container: String,
    pub follow: bool,
    pub timestamps: bool,
    pub tail_lines: i64,
}

impl LogOptions {
    pub fn follow(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            follow: true,
            timestamps: false,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

/// Lines from the log source; `Err` carries a read failure and ends the feed.
pub type LogFeed = Feed<Result<String, String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Line(String),
    Failed(String),
}

pub struct LogRelay {
    feed: LogFeed,
}

impl LogRelay {
    pub fn new(feed: LogFeed) -> Self {
        Self { feed }
    }

    pub async fn run<S>(mut self, sink: &mut S, request_done: CancellationToken) -> RelayEnd
    where
        S: StreamSink<LogChunk> + ?Sized,
    {
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = request_done.cancelled() => break RelayEnd::ClientDisconnected,
                next = self.feed.next() => next,
            };
            match next {
                None => break RelayEnd::UpstreamClosed,
                Some(Ok(line)) => {
                    if sink.deliver(LogChunk::Line(line)).await.is_err() {
                        break RelayEnd::SinkClosed;
                    }
                }
                Some(Err(message)) => {
                    warn!(error = %message, "log stream read failed");
                    let _ = sink.deliver(LogChunk::Failed(message)).await;
                    break RelayEnd::UpstreamFailed;
                }
            }
        };
        self.feed.stop();
        debug!(end = end.as_str(), "log relay finished");
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::feed;

    #[tokio::test]
    async fn forwards_lines_then_failure() {
        let (producer, logs) = feed(8);
        producer.send(Ok("one".to_string())).await;
        producer.send(Ok("two".to_string())).await;
        producer.send(Err("stream reset".to_string())).await;

        let mut sink: Vec<LogChunk> = Vec::new();
        let end = LogRelay::new(logs).run(&mut sink, CancellationToken::new()).await;
        assert_eq!(end, RelayEnd::UpstreamFailed);
        assert_eq!(
            sink,
            vec![
                LogChunk::Line("one".into()),
                LogChunk::Line("two".into()),
                LogChunk::Failed("stream reset".into()),
            ]
        );
        assert!(producer.is_stopped());
    }

    #[tokio::test]
    async fn stops_source_when_request_ends() {
        let (producer, logs) = feed::<Result<String, String>>(8);
        let done = CancellationToken::new();
        done.cancel();
        let mut sink: Vec<LogChunk> = Vec::new();
        let end = LogRelay::new(logs).run(&mut sink, done).await;
        assert_eq!(end, RelayEnd::ClientDisconnected);
        assert!(producer.is_stopped());
        assert!(sink.is_empty());
    }
}
