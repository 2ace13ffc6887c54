use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Consumer side of a cancellable upstream stream (a watch subscription or a
/// log follow). Dropping it stops the producer.
pub struct Feed<T> {
    items: mpsc::Receiver<T>,
    stop: CancellationToken,
}

/// Producer side handed to whatever pumps the upstream.
pub struct FeedProducer<T> {
    items: mpsc::Sender<T>,
    stop: CancellationToken,
}

pub fn feed<T>(capacity: usize) -> (FeedProducer<T>, Feed<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stop = CancellationToken::new();
    (
        FeedProducer {
            items: tx,
            stop: stop.clone(),
        },
        Feed { items: rx, stop },
    )
}

impl<T> Feed<T> {
    /// `None` once the producer has finished.
    pub async fn next(&mut self) -> Option<T> {
        self.items.recv().await
    }

    /// Releases the upstream. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<T> FeedProducer<T> {
    /// Returns `false` once the consumer stopped or went away.
    pub async fn send(&self, item: T) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.items.send(item) => sent.is_ok(),
        }
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stop.cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("stream sink closed")]
pub struct SinkClosed;

/// Where a relay pushes translated items, in order.
#[async_trait]
pub trait StreamSink<T: Send + 'static>: Send {
    async fn deliver(&mut self, item: T) -> Result<(), SinkClosed>;
}

#[async_trait]
impl<T: Send + 'static> StreamSink<T> for mpsc::Sender<T> {
    async fn deliver(&mut self, item: T) -> Result<(), SinkClosed> {
        self.send(item).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl<T: Send + 'static> StreamSink<T> for Vec<T> {
    async fn deliver(&mut self, item: T) -> Result<(), SinkClosed> {
        self.push(item);
        Ok(())
    }
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The upstream finished on its own.
    UpstreamClosed,
    /// The upstream reported a failure, which was forwarded to the sink.
    UpstreamFailed,
    /// The request scope ended.
    ClientDisconnected,
    /// The sink refused an item.
    SinkClosed,
}

impl RelayEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayEnd::UpstreamClosed => "upstream_closed",
            RelayEnd::UpstreamFailed => "upstream_failed",
            RelayEnd::ClientDisconnected => "client_disconnected",
            RelayEnd::SinkClosed => "sink_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_feed_stops_producer() {
        let (producer, consumer) = feed::<u32>(4);
        assert!(producer.send(1).await);
        drop(consumer);
        assert!(producer.is_stopped());
        assert!(!producer.send(2).await);
    }

    #[tokio::test]
    async fn feed_ends_when_producer_drops() {
        let (producer, mut consumer) = feed::<u32>(4);
        assert!(producer.send(7).await);
        drop(producer);
        assert_eq!(consumer.next().await, Some(7));
        assert_eq!(consumer.next().await, None);
    }
}
