//! Streaming core of the pier cluster backend.
//!
//! Three long-lived streaming shapes live here, all cancellable through a
//! request-scoped [`CancellationToken`](tokio_util::sync::CancellationToken):
//!
//! - [`bridge::DuplexBridge`] + [`exec::ExecSession`]: an interactive remote
//!   command attached to a message-framed bidirectional transport.
//! - [`watch::WatchRelay`] and [`logs::LogRelay`]: one-way relays from a
//!   cluster subscription to an event-stream sink.
//! - [`progress::ProgressPipe`]: a multi-phase external installation task
//!   reporting to a single best-effort listener.

pub mod bridge;
pub mod cluster;
pub mod error;
pub mod exec;
pub mod feed;
pub mod logs;
pub mod progress;
pub mod resources;
pub mod validate;
pub mod watch;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::{BridgeError, DuplexBridge, Frame, FrameTransport, ReadOutcome, Readable, TransportError, Writable};
pub use cluster::{ClusterError, LogSource, ObjectStore, WatchSource};
pub use error::StreamError;
pub use exec::{build_command, ExecError, ExecOutcome, ExecRequest, ExecSession, ExecStreams, Executor};
pub use feed::{feed, Feed, FeedProducer, RelayEnd, SinkClosed, StreamSink};
pub use logs::{LogChunk, LogOptions, LogRelay};
pub use progress::{InstallPlan, ProgressPipe, ProgressReceiver, ProgressUpdate, Step};
pub use resources::{PodSummary, ResourceKind, ResourceSummary};
pub use watch::{EventType, RawEvent, Subscription, WatchEvent, WatchObject, WatchRelay};
