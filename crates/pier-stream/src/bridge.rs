//! Adapts a message-framed bidirectional transport (a WebSocket) into the
//! byte-stream read/write capabilities a remote-exec primitive consumes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Depth of the inbound and outbound frame queues.
pub const QUEUE_CAPACITY: usize = 100;

/// How long `close` waits for queued output to reach the transport.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn into_bytes(self) -> Bytes {
        match self {
            Frame::Text(text) => Bytes::from(text),
            Frame::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed (code {code:?})")]
    Closed { code: Option<u16> },
    #[error("transport i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Normal, going-away and abnormal closures are how browsers leave; they
    /// are not worth a warning.
    pub fn is_expected_close(&self) -> bool {
        matches!(
            self,
            TransportError::Closed {
                code: None | Some(CLOSE_NORMAL | CLOSE_GOING_AWAY | CLOSE_ABNORMAL)
            }
        )
    }
}

/// A message-framed duplex transport. `recv` is only ever called from one task
/// at a time; `send` likewise.
#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    /// Next inbound frame. `None` once the peer is gone.
    async fn recv(&self) -> Option<Result<Frame, TransportError>>;
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;
    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the caller's buffer.
    Data(usize),
    /// The peer sent a zero-length frame. Not end-of-input.
    Empty,
    /// End of input.
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("bridge is closed")]
    Closed,
    #[error("output direction is not enabled")]
    OutputDisabled,
}

#[async_trait]
pub trait Readable: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, BridgeError>;
}

#[async_trait]
pub trait Writable: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<usize, BridgeError>;
}

#[derive(Default)]
struct CloseState {
    input_closed: bool,
    closed: bool,
    outbound: Option<mpsc::Sender<Frame>>,
}

struct Signals {
    state: Mutex<CloseState>,
    input_closed: CancellationToken,
    client_gone: CancellationToken,
}

impl Signals {
    fn close_input(&self) -> bool {
        let mut state = self.state.lock();
        if state.input_closed {
            return false;
        }
        state.input_closed = true;
        self.input_closed.cancel();
        true
    }
}

struct Inbound {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

pub struct DuplexBridge {
    transport: Arc<dyn FrameTransport>,
    signals: Arc<Signals>,
    inbound: AsyncMutex<Inbound>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl DuplexBridge {
    /// Starts the reader loop only when input is enabled and the writer loop
    /// only when output is enabled. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn FrameTransport>, enable_input: bool, enable_output: bool) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        let signals = Arc::new(Signals {
            state: Mutex::new(CloseState {
                outbound: enable_output.then_some(outbound_tx),
                ..CloseState::default()
            }),
            input_closed: CancellationToken::new(),
            client_gone: CancellationToken::new(),
        });

        let reader = if enable_input {
            Some(tokio::spawn(read_loop(transport.clone(), inbound_tx, signals.clone())))
        } else {
            drop(inbound_tx);
            None
        };
        let writer = if enable_output {
            Some(tokio::spawn(write_loop(transport.clone(), outbound_rx, signals.clone())))
        } else {
            None
        };

        Arc::new(Self {
            transport,
            signals,
            inbound: AsyncMutex::new(Inbound {
                rx: inbound_rx,
                pending: Bytes::new(),
            }),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    /// Fires when the peer disconnects or the transport fails in either
    /// direction.
    pub fn client_gone(&self) -> CancellationToken {
        self.signals.client_gone.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.signals.state.lock().closed
    }

    /// Signals end-of-input to readers. Safe to call any number of times.
    pub fn close_input(&self) {
        if self.signals.close_input() {
            debug!("bridge input closed");
        }
    }

    /// Queues a text frame behind any pending output.
    pub async fn write_text(&self, text: impl Into<String>) -> Result<(), BridgeError> {
        self.enqueue(Frame::Text(text.into())).await
    }

    async fn enqueue(&self, frame: Frame) -> Result<(), BridgeError> {
        let sender = {
            let state = self.signals.state.lock();
            if state.closed {
                return Err(BridgeError::Closed);
            }
            state.outbound.clone().ok_or(BridgeError::OutputDisabled)?
        };
        sender.send(frame).await.map_err(|_| BridgeError::Closed)
    }

    /// Idempotent. Lets queued output drain (bounded by [`DRAIN_TIMEOUT`]),
    /// then closes the transport exactly once.
    pub async fn close(&self) {
        let outbound = {
            let mut state = self.signals.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.outbound.take()
        };
        self.signals.close_input();
        drop(outbound);

        let writer = self.writer.lock().take();
        if let Some(handle) = writer {
            join_or_abort(handle, "writer").await;
        }
        self.transport.close().await;
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            join_or_abort(handle, "reader").await;
        }
        debug!("bridge closed");
    }
}

#[async_trait]
impl Readable for DuplexBridge {
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, BridgeError> {
        let mut inbound = self.inbound.lock().await;
        if !inbound.pending.is_empty() {
            let n = buf.len().min(inbound.pending.len());
            let chunk = inbound.pending.split_to(n);
            buf[..n].copy_from_slice(&chunk);
            return Ok(ReadOutcome::Data(n));
        }

        let next = tokio::select! {
            biased;
            next = inbound.rx.recv() => next,
            _ = self.signals.input_closed.cancelled() => None,
        };
        match next {
            None => Ok(ReadOutcome::Closed),
            Some(payload) if payload.is_empty() => Ok(ReadOutcome::Empty),
            Some(mut payload) => {
                let n = buf.len().min(payload.len());
                buf[..n].copy_from_slice(&payload[..n]);
                inbound.pending = payload.split_off(n);
                Ok(ReadOutcome::Data(n))
            }
        }
    }
}

#[async_trait]
impl Writable for DuplexBridge {
    async fn write(&self, data: &[u8]) -> Result<usize, BridgeError> {
        self.enqueue(Frame::Binary(Bytes::copy_from_slice(data))).await?;
        Ok(data.len())
    }
}

impl Drop for DuplexBridge {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop(transport: Arc<dyn FrameTransport>, inbound: mpsc::Sender<Bytes>, signals: Arc<Signals>) {
    loop {
        let next = tokio::select! {
            _ = signals.input_closed.cancelled() => break,
            next = transport.recv() => next,
        };
        match next {
            Some(Ok(frame)) => {
                let payload = frame.into_bytes();
                tokio::select! {
                    _ = signals.input_closed.cancelled() => break,
                    sent = inbound.send(payload) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Err(err)) => {
                if err.is_expected_close() {
                    debug!(error = %err, "client closed transport");
                } else {
                    warn!(error = %err, "transport read failed");
                    counter!("pier_transport_errors_total", 1, "direction" => "read");
                }
                signals.client_gone.cancel();
                break;
            }
            None => {
                debug!("transport ended");
                signals.client_gone.cancel();
                break;
            }
        }
    }
    signals.close_input();
}

async fn write_loop(transport: Arc<dyn FrameTransport>, mut outbound: mpsc::Receiver<Frame>, signals: Arc<Signals>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = transport.send(frame).await {
            if err.is_expected_close() {
                debug!(error = %err, "transport closed while writing");
            } else {
                warn!(error = %err, "transport write failed");
                counter!("pier_transport_errors_total", 1, "direction" => "write");
            }
            signals.client_gone.cancel();
            break;
        }
    }
}

async fn join_or_abort(mut handle: JoinHandle<()>, label: &'static str) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
        debug!(task = label, "bridge task did not finish in time; aborting");
        handle.abort();
    }
}
