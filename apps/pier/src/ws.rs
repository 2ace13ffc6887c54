//! [`FrameTransport`] over an axum WebSocket.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pier_stream::{Frame, FrameTransport, TransportError};
use tokio::sync::Mutex;
use tracing::trace;

pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn recv(&self) -> Option<Result<Frame, TransportError>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(data)) => return Some(Ok(Frame::Binary(Bytes::from(data)))),
                Ok(Message::Close(frame)) => {
                    return Some(Err(TransportError::Closed {
                        code: frame.map(|f| f.code),
                    }))
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("websocket keepalive frame");
                }
                Err(err) => return Some(Err(TransportError::Io(err.to_string()))),
            }
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
        let _ = sink.close().await;
    }
}
