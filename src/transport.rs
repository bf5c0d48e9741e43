//! Connection endpoint seen by a session: one half to read frames, one
//! half to write them. The WebSocket implementation lives here; sessions
//! only see the traits.

use crate::error::SessionError;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application data (text or binary).
    Payload(Bytes),
    /// Ping or pong; only proves the peer is alive.
    Keepalive,
}

#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the peer has closed the connection.
    async fn recv_frame(&mut self) -> Result<Option<Frame>, SessionError>;
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError>;

    async fn send_ping(&mut self) -> Result<(), SessionError>;

    /// Sends a close notice and shuts the write half.
    async fn close(&mut self) -> Result<(), SessionError>;
}

fn transport_error(err: axum::Error) -> SessionError {
    SessionError::Transport(err.to_string())
}

/// Splits an upgraded WebSocket into its two endpoint halves.
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsSource(stream))
}

pub struct WsSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for WsSource {
    async fn recv_frame(&mut self) -> Result<Option<Frame>, SessionError> {
        match self.0.next().await {
            None | Some(Ok(Message::Close(_))) => Ok(None),
            Some(Err(e)) => Err(transport_error(e)),
            Some(Ok(Message::Text(text))) => Ok(Some(Frame::Payload(Bytes::copy_from_slice(
                text.as_str().as_bytes(),
            )))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Frame::Payload(data))),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => Ok(Some(Frame::Keepalive)),
        }
    }
}

pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(transport_error)
    }

    async fn send_ping(&mut self) -> Result<(), SessionError> {
        self.0
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(transport_error)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.0
            .send(Message::Close(None))
            .await
            .map_err(transport_error)?;
        self.0.close().await.map_err(transport_error)
    }
}
