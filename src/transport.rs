//! The duplex frame channel underneath a session.
//!
//! The core only needs three things from a transport: send one text frame,
//! receive one text frame, and close. The send side is a shared, clonable
//! handle ([`WsSink`]); the receive side ([`WsStream`]) is a distinct owned
//! value that the session's reader task consumes: no other task can touch
//! the receive primitive, which is how the single-reader rule is enforced
//! structurally rather than by convention.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::ZonisError;

/// The stream type a [`crate::Client`] connects over.
pub type ClientStream = MaybeTlsStream<TcpStream>;

/// Send half of a duplex text-frame channel.
///
/// Any task may send; the transport's receive side is deliberately not
/// reachable from this trait. Implementations are cheap handles; cloning
/// shares the underlying channel.
pub trait FrameSink: Clone + Send + Sync + 'static {
    /// Send one text frame.
    fn send_text(&self, text: String) -> impl Future<Output = Result<(), ZonisError>> + Send;

    /// Close the channel.
    fn close(&self) -> impl Future<Output = Result<(), ZonisError>> + Send;

    /// Close the channel with a close code and reason, where the transport
    /// supports one.
    fn close_with(
        &self,
        code: u16,
        reason: String,
    ) -> impl Future<Output = Result<(), ZonisError>> + Send;
}

/// Connect a WebSocket to `url` (`ws://` or `wss://`).
pub async fn connect(url: &str) -> Result<WebSocketStream<ClientStream>, ZonisError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ZonisError::Transport(e.to_string()))?;
    Ok(ws)
}

/// Accept a WebSocket handshake on an inbound byte stream.
pub async fn accept<S>(stream: S) -> Result<WebSocketStream<S>, ZonisError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ZonisError::Transport(e.to_string()))
}

/// Split a WebSocket into its shared send half and reader-owned receive half.
pub fn split<S>(ws: WebSocketStream<S>) -> (WsSink<S>, WsStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (
        WsSink {
            inner: Arc::new(WsSinkInner {
                sink: tokio::sync::Mutex::new(Some(sink)),
                closed: AtomicBool::new(false),
            }),
        },
        WsStream { stream },
    )
}

/// Clonable write half of a WebSocket.
///
/// The split sink sits behind an async mutex so that any task may send;
/// frames emitted by concurrent senders are serialized, preserving the
/// transport's FIFO guarantee per sender.
pub struct WsSink<S> {
    inner: Arc<WsSinkInner<S>>,
}

struct WsSinkInner<S> {
    sink: tokio::sync::Mutex<Option<SplitSink<WebSocketStream<S>, Message>>>,
    closed: AtomicBool,
}

impl<S> Clone for WsSink<S> {
    fn clone(&self) -> Self {
        WsSink {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Swap in the write half of a freshly connected WebSocket and hand
    /// back its read half. Used by the client's reconnect path so that
    /// existing clones of this sink keep working.
    pub(crate) async fn replace_with(&self, ws: WebSocketStream<S>) -> WsStream<S> {
        let (sink, stream) = ws.split();
        *self.inner.sink.lock().await = Some(sink);
        self.inner.closed.store(false, Ordering::Release);
        WsStream { stream }
    }

    async fn send_message(&self, message: Message) -> Result<(), ZonisError> {
        if self.is_closed() {
            return Err(ZonisError::TransportClosed);
        }
        let mut guard = self.inner.sink.lock().await;
        let sink = guard.as_mut().ok_or(ZonisError::TransportClosed)?;
        sink.send(message).await.map_err(|e| {
            self.inner.closed.store(true, Ordering::Release);
            ZonisError::Transport(e.to_string())
        })
    }
}

impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&self, text: String) -> Result<(), ZonisError> {
        self.send_message(Message::Text(text)).await
    }

    async fn close(&self) -> Result<(), ZonisError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sink = self.inner.sink.lock().await.take();
        if let Some(mut sink) = sink {
            finish_close(sink.close().await)?;
        }
        Ok(())
    }

    async fn close_with(&self, code: u16, reason: String) -> Result<(), ZonisError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sink = self.inner.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                debug!(error = %e, "error sending close frame");
            }
            finish_close(sink.close().await)?;
        }
        Ok(())
    }
}

/// Closing a socket whose close handshake already completed is not an error.
fn finish_close(result: Result<(), WsError>) -> Result<(), ZonisError> {
    match result {
        Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
        Err(e) => Err(ZonisError::Transport(e.to_string())),
    }
}

/// Receive half of a WebSocket. Owned exclusively by the session reader.
pub struct WsStream<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive the next text frame.
    ///
    /// Returns `Ok(None)` on clean close. A close frame carrying one of
    /// the protocol's custom close codes is surfaced as the matching typed
    /// error; so are transport failures. Ping/pong frames are handled by
    /// the WebSocket layer; binary frames are not part of this protocol
    /// and are skipped with a warning.
    pub async fn recv(&mut self) -> Result<Option<String>, ZonisError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(_))) => {
                    warn!("skipping binary frame on a text protocol");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        let code = u16::from(frame.code);
                        if let Some(err) = ZonisError::from_close_code(code) {
                            return Err(err);
                        }
                    }
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(ZonisError::Transport(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}
