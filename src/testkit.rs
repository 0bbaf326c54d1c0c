//! Test transports shared by the crate's own tests and downstream suites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::error::ZonisError;
use crate::transport::{self, FrameSink, WsSink, WsStream};

/// A connected pair of real WebSocket halves over an in-process duplex
/// pipe, handshake included. `(client, server)` order.
pub async fn ws_pair() -> (
    (WsSink<DuplexStream>, WsStream<DuplexStream>),
    (WsSink<DuplexStream>, WsStream<DuplexStream>),
) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_ws, server_ws) = tokio::join!(
        async {
            tokio_tungstenite::client_async("ws://localhost/", client_io)
                .await
                .expect("client handshake failed")
                .0
        },
        async {
            tokio_tungstenite::accept_async(server_io)
                .await
                .expect("server handshake failed")
        }
    );
    (transport::split(client_ws), transport::split(server_ws))
}

/// A [`FrameSink`] that captures every sent frame on an unbounded channel.
///
/// Stands in for a connection's send half when driving a hub the way an
/// external WebSocket endpoint would.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Build a [`ChannelSink`] plus the receiver its frames land on.
pub fn channel_sink() -> (ChannelSink, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelSink {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

impl FrameSink for ChannelSink {
    async fn send_text(&self, text: String) -> Result<(), ZonisError> {
        if self.is_closed() {
            return Err(ZonisError::TransportClosed);
        }
        self.tx
            .send(text)
            .map_err(|_| ZonisError::TransportClosed)
    }

    async fn close(&self) -> Result<(), ZonisError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn close_with(&self, _code: u16, _reason: String) -> Result<(), ZonisError> {
        self.close().await
    }
}
