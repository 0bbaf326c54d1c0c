//! The client side of the fabric: one outbound WebSocket, one reader.
//!
//! A [`Client`] connects to the hub, identifies itself, and then serves
//! two directions of traffic over the same connection: requests it makes
//! with [`Client::request`], and requests the hub makes of it, answered by
//! the handlers registered on its route table.
//!
//! Exactly one reader task consumes the connection's receive half. Callers
//! of `request` never touch it; they park on a pending slot that the
//! reader settles when the correlated response arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ZonisError;
use crate::packet::{Arguments, Packet};
use crate::routes::{HandlerResult, RouteTable};
use crate::session::{RequestKind, SessionCore};
use crate::transport::{self, ClientStream, FrameSink, WsSink, WsStream};

const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Configuration for a [`Client`] connection.
pub struct ClientBuilder {
    url: String,
    identifier: Option<String>,
    secret_key: Option<String>,
    override_key: Option<String>,
    reconnect_attempts: u32,
    routes: Option<RouteTable>,
}

impl ClientBuilder {
    fn new(url: impl Into<String>) -> Self {
        ClientBuilder {
            url: url.into(),
            identifier: None,
            secret_key: None,
            override_key: None,
            reconnect_attempts: 3,
            routes: None,
        }
    }

    /// The identifier to present at admission. When unset, the server
    /// assigns one; see [`Client::identifier`] for the result.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Credential for reclaiming an already-bound identifier.
    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    /// Explicit override key; takes precedence over `secret_key`.
    pub fn override_key(mut self, key: impl Into<String>) -> Self {
        self.override_key = Some(key.into());
        self
    }

    /// How many times to retry connect + re-identify after an established
    /// connection drops unexpectedly. Zero disables reconnection.
    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    /// Register a handler the server can invoke on this client.
    pub fn route<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Result<Self, ZonisError>
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.routes
            .get_or_insert_with(RouteTable::new)
            .register(name, handler)?;
        Ok(self)
    }

    /// Attach a prebuilt route table.
    pub fn routes(mut self, table: RouteTable) -> Self {
        self.routes = Some(table);
        self
    }

    /// Connect, identify, and enter the running state.
    ///
    /// Resolves once the server acknowledges admission; a rejection
    /// surfaces as the matching typed error (for example
    /// [`ZonisError::DuplicateConnection`]).
    pub async fn connect(self) -> Result<Client, ZonisError> {
        let url = normalize_url(&self.url);
        let ws = transport::connect(&url).await?;
        let (sink, stream) = transport::split(ws);

        let core = SessionCore::new(sink, self.routes.map(Arc::new));
        let ack = core.arm_identify();
        let running = Arc::new(AtomicBool::new(true));
        let (closed_tx, closed_rx) = watch::channel(false);
        let credential = self.override_key.or(self.secret_key);

        let reader = Reader {
            core: Arc::clone(&core),
            running: Arc::clone(&running),
            closed_tx,
            url: url.clone(),
            configured_identifier: self.identifier.clone(),
            credential: credential.clone(),
            reconnect_attempts: self.reconnect_attempts,
        };
        tokio::spawn(reader.run(stream));

        let identify = Packet::identify(self.identifier, credential);
        if let Err(err) = core.sink().send_text(identify.encode()).await {
            running.store(false, Ordering::Release);
            let _ = core.sink().close().await;
            return Err(err);
        }

        let identifier = match ack.await {
            Ok(Ok(identifier)) => identifier,
            Ok(Err(err)) => {
                running.store(false, Ordering::Release);
                let _ = core.sink().close().await;
                return Err(err);
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                let _ = core.sink().close().await;
                return Err(ZonisError::TransportClosed);
            }
        };

        info!(identifier = %identifier, url = %url, "connected");
        Ok(Client {
            core,
            running,
            closed_rx,
            identifier,
        })
    }
}

/// One end of one connection: owns the transport, the reader, a pending
/// registry, and a route table.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Client {
    core: Arc<SessionCore<WsSink<ClientStream>>>,
    running: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
    identifier: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl Client {
    /// Start configuring a connection to `url` (a bare `host:port` is
    /// prefixed with `ws://`).
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// The identifier this client was admitted under.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Ask the server to execute `route` and return its value.
    ///
    /// Fails with [`ZonisError::RequestFailed`] when the server-side
    /// handler fails, or [`ZonisError::TransportClosed`] when the
    /// connection is lost before the response arrives.
    pub async fn request(
        &self,
        route: &str,
        arguments: Arguments,
    ) -> Result<serde_json::Value, ZonisError> {
        self.core
            .request(RequestKind::ClientToServer, route, arguments)
            .await
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.core.pending_len()
    }

    /// Wait until the reader task has exited for good.
    pub async fn block_until_closed(&self) {
        let mut rx = self.closed_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the session: cancel outstanding requests with
    /// [`ZonisError::TransportClosed`] and close the transport.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.core.fail_all(ZonisError::TransportClosed);
        if let Err(err) = self.core.sink().close().await {
            debug!(error = %err, "error closing transport");
        }
    }
}

/// The single reader: consumes the receive half until the connection ends,
/// then either reconnects or winds the session down.
struct Reader {
    core: Arc<SessionCore<WsSink<ClientStream>>>,
    running: Arc<AtomicBool>,
    closed_tx: watch::Sender<bool>,
    url: String,
    configured_identifier: Option<String>,
    credential: Option<String>,
    reconnect_attempts: u32,
}

impl Reader {
    async fn run(self, mut stream: WsStream<ClientStream>) {
        loop {
            let exit = loop {
                match stream.recv().await {
                    Ok(Some(text)) => {
                        if let Err(err) = self.core.handle_frame(&text).await {
                            warn!(error = %err, "failed to handle inbound frame");
                        }
                    }
                    Ok(None) => break None,
                    Err(err) => break Some(err),
                }
            };

            // An admission rejection carried on the close frame is final;
            // retrying would only be rejected again.
            let rejected = matches!(
                exit,
                Some(ZonisError::DuplicateConnection)
                    | Some(ZonisError::InvalidOverrideKey)
                    | Some(ZonisError::UnhandledWebsocketType(_))
            );
            if let Some(err) = &exit {
                debug!(error = %err, "connection ended");
            }
            self.core
                .abort_identify(exit.unwrap_or(ZonisError::TransportClosed));
            self.core.fail_all(ZonisError::TransportClosed);

            if rejected || !self.running.load(Ordering::Acquire) {
                break;
            }
            match self.reconnect().await {
                Some(new_stream) => stream = new_stream,
                None => break,
            }
        }

        self.running.store(false, Ordering::Release);
        let _ = self.closed_tx.send(true);
    }

    async fn reconnect(&self) -> Option<WsStream<ClientStream>> {
        for attempt in 1..=self.reconnect_attempts {
            tokio::time::sleep(RECONNECT_DELAY).await;
            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            let ws = match transport::connect(&self.url).await {
                Ok(ws) => ws,
                Err(err) => {
                    warn!(attempt, error = %err, "reconnection attempt failed");
                    continue;
                }
            };
            let stream = self.core.sink().replace_with(ws).await;
            let identifier = self
                .core
                .identity()
                .or_else(|| self.configured_identifier.clone());
            let identify = Packet::identify(identifier, self.credential.clone());
            if let Err(err) = self.core.sink().send_text(identify.encode()).await {
                warn!(attempt, error = %err, "failed to re-identify after reconnect");
                continue;
            }
            info!(attempt, "reconnected");
            return Some(stream);
        }
        if self.reconnect_attempts > 0 {
            warn!("exceeded maximum reconnection attempts");
        }
        None
    }
}

fn normalize_url(url: &str) -> String {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_owned()
    } else {
        format!("ws://{url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses_get_a_scheme() {
        assert_eq!(normalize_url("localhost:8080"), "ws://localhost:8080");
        assert_eq!(normalize_url("ws://localhost:8080"), "ws://localhost:8080");
        assert_eq!(normalize_url("wss://example.com"), "wss://example.com");
    }
}
