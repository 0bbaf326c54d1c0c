//! The server hub: zero or more identified client sessions, each backed by
//! one duplex connection.
//!
//! The hub has two driving surfaces that share all of their machinery:
//!
//! - the built-in listener ([`Server::serve`]) accepts WebSocket
//!   connections, admits the first frame through [`Server::parse_identify`],
//!   and runs each connection's ingestion loop itself;
//! - an external endpoint (any web framework that owns the WebSocket) calls
//!   [`Server::parse_identify`] with the first frame and then feeds every
//!   subsequent frame to [`Server::ingest`].
//!
//! Either way, each session's ingestion is logically that session's reader:
//! requests dispatch through the hub's route table, responses settle that
//! session's server-side pending slots.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::ZonisError;
use crate::packet::{packet_id, Arguments, Packet, PacketBody};
use crate::routes::{HandlerResult, RouteTable};
use crate::session::{RequestKind, SessionCore};
use crate::transport::{self, FrameSink, WsSink};

/// What to do when an identify conflicts with a bound identifier and its
/// override key does not match the configured secret. A key presented on
/// an unbound identifier resolves no conflict and is ignored under either
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverridePolicy {
    /// Fold the failed override into the ordinary
    /// [`ZonisError::DuplicateConnection`] rejection.
    #[default]
    Lenient,
    /// Call the failed override out distinctly with
    /// [`ZonisError::InvalidOverrideKey`].
    Strict,
}

/// Configuration for a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    secret_keys: HashMap<String, String>,
    override_policy: OverridePolicy,
    routes: Option<RouteTable>,
}

impl ServerBuilder {
    /// Configure the override secret for one identifier.
    pub fn secret_key(
        mut self,
        identifier: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.secret_keys.insert(identifier.into(), key.into());
        self
    }

    /// Merge a map of identifier → override secret.
    pub fn secret_keys(mut self, keys: HashMap<String, String>) -> Self {
        self.secret_keys.extend(keys);
        self
    }

    pub fn override_policy(mut self, policy: OverridePolicy) -> Self {
        self.override_policy = policy;
        self
    }

    /// Register a handler clients can invoke via `client_to_server`.
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

    pub fn build<S: FrameSink>(self) -> Server<S> {
        Server {
            inner: Arc::new(HubInner {
                sessions: Mutex::new(HashMap::new()),
                secret_keys: self.secret_keys,
                override_policy: self.override_policy,
                routes: self.routes.map(Arc::new),
            }),
        }
    }
}

/// The hub. Cheap to clone; all clones share one session map.
pub struct Server<S: FrameSink> {
    inner: Arc<HubInner<S>>,
}

struct HubInner<S: FrameSink> {
    sessions: Mutex<HashMap<String, Arc<SessionCore<S>>>>,
    secret_keys: HashMap<String, String>,
    override_policy: OverridePolicy,
    routes: Option<Arc<RouteTable>>,
}

impl<S: FrameSink> Clone for Server<S> {
    fn clone(&self) -> Self {
        Server {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: FrameSink> Server<S> {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Admit a client from its identify frame.
    ///
    /// `sink` is the send half of the client's connection. Returns the
    /// admitted identifier (generated when the client supplied none). On
    /// error the caller should close the transport, quoting
    /// [`ZonisError::close_code`] when there is one.
    pub async fn parse_identify(&self, frame: &str, sink: S) -> Result<String, ZonisError> {
        self.admit(frame, sink).await.map(|(identifier, _)| identifier)
    }

    async fn admit(
        &self,
        frame: &str,
        sink: S,
    ) -> Result<(String, Arc<SessionCore<S>>), ZonisError> {
        let packet = Packet::decode(frame)?;
        let PacketBody::Identify(data) = packet.body else {
            return Err(ZonisError::UnknownPacket(format!(
                "expected identify frame, got {}",
                packet.body.kind()
            )));
        };

        let identifier = match data.client_identifier {
            Some(identifier) if !identifier.is_empty() => identifier,
            _ => packet_id(),
        };
        let override_valid = match (&data.override_key, self.inner.secret_keys.get(&identifier)) {
            (Some(key), Some(secret)) => key == secret,
            _ => false,
        };

        let core = SessionCore::new(sink, self.inner.routes.clone());
        let evicted = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.entry(identifier.clone()) {
                Entry::Occupied(mut occupied) => {
                    // The override key only matters when there is a bound
                    // session to adjudicate; a stray key on a vacant
                    // identifier is ignored.
                    if !override_valid {
                        if data.override_key.is_some()
                            && self.inner.override_policy == OverridePolicy::Strict
                        {
                            return Err(ZonisError::InvalidOverrideKey);
                        }
                        return Err(ZonisError::DuplicateConnection);
                    }
                    Some(std::mem::replace(occupied.get_mut(), Arc::clone(&core)))
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::clone(&core));
                    None
                }
            }
        };
        if let Some(old) = evicted {
            // Request identity is tied to the transport: the evicted
            // session's in-flight requests fail rather than migrate.
            old.fail_all(ZonisError::TransportClosed);
            let _ = old.sink().close().await;
            info!(identifier = %identifier, "session overridden");
        }

        let ack = Packet::identify(Some(identifier.clone()), None);
        if let Err(err) = core.sink().send_text(ack.encode()).await {
            self.remove_if_current(&identifier, &core).await;
            return Err(err);
        }
        Ok((identifier, core))
    }

    /// Feed one inbound frame from `identifier`'s connection.
    ///
    /// This is the per-session ingestion point used when an external
    /// endpoint owns the transport.
    pub async fn ingest(&self, identifier: &str, frame: &str) -> Result<(), ZonisError> {
        let core = self.session(identifier).ok_or(ZonisError::UnknownClient)?;
        core.handle_frame(frame).await
    }

    /// Request against the sole connected client.
    ///
    /// Fails with [`ZonisError::UnknownClient`] when zero or more than one
    /// client is connected.
    pub async fn request(
        &self,
        route: &str,
        arguments: Arguments,
    ) -> Result<Value, ZonisError> {
        let core = {
            let sessions = self.inner.sessions.lock();
            if sessions.len() == 1 {
                sessions.values().next().cloned()
            } else {
                None
            }
        }
        .ok_or(ZonisError::UnknownClient)?;
        core.request(RequestKind::Request, route, arguments).await
    }

    /// Request against one identified client.
    pub async fn request_to(
        &self,
        identifier: &str,
        route: &str,
        arguments: Arguments,
    ) -> Result<Value, ZonisError> {
        let core = self.session(identifier).ok_or(ZonisError::UnknownClient)?;
        core.request(RequestKind::Request, route, arguments).await
    }

    /// Fan a request out to every client connected right now.
    ///
    /// The result holds one entry per client in the dispatch snapshot:
    /// clients joining later are not included, clients lost mid-request
    /// appear with [`ZonisError::TransportClosed`]. The aggregate itself
    /// never fails.
    pub async fn request_all(
        &self,
        route: &str,
        arguments: Arguments,
    ) -> HashMap<String, Result<Value, ZonisError>> {
        let snapshot: Vec<(String, Arc<SessionCore<S>>)> = {
            let sessions = self.inner.sessions.lock();
            sessions
                .iter()
                .map(|(identifier, core)| (identifier.clone(), Arc::clone(core)))
                .collect()
        };
        let calls = snapshot.into_iter().map(|(identifier, core)| {
            let arguments = arguments.clone();
            async move {
                let outcome = core.request(RequestKind::Request, route, arguments).await;
                (identifier, outcome)
            }
        });
        join_all(calls).await.into_iter().collect()
    }

    /// Remove a client: cancel its outstanding server-side requests with
    /// [`ZonisError::TransportClosed`] and close its transport.
    /// Disconnecting an unknown identifier is a no-op.
    pub async fn disconnect(&self, identifier: &str) {
        let removed = self.inner.sessions.lock().remove(identifier);
        if let Some(core) = removed {
            core.fail_all(ZonisError::TransportClosed);
            if let Err(err) = core.sink().close().await {
                debug!(identifier = %identifier, error = %err, "error closing transport");
            }
            info!(identifier = %identifier, "client disconnected");
        }
    }

    /// Identifiers of every connected client.
    pub fn clients(&self) -> Vec<String> {
        self.inner.sessions.lock().keys().cloned().collect()
    }

    pub fn is_connected(&self, identifier: &str) -> bool {
        self.inner.sessions.lock().contains_key(identifier)
    }

    /// Server-side requests currently in flight toward `identifier`.
    pub fn pending_requests(&self, identifier: &str) -> Option<usize> {
        self.session(identifier).map(|core| core.pending_len())
    }

    fn session(&self, identifier: &str) -> Option<Arc<SessionCore<S>>> {
        self.inner.sessions.lock().get(identifier).cloned()
    }

    /// Remove `identifier` only while the map still holds this exact
    /// session; an overridden connection's teardown must not evict its
    /// replacement.
    async fn remove_if_current(&self, identifier: &str, core: &Arc<SessionCore<S>>) {
        let removed = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get(identifier) {
                Some(current) if Arc::ptr_eq(current, core) => sessions.remove(identifier),
                _ => None,
            }
        };
        if let Some(core) = removed {
            core.fail_all(ZonisError::TransportClosed);
            let _ = core.sink().close().await;
            info!(identifier = %identifier, "client disconnected");
        }
    }
}

impl Server<WsSink<TcpStream>> {
    /// Accept and serve WebSocket connections on `listener`.
    ///
    /// Runs until the listener fails; spawn it alongside the rest of the
    /// application.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ZonisError> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| ZonisError::Transport(e.to_string()))?;
            debug!(peer = %peer, "accepted tcp connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.drive_connection(stream).await {
                    debug!(error = %err, "connection ended with error");
                }
            });
        }
    }

    /// One connection's lifecycle: handshake, admission, ingestion loop,
    /// teardown.
    async fn drive_connection(&self, stream: TcpStream) -> Result<(), ZonisError> {
        let ws = transport::accept(stream).await?;
        let (sink, mut frames) = transport::split(ws);

        let Some(first) = frames.recv().await? else {
            return Ok(());
        };
        let (identifier, core) = match self.admit(&first, sink.clone()).await {
            Ok(admitted) => admitted,
            Err(err) => {
                match err.close_code() {
                    Some(code) => {
                        let _ = sink.close_with(code, err.to_string()).await;
                    }
                    None => {
                        let _ = sink.close().await;
                    }
                }
                return Err(err);
            }
        };
        info!(identifier = %identifier, "client identified");

        loop {
            match frames.recv().await {
                Ok(Some(text)) => {
                    if let Err(err) = core.handle_frame(&text).await {
                        warn!(identifier = %identifier, error = %err, "failed to handle inbound frame");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(identifier = %identifier, error = %err, "connection error");
                    break;
                }
            }
        }
        self.remove_if_current(&identifier, &core).await;
        Ok(())
    }
}
