//! Session core: the classification engine both ends of a connection share.
//!
//! A session owns a send handle, a pending-request registry, and an
//! optional route table. Exactly one reader drives [`SessionCore::handle_frame`]
//! with inbound frames; everything else rendezvouses through the registry:
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!                       │         SessionCore          │
//!                       ├──────────────────────────────┤
//!                       │  sink: S                     │
//!                       │  pending: PendingRegistry    │
//!                       │  routes: Option<RouteTable>  │
//!                       └──────────────┬───────────────┘
//!                                      │
//!                          reader: handle_frame(text)
//!                                      │
//!          ┌───────────────────────────┼───────────────────────────┐
//!          │                           │                           │
//!   request / client_to_server   response / failure          identify
//!          │                           │                           │
//!   dispatch on a spawned       settle the matching      resolve the armed
//!   task, reply with the        pending slot             acknowledgement hook
//!   same packet_id
//! ```
//!
//! Requests dispatch on spawned tasks so a slow handler never blocks the
//! reader; their outcome (value or stringified failure) is sent back
//! under the originating packet id.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ZonisError;
use crate::packet::{Arguments, Packet, PacketBody};
use crate::pending::PendingRegistry;
use crate::routes::RouteTable;
use crate::transport::FrameSink;

/// Which envelope a locally originated request travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// Server-originated `request`.
    Request,
    /// Client-originated `client_to_server`.
    ClientToServer,
}

pub(crate) struct SessionCore<S: FrameSink> {
    sink: S,
    pending: PendingRegistry,
    routes: Option<Arc<RouteTable>>,
    /// Armed by `Client::connect` (and only there) to rendezvous with the
    /// server's identify acknowledgement.
    identify: Mutex<Option<oneshot::Sender<Result<String, ZonisError>>>>,
    /// The identifier most recently acknowledged by the peer.
    identity: Mutex<Option<String>>,
}

impl<S: FrameSink> SessionCore<S> {
    pub(crate) fn new(sink: S, routes: Option<Arc<RouteTable>>) -> Arc<Self> {
        Arc::new(SessionCore {
            sink,
            pending: PendingRegistry::new(),
            routes,
            identify: Mutex::new(None),
            identity: Mutex::new(None),
        })
    }

    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    /// Install the one-shot that the next identify acknowledgement resolves.
    pub(crate) fn arm_identify(&self) -> oneshot::Receiver<Result<String, ZonisError>> {
        let (tx, rx) = oneshot::channel();
        *self.identify.lock() = Some(tx);
        rx
    }

    /// Resolve an armed identify hook with a failure (connection lost or
    /// admission rejected before the acknowledgement arrived).
    pub(crate) fn abort_identify(&self, reason: ZonisError) {
        if let Some(tx) = self.identify.lock().take() {
            let _ = tx.send(Err(reason));
        }
    }

    /// Send a request and await the correlated response.
    pub(crate) async fn request(
        &self,
        kind: RequestKind,
        route: &str,
        arguments: Arguments,
    ) -> Result<serde_json::Value, ZonisError> {
        let slot = self.pending.open();
        let packet_id = slot.packet_id().to_owned();
        let packet = match kind {
            RequestKind::Request => Packet::request(packet_id.clone(), route, arguments),
            RequestKind::ClientToServer => {
                Packet::client_to_server(packet_id.clone(), route, arguments)
            }
        };
        debug!(packet_id = %packet_id, route, "sending request");
        // A send failure drops the slot here, removing it from the registry.
        self.sink.send_text(packet.encode()).await?;
        slot.wait().await
    }

    /// Classify and act on one inbound frame.
    ///
    /// Errors are signals for the reader to log; none of them terminate
    /// the session.
    pub(crate) async fn handle_frame(&self, text: &str) -> Result<(), ZonisError> {
        let packet = Packet::decode(text)?;
        match packet.body {
            PacketBody::Request(request) | PacketBody::ClientToServer(request) => {
                let Some(routes) = self.routes.clone() else {
                    let reply = Packet::failure(
                        packet.packet_id,
                        ZonisError::MissingReceiveHandler.to_string(),
                    );
                    if let Err(e) = self.sink.send_text(reply.encode()).await {
                        debug!(error = %e, "could not reflect missing-handler failure");
                    }
                    return Err(ZonisError::MissingReceiveHandler);
                };
                let sink = self.sink.clone();
                let packet_id = packet.packet_id;
                tokio::spawn(async move {
                    let reply = match routes.dispatch(&request.route, request.arguments).await {
                        Ok(value) => Packet::response(packet_id, value),
                        Err(err) => {
                            debug!(route = %request.route, error = %err, "route dispatch failed");
                            Packet::failure(packet_id, err.to_string())
                        }
                    };
                    if let Err(err) = sink.send_text(reply.encode()).await {
                        warn!(error = %err, "failed to send reply");
                    }
                });
                Ok(())
            }
            PacketBody::Response(value) => {
                self.pending.settle(&packet.packet_id, Ok(value));
                Ok(())
            }
            PacketBody::FailureResponse(failure) => {
                self.pending.settle(
                    &packet.packet_id,
                    Err(ZonisError::RequestFailed(failure.exception)),
                );
                Ok(())
            }
            PacketBody::Identify(data) => {
                let identifier = data.client_identifier.unwrap_or_default();
                *self.identity.lock() = Some(identifier.clone());
                match self.identify.lock().take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(identifier));
                    }
                    None => debug!(identifier = %identifier, "re-identified"),
                }
                Ok(())
            }
        }
    }

    /// Fail every outstanding request on this session.
    pub(crate) fn fail_all(&self, reason: ZonisError) {
        self.pending.cancel_all(reason);
    }
}
