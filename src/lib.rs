//! zonis: many-to-one IPC over WebSockets.
//!
//! One [`Server`] hub coordinates a dynamic population of [`Client`]s over
//! duplex text-frame connections. Either side may issue a request and
//! await the correlated response; the server can also fan a request out to
//! every connected client and aggregate the replies per identifier.
//!
//! The heart of the crate is the correlation and dispatch core: concurrent
//! in-flight requests multiplex over a single connection by packet id,
//! with exactly one reader per session consuming the transport's receive
//! half. Callers rendezvous with the reader through one-shot pending
//! slots, never through the socket.
//!
//! ```no_run
//! use serde_json::json;
//! use zonis::{Arguments, Client, WsServer};
//!
//! # async fn demo() -> Result<(), zonis::ZonisError> {
//! // Server side: listen and call out to clients.
//! let server: WsServer = WsServer::builder().build();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9050").await.unwrap();
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.serve(listener).await }
//! });
//!
//! // Client side: register a route, connect, identify.
//! let client = Client::builder("ws://127.0.0.1:9050")
//!     .identifier("worker-1")
//!     .route("ping", |_args: Arguments| async { Ok(json!("pong")) })?
//!     .connect()
//!     .await?;
//!
//! let answer = server.request_to("worker-1", "ping", Arguments::new()).await?;
//! assert_eq!(answer, json!("pong"));
//! # client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod packet;
pub mod pending;
pub mod routes;
pub mod server;
mod session;
pub mod testkit;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use error::{
    ZonisError, CLOSE_DUPLICATE_CONNECTION, CLOSE_INVALID_OVERRIDE_KEY, CLOSE_UNHANDLED_TYPE,
};
pub use packet::{packet_id, Arguments, FailureData, IdentifyData, Packet, PacketBody, RequestData};
pub use pending::{Outcome, PendingRegistry, PendingRequest};
pub use routes::{Handler, HandlerError, HandlerResult, RouteTable};
pub use server::{OverridePolicy, Server, ServerBuilder};
pub use transport::{FrameSink, WsSink, WsStream};

/// A [`Server`] backed by the built-in TCP listener.
pub type WsServer = Server<WsSink<tokio::net::TcpStream>>;
