//! Error taxonomy for the IPC fabric.
//!
//! Every failure a caller can observe is a [`ZonisError`]. Route-dispatch
//! failures are reflected to the peer as `failure_response` frames and
//! never terminate a session; transport loss settles outstanding requests
//! with [`ZonisError::TransportClosed`].

use std::fmt;

/// WebSocket close code sent when an identify is rejected as a duplicate.
pub const CLOSE_DUPLICATE_CONNECTION: u16 = 3000;
/// WebSocket close code sent when a frame carried an unknown `type`.
pub const CLOSE_UNHANDLED_TYPE: u16 = 3001;
/// WebSocket close code sent when a strict-policy server rejects a
/// conflicting identify over its override key.
pub const CLOSE_INVALID_OVERRIDE_KEY: u16 = 3002;

/// All errors produced by this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZonisError {
    /// Identify presented an identifier that is already bound, with no
    /// valid override key.
    DuplicateConnection,
    /// A route with this name is already registered on the table.
    DuplicateRoute(String),
    /// Inbound frame carried a `type` value the receiver does not know.
    UnhandledWebsocketType(String),
    /// The requested route is absent from the local table.
    UnknownRoute(String),
    /// Unicast target identifier is not in the session map, or the
    /// default target was ambiguous.
    UnknownClient,
    /// Frame was well-formed JSON but structurally invalid.
    UnknownPacket(String),
    /// A request arrived on a session with no route table attached.
    MissingReceiveHandler,
    /// The remote handler failed; carries the stringified cause from the
    /// peer's `failure_response` frame.
    RequestFailed(String),
    /// A conflicting identify presented an override key that does not
    /// match the configured secret (strict override policy only).
    InvalidOverrideKey,
    /// The connection was lost before the operation completed.
    TransportClosed,
    /// Transport-level failure (I/O, handshake, protocol).
    Transport(String),
    /// A local handler failed; carries the stringified error before it is
    /// reflected to the peer.
    Handler(String),
}

impl ZonisError {
    /// The custom WebSocket close code for this error, if it has one.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ZonisError::DuplicateConnection => Some(CLOSE_DUPLICATE_CONNECTION),
            ZonisError::UnhandledWebsocketType(_) => Some(CLOSE_UNHANDLED_TYPE),
            ZonisError::InvalidOverrideKey => Some(CLOSE_INVALID_OVERRIDE_KEY),
            _ => None,
        }
    }

    /// Map a custom WebSocket close code back to its error.
    pub fn from_close_code(code: u16) -> Option<Self> {
        match code {
            CLOSE_DUPLICATE_CONNECTION => Some(ZonisError::DuplicateConnection),
            CLOSE_UNHANDLED_TYPE => {
                Some(ZonisError::UnhandledWebsocketType("close".to_owned()))
            }
            CLOSE_INVALID_OVERRIDE_KEY => Some(ZonisError::InvalidOverrideKey),
            _ => None,
        }
    }
}

impl fmt::Display for ZonisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZonisError::DuplicateConnection => {
                write!(
                    f,
                    "identifier is already connected; supply a valid override key to replace it"
                )
            }
            ZonisError::DuplicateRoute(name) => {
                write!(f, "route {name:?} is already registered")
            }
            ZonisError::UnhandledWebsocketType(ty) => {
                write!(f, "unhandled websocket packet type {ty:?}")
            }
            ZonisError::UnknownRoute(name) => {
                write!(f, "{name} is not a valid route name")
            }
            ZonisError::UnknownClient => {
                write!(f, "the requested client is not currently connected")
            }
            ZonisError::UnknownPacket(detail) => {
                write!(f, "malformed packet: {detail}")
            }
            ZonisError::MissingReceiveHandler => {
                write!(f, "no route table attached to handle incoming requests")
            }
            ZonisError::RequestFailed(cause) => {
                write!(f, "request failed on the remote end: {cause}")
            }
            ZonisError::InvalidOverrideKey => {
                write!(f, "override key does not match the configured secret")
            }
            ZonisError::TransportClosed => write!(f, "transport closed"),
            ZonisError::Transport(detail) => write!(f, "transport error: {detail}"),
            ZonisError::Handler(cause) => write!(f, "handler failed: {cause}"),
        }
    }
}

impl std::error::Error for ZonisError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_roundtrip() {
        assert_eq!(
            ZonisError::from_close_code(CLOSE_DUPLICATE_CONNECTION),
            Some(ZonisError::DuplicateConnection)
        );
        assert_eq!(
            ZonisError::DuplicateConnection.close_code(),
            Some(CLOSE_DUPLICATE_CONNECTION)
        );
        assert!(matches!(
            ZonisError::from_close_code(CLOSE_UNHANDLED_TYPE),
            Some(ZonisError::UnhandledWebsocketType(_))
        ));
        assert_eq!(
            ZonisError::from_close_code(CLOSE_INVALID_OVERRIDE_KEY),
            Some(ZonisError::InvalidOverrideKey)
        );
        assert_eq!(
            ZonisError::InvalidOverrideKey.close_code(),
            Some(CLOSE_INVALID_OVERRIDE_KEY)
        );
        assert_eq!(ZonisError::from_close_code(1000), None);
        assert_eq!(ZonisError::UnknownClient.close_code(), None);
    }

    #[test]
    fn display_carries_context() {
        let s = format!("{}", ZonisError::UnknownRoute("ping".into()));
        assert!(s.contains("ping"));

        let s = format!("{}", ZonisError::RequestFailed("boom".into()));
        assert!(s.contains("boom"));

        let s = format!("{}", ZonisError::DuplicateRoute("echo".into()));
        assert!(s.contains("echo"));

        let s = format!("{}", ZonisError::Handler("no".into()));
        assert!(s.contains("no"));
    }
}
