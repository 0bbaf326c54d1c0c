//! The wire envelope: JSON text frames of the shape `{packet_id, type, data}`.
//!
//! Five frame types travel over a connection:
//!
//! | `type`             | `data`                                    |
//! |--------------------|-------------------------------------------|
//! | `request`          | `{route, arguments}`                      |
//! | `response`         | the handler's return value                |
//! | `failure_response` | `{exception}`                             |
//! | `identify`         | `{override_key, client_identifier}`       |
//! | `client_to_server` | `{route, arguments}`                      |
//!
//! `packet_id` is chosen by the sender and echoed verbatim on the matching
//! response; it is the correlation key for the pending-request registry.
//! Decoding is staged so that a structurally broken frame surfaces as
//! [`ZonisError::UnknownPacket`] while a well-formed frame with an unknown
//! `type` surfaces as [`ZonisError::UnhandledWebsocketType`]. The latter
//! never terminates a session.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ZonisError;

/// Keyword arguments passed to a route handler.
pub type Arguments = serde_json::Map<String, Value>;

/// Packet id used on identify frames. Receivers must not rely on it.
pub const IDENTIFY_PACKET_ID: &str = "IDENTIFY";

/// A fresh correlation id: URL-safe base64 of 16 random bytes.
///
/// Any collision-free string within a session's in-flight set would do;
/// 128 bits of entropy makes collisions a non-concern.
pub fn packet_id() -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>())
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    pub packet_id: String,
    #[serde(flatten)]
    pub body: PacketBody,
}

/// The typed payload of a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PacketBody {
    /// Ask the peer to execute a route (server-originated).
    Request(RequestData),
    /// A handler's return value, echoing the request's packet id.
    Response(Value),
    /// The remote handler failed; carries the stringified cause.
    FailureResponse(FailureData),
    /// Admission handshake, and the server's acknowledgement of it.
    Identify(IdentifyData),
    /// Ask the peer to execute a route (client-originated).
    ClientToServer(RequestData),
}

impl PacketBody {
    /// The wire tag for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            PacketBody::Request(_) => "request",
            PacketBody::Response(_) => "response",
            PacketBody::FailureResponse(_) => "failure_response",
            PacketBody::Identify(_) => "identify",
            PacketBody::ClientToServer(_) => "client_to_server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub route: String,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureData {
    pub exception: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyData {
    #[serde(default)]
    pub override_key: Option<String>,
    /// `None` asks the server to assign an identifier at admission.
    #[serde(default)]
    pub client_identifier: Option<String>,
}

impl Packet {
    pub fn request(packet_id: String, route: &str, arguments: Arguments) -> Self {
        Packet {
            packet_id,
            body: PacketBody::Request(RequestData {
                route: route.to_owned(),
                arguments,
            }),
        }
    }

    pub fn client_to_server(packet_id: String, route: &str, arguments: Arguments) -> Self {
        Packet {
            packet_id,
            body: PacketBody::ClientToServer(RequestData {
                route: route.to_owned(),
                arguments,
            }),
        }
    }

    pub fn response(packet_id: String, value: Value) -> Self {
        Packet {
            packet_id,
            body: PacketBody::Response(value),
        }
    }

    pub fn failure(packet_id: String, exception: String) -> Self {
        Packet {
            packet_id,
            body: PacketBody::FailureResponse(FailureData { exception }),
        }
    }

    pub fn identify(client_identifier: Option<String>, override_key: Option<String>) -> Self {
        Packet {
            packet_id: IDENTIFY_PACKET_ID.to_owned(),
            body: PacketBody::Identify(IdentifyData {
                override_key,
                client_identifier,
            }),
        }
    }

    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("packet serialization is infallible")
    }

    /// Staged decode of one text frame.
    ///
    /// Checks the envelope field by field before touching the payload, so
    /// the error tells the receiver whether the frame was structurally
    /// broken or merely of an unknown type.
    pub fn decode(text: &str) -> Result<Packet, ZonisError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ZonisError::UnknownPacket(format!("invalid JSON: {e}")))?;
        let frame = value
            .as_object()
            .ok_or_else(|| ZonisError::UnknownPacket("frame is not an object".to_owned()))?;

        let packet_id = frame
            .get("packet_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ZonisError::UnknownPacket("missing packet_id".to_owned()))?
            .to_owned();
        let kind = frame
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ZonisError::UnknownPacket("missing type".to_owned()))?;
        let data = frame
            .get("data")
            .cloned()
            .ok_or_else(|| ZonisError::UnknownPacket("missing data".to_owned()))?;

        let body = match kind {
            "request" => PacketBody::Request(decode_data(data)?),
            "client_to_server" => PacketBody::ClientToServer(decode_data(data)?),
            "response" => PacketBody::Response(data),
            "failure_response" => PacketBody::FailureResponse(decode_data(data)?),
            "identify" => PacketBody::Identify(decode_data(data)?),
            other => return Err(ZonisError::UnhandledWebsocketType(other.to_owned())),
        };

        Ok(Packet { packet_id, body })
    }
}

fn decode_data<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, ZonisError> {
    serde_json::from_value(data).map_err(|e| ZonisError::UnknownPacket(e.to_string()))
}
