//! Hub behavior when driven by an external endpoint: admission through
//! `parse_identify`, frames fed through `ingest`, with `ChannelSink`
//! standing in for each connection's send half.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use zonis::testkit::{channel_sink, ChannelSink};
use zonis::{Arguments, OverridePolicy, Packet, PacketBody, Server, ZonisError};

const TICK: Duration = Duration::from_secs(2);

fn identify(identifier: Option<&str>, override_key: Option<&str>) -> String {
    Packet::identify(
        identifier.map(str::to_owned),
        override_key.map(str::to_owned),
    )
    .encode()
}

async fn next_frame(rx: &mut UnboundedReceiver<String>) -> Packet {
    let text = timeout(TICK, rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("sink closed");
    Packet::decode(&text).expect("emitted frame must decode")
}

/// Admit a client and swallow the identify acknowledgement.
async fn admit(
    server: &Server<ChannelSink>,
    identifier: Option<&str>,
    override_key: Option<&str>,
) -> (String, UnboundedReceiver<String>) {
    let (sink, mut rx) = channel_sink();
    let admitted = server
        .parse_identify(&identify(identifier, override_key), sink)
        .await
        .expect("admission should succeed");
    let ack = next_frame(&mut rx).await;
    match ack.body {
        PacketBody::Identify(data) => {
            assert_eq!(data.client_identifier.as_deref(), Some(admitted.as_str()));
        }
        other => panic!("expected identify acknowledgement, got {other:?}"),
    }
    (admitted, rx)
}

#[tokio::test]
async fn unicast_request_round_trip() {
    let server = Server::<ChannelSink>::builder().build();
    let (id, mut rx) = admit(&server, Some("a"), None).await;
    assert_eq!(id, "a");

    let call = tokio::spawn({
        let server = server.clone();
        async move { server.request_to("a", "ping", Arguments::new()).await }
    });

    let frame = next_frame(&mut rx).await;
    let PacketBody::Request(request) = &frame.body else {
        panic!("expected request frame, got {:?}", frame.body);
    };
    assert_eq!(request.route, "ping");

    server
        .ingest("a", &Packet::response(frame.packet_id, json!("pong")).encode())
        .await
        .unwrap();

    assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    assert_eq!(server.pending_requests("a"), Some(0));
}

#[tokio::test]
async fn assigns_identifier_when_client_supplies_none() {
    let server = Server::<ChannelSink>::builder().build();
    let (id, _rx) = admit(&server, None, None).await;
    assert!(!id.is_empty());
    assert!(server.is_connected(&id));
}

#[tokio::test]
async fn duplicate_identifier_without_override_is_rejected() {
    let server = Server::<ChannelSink>::builder().build();
    let (_, _rx_a) = admit(&server, Some("x"), None).await;

    let (sink_b, _rx_b) = channel_sink();
    let err = server
        .parse_identify(&identify(Some("x"), None), sink_b)
        .await
        .unwrap_err();
    assert_eq!(err, ZonisError::DuplicateConnection);

    // The original session is untouched.
    assert_eq!(server.clients(), vec!["x".to_owned()]);
}

#[tokio::test]
async fn valid_override_replaces_and_fails_inflight_requests() {
    let server = Server::<ChannelSink>::builder()
        .secret_key("x", "s")
        .build();
    let (_, mut rx_a) = admit(&server, Some("x"), None).await;

    // Leave a request in flight toward the first session.
    let stuck = tokio::spawn({
        let server = server.clone();
        async move { server.request_to("x", "slow", Arguments::new()).await }
    });
    let frame = next_frame(&mut rx_a).await;
    assert!(matches!(frame.body, PacketBody::Request(_)));
    assert_eq!(server.pending_requests("x"), Some(1));

    let (_, mut rx_b) = admit(&server, Some("x"), Some("s")).await;

    // The evicted session's request fails; the identifier now routes to
    // the replacement.
    assert_eq!(
        stuck.await.unwrap().unwrap_err(),
        ZonisError::TransportClosed
    );

    let call = tokio::spawn({
        let server = server.clone();
        async move { server.request_to("x", "ping", Arguments::new()).await }
    });
    let frame = next_frame(&mut rx_b).await;
    server
        .ingest("x", &Packet::response(frame.packet_id, json!("pong b")).encode())
        .await
        .unwrap();
    assert_eq!(call.await.unwrap().unwrap(), json!("pong b"));
}

#[tokio::test]
async fn wrong_override_key_is_still_a_duplicate() {
    let server = Server::<ChannelSink>::builder()
        .secret_key("x", "s")
        .build();
    let (_, _rx_a) = admit(&server, Some("x"), None).await;

    let (sink_b, _rx_b) = channel_sink();
    let err = server
        .parse_identify(&identify(Some("x"), Some("wrong")), sink_b)
        .await
        .unwrap_err();
    assert_eq!(err, ZonisError::DuplicateConnection);
}

#[tokio::test]
async fn strict_policy_rejects_conflicting_override_keys() {
    let server = Server::<ChannelSink>::builder()
        .secret_key("x", "s")
        .override_policy(OverridePolicy::Strict)
        .build();
    let (_, _rx_a) = admit(&server, Some("x"), None).await;

    // A conflicting identify with the wrong key is called out distinctly.
    let (sink_b, _rx_b) = channel_sink();
    let err = server
        .parse_identify(&identify(Some("x"), Some("wrong")), sink_b)
        .await
        .unwrap_err();
    assert_eq!(err, ZonisError::InvalidOverrideKey);
    assert_eq!(server.clients(), vec!["x".to_owned()]);

    // A stray key on a first-time identify resolves no conflict; it is
    // admitted under either policy.
    let (_, _rx_c) = admit(&server, Some("y"), Some("made-up")).await;
    assert!(server.is_connected("y"));

    let lenient = Server::<ChannelSink>::builder().build();
    let (_, _rx_d) = admit(&lenient, Some("y"), Some("made-up")).await;
    assert!(lenient.is_connected("y"));
}

#[tokio::test]
async fn non_identify_first_frame_is_rejected() {
    let server = Server::<ChannelSink>::builder().build();
    let (sink, _rx) = channel_sink();
    let frame = Packet::response("r".to_owned(), json!(null)).encode();
    let err = server.parse_identify(&frame, sink).await.unwrap_err();
    assert!(matches!(err, ZonisError::UnknownPacket(_)));
}

#[tokio::test]
async fn response_with_unknown_packet_id_is_dropped_silently() {
    let server = Server::<ChannelSink>::builder().build();
    let (_, _rx) = admit(&server, Some("a"), None).await;

    let stale = Packet::response("no-such-id".to_owned(), json!(1)).encode();
    server.ingest("a", &stale).await.unwrap();
    assert!(server.is_connected("a"));
}

#[tokio::test]
async fn unknown_frame_type_does_not_kill_the_session() {
    let server = Server::<ChannelSink>::builder().build();
    let (_, mut rx) = admit(&server, Some("a"), None).await;

    let err = server
        .ingest("a", r#"{"packet_id": "p", "type": "telemetry", "data": {}}"#)
        .await
        .unwrap_err();
    assert_eq!(err, ZonisError::UnhandledWebsocketType("telemetry".to_owned()));
    assert!(server.is_connected("a"));

    // The session still serves requests afterwards.
    let call = tokio::spawn({
        let server = server.clone();
        async move { server.request_to("a", "ping", Arguments::new()).await }
    });
    let frame = next_frame(&mut rx).await;
    server
        .ingest("a", &Packet::response(frame.packet_id, json!("pong")).encode())
        .await
        .unwrap();
    assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
}

#[tokio::test]
async fn client_to_server_dispatches_through_the_hub_route_table() {
    let server = Server::<ChannelSink>::builder()
        .route("sum", |arguments: Arguments| async move {
            let a = arguments.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = arguments.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        })
        .unwrap()
        .build();
    let (_, mut rx) = admit(&server, Some("a"), None).await;

    let mut arguments = Arguments::new();
    arguments.insert("a".to_owned(), json!(2));
    arguments.insert("b".to_owned(), json!(3));
    let frame = Packet::client_to_server("req-1".to_owned(), "sum", arguments).encode();
    server.ingest("a", &frame).await.unwrap();

    let reply = next_frame(&mut rx).await;
    assert_eq!(reply.packet_id, "req-1");
    match reply.body {
        PacketBody::Response(value) => assert_eq!(value, json!(5)),
        other => panic!("expected response, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_route_is_reflected_as_failure_response() {
    let server = Server::<ChannelSink>::builder()
        .route("ping", |_| async { Ok(json!("pong")) })
        .unwrap()
        .build();
    let (_, mut rx) = admit(&server, Some("a"), None).await;

    let frame = Packet::client_to_server("req-2".to_owned(), "nope", Arguments::new()).encode();
    server.ingest("a", &frame).await.unwrap();

    let reply = next_frame(&mut rx).await;
    assert_eq!(reply.packet_id, "req-2");
    match reply.body {
        PacketBody::FailureResponse(failure) => assert!(failure.exception.contains("nope")),
        other => panic!("expected failure_response, got {other:?}"),
    }
}

#[tokio::test]
async fn hub_without_routes_reflects_missing_receive_handler() {
    let server = Server::<ChannelSink>::builder().build();
    let (_, mut rx) = admit(&server, Some("a"), None).await;

    let frame = Packet::client_to_server("req-3".to_owned(), "ping", Arguments::new()).encode();
    let err = server.ingest("a", &frame).await.unwrap_err();
    assert_eq!(err, ZonisError::MissingReceiveHandler);

    let reply = next_frame(&mut rx).await;
    match reply.body {
        PacketBody::FailureResponse(failure) => {
            assert!(failure.exception.contains("route table"));
        }
        other => panic!("expected failure_response, got {other:?}"),
    }
}

#[tokio::test]
async fn request_all_isolates_per_client_failures() {
    let server = Server::<ChannelSink>::builder().build();
    let (_, mut rx_a) = admit(&server, Some("a"), None).await;
    let (_, mut rx_b) = admit(&server, Some("b"), None).await;

    let fan_out = tokio::spawn({
        let server = server.clone();
        async move { server.request_all("ping", Arguments::new()).await }
    });

    // Client a answers; client b is disconnected mid-request.
    let frame_a = next_frame(&mut rx_a).await;
    server
        .ingest("a", &Packet::response(frame_a.packet_id, json!("pong a")).encode())
        .await
        .unwrap();
    let _frame_b = next_frame(&mut rx_b).await;
    server.disconnect("b").await;

    let results = fan_out.await.unwrap();
    let mut keys: Vec<_> = results.keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, ["a", "b"]);
    assert_eq!(results["a"], Ok(json!("pong a")));
    assert_eq!(results["b"], Err(ZonisError::TransportClosed));
}

#[tokio::test]
async fn request_all_with_no_clients_is_empty() {
    let server: Server<ChannelSink> = Server::<ChannelSink>::builder().build();
    let results = server.request_all("ping", Arguments::new()).await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn default_unicast_needs_exactly_one_client() {
    let server = Server::<ChannelSink>::builder().build();
    assert_eq!(
        server.request("ping", Arguments::new()).await.unwrap_err(),
        ZonisError::UnknownClient
    );

    let (_, mut rx_a) = admit(&server, Some("a"), None).await;
    let call = tokio::spawn({
        let server = server.clone();
        async move { server.request("ping", Arguments::new()).await }
    });
    let frame = next_frame(&mut rx_a).await;
    server
        .ingest("a", &Packet::response(frame.packet_id, json!("pong")).encode())
        .await
        .unwrap();
    assert_eq!(call.await.unwrap().unwrap(), json!("pong"));

    let (_, _rx_b) = admit(&server, Some("b"), None).await;
    assert_eq!(
        server.request("ping", Arguments::new()).await.unwrap_err(),
        ZonisError::UnknownClient
    );
}

#[tokio::test]
async fn disconnect_is_idempotent_and_fails_inflight() {
    let server = Server::<ChannelSink>::builder().build();
    let (_, mut rx) = admit(&server, Some("a"), None).await;

    let stuck = tokio::spawn({
        let server = server.clone();
        async move { server.request_to("a", "ping", Arguments::new()).await }
    });
    let _ = next_frame(&mut rx).await;

    server.disconnect("a").await;
    assert_eq!(
        stuck.await.unwrap().unwrap_err(),
        ZonisError::TransportClosed
    );
    assert!(!server.is_connected("a"));

    // Second disconnect, and disconnecting a stranger, are no-ops.
    server.disconnect("a").await;
    server.disconnect("never-connected").await;

    assert_eq!(
        server.ingest("a", "{}").await.unwrap_err(),
        ZonisError::UnknownClient
    );
}
