//! Transport-level tests that drive one side of the channel by hand,
//! plus registry behavior. Full end-to-end scenarios live in
//! `tests/integration.rs`.

use std::time::Duration;

use wicket_wire::{
    Metadata, REQUEST_ID_HEADER, RequestEnvelope, ResponseEnvelope, StatusCode, header_get,
};

use crate::{
    CallError, CallOptions, Client, CloseReason, DataChannel, MemoryChannel, Server, make_handler,
};

fn ser_string(v: &String) -> Result<Vec<u8>, crate::BoxError> {
    serde_json::to_vec(v).map_err(Into::into)
}

fn de_string(bytes: &[u8]) -> Result<String, crate::BoxError> {
    serde_json::from_slice(bytes).map_err(Into::into)
}

fn short(timeout_ms: u64) -> CallOptions {
    CallOptions {
        timeout: Some(Duration::from_millis(timeout_ms)),
        ..CallOptions::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Spawn a client whose peer end is handed back raw, so tests can shape
/// arbitrary response bytes.
fn client_with_raw_peer() -> (Client, MemoryChannel) {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let (client, driver) = Client::new(near);
    tokio::spawn(driver.run());
    (client, far)
}

#[tokio::test]
async fn raw_call_requires_request_id() {
    let (client, _peer) = client_with_raw_peer();
    let envelope = RequestEnvelope::new("/svc/M", Metadata::new(), Vec::new());
    let err = client.call(envelope, short(100)).await.unwrap_err();
    assert!(matches!(err, CallError::MissingRequestId));
}

#[tokio::test]
async fn unary_rejects_multi_message_response() {
    let (client, mut peer) = client_with_raw_peer();

    tokio::spawn(async move {
        let bytes = peer.recv().await.unwrap().unwrap();
        let request = RequestEnvelope::decode(&bytes).unwrap();
        let id = header_get(&request.headers, REQUEST_ID_HEADER).unwrap();
        let mut response = ResponseEnvelope::ok(b"\"one\"".to_vec());
        response.messages.push(b"\"two\"".to_vec());
        response
            .headers
            .insert(REQUEST_ID_HEADER.into(), id.to_string());
        peer.send(&response.encode().unwrap()).await.unwrap();
    });

    let err = client
        .unary("/svc/M", &"hi".to_string(), ser_string, de_string, short(500))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::MessageCount(2)));
}

#[tokio::test]
async fn unary_response_completes_streaming_call() {
    let (client, mut peer) = client_with_raw_peer();

    tokio::spawn(async move {
        let bytes = peer.recv().await.unwrap().unwrap();
        let request = RequestEnvelope::decode(&bytes).unwrap();
        let id = header_get(&request.headers, REQUEST_ID_HEADER).unwrap();
        // Answer the streaming call with a unary-shaped response.
        let mut response = ResponseEnvelope::ok(b"\"only\"".to_vec());
        response
            .headers
            .insert(REQUEST_ID_HEADER.into(), id.to_string());
        peer.send(&response.encode().unwrap()).await.unwrap();
    });

    let mut stream = client
        .server_streaming("/svc/S", &"go".to_string(), ser_string, de_string, short(500))
        .await
        .unwrap();
    assert_eq!(stream.recv().await.unwrap(), Some("only".to_string()));
    assert_eq!(stream.recv().await.unwrap(), None);
    assert_eq!(
        stream.trailers().and_then(|t| t.get("grpc-status")).map(String::as_str),
        Some("0")
    );
}

#[tokio::test]
async fn undecodable_inbound_is_dropped_and_transport_survives() {
    let (client, mut peer) = client_with_raw_peer();

    tokio::spawn(async move {
        // Garbage first; the transport must shrug it off.
        peer.send(&[0xff; 3]).await.unwrap();
        let bytes = peer.recv().await.unwrap().unwrap();
        let request = RequestEnvelope::decode(&bytes).unwrap();
        let id = header_get(&request.headers, REQUEST_ID_HEADER).unwrap();
        let mut response = ResponseEnvelope::ok(b"\"pong\"".to_vec());
        response
            .headers
            .insert(REQUEST_ID_HEADER.into(), id.to_string());
        peer.send(&response.encode().unwrap()).await.unwrap();
    });

    let reply: String = client
        .unary("/svc/Ping", &"ping".to_string(), ser_string, de_string, short(500))
        .await
        .unwrap();
    assert_eq!(reply, "pong");
}

#[tokio::test]
async fn close_rejects_pending_exactly_once() {
    let (client, _peer) = client_with_raw_peer();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .unary("/svc/Slow", &"x".to_string(), ser_string, de_string, short(5_000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.close();
    client.close();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Closed(CloseReason::Local)));
    assert_eq!(err.to_string(), "Transport closed");

    // New calls fail immediately after close.
    let err = client
        .unary("/svc/Slow", &"x".to_string(), ser_string, de_string, short(100))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Closed(CloseReason::Local)));
}

#[tokio::test(flavor = "multi_thread")]
async fn close_racing_a_new_call_still_rejects_it_as_closed() {
    // The call and the close land on different threads; whichever
    // interleaving wins, the call must report closure, never sit in the
    // pending map until its timer fires.
    for _ in 0..50 {
        let (client, _peer) = client_with_raw_peer();

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .unary("/svc/M", &"x".to_string(), ser_string, de_string, short(50))
                    .await
            })
        };
        let closer = {
            let client = client.clone();
            tokio::spawn(async move { client.close() })
        };

        let err = call.await.unwrap().unwrap_err();
        assert!(
            matches!(err, CallError::Closed(CloseReason::Local)),
            "got {err}"
        );
        closer.await.unwrap();
    }
}

#[tokio::test]
async fn peer_close_fails_calls_with_channel_reason() {
    let (client, mut peer) = client_with_raw_peer();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .unary("/svc/Slow", &"x".to_string(), ser_string, de_string, short(5_000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    peer.close().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Closed(CloseReason::Channel)));
    assert_eq!(err.to_string(), "DataChannel closed");
}

#[tokio::test]
async fn registered_methods_are_sorted_and_deduped() {
    let (channel, _peer) = MemoryChannel::pair();
    let (server, _driver) = Server::new(channel);

    let noop = make_handler(de_string, ser_string, |_ctx, req: String| async move { Ok(req) });
    server.register_handler("/b.Svc/Two", noop.clone());
    server.register_handler("/a.Svc/One", noop.clone());
    server.register_handler("/a.Svc/One", noop.clone());

    assert_eq!(server.registered_methods(), vec!["/a.Svc/One", "/b.Svc/Two"]);

    server.unregister_handler("/a.Svc/One");
    assert_eq!(server.registered_methods(), vec!["/b.Svc/Two"]);
}

#[tokio::test]
async fn handler_registered_after_start_is_dispatched() {
    let (near, far) = MemoryChannel::pair();
    let (client, client_driver) = Client::new(near);
    let (server, server_driver) = Server::new(far);
    tokio::spawn(client_driver.run());
    tokio::spawn(server_driver.run());

    // First attempt: nothing registered yet.
    let err = client
        .unary("/late/M", &"x".to_string(), ser_string, de_string, short(500))
        .await
        .unwrap_err();
    let CallError::Rpc(grpc) = err else {
        panic!("expected rpc error");
    };
    assert_eq!(grpc.code, StatusCode::Unimplemented.code());

    server.register_handler(
        "/late/M",
        make_handler(de_string, ser_string, |_ctx, req: String| async move { Ok(req) }),
    );
    let reply: String = client
        .unary("/late/M", &"now".to_string(), ser_string, de_string, short(500))
        .await
        .unwrap();
    assert_eq!(reply, "now");
}
