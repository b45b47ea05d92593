#![cfg(unix)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::join_all;
use netipc_peer::{
    Client, ClientOptions, ClientStatus, PeerError, Server, ServerOptions, REASON_ORPHAN,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

fn socket_path(tag: &str) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/netipc-{tag}-{}-{}.sock",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ))
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Echoes messages back and answers requests with their own payload.
async fn echo_server(options: ServerOptions) -> Server {
    let server = Server::new(options).expect("server options should be valid");
    server
        .on_message(|connection, data| {
            let _ = connection.post(data);
        })
        .on_request(|_, data, responder| {
            let _ = responder.reply(data);
        });
    server.start().await.expect("server should start")
}

fn quick(options: ClientOptions) -> ClientOptions {
    options
        .with_retries(2)
        .with_retry_delay(Duration::from_millis(10), Duration::from_millis(20))
}

async fn connect(options: ClientOptions) -> Client {
    let client = Client::new(options).expect("client options should be valid");
    client.connect(None).await.expect("client should connect")
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("value should arrive in time")
        .expect("channel should stay open")
}

#[tokio::test]
async fn echo_over_unix_path() {
    let path = socket_path("echo");
    let server = echo_server(ServerOptions::path(&path)).await;
    assert_eq!(server.address().as_deref(), path.to_str());

    let client = Client::new(ClientOptions::path(&path)).expect("client options should be valid");
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_message(move |data| {
        let _ = tx.send(data);
    });
    client.connect(None).await.expect("client should connect");
    assert_eq!(client.status(), ClientStatus::Ready);
    assert!(client.id().is_some());

    client
        .send(json!({"hello": "world"}))
        .await
        .expect("send should flush");
    assert_eq!(recv(&mut rx).await, json!({"hello": "world"}));

    let reply = client
        .request(json!([1, 2, 3]), Duration::from_secs(2))
        .await
        .expect("request should be answered");
    assert_eq!(reply, json!([1, 2, 3]));

    let rtt = client
        .ping(Value::Null, Duration::from_secs(2))
        .await
        .expect("ping should be answered");
    assert!(rtt < Duration::from_secs(2));

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn connect_payload_reaches_server() {
    let path = socket_path("extras");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_connect(move |connection, extras| {
        let _ = tx.send((connection.id().to_string(), extras));
    });
    server.start().await.expect("server should start");

    let client = Client::new(ClientOptions::path(&path)).expect("client options should be valid");
    client
        .connect(Some(json!({"name": "worker-1"})))
        .await
        .expect("client should connect");

    let (id, extras) = recv(&mut rx).await;
    assert_eq!(extras, Some(json!({"name": "worker-1"})));
    assert_eq!(client.id().as_deref(), Some(id.as_str()));

    let again = client.connect(None).await;
    assert!(matches!(again, Err(PeerError::NotIdle)));

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn messages_arrive_in_send_order() {
    let path = socket_path("order");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_message(move |_, data| {
        let _ = tx.send(data);
    });
    server.start().await.expect("server should start");

    let client = connect(ClientOptions::path(&path)).await;
    for i in 0..200 {
        client.post(json!(i)).await.expect("post should queue");
    }
    for i in 0..200 {
        assert_eq!(recv(&mut rx).await, json!(i));
    }

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let path = socket_path("correlate");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    server.on_request(|_, data, responder| {
        let n = data["n"].as_u64().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis((n % 7) * 3)).await;
            let _ = responder.reply(json!({"n": n, "double": n * 2}));
        });
    });
    server.start().await.expect("server should start");

    let client = connect(ClientOptions::path(&path)).await;
    let replies = join_all(
        (0..100u64).map(|n| client.request(json!({"n": n}), Duration::from_secs(5))),
    )
    .await;

    for (n, reply) in replies.into_iter().enumerate() {
        let reply = reply.expect("every request should be answered");
        assert_eq!(reply, json!({"n": n, "double": n * 2}));
    }

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn request_times_out_and_late_reply_is_dropped() {
    let path = socket_path("timeout");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    server.on_request(|_, data, responder| {
        if data["slow"] == json!(true) {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                let _ = responder.reply(json!("late"));
            });
        } else {
            let _ = responder.reply(json!("fast"));
        }
    });
    server.start().await.expect("server should start");

    let client = connect(ClientOptions::path(&path)).await;
    let started = Instant::now();
    let err = client
        .request(json!({"slow": true}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_millis(150));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let reply = client
        .request(json!({"slow": false}), Duration::from_secs(2))
        .await
        .expect("connection should survive the late reply");
    assert_eq!(reply, json!("fast"));

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn unhandled_request_gets_empty_response() {
    let path = socket_path("empty");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    server.start().await.expect("server should start");

    let client = connect(ClientOptions::path(&path)).await;
    let reply = client
        .request(json!("anyone?"), Duration::from_secs(2))
        .await
        .expect("request should be answered");
    assert_eq!(reply, Value::Null);

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn large_volume_keeps_payload_integrity() {
    let path = socket_path("volume");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_message(move |_, data| {
        let _ = tx.send(data);
    });
    server.start().await.expect("server should start");

    let client = connect(ClientOptions::path(&path)).await;
    let body = |i: usize| char::from(b'a' + (i % 26) as u8).to_string().repeat(16 * 1024);
    for i in 0..500 {
        client
            .post(json!({"i": i, "body": body(i)}))
            .await
            .expect("post should queue");
    }

    for i in 0..500 {
        let data = recv(&mut rx).await;
        assert_eq!(data["i"], json!(i));
        assert_eq!(data["body"].as_str(), Some(body(i).as_str()));
    }

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn reconnection_gives_up_after_retries() {
    let path = socket_path("missing");
    let client = Client::new(quick(ClientOptions::path(&path))).expect("client options should be valid");
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    client.on_status(move |status| {
        if status == ClientStatus::Connecting {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    let err = client.connect(None).await.unwrap_err();
    assert!(matches!(err, PeerError::Transport(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(client.status(), ClientStatus::Idle);
}

#[tokio::test]
async fn server_refuses_connections_over_max() {
    let path = socket_path("max");
    let server = echo_server(ServerOptions::path(&path).with_max_connections(1)).await;

    let first = connect(ClientOptions::path(&path)).await;
    wait_until("first connection registered", || server.connections().len() == 1).await;

    let second = Client::new(ClientOptions::path(&path).with_reconnect(false))
        .expect("client options should be valid");
    assert!(second.connect(None).await.is_err());
    assert_eq!(server.connections().len(), 1);

    first.close(None).await.expect("close should succeed");
    wait_until("first connection released", || server.connections().is_empty()).await;

    let third = connect(ClientOptions::path(&path)).await;
    let reply = third
        .request(json!("after"), Duration::from_secs(2))
        .await
        .expect("third client should be served");
    assert_eq!(reply, json!("after"));

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn compression_and_messagepack_are_negotiated() {
    let path = socket_path("packed");
    let server = echo_server(ServerOptions::path(&path)).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_connect(move |connection, _| {
        let _ = tx.send((connection.is_compressed(), connection.is_binary()));
    });

    let client = connect(
        ClientOptions::path(&path)
            .with_compression(true)
            .with_messagepack(true),
    )
    .await;
    assert_eq!(recv(&mut rx).await, (true, true));

    let data = json!({
        "text": "repeat ".repeat(512),
        "nested": {"list": [1, 2.5, null, true, "s"], "empty": {}},
    });
    let reply = client
        .request(data.clone(), Duration::from_secs(2))
        .await
        .expect("request should be answered");
    assert_eq!(reply, data);

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn http_upgrade_precedes_the_sentinel() {
    let path = socket_path("upgrade");
    let server = echo_server(ServerOptions::path(&path)).await;

    let client = connect(ClientOptions::path(&path).with_http_upgrade(true)).await;
    let reply = client
        .request(json!({"via": "upgrade"}), Duration::from_secs(2))
        .await
        .expect("request should be answered");
    assert_eq!(reply, json!({"via": "upgrade"}));

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn premature_packet_closes_the_connection() {
    let path = socket_path("premature");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_error(move |err, _| {
        let _ = tx.send(err.to_string());
    });
    server.start().await.expect("server should start");

    let mut stream = tokio::net::UnixStream::connect(&path)
        .await
        .expect("raw connect should succeed");
    let mut wire = BytesMut::from(&b"IPC"[..]);
    netipc_frame::codec::encode_frame(br#"{"t":1,"d":"early"}"#, &mut wire)
        .expect("frame should encode");
    stream.write_all(&wire).await.expect("raw write should succeed");

    assert_eq!(recv(&mut rx).await, PeerError::PrematurePacket.to_string());
    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close the stream");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(server.connections().is_empty());

    server.close(false).await.expect("server should close");
}

/// Read from a raw stream until `needle` shows up in what was received.
async fn read_until(stream: &mut tokio::net::UnixStream, needle: &str) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 256];
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let text = String::from_utf8_lossy(&seen).into_owned();
        if text.contains(needle) {
            return text;
        }
        let read = tokio::time::timeout_at(deadline, stream.read(&mut buf))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got {text:?}"))
            .expect("raw read should succeed");
        assert!(read > 0, "stream closed before {needle:?}, got {text:?}");
        seen.extend_from_slice(&buf[..read]);
    }
}

/// Sentinel plus a CONNECTION frame, as a client would send them.
fn raw_handshake() -> BytesMut {
    let mut wire = BytesMut::from(&b"IPC"[..]);
    netipc_frame::codec::encode_frame(br#"{"t":0,"d":{},"n":"abc"}"#, &mut wire)
        .expect("frame should encode");
    wire
}

#[tokio::test]
async fn half_open_connection_is_dropped_at_handshake_deadline() {
    let path = socket_path("halfopen");
    let server = echo_server(ServerOptions {
        handshake_timeout: Duration::from_millis(100),
        ..ServerOptions::path(&path)
    })
    .await;

    let mut stream = tokio::net::UnixStream::connect(&path)
        .await
        .expect("raw connect should succeed");
    let started = Instant::now();
    stream.write_all(b"IPC").await.expect("raw write should succeed");

    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should drop the half-open stream");
    assert!(matches!(read, Ok(0) | Err(_)), "unexpected read: {read:?}");
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(server.connections().is_empty());

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn server_close_refuses_connections_still_handshaking() {
    let path = socket_path("closerace");
    let server = echo_server(ServerOptions::path(&path)).await;
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    server.on_connect(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut stream = tokio::net::UnixStream::connect(&path)
        .await
        .expect("raw connect should succeed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close(false).await.expect("server should close");

    // The peer may already be gone, so the write itself can fail.
    let _ = stream.write_all(&raw_handshake()).await;
    let mut reply = Vec::new();
    let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .expect("server should drop the stream");
    assert!(
        matches!(read, Ok(0) | Err(_)),
        "closed server answered: {:?}",
        String::from_utf8_lossy(&reply)
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.connections().is_empty());
    assert_eq!(connects.load(Ordering::SeqCst), 0);

    server.start().await.expect("server should restart");
    assert!(server.connections().is_empty());
    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn orphaned_connection_is_closed_on_error() {
    let path = socket_path("orphan");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    server.start().await.expect("server should start");

    let mut stream = tokio::net::UnixStream::connect(&path)
        .await
        .expect("raw connect should succeed");
    stream
        .write_all(&raw_handshake())
        .await
        .expect("raw write should succeed");
    read_until(&mut stream, "\"id\"").await;
    drop(server);

    // A REQUEST without a nonce is an error on the connection.
    let mut wire = BytesMut::new();
    netipc_frame::codec::encode_frame(br#"{"t":2,"d":"lost"}"#, &mut wire)
        .expect("frame should encode");
    stream.write_all(&wire).await.expect("raw write should succeed");

    let end = read_until(&mut stream, REASON_ORPHAN).await;
    assert!(end.contains(r#""a":true"#), "unexpected end notice: {end:?}");
}

#[tokio::test]
async fn invalid_preamble_is_rejected() {
    let path = socket_path("preamble");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_error(move |err, _| {
        let _ = tx.send(err.to_string());
    });
    server.start().await.expect("server should start");

    let mut stream = tokio::net::UnixStream::connect(&path)
        .await
        .expect("raw connect should succeed");
    stream
        .write_all(b"BOGUS\r\n")
        .await
        .expect("raw write should succeed");

    let message = recv(&mut rx).await;
    assert!(message.starts_with("invalid preamble"), "unexpected error: {message}");
    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close the stream");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn broadcast_survey_and_ping_reach_every_client() {
    let path = socket_path("fanout");
    let server = echo_server(ServerOptions::path(&path)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut clients = Vec::new();
    for n in 0..2 {
        let client = Client::new(ClientOptions::path(&path)).expect("client options should be valid");
        let tx = tx.clone();
        client
            .on_message(move |data| {
                let _ = tx.send((n, data));
            })
            .on_request(move |_, responder| {
                let _ = responder.reply(json!({"client": n}));
            });
        client.connect(None).await.expect("client should connect");
        clients.push(client);
    }
    wait_until("both connections registered", || server.connections().len() == 2).await;

    server.broadcast(json!("news")).await;
    let mut got = vec![recv(&mut rx).await, recv(&mut rx).await];
    got.sort_by_key(|(n, _)| *n);
    assert_eq!(got, vec![(0, json!("news")), (1, json!("news"))]);

    let survey = server.survey(json!("who?"), Duration::from_secs(2)).await;
    let mut answers: Vec<Value> = survey
        .into_iter()
        .map(|(_, result)| result.expect("every client should answer"))
        .collect();
    answers.sort_by_key(|answer| answer["client"].as_u64());
    assert_eq!(answers, vec![json!({"client": 0}), json!({"client": 1})]);

    let pings = server.ping(Value::Null, Duration::from_secs(2)).await;
    assert_eq!(pings.len(), 2);
    assert!(pings.iter().all(|(_, rtt)| rtt.is_ok()));

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn paused_server_holds_messages_until_resumed() {
    let path = socket_path("pause");
    let server = Server::new(ServerOptions::path(&path)).expect("server options should be valid");
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_message(move |_, data| {
        let _ = tx.send(data);
    });
    server.start().await.expect("server should start");

    let client = connect(ClientOptions::path(&path)).await;
    wait_until("connection registered", || server.connections().len() == 1).await;

    server.pause();
    client.send(json!("held")).await.expect("send should flush");
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    server.resume();
    assert_eq!(recv(&mut rx).await, json!("held"));

    server.close(false).await.expect("server should close");
}

#[tokio::test]
async fn client_reconnects_after_server_restart() {
    let path = socket_path("restart");
    let server = echo_server(ServerOptions::path(&path)).await;

    let client = Client::new(
        ClientOptions::path(&path)
            .with_retries(50)
            .with_retry_delay(Duration::from_millis(20), Duration::from_millis(50)),
    )
    .expect("client options should be valid");
    let closes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&closes);
    client.on_close(move |disconnect| {
        seen.lock()
            .expect("close log lock")
            .push(disconnect.reason().cloned());
    });
    client.connect(None).await.expect("client should connect");
    let first_id = client.id();

    server.close(true).await.expect("server should close");
    wait_until("client noticed shutdown", || client.status() != ClientStatus::Ready).await;

    server.start().await.expect("server should restart");
    wait_until("client reconnected", || client.status() == ClientStatus::Ready).await;
    assert_ne!(client.id(), first_id);
    let reply = client
        .request(json!("again"), Duration::from_secs(2))
        .await
        .expect("request should be answered after reconnect");
    assert_eq!(reply, json!("again"));
    assert!(closes.lock().expect("close log lock").is_empty());

    server.close(false).await.expect("server should close");
    wait_until("client closed for good", || {
        !closes.lock().expect("close log lock").is_empty()
    })
    .await;
    assert_eq!(client.status(), ClientStatus::Idle);
    assert!(matches!(
        client.send(json!("gone")).await,
        Err(PeerError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn client_close_stops_reconnecting() {
    let path = socket_path("clientclose");
    let server = echo_server(ServerOptions::path(&path)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_disconnect(move |connection, disconnect| {
        let _ = tx.send((connection.id().to_string(), disconnect.allows_reconnect()));
    });

    let client = connect(quick(ClientOptions::path(&path))).await;
    assert!(client.close(Some(json!("bye"))).await.expect("close should succeed"));

    let (id, allows_reconnect) = recv(&mut rx).await;
    assert_eq!(client.id().as_deref(), Some(id.as_str()));
    assert!(!allows_reconnect);
    wait_until("client idle", || client.status() == ClientStatus::Idle).await;
    assert!(matches!(
        client.request(json!("late"), Duration::from_millis(100)).await,
        Err(PeerError::ConnectionClosed)
    ));

    server.close(false).await.expect("server should close");
}
