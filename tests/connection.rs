//! Session-level scenarios driven against a scripted peer over an
//! in-memory duplex transport.

mod support;

use h2client::{
    flags::*,
    frame::Frame,
    types::{ErrorType, SettingsParameter},
    Config, Connection, Request,
};
use std::{sync::Arc, time::Duration};
use support::{field, nonzero, FakePeer};

async fn connect(config: Config) -> (Arc<Connection>, FakePeer) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let connection = Connection::handshake(client_io, config)
        .await
        .expect("client handshake");
    (Arc::new(connection), FakePeer::new(server_io))
}

fn spawn_request(
    connection: &Arc<Connection>,
    request: Request,
) -> tokio::task::JoinHandle<Result<h2client::Response, h2client::H2Error>> {
    let connection = connection.clone();
    tokio::spawn(async move { connection.request(request).await })
}

#[tokio::test]
async fn prior_knowledge_get() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    let pending = spawn_request(
        &connection,
        Request::get("http://example.com/".try_into().unwrap(), None),
    );

    match peer.recv_frame().await {
        Frame::Headers {
            stream,
            flags,
            fragment,
            ..
        } => {
            assert_eq!(stream.get(), 1);
            assert!(flags.contains(HeadersFlags::END_HEADERS));
            assert!(flags.contains(HeadersFlags::END_STREAM));
            let request = peer.decode_fields(&fragment);
            assert_eq!(field(&request, ":method"), Some("GET"));
            assert_eq!(field(&request, ":path"), Some("/"));
            assert_eq!(field(&request, ":scheme"), Some("http"));
        }
        other => panic!("expected HEADERS, got {other:?}"),
    }

    peer.send_headers(1, &[(":status", "200")], true).await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.body.is_empty());
    assert_eq!(connection.active_streams().await, 0);
}

#[tokio::test]
async fn stream_ids_are_odd_and_increasing() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    let mut pending = Vec::new();
    for _ in 0..3 {
        pending.push(spawn_request(
            &connection,
            Request::get("http://example.com/".try_into().unwrap(), None),
        ));
    }

    let mut seen = Vec::new();
    while seen.len() < 3 {
        if let Frame::Headers { stream, .. } = peer.recv_frame().await {
            seen.push(stream.get());
        }
    }
    assert!(seen.iter().all(|id| id % 2 == 1));
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));

    for id in seen {
        peer.send_headers(id, &[(":status", "204")], true).await;
    }
    for task in pending {
        assert_eq!(task.await.unwrap().unwrap().status(), 204);
    }
}

#[tokio::test]
async fn flow_control_blocks_then_resumes() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[(SettingsParameter::InitialWindowSize, 10)])
        .await;

    let pending = spawn_request(
        &connection,
        Request::post(
            "http://example.com/upload".try_into().unwrap(),
            None,
            vec![0x42u8; 25],
        ),
    );

    match peer.recv_frame().await {
        Frame::Headers { stream, flags, .. } => {
            assert_eq!(stream.get(), 1);
            assert!(!flags.contains(HeadersFlags::END_STREAM));
        }
        other => panic!("expected HEADERS, got {other:?}"),
    }

    // exactly one DATA frame sized to the stream window
    match peer.recv_frame().await {
        Frame::Data { data, flags, .. } => {
            assert_eq!(data.len(), 10);
            assert!(!flags.contains(DataFlags::END_STREAM));
        }
        other => panic!("expected DATA, got {other:?}"),
    }

    // the writer is suspended now; nothing else may show up
    let quiet = tokio::time::timeout(Duration::from_millis(100), peer.recv_frame()).await;
    assert!(quiet.is_err(), "writer was not suspended: {quiet:?}");

    peer.send(&Frame::WindowUpdate {
        stream: 1,
        increment: 15,
    })
    .await;

    match peer.recv_frame().await {
        Frame::Data { data, flags, .. } => {
            assert_eq!(data.len(), 15);
            assert!(flags.contains(DataFlags::END_STREAM));
        }
        other => panic!("expected DATA, got {other:?}"),
    }

    peer.send_headers(1, &[(":status", "200")], true).await;
    assert_eq!(pending.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn push_promise_with_push_disabled_is_fatal() {
    let (connection, mut peer) = connect(Config {
        push_enabled: false,
        ..Config::default()
    })
    .await;
    peer.handshake(&[]).await;

    let pending = spawn_request(
        &connection,
        Request::get("http://example.com/".try_into().unwrap(), None),
    );
    match peer.recv_frame().await {
        Frame::Headers { stream, .. } => assert_eq!(stream.get(), 1),
        other => panic!("expected HEADERS, got {other:?}"),
    }

    let fragment = peer.encode_fields(&[(":method", "GET"), (":path", "/pushed")]);
    peer.send(&Frame::PushPromise {
        stream: nonzero(1),
        flags: PushPromiseFlags::END_HEADERS,
        promised: nonzero(2),
        fragment,
    })
    .await;

    match peer.recv_frame().await {
        Frame::GoAway { error, .. } => assert_eq!(error, ErrorType::ProtocolError),
        other => panic!("expected GOAWAY, got {other:?}"),
    }
    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn pushed_response_surfaces_when_opted_in() {
    let (connection, mut peer) = connect(Config {
        send_push_request_upstream: true,
        ..Config::default()
    })
    .await;
    peer.handshake(&[]).await;
    let mut pushes = connection.pushed_exchanges().expect("push channel");

    let pending = spawn_request(
        &connection,
        Request::get("http://example.com/".try_into().unwrap(), None),
    );
    match peer.recv_frame().await {
        Frame::Headers { stream, .. } => assert_eq!(stream.get(), 1),
        other => panic!("expected HEADERS, got {other:?}"),
    }

    let fragment = peer.encode_fields(&[(":method", "GET"), (":path", "/style.css")]);
    peer.send(&Frame::PushPromise {
        stream: nonzero(1),
        flags: PushPromiseFlags::END_HEADERS,
        promised: nonzero(2),
        fragment,
    })
    .await;
    peer.send_headers(2, &[(":status", "200")], true).await;
    peer.send_headers(1, &[(":status", "204")], true).await;

    assert_eq!(pending.await.unwrap().unwrap().status(), 204);

    let push = pushes.recv().await.expect("pushed exchange");
    assert_eq!(field(&push.request, ":path"), Some("/style.css"));
    let pushed_response = push.response.await.unwrap().unwrap();
    assert_eq!(pushed_response.status(), 200);
}

#[tokio::test]
async fn interleaved_frame_inside_header_block_is_fatal() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    let pending = spawn_request(
        &connection,
        Request::get("http://example.com/".try_into().unwrap(), None),
    );
    match peer.recv_frame().await {
        Frame::Headers { stream, .. } => assert_eq!(stream.get(), 1),
        other => panic!("expected HEADERS, got {other:?}"),
    }

    // open a header block on stream 1 and leave it unterminated
    let block = peer.encode_fields(&[(":status", "200")]);
    let split = block.len() / 2;
    peer.send(&Frame::Headers {
        stream: nonzero(1),
        flags: HeadersFlags::empty(),
        priority: None,
        fragment: block.slice(..split),
    })
    .await;
    peer.send_data(1, b"x", false).await;

    match peer.recv_frame().await {
        Frame::GoAway { last_stream, error, .. } => {
            assert_eq!(error, ErrorType::ProtocolError);
            assert_eq!(last_stream, 0);
        }
        other => panic!("expected GOAWAY, got {other:?}"),
    }
    assert!(pending.await.unwrap().unwrap_err().is_connection_error());
}

#[tokio::test]
async fn goaway_refuses_unprocessed_streams() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    let pending = spawn_request(
        &connection,
        Request::get("http://example.com/".try_into().unwrap(), None),
    );
    match peer.recv_frame().await {
        Frame::Headers { stream, .. } => assert_eq!(stream.get(), 1),
        other => panic!("expected HEADERS, got {other:?}"),
    }

    peer.send(&Frame::GoAway {
        last_stream: 0,
        error: ErrorType::NoError,
        debug: h2client::Bytes::new(),
    })
    .await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_retryable(), "expected REFUSED_STREAM, got {err:?}");
    assert_eq!(err.code(), Some(ErrorType::RefusedStream));
}

#[tokio::test]
async fn ping_is_echoed_with_ack() {
    let (_connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    peer.send(&Frame::Ping {
        flags: PingFlags::empty(),
        data: *b"feedcafe",
    })
    .await;
    match peer.recv_frame().await {
        Frame::Ping { flags, data } => {
            assert!(flags.contains(PingFlags::ACK));
            assert_eq!(&data, b"feedcafe");
        }
        other => panic!("expected PING ACK, got {other:?}"),
    }
}

#[tokio::test]
async fn local_ping_round_trips() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    let pinger = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.ping().await })
    };
    match peer.recv_frame().await {
        Frame::Ping { flags, data } => {
            assert!(!flags.contains(PingFlags::ACK));
            peer.send(&Frame::Ping {
                flags: PingFlags::ACK,
                data,
            })
            .await;
        }
        other => panic!("expected PING, got {other:?}"),
    }
    pinger.await.unwrap().unwrap();
}

#[tokio::test]
async fn receive_windows_are_replenished() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    let pending = spawn_request(
        &connection,
        Request::get("http://example.com/big".try_into().unwrap(), None),
    );
    match peer.recv_frame().await {
        Frame::Headers { stream, .. } => assert_eq!(stream.get(), 1),
        other => panic!("expected HEADERS, got {other:?}"),
    }

    peer.send_headers(1, &[(":status", "200")], false).await;
    // push 40000 bytes through in MAX_FRAME_SIZE slices; that crosses the
    // halfway mark of the 65535-byte windows exactly once
    peer.send_data(1, &[7u8; 16_384], false).await;
    peer.send_data(1, &[7u8; 16_384], false).await;
    peer.send_data(1, &[7u8; 7_232], false).await;

    match peer.recv_frame().await {
        Frame::WindowUpdate { stream, increment } => {
            assert_eq!(stream, 0);
            assert_eq!(increment, 40_000);
        }
        other => panic!("expected session WINDOW_UPDATE, got {other:?}"),
    }
    match peer.recv_frame().await {
        Frame::WindowUpdate { stream, increment } => {
            assert_eq!(stream, 1);
            assert_eq!(increment, 40_000);
        }
        other => panic!("expected stream WINDOW_UPDATE, got {other:?}"),
    }

    peer.send_data(1, &[], true).await;
    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.body.len(), 40_000);
}

#[tokio::test]
async fn settings_before_server_preface_is_required() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.expect_preface().await;
    match peer.recv_frame().await {
        Frame::Settings { .. } => {}
        other => panic!("expected SETTINGS, got {other:?}"),
    }

    // a PING instead of the server SETTINGS preface is a protocol error
    peer.send(&Frame::Ping {
        flags: PingFlags::empty(),
        data: [0; 8],
    })
    .await;

    match peer.recv_frame().await {
        Frame::GoAway { error, .. } => assert_eq!(error, ErrorType::ProtocolError),
        other => panic!("expected GOAWAY, got {other:?}"),
    }
    assert!(connection.last_error().await.is_some());
}

#[tokio::test]
async fn cancel_sends_rst_stream() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    let handle = connection
        .execute(Request::get("http://example.com/slow".try_into().unwrap(), None))
        .await
        .unwrap();
    match peer.recv_frame().await {
        Frame::Headers { stream, .. } => assert_eq!(stream.get(), handle.stream),
        other => panic!("expected HEADERS, got {other:?}"),
    }

    connection.cancel(handle.stream).await.unwrap();
    match peer.recv_frame().await {
        Frame::ResetStream { stream, error } => {
            assert_eq!(stream.get(), handle.stream);
            assert_eq!(error, ErrorType::Cancel);
        }
        other => panic!("expected RST_STREAM, got {other:?}"),
    }
    let err = handle.response().await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorType::Cancel));
    assert_eq!(connection.active_streams().await, 0);
}

#[tokio::test]
async fn graceful_close_sends_goaway() {
    let (connection, mut peer) = connect(Config::default()).await;
    peer.handshake(&[]).await;

    connection.close().await.unwrap();
    match peer.recv_frame().await {
        Frame::GoAway { error, .. } => assert_eq!(error, ErrorType::NoError),
        other => panic!("expected GOAWAY, got {other:?}"),
    }
    assert_eq!(
        connection.state().await,
        h2client::SessionState::Closed
    );
}
