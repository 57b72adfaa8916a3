//! HTTP/1.1 Upgrade establishment: accepted, declined, and the
//! no-pipelining rule while an upgrade is unresolved.

mod support;

use base64::Engine as _;
use h2client::{
    flags::SettingsFlags,
    frame::Frame,
    handshake::{self, UpgradeResult},
    settings,
    types::SettingsParameter,
    Client, Config, H2Error, LocalError, Request, Url,
};
use std::sync::Arc;
use support::FakePeer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn read_h1_head<T: AsyncReadExt + Unpin>(io: &mut T) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        io.read_exact(&mut byte).await.expect("head read");
        head.push(byte[0]);
    }
    String::from_utf8(head).expect("head is not UTF-8")
}

#[tokio::test]
async fn upgrade_accepted_switches_to_http2() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);
    let task = tokio::spawn(handshake::upgrade(
        client_io,
        Config::default(),
        Request::get("http://example.com/x".try_into().unwrap(), None),
    ));

    let head = read_h1_head(&mut server_io).await;
    assert!(head.starts_with("GET /x HTTP/1.1\r\n"), "{head}");
    assert!(head.contains("Upgrade: h2c\r\n"), "{head}");
    assert!(head.contains("Connection: Upgrade, HTTP2-Settings\r\n"), "{head}");

    // the HTTP2-Settings token must decode to a valid SETTINGS payload
    let token = head
        .lines()
        .find_map(|line| line.trim_end().strip_prefix("HTTP2-Settings: "))
        .expect("HTTP2-Settings header missing");
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .expect("token is not base64url");
    assert_eq!(payload.len() % 6, 0);
    let params = settings::parse_params(&payload);
    assert!(params.contains(&(SettingsParameter::MaxConcurrentStreams, 100)));

    server_io
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n")
        .await
        .unwrap();

    // from here the wire is HTTP/2: preface, SETTINGS exchange
    let mut peer = FakePeer::new(server_io);
    peer.expect_preface().await;
    match peer.recv_frame().await {
        Frame::Settings { flags, .. } => assert!(!flags.contains(SettingsFlags::ACK)),
        other => panic!("expected SETTINGS, got {other:?}"),
    }
    peer.send_settings(&[]).await;
    match peer.recv_frame().await {
        Frame::Settings { flags, .. } => assert!(flags.contains(SettingsFlags::ACK)),
        other => panic!("expected SETTINGS ACK, got {other:?}"),
    }

    let (connection, upgraded) = match task.await.unwrap().unwrap() {
        UpgradeResult::Http2 {
            connection,
            response,
        } => (Arc::new(connection), response),
        UpgradeResult::Http1 { .. } => panic!("server switched but driver stayed on HTTP/1.1"),
    };

    // the upgraded request is implicit stream 1 in half-closed (local)
    assert_eq!(upgraded.stream, 1);
    peer.send_headers(1, &[(":status", "200")], true).await;
    let response = upgraded.response().await.unwrap();
    assert_eq!(response.status(), 200);

    // a follow-up request starts at stream 3
    let follow_up = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .request(Request::get("http://example.com/y".try_into().unwrap(), None))
                .await
        })
    };
    match peer.recv_frame().await {
        Frame::Headers { stream, .. } => assert_eq!(stream.get(), 3),
        other => panic!("expected HEADERS, got {other:?}"),
    }
    peer.send_headers(3, &[(":status", "204")], true).await;
    assert_eq!(follow_up.await.unwrap().unwrap().status(), 204);
}

#[tokio::test]
async fn upgrade_declined_stays_http1() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);
    let task = tokio::spawn(handshake::upgrade(
        client_io,
        Config::default(),
        Request::get("http://example.com/x".try_into().unwrap(), None),
    ));

    let head = read_h1_head(&mut server_io).await;
    assert!(head.contains("Upgrade: h2c\r\n"));
    server_io
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();

    match task.await.unwrap().unwrap() {
        UpgradeResult::Http1 { response } => {
            assert_eq!(response.status(), 200);
            assert_eq!(response.body.as_ref(), b"hello");
        }
        UpgradeResult::Http2 { .. } => panic!("server declined but driver adopted HTTP/2"),
    }
}

#[tokio::test]
async fn never_force_upgrade_skips_the_dance() {
    let (client_io, mut server_io) = tokio::io::duplex(1 << 20);
    let config = Config {
        never_force_upgrade: true,
        ..Config::default()
    };
    let task = tokio::spawn(handshake::upgrade(
        client_io,
        config,
        Request::get("http://example.com/plain".try_into().unwrap(), None),
    ));

    let head = read_h1_head(&mut server_io).await;
    assert!(!head.contains("Upgrade:"), "{head}");
    assert!(!head.contains("HTTP2-Settings"), "{head}");
    server_io
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();

    match task.await.unwrap().unwrap() {
        UpgradeResult::Http1 { response } => assert_eq!(response.status(), 200),
        UpgradeResult::Http2 { .. } => panic!("upgrade ran despite never_force_upgrade"),
    }
}

#[tokio::test]
async fn declined_authority_stays_on_http1() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // first connection carries the upgrade offer; decline it
        let (mut sock, _) = listener.accept().await.unwrap();
        let head = read_h1_head(&mut sock).await;
        assert!(head.contains("Upgrade: h2c"));
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();

        // the authority is marked never-HTTP/2: no upgrade offer this time
        let (mut sock, _) = listener.accept().await.unwrap();
        let head = read_h1_head(&mut sock).await;
        assert!(!head.contains("Upgrade:"), "{head}");
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nraw")
            .await
            .unwrap();
    });

    let client = Client::default();
    let url: Url = format!("http://127.0.0.1:{port}/").parse().unwrap();
    let first = client.get(url.clone()).await.unwrap();
    assert_eq!(first.body.as_ref(), b"ok");
    let second = client.get(url).await.unwrap();
    assert_eq!(second.body.as_ref(), b"raw");
    server.await.unwrap();
}

#[tokio::test]
async fn second_request_during_upgrade_is_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (head_seen_tx, head_seen_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        read_h1_head(&mut sock).await;
        head_seen_tx.send(()).unwrap();
        // hold the response until the test has tried to pipeline
        release_rx.await.unwrap();
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let client = Arc::new(Client::default());
    let url: Url = format!("http://127.0.0.1:{port}/").parse().unwrap();
    let first = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move { client.get(url).await })
    };

    head_seen_rx.await.unwrap();
    let err = client.get(url).await.unwrap_err();
    match err.downcast_ref::<H2Error>() {
        Some(H2Error::Local(LocalError::UpgradeInProgress)) => {}
        other => panic!("expected UpgradeInProgress, got {other:?}"),
    }

    release_tx.send(()).unwrap();
    assert_eq!(first.await.unwrap().unwrap().status(), 200);
    server.await.unwrap();
}
