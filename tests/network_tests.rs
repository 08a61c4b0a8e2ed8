//! Sinks built from configuration talk to real sockets.

mod test_utils;

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::TcpListener,
    thread,
    time::Duration,
};

use lineship::{BuildError, MessageFormat, Sink, SinkBuilder, TransportKind};
use rstest::rstest;
use tempfile::TempDir;
use test_utils::store_dir;

const TOKEN: &str = "2bfbea1e-10c3-4419-bdad-7e6435882e1f";

#[rstest]
fn relay_receives_token_prefixed_lines(store_dir: TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        BufReader::new(stream)
            .lines()
            .take(2)
            .collect::<Result<Vec<_>, _>>()
            .expect("read lines")
    });

    let sink = SinkBuilder::new()
        .with_token(TOKEN)
        .with_relay("127.0.0.1", port)
        .with_format(MessageFormat::Raw)
        .with_store_path(store_dir.path().join("overflow.log"))
        .build()
        .expect("build sink");
    sink.enqueue("first");
    sink.enqueue("second\nline");
    sink.close(Duration::ZERO);

    let lines = server.join().expect("server thread");
    assert_eq!(
        lines,
        vec![
            format!("{TOKEN} first"),
            format!("{TOKEN} second\u{2028}line")
        ]
    );
}

#[rstest]
fn http_transport_posts_json(store_dir: TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let mut request = Vec::new();
        let mut buf = [0_u8; 4096];
        while !String::from_utf8_lossy(&request).contains("over http") {
            let read = stream.read(&mut buf).expect("read request");
            if read == 0 {
                break;
            }
            request.extend_from_slice(&buf[..read]);
        }
        stream
            .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .expect("write response");
        String::from_utf8_lossy(&request).into_owned()
    });

    let sink = SinkBuilder::new()
        .with_token("plain-token")
        .with_transport(TransportKind::Http)
        .with_http_base_url(format!("http://127.0.0.1:{port}/v1/logs/"))
        .with_store_path(store_dir.path().join("overflow.log"))
        .build()
        .expect("build sink");
    sink.enqueue("over http");
    sink.close(Duration::ZERO);

    let request = server.join().expect("server thread");
    assert!(request.starts_with("POST /v1/logs/plain-token HTTP/1.1"), "{request}");
    assert!(request.contains("over http"), "{request}");
}

#[rstest]
#[case("not-a-uuid")]
#[case("")]
fn socket_transport_requires_uuid_token(store_dir: TempDir, #[case] token: &str) {
    let result = SinkBuilder::new()
        .with_token(token)
        .with_store_path(store_dir.path().join("overflow.log"))
        .build();
    assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
}
