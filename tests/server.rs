//! End-to-end tests driving a real server over loopback sockets.

use std::io::{Read, Write};
use std::net::{self, Shutdown, SocketAddr};
use std::thread::{self, sleep};
use std::time::Duration;

use httplet::{Request, Server};

/// Spawn a server with `max_clients` slots on an OS-assigned port and a
/// handler thread that answers by path:
///
/// * `/` answers `Hello, world!` as `text/plain`,
/// * `/close` asks for the connection to be closed,
/// * `/echo` echoes the request body,
/// * `/headers` reports the captured and ignored header counts,
/// * anything else echoes the path.
///
/// The thread blocks in `wait` forever; it dies with the test process.
fn spawn_test_server(max_clients: usize) -> SocketAddr {
    let mut server = Server::new(max_clients).unwrap();
    server
        .listen(0, Some("127.0.0.1".parse().unwrap()))
        .unwrap();
    let address = server.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let mut req = Request::new();
        loop {
            if server.wait(&mut req).is_err() {
                return;
            }
            match req.path() {
                "/" => {
                    server.status(200);
                    server.header("Content-Type", "text/plain");
                    server.write(b"Hello, world!");
                }
                "/close" => {
                    server.status(200);
                    server.header("Connection", "Close");
                    server.write(b"bye");
                }
                "/echo" => {
                    server.status(200);
                    server.header("Content-Type", "application/octet-stream");
                    let body = req.body().to_vec();
                    server.write(&body);
                }
                "/headers" => {
                    server.status(200);
                    let report = format!("{} {}", req.header_count(), req.ignored_count());
                    server.write(report.as_bytes());
                }
                path => {
                    server.status(200);
                    let path = path.to_string();
                    server.write(path.as_bytes());
                }
            }
            server.send();
        }
    });
    drop(handle);

    address
}

fn connect(address: SocketAddr) -> net::TcpStream {
    let stream = net::TcpStream::connect(address).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one full response (head plus `Content-Length` bytes of body) from
/// `stream`. Bytes of a subsequent pipelined response stay in `carry`.
fn read_response(stream: &mut net::TcpStream, carry: &mut Vec<u8>) -> String {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(head_end) = find(carry, b"\r\n\r\n") {
            let head = std::str::from_utf8(&carry[..head_end + 4]).unwrap();
            let total = head_end + 4 + content_length_of(head);
            while carry.len() < total {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "connection closed mid-response");
                carry.extend_from_slice(&chunk[..n]);
            }
            let response = String::from_utf8(carry[..total].to_vec()).unwrap();
            carry.drain(..total);
            return response;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before the response head");
        carry.extend_from_slice(&chunk[..n]);
    }
}

/// The declared `Content-Length` of a response head. The engine pads the
/// value with spaces up to its placeholder width (trailing whitespace in a
/// field value is legal OWS, RFC 7230 section 3.2).
fn content_length_of(head: &str) -> usize {
    let rest = match head.split_once("Content-Length: ") {
        Some((_, rest)) => rest,
        None => panic!("no Content-Length in: {head:?}"),
    };
    let value = rest.split("\r\n").next().unwrap();
    value.trim().parse().unwrap()
}

/// Reads until EOF; returns `true` if the peer closed the connection
/// without sending anything further.
fn reads_eof(stream: &mut net::TcpStream) -> bool {
    let mut buf = [0u8; 128];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => panic!("expected a clean close: {err}"),
    }
}

#[test]
fn hello_world() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

    let mut carry = Vec::new();
    let response = read_response(&mut stream, &mut carry);
    assert!(
        response.starts_with("HTTP/1.1 200 OK\r\n"),
        "response: {response:?}"
    );
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert!(response.contains("Content-Length: 13"));
    assert!(response.ends_with("\r\n\r\nHello, world!"));
}

#[test]
fn header_order_is_preserved() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

    let mut carry = Vec::new();
    let response = read_response(&mut stream, &mut carry);
    // Application headers come first, then the engine's Connection and
    // Content-Length, then the empty line.
    let content_type = find(response.as_bytes(), b"Content-Type:").unwrap();
    let connection = find(response.as_bytes(), b"Connection:").unwrap();
    let content_length = find(response.as_bytes(), b"Content-Length:").unwrap();
    assert!(content_type < connection);
    assert!(connection < content_length);
}

#[test]
fn explicit_close() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);
    stream.write_all(b"GET /close HTTP/1.1\r\n\r\n").unwrap();

    let mut carry = Vec::new();
    let response = read_response(&mut stream, &mut carry);
    assert!(response.contains("Connection: Close\r\n"));
    assert!(response.ends_with("bye"));
    // The engine closes the socket once the response is flushed.
    assert!(reads_eof(&mut stream));
}

#[test]
fn pipelined_keep_alive() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);
    stream
        .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
        .unwrap();

    let mut carry = Vec::new();
    let first = read_response(&mut stream, &mut carry);
    assert!(first.contains("Connection: Keep-Alive\r\n"));
    assert!(first.ends_with("/a"), "first response: {first:?}");
    let second = read_response(&mut stream, &mut carry);
    assert!(second.ends_with("/b"), "second response: {second:?}");
}

#[test]
fn post_body_in_two_parts() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);
    // The head (and the body's first half) arrive well before the rest;
    // the request must only be served once the body is complete.
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel")
        .unwrap();
    sleep(Duration::from_millis(50));
    stream.write_all(b"lo").unwrap();

    let mut carry = Vec::new();
    let response = read_response(&mut stream, &mut carry);
    assert!(response.contains("Content-Length: 5"));
    assert!(response.ends_with("\r\n\r\nhello"));
}

#[test]
fn malformed_content_length_drops_the_connection() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);
    stream
        .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 99999999999999999999\r\n\r\n")
        .unwrap();
    // No response; the connection is dropped before a handler runs.
    assert!(reads_eof(&mut stream));
}

#[test]
fn unsupported_method_drops_the_connection() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);
    stream.write_all(b"PUT /x HTTP/1.1\r\n\r\n").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    assert!(reads_eof(&mut stream));
}

#[test]
fn header_overflow_is_reported() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);

    let mut request = Vec::from(&b"GET /headers HTTP/1.1\r\n"[..]);
    for n in 0..33 {
        request.extend_from_slice(format!("X-Filler-{n}: {n}\r\n").as_bytes());
    }
    request.extend_from_slice(b"\r\n");
    stream.write_all(&request).unwrap();

    let mut carry = Vec::new();
    let response = read_response(&mut stream, &mut carry);
    assert!(response.ends_with("32 1"), "response: {response:?}");
}

#[test]
fn keep_alive_downgrades_after_five_responses() {
    let address = spawn_test_server(16);
    let mut stream = connect(address);
    let mut carry = Vec::new();

    for _ in 0..5 {
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let response = read_response(&mut stream, &mut carry);
        assert!(
            response.contains("Connection: Keep-Alive\r\n"),
            "response: {response:?}"
        );
    }

    // The sixth response on the same connection is a close.
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let response = read_response(&mut stream, &mut carry);
    assert!(
        response.contains("Connection: Close\r\n"),
        "response: {response:?}"
    );
    assert!(reads_eof(&mut stream));
}

#[test]
fn keep_alive_downgrades_when_nearly_full() {
    // A single-slot server is always more than 70% full while serving.
    let address = spawn_test_server(1);
    let mut stream = connect(address);
    let mut carry = Vec::new();

    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let response = read_response(&mut stream, &mut carry);
    assert!(response.contains("Connection: Close\r\n"));
    assert!(reads_eof(&mut stream));
}

#[test]
fn over_capacity_connections_are_served_as_slots_free_up() {
    // Capacity one: every response closes its connection, freeing the slot
    // for the next one.
    let address = spawn_test_server(1);
    for _ in 0..3 {
        let mut stream = connect(address);
        let mut carry = Vec::new();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let response = read_response(&mut stream, &mut carry);
        assert!(response.ends_with("Hello, world!"));
    }
}

#[test]
fn parallel_connections() {
    let address = spawn_test_server(16);
    let mut streams = Vec::new();
    let mut carries = Vec::new();
    for n in 0..4 {
        let mut stream = connect(address);
        stream
            .write_all(format!("GET /conn-{n} HTTP/1.1\r\n\r\n").as_bytes())
            .unwrap();
        streams.push(stream);
        carries.push(Vec::new());
    }
    for (n, (stream, carry)) in streams.iter_mut().zip(carries.iter_mut()).enumerate() {
        let response = read_response(stream, carry);
        assert!(
            response.ends_with(&format!("/conn-{n}")),
            "response: {response:?}"
        );
    }
}
