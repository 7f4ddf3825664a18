//! End-to-end tests of the blocking connection over `ReqwestEngine`
//! against a local mock server.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};
use url::Url;
use url_connection::error::RequestErrorKind;
use url_connection::{ConnectionError, EngineConfig, HttpUrlConnection, ReqwestEngine};

fn engine() -> Arc<ReqwestEngine> {
    static ENGINE: OnceLock<Arc<ReqwestEngine>> = OnceLock::new();
    ENGINE
        .get_or_init(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
            let config = EngineConfig {
                request_timeout_ms: 10_000,
                user_agent: Some("url-connection-tests".to_string()),
                ..Default::default()
            };
            Arc::new(ReqwestEngine::with_config(config).unwrap())
        })
        .clone()
}

fn connect(server: &mockito::Server, path: &str) -> HttpUrlConnection {
    let url = Url::parse(&format!("{}{}", server.url(), path)).unwrap();
    HttpUrlConnection::new(url, engine())
}

fn read_body(connection: &mut HttpUrlConnection) -> String {
    let mut body = String::new();
    connection
        .input_stream()
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    body
}

#[test]
fn test_get() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/hello")
        .match_header("user-agent", "url-connection-tests")
        .match_header("accept", "text/plain")
        .with_status(200)
        .with_header("content-type", "text/plain")
        .with_header("x-custom", "yes")
        .with_body("hello from server")
        .create();

    let mut connection = connect(&server, "/hello");
    connection.set_request_property("Accept", "text/plain").unwrap();
    assert_eq!(connection.response_code().unwrap(), 200);
    assert_eq!(connection.response_message().unwrap(), "OK");
    assert_eq!(connection.header_field("X-Custom"), Some("yes"));
    assert_eq!(read_body(&mut connection), "hello from server");
    assert_eq!(
        connection.response_info().unwrap().negotiated_protocol,
        "HTTP/1.1"
    );
    mock.assert();
}

#[test]
fn test_gzip_body_is_decoded() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"hello from a gzip body").unwrap();
    let compressed = encoder.finish().unwrap();

    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/gzip")
        .with_header("content-type", "text/plain")
        .with_header("content-encoding", "gzip")
        .with_body(compressed)
        .create();

    let mut connection = connect(&server, "/gzip");
    connection.set_request_property("Accept-Encoding", "gzip").unwrap();
    assert_eq!(connection.response_code().unwrap(), 200);
    assert_eq!(connection.header_field("Content-Encoding"), None);
    assert_eq!(read_body(&mut connection), "hello from a gzip body");
    mock.assert();
}

#[test]
fn test_large_body_is_read_across_many_reads() {
    let body = "0123456789".repeat(10_000);
    let mut server = mockito::Server::new();
    let mock = server.mock("GET", "/big").with_body(&body).create();

    let mut connection = connect(&server, "/big");
    assert_eq!(read_body(&mut connection), body);
    mock.assert();
}

#[test]
fn test_post_fixed_length() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/fixed")
        .match_header("content-length", "11")
        .match_header("content-type", "application/x-www-form-urlencoded")
        .match_body("hello world")
        .with_status(201)
        .with_body("created")
        .create();

    let mut connection = connect(&server, "/fixed");
    connection.set_do_output(true).unwrap();
    connection.set_fixed_length_streaming_mode(11).unwrap();
    let stream = connection.output_stream().unwrap();
    stream.write_all(b"hello ").unwrap();
    stream.write_all(b"world").unwrap();

    assert_eq!(connection.response_code().unwrap(), 201);
    assert_eq!(read_body(&mut connection), "created");
    mock.assert();
}

#[test]
fn test_post_chunked() {
    let payload = "chunk-".repeat(100);
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/chunked")
        .match_header("transfer-encoding", "chunked")
        .match_body(payload.as_str())
        .with_body("ok")
        .create();

    let mut connection = connect(&server, "/chunked");
    connection.set_do_output(true).unwrap();
    connection.set_chunked_streaming_mode(64).unwrap();
    connection
        .output_stream()
        .unwrap()
        .write_all(payload.as_bytes())
        .unwrap();

    assert_eq!(connection.response_code().unwrap(), 200);
    assert_eq!(read_body(&mut connection), "ok");
    mock.assert();
}

#[test]
fn test_post_buffered() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/form")
        .match_header("content-length", "7")
        .match_body("a=1&b=2")
        .with_body("thanks")
        .create();

    let mut connection = connect(&server, "/form");
    connection.set_do_output(true).unwrap();
    connection.output_stream().unwrap().write_all(b"a=1&b=2").unwrap();

    assert_eq!(connection.response_code().unwrap(), 200);
    assert_eq!(read_body(&mut connection), "thanks");
    mock.assert();
}

#[test]
fn test_redirect_followed() {
    let mut server = mockito::Server::new();
    let old = server
        .mock("GET", "/old")
        .with_status(302)
        .with_header("location", "/new")
        .create();
    let new = server.mock("GET", "/new").with_body("moved here").create();

    let mut connection = connect(&server, "/old");
    assert_eq!(connection.response_code().unwrap(), 200);
    assert!(connection.url().as_str().ends_with("/new"));
    assert_eq!(read_body(&mut connection), "moved here");
    assert_eq!(connection.response_info().unwrap().url_chain.len(), 2);
    old.assert();
    new.assert();
}

#[test]
fn test_redirect_not_followed() {
    let mut server = mockito::Server::new();
    let old = server
        .mock("GET", "/old")
        .with_status(301)
        .with_header("location", "/new")
        .create();
    let new = server.mock("GET", "/new").expect(0).create();

    let mut connection = connect(&server, "/old");
    connection.set_instance_follow_redirects(false).unwrap();
    assert_eq!(connection.response_code().unwrap(), 301);
    assert_eq!(connection.header_field("Location"), Some("/new"));
    assert!(matches!(
        connection.input_stream(),
        Err(ConnectionError::RedirectBody)
    ));
    old.assert();
    new.assert();
}

#[test]
fn test_see_other_switches_post_to_get() {
    let mut server = mockito::Server::new();
    let submit = server
        .mock("POST", "/submit")
        .match_body("payload")
        .with_status(303)
        .with_header("location", "/result")
        .create();
    let result = server.mock("GET", "/result").with_body("done").create();

    let mut connection = connect(&server, "/submit");
    connection.set_do_output(true).unwrap();
    connection.output_stream().unwrap().write_all(b"payload").unwrap();
    assert_eq!(connection.response_code().unwrap(), 200);
    assert_eq!(read_body(&mut connection), "done");
    submit.assert();
    result.assert();
}

#[test]
fn test_temporary_redirect_replays_buffered_body() {
    let mut server = mockito::Server::new();
    let first = server
        .mock("POST", "/first")
        .match_body("replay me")
        .with_status(307)
        .with_header("location", "/second")
        .create();
    let second = server
        .mock("POST", "/second")
        .match_body("replay me")
        .with_body("replayed")
        .create();

    let mut connection = connect(&server, "/first");
    connection.set_do_output(true).unwrap();
    connection.output_stream().unwrap().write_all(b"replay me").unwrap();
    assert_eq!(connection.response_code().unwrap(), 200);
    assert_eq!(read_body(&mut connection), "replayed");
    first.assert();
    second.assert();
}

#[test]
fn test_not_found_error_stream() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/missing")
        .with_status(404)
        .with_body("no such thing")
        .create();

    let mut connection = connect(&server, "/missing");
    assert_eq!(connection.response_code().unwrap(), 404);
    assert!(matches!(
        connection.input_stream(),
        Err(ConnectionError::NotFound(_))
    ));
    let mut body = String::new();
    connection
        .error_stream()
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "no such thing");
    mock.assert();
}

#[test]
fn test_connection_refused() {
    let url = Url::parse("http://127.0.0.1:1/").unwrap();
    let mut connection = HttpUrlConnection::new(url, engine());
    match connection.response_code() {
        Err(ConnectionError::Request(err)) => {
            assert_eq!(err.kind(), RequestErrorKind::Connect);
            assert!(err.is_immediately_retryable());
        }
        other => panic!("expected a connect failure, got {other:?}"),
    }
}

#[test]
fn test_invalid_header_fails_connect() {
    let server = mockito::Server::new();
    let mut connection = connect(&server, "/");
    connection.set_request_property("X-Bad", "line\nbreak").unwrap();
    assert!(matches!(
        connection.connect(),
        Err(ConnectionError::InvalidHeader(_))
    ));
}
