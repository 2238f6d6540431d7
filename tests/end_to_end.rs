//! End-to-end scenarios against a real server on a loopback port,
//! speaking raw bytes like a client would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use iridium::cache::EdgeCache;
use iridium::config::Config;
use iridium::host::{EdgeCacheSettings, Host, Location};
use iridium::logging::Logs;
use iridium::{h2, hpack, seal, Context, RunConfig};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

async fn start(hosts: Vec<Host>, mutate: impl FnOnce(&mut Config)) -> SocketAddr {
    let mut config = Config::default();
    mutate(&mut config);
    let dir = std::env::temp_dir().join(format!(
        "iridium-e2e-{}-{}",
        std::process::id(),
        NEXT_DIR.fetch_add(1, Ordering::Relaxed)
    ));
    let logs = Logs::open(&dir, &config.logging).unwrap();
    let ctx = Arc::new(Context {
        config,
        hosts,
        cache: EdgeCache::new(),
        key: seal::Key::resolve(Some("end-to-end test key")),
        logs,
    });
    let (addr, _handle) = iridium::spawn(ctx, RunConfig::with_ports(0, 0))
        .await
        .unwrap();
    addr
}

fn location(pattern: &str) -> Location {
    Location {
        pattern: pattern.to_string(),
        content: None,
        root: None,
        proxy: None,
        headers: None,
    }
}

fn host_with(domain: &str, locations: Vec<Location>, edge_cache: EdgeCacheSettings) -> Host {
    Host {
        domain: domain.to_string(),
        locations,
        edge_cache,
    }
}

struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn exchange(addr: SocketAddr, raw: &str) -> Response {
    let mut stream = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();
    parse_response(&wire)
}

fn parse_response(wire: &[u8]) -> Response {
    let head_end = wire
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");
    let head = String::from_utf8_lossy(&wire[..head_end]).into_owned();
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("no status code");
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Response {
        status,
        headers,
        body: wire[head_end + 4..].to_vec(),
    }
}

#[tokio::test]
async fn inline_content_with_substitution() {
    let mut location = location("/");
    location.content = Some("Hello $method $path from $host over $scheme".to_string());
    let addr = start(
        vec![host_with("example.com", vec![location], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;

    let response = exchange(addr, "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"Hello GET / from example.com over http");
    assert!(response.headers["server"].starts_with("Iridium/"));
    assert_eq!(response.headers["connection"], "keep-alive");
    assert!(response.headers.contains_key("date"));
}

#[tokio::test]
async fn unknown_host_gets_the_fallback_page() {
    let addr = start(
        vec![host_with("example.com", vec![], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;
    let response = exchange(addr, "GET / HTTP/1.1\r\nHost: stranger.net\r\n\r\n").await;
    assert_eq!(response.status, 200);
    assert!(String::from_utf8_lossy(&response.body).contains("Welcome to Iridium!"));
}

#[tokio::test]
async fn missing_host_is_a_bad_request() {
    let addr = start(
        vec![host_with("example.com", vec![], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;
    let response = exchange(addr, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn first_non_matching_location_is_not_found() {
    let mut first = location("/exact");
    first.content = Some("never reached".to_string());
    let mut second = location("/*");
    second.content = Some("also never reached".to_string());
    let addr = start(
        vec![host_with("a", vec![first, second], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;
    // the second location would match, but only the first is consulted
    let response = exchange(addr, "GET /other HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(response.status, 404);
}

fn file_fixture(name: &str, contents: &[u8]) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "iridium-files-{}-{}",
        std::process::id(),
        NEXT_DIR.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), contents).unwrap();
    dir
}

#[tokio::test]
async fn file_cache_miss_then_conditional_hit() {
    let dir = file_fixture("file.css", b"body{color:red}");
    let mut files = location("/*");
    files.root = Some(dir.to_str().unwrap().to_string());
    let addr = start(
        vec![host_with(
            "a",
            vec![files],
            EdgeCacheSettings {
                enabled: true,
                duration_seconds: 60,
                extensions: vec![],
            },
        )],
        |_| {},
    )
    .await;

    let first = exchange(addr, "GET /file.css HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(first.status, 200);
    assert_eq!(first.headers["x-cache"], "MISS");
    assert_eq!(first.headers["content-type"], "text/css");
    assert_eq!(first.body, b"body{color:red}");
    let last_modified = first.headers["last-modified"].clone();

    let second = exchange(
        addr,
        &format!("GET /file.css HTTP/1.1\r\nHost: a\r\nIf-Modified-Since: {last_modified}\r\n\r\n"),
    )
    .await;
    assert_eq!(second.status, 304);
    assert_eq!(second.headers["x-cache"], "HIT");
    assert!(second.body.is_empty());
    assert!(second.headers.contains_key("age"));

    let third = exchange(addr, "GET /file.css HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(third.status, 200);
    assert_eq!(third.headers["x-cache"], "HIT");
    assert_eq!(third.body, b"body{color:red}");
}

#[tokio::test]
async fn media_byte_ranges() {
    let bytes: Vec<u8> = (0..100).collect();
    let dir = file_fixture("v.mp4", &bytes);
    let mut files = location("/*");
    files.root = Some(dir.to_str().unwrap().to_string());
    let addr = start(
        vec![host_with("a", vec![files], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;

    let response = exchange(
        addr,
        "GET /v.mp4 HTTP/1.1\r\nHost: a\r\nRange: bytes=0-9\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 206);
    assert_eq!(response.headers["content-range"], "bytes 0-9/100");
    assert_eq!(response.headers["accept-ranges"], "bytes");
    assert_eq!(response.body, &bytes[..10]);

    let tail = exchange(
        addr,
        "GET /v.mp4 HTTP/1.1\r\nHost: a\r\nRange: bytes=-10\r\n\r\n",
    )
    .await;
    assert_eq!(tail.status, 206);
    assert_eq!(tail.headers["content-range"], "bytes 90-99/100");
    assert_eq!(tail.body, &bytes[90..]);

    let bad = exchange(
        addr,
        "GET /v.mp4 HTTP/1.1\r\nHost: a\r\nRange: bytes=100-\r\n\r\n",
    )
    .await;
    assert_eq!(bad.status, 416);
}

#[tokio::test]
async fn waf_resets_library_user_agents() {
    let mut location = location("/");
    location.content = Some("protected".to_string());
    let addr = start(
        vec![host_with("a", vec![location], EdgeCacheSettings::default())],
        |config| config.waf.enabled = true,
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: a\r\nUser-Agent: curl/8.4.0\r\n\r\n")
        .await
        .unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();
    // the connection closes without a single response byte
    assert!(wire.is_empty());

    // a browser user agent is untouched while no CAPTCHA is configured
    let response = exchange(
        addr,
        "GET / HTTP/1.1\r\nHost: a\r\nUser-Agent: Mozilla/5.0 (X11; Linux x86_64)\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn waf_challenges_when_captcha_is_enabled() {
    let mut location = location("/");
    location.content = Some("protected".to_string());
    let addr = start(
        vec![host_with("a", vec![location], EdgeCacheSettings::default())],
        |config| {
            config.waf.enabled = true;
            config.waf.captcha.enabled = true;
            config.waf.captcha.provider = "hcaptcha".to_string();
            config.waf.captcha.site_key = "test-site-key".to_string();
            config.waf.captcha.secret_key = "test-secret".to_string();
        },
    )
    .await;

    let response = exchange(
        addr,
        "GET /page HTTP/1.1\r\nHost: a\r\nUser-Agent: Mozilla/5.0 (X11; Linux x86_64)\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 403);
    let page = String::from_utf8_lossy(&response.body);
    assert!(page.contains("data-sitekey=\"test-site-key\""));
    assert!(page.contains("name=\"data\""));
}

async fn read_head<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) {
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await.unwrap_or(0);
        if read == 0 || line == "\r\n" {
            break;
        }
    }
}

/// An origin that first rejects a TLS probe, then answers one plain HTTP
/// request with a gzip-encoded body.
async fn gzip_origin() -> (u16, Vec<u8>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let body = iridium::compression::compress_bytes(b"hello from the origin", "gzip").unwrap();
    let encoded = body.clone();
    tokio::spawn(async move {
        // connection 1: the TLS attempt; answer garbage so the handshake
        // fails and the proxy falls back to plain TCP
        let (mut probe, _) = listener.accept().await.unwrap();
        let mut byte = [0u8; 1];
        let _ = probe.read_exact(&mut byte).await;
        let _ = probe.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        drop(probe);

        // connection 2: the real exchange
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        read_head(&mut stream).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nCache-Control: no-store\r\n\r\n",
            encoded.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&encoded).await.unwrap();
        stream.flush().await.unwrap();
    });
    (port, body)
}

#[tokio::test]
async fn upstream_response_is_decoded() {
    let (origin_port, _) = gzip_origin().await;
    let mut proxied = location("/*");
    proxied.proxy = Some(format!("127.0.0.1:{origin_port}"));
    let addr = start(
        vec![host_with("a", vec![proxied], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;

    let response = exchange(addr, "GET /api HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(response.status, 200);
    // the gzip encoding from the origin never leaks through
    assert!(!response.headers.contains_key("content-encoding"));
    assert_eq!(response.headers["content-type"], "text/plain");
    assert_eq!(response.body, b"hello from the origin");
}

#[tokio::test]
async fn upstream_dial_failure_is_bad_gateway() {
    let unused_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut proxied = location("/*");
    proxied.proxy = Some(format!("127.0.0.1:{unused_port}"));
    let addr = start(
        vec![host_with("a", vec![proxied], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;
    let response = exchange(addr, "GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(response.status, 502);
}

#[tokio::test]
async fn h2c_prior_knowledge_stream() {
    let mut location = location("/");
    location.content = Some("h2 works".to_string());
    let addr = start(
        vec![host_with("a", vec![location], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .unwrap();
    stream.write_all(h2::PREFACE).await.unwrap();
    h2::write_frame(&mut stream, h2::frame::SETTINGS, 0, 0, &[])
        .await
        .unwrap();
    let block = hpack::encode([
        (":method", "GET"),
        (":path", "/"),
        (":scheme", "https"),
        (":authority", "a"),
    ]);
    h2::write_frame(
        &mut stream,
        h2::frame::HEADERS,
        h2::flags::END_HEADERS | h2::flags::END_STREAM,
        1,
        &block,
    )
    .await
    .unwrap();

    let mut got_headers = false;
    loop {
        let frame = h2::read_frame(&mut stream).await.unwrap();
        match frame.kind {
            h2::frame::SETTINGS => {}
            h2::frame::HEADERS => {
                assert_eq!(frame.stream_id, 1);
                assert_eq!(frame.flags, h2::flags::END_HEADERS);
                let fields = hpack::Decoder::new().decode(&frame.payload).unwrap();
                assert_eq!(fields[0], (":status".to_string(), "200".to_string()));
                got_headers = true;
            }
            h2::frame::DATA => {
                assert!(got_headers, "DATA arrived before HEADERS");
                assert_eq!(frame.stream_id, 1);
                assert_eq!(frame.flags, h2::flags::END_STREAM);
                assert_eq!(frame.payload, b"h2 works");
                break;
            }
            other => panic!("unexpected frame type {other}"),
        }
    }
}

#[tokio::test]
async fn malformed_request_line_is_bad_request() {
    let addr = start(
        vec![host_with("a", vec![], EdgeCacheSettings::default())],
        |_| {},
    )
    .await;
    let response = exchange(addr, "BREW / HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert_eq!(response.status, 400);
}
