//! The upstream proxy connector: dials the target origin, forwards the
//! decoded request as an HTTP/1.1 exchange, and reads back a normalised
//! in-memory response.
//!
//! A target with an explicit port is dialed with TLS first, falling back
//! to plain TCP when the peer clearly does not speak TLS; a bare host
//! defaults to port 80 and plain TCP. There is no connection pooling;
//! each request opens a fresh connection.

use crate::prelude::{networking::*, *};
use crate::{compression, parse};
use rustls::pki_types::ServerName;
use std::sync::LazyLock;
use tokio_rustls::TlsConnector;

/// The deadline for establishing the upstream connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(90);

/// Request headers never copied to the origin.
const STRIPPED_HEADERS: &[&str] = &["x-forwarded-for", "host"];

static TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    // unwrap is ok; the ring provider supports the default versions
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    Arc::new(config)
});

/// An error from the upstream exchange, each mapped to a response status.
#[derive(Debug)]
pub enum Error {
    /// The 90-second dial deadline passed. Maps to 504.
    DialTimeout,
    /// The target could not be reached. Maps to 502.
    Dial(io::Error),
    /// Writing the request or reading the raw response failed. Maps to 502.
    Io(io::Error),
    /// The origin spoke something that did not parse as HTTP. Maps to 500.
    Parse(parse::Error),
}
impl Error {
    /// The response status this failure turns into.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::DialTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Dial(_) | Self::Io(_) => StatusCode::BAD_GATEWAY,
            Self::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialTimeout => f.write_str("upstream dial timed out"),
            Self::Dial(err) => write!(f, "upstream dial failed: {err}"),
            Self::Io(err) => write!(f, "upstream io failed: {err}"),
            Self::Parse(err) => write!(f, "upstream response invalid: {err}"),
        }
    }
}
impl std::error::Error for Error {}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

fn split_target(target: &str) -> (&str, u16, bool) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port, true),
            Err(_) => (target, 80, false),
        },
        None => (target, 80, false),
    }
}

async fn dial(host: &str, port: u16, try_tls: bool) -> Result<Box<dyn Io>, Error> {
    let stream = TcpStream::connect((host, port)).await.map_err(Error::Dial)?;
    if !try_tls {
        return Ok(Box::new(stream));
    }

    let Ok(server_name) = ServerName::try_from(host.to_string()) else {
        return Ok(Box::new(stream));
    };
    let connector = TlsConnector::from(Arc::clone(&TLS_CONFIG));
    match connector.connect(server_name, stream).await {
        Ok(tls) => Ok(Box::new(tls)),
        Err(err) => {
            // the peer does not speak TLS on this port; retry in plain
            debug!("Upstream TLS handshake with {host}:{port} failed ({err}); retrying plain");
            let stream = TcpStream::connect((host, port)).await.map_err(Error::Dial)?;
            Ok(Box::new(stream))
        }
    }
}

fn proxy_headers(request: &Request, host: &str, client_ip: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(request.headers.len() + 3);
    for (name, value) in &request.headers {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    if let Ok(host) = HeaderValue::from_str(host) {
        headers.insert("host", host);
    }
    if let Ok(ip) = HeaderValue::from_str(client_ip) {
        headers.insert("x-forwarded-for", ip);
    }
    headers.insert(
        "accept-encoding",
        HeaderValue::from_static("gzip, deflate, zstd"),
    );
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers
}

/// Forwards `request` to `target` (`host[:port]`) and returns the origin's
/// response with any `content-encoding` in {gzip, deflate, zstd} already
/// decoded and the encoding header cleared. Re-encoding is decided
/// downstream by the response writer.
///
/// # Errors
///
/// See [`Error`] for the status mapping.
pub async fn forward(request: &Request, target: &str, client_ip: &str) -> Result<Request, Error> {
    let (host, port, try_tls) = split_target(target);

    let stream = timeout(DIAL_TIMEOUT, dial(host, port, try_tls))
        .await
        .map_err(|_| Error::DialTimeout)??;

    let mut proxy_request = request.clone();
    proxy_request.version = Version::HTTP_11;
    proxy_request.stream_id = None;
    proxy_request.headers = proxy_headers(request, host, client_ip);
    parse::set_content_length(&mut proxy_request);

    let mut stream = BufReader::new(stream);
    stream
        .write_all(&proxy_request.to_bytes())
        .await
        .map_err(Error::Io)?;
    stream.flush().await.map_err(Error::Io)?;

    let mut response = parse::read_response(&mut stream, &request.path)
        .await
        .map_err(|err| match err {
            parse::Error::Io(io) => Error::Io(io),
            err => Error::Parse(err),
        })?;

    if let Some(encoding) = response
        .header("content-encoding")
        .map(str::to_ascii_lowercase)
    {
        if compression::supported(&encoding) {
            match compression::decompress_bytes(&response.body, &encoding) {
                Ok(decoded) => {
                    response.body = Bytes::from(decoded);
                    response.headers.remove("content-encoding");
                }
                Err(err) => return Err(Error::Parse(parse::Error::Io(err))),
            }
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_splitting() {
        assert_eq!(split_target("origin.example"), ("origin.example", 80, false));
        assert_eq!(split_target("origin.example:8080"), ("origin.example", 8080, true));
        assert_eq!(split_target("origin.example:nope"), ("origin.example:nope", 80, false));
    }

    #[test]
    fn header_rewrite() {
        let mut request = Request::empty();
        request
            .headers
            .insert("host", HeaderValue::from_static("public.example"));
        request
            .headers
            .insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9"));
        request
            .headers
            .insert("accept-encoding", HeaderValue::from_static("br"));
        request
            .headers
            .insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));

        let headers = proxy_headers(&request, "origin.internal", "1.2.3.4");
        assert_eq!(headers.get("host").unwrap(), "origin.internal");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "1.2.3.4");
        assert_eq!(headers.get("accept-encoding").unwrap(), "gzip, deflate, zstd");
        assert_eq!(headers.get("connection").unwrap(), "keep-alive");
        assert_eq!(headers.get("user-agent").unwrap(), "Mozilla/5.0");
    }

    #[tokio::test]
    async fn refused_connection_maps_to_bad_gateway() {
        let request = Request::empty();
        // bind-then-drop leaves a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = forward(&request, &format!("127.0.0.1:{port}"), "1.2.3.4")
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
