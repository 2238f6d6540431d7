//! General parsing complying to the HTTP standards.
//!
//! This is where HTTP/1.x requests and responses are read from the wire:
//! the request line, lowercased headers, and chunked or `content-length`
//! delimited bodies. The [`range_bounds`] parser and the cookie and
//! form-encoding helpers also live here.

use crate::prelude::{networking::*, *};

/// Supported request methods, as they appear on the request line.
pub const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];
/// Supported protocol versions, as they appear on the request line.
pub const VERSIONS: &[&str] = &["HTTP/1.0", "HTTP/1.1", "HTTP/2.0"];

/// Upper bound on a single header line; longer lines abort the request.
const MAX_LINE_LEN: usize = 16 * 1024;

/// A general error from parsing.
#[derive(Debug)]
pub enum Error {
    /// The stream ended before a complete message was read.
    UnexpectedEnd,
    /// The request line did not have the `METHOD TARGET VERSION` shape.
    MalformedRequestLine,
    /// The method is not one of [`METHODS`].
    UnsupportedMethod,
    /// The version is not one of [`VERSIONS`].
    UnsupportedVersion,
    /// The status line of a response could not be parsed.
    MalformedStatusLine,
    /// A chunk size line was not valid hexadecimal.
    MalformedChunk,
    /// The `content-length` header was not an integer.
    InvalidContentLength,
    /// A header or chunk line exceeded [`MAX_LINE_LEN`].
    LineTooLong,
    /// An input-output error occurred while reading.
    Io(io::Error),
}
impl Error {
    /// Gets a string representation of [`Error`].
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnexpectedEnd => "stream is exhausted",
            Self::MalformedRequestLine => "malformed request",
            Self::UnsupportedMethod => "unsupported HTTP method",
            Self::UnsupportedVersion => "unsupported HTTP version",
            Self::MalformedStatusLine => "malformed response",
            Self::MalformedChunk => "malformed chunk size",
            Self::InvalidContentLength => "content-length is not an integer",
            Self::LineTooLong => "header line is too long",
            Self::Io(_) => "io error while reading",
        }
    }
}
impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Self::UnexpectedEnd;
        }
        Self::Io(err)
    }
}
impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let message = err.as_str();
        match err {
            Error::Io(io) => io,
            Error::UnexpectedEnd => io::Error::new(io::ErrorKind::BrokenPipe, message),
            _ => io::Error::new(io::ErrorKind::InvalidData, message),
        }
    }
}
impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl std::error::Error for Error {}

/// One HTTP exchange turn, request- or response-shaped.
///
/// Invariants: header names are lowercase with values trimmed;
/// `status` is only populated on response-shaped instances;
/// `stream_id` is only present for HTTP/2 and is then odd and non-zero.
#[derive(Debug, Clone)]
pub struct Request {
    /// Protocol version of the exchange.
    pub version: Version,
    /// The request method.
    pub method: Method,
    /// The raw target path, including any query.
    pub path: String,
    /// Lowercase header map. Duplicates are last-wins.
    pub headers: HeaderMap,
    /// The body, fully buffered. Possibly empty.
    pub body: Bytes,
    /// Status code, for response-shaped instances.
    pub status: Option<StatusCode>,
    /// HTTP/2 stream this request arrived on.
    pub stream_id: Option<u32>,
}
impl Request {
    /// An empty HTTP/1.1 GET. Used as the base when building
    /// requests from decoded header blocks.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: Version::HTTP_11,
            method: Method::GET,
            path: String::from("/"),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            status: None,
            stream_id: None,
        }
    }
    /// Gets a header value as a `&str`, if present and valid UTF-8.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
    /// The `host` header, set for every parsed request
    /// (derived from `:authority` on HTTP/2).
    #[inline]
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }
    /// The version as it is written on a request line.
    #[must_use]
    pub fn version_str(&self) -> &'static str {
        match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_2 => "HTTP/2.0",
            _ => "HTTP/1.1",
        }
    }
    /// Serialises the request line, headers, and body as an HTTP/1.1 message.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(self.path.len() + self.body.len() + 256);
        bytes.extend_from_slice(self.method.as_str().as_bytes());
        bytes.extend_from_slice(b" ");
        bytes.extend_from_slice(self.path.as_bytes());
        bytes.extend_from_slice(b" ");
        bytes.extend_from_slice(self.version_str().as_bytes());
        bytes.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            bytes.extend_from_slice(name.as_str().as_bytes());
            bytes.extend_from_slice(b": ");
            bytes.extend_from_slice(value.as_bytes());
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(&self.body);
        bytes.freeze()
    }
}

/// What [`read_request`] found on the wire.
#[derive(Debug)]
pub enum RequestOutcome {
    /// A complete HTTP/1.x request.
    Request(Request),
    /// The client sent `PRI * HTTP/2.0`: hand off to the HTTP/2
    /// framer, which consumes the remaining 8 preface bytes.
    H2PriorKnowledge,
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, Error> {
    let mut line = Vec::with_capacity(64);
    loop {
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            if line.is_empty() {
                return Err(Error::UnexpectedEnd);
            }
            break;
        }
        if line.ends_with(b"\n") {
            break;
        }
        if line.len() > MAX_LINE_LEN {
            return Err(Error::LineTooLong);
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn version_from_str(version: &str) -> Option<Version> {
    Some(match version {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/2.0" => Version::HTTP_2,
        _ => return None,
    })
}

/// Reads header lines until a bare CRLF into a lowercase [`HeaderMap`].
///
/// A line without a `:` is dropped and logged. Names and values are trimmed.
pub async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader).await?;
        if line == "\r\n" || line == "\n" {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let Some((name, value)) = trimmed.split_once(':') else {
            warn!("Malformed header: {trimmed:?}");
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Malformed header: {trimmed:?}"),
        }
    }
    Ok(headers)
}

async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    headers: &HeaderMap,
) -> Result<Bytes, Error> {
    let transfer_encoding = headers
        .get("transfer-encoding")
        .and_then(|v| v.to_str().ok());
    if transfer_encoding.is_some_and(|te| te.eq_ignore_ascii_case("chunked")) {
        return read_chunked_body(reader).await;
    }
    if let Some(len) = headers.get("content-length") {
        let len: usize = len
            .to_str()
            .ok()
            .and_then(|l| l.trim().parse().ok())
            .ok_or(Error::InvalidContentLength)?;
        return read_content_length_body(reader, len).await;
    }
    Ok(Bytes::new())
}

/// Reads exactly `len` bytes as the message body.
pub async fn read_content_length_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    len: usize,
) -> Result<Bytes, Error> {
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Reads a `transfer-encoding: chunked` body: hex-length chunks, each
/// followed by CRLF, terminated by a zero-length chunk.
pub async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Bytes, Error> {
    let mut body = BytesMut::new();
    loop {
        let size_line = read_line(reader).await?;
        let size =
            usize::from_str_radix(size_line.trim(), 16).map_err(|_| Error::MalformedChunk)?;
        if size == 0 {
            // trailing CRLF after the last chunk
            let _ = read_line(reader).await;
            break;
        }
        let mut chunk = vec![0; size];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);
        // trailing CRLF after each chunk
        let _ = read_line(reader).await;
    }
    Ok(body.freeze())
}

/// Reads and parses an HTTP/1.x request.
///
/// A request line of `PRI * HTTP/2.0` yields
/// [`RequestOutcome::H2PriorKnowledge`] instead of a request.
///
/// # Errors
///
/// Rejects any request line not shaped `METHOD SP TARGET SP VERSION` with
/// a method in [`METHODS`] and a version in [`VERSIONS`].
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<RequestOutcome, Error> {
    let line = read_line(reader).await?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::MalformedRequestLine);
    };

    if method == "PRI" && path == "*" && version == "HTTP/2.0" {
        return Ok(RequestOutcome::H2PriorKnowledge);
    }
    if !METHODS.contains(&method) {
        return Err(Error::UnsupportedMethod);
    }
    // version_from_str accepts exactly the members of VERSIONS
    let Some(version) = version_from_str(version) else {
        return Err(Error::UnsupportedVersion);
    };

    let headers = read_headers(reader).await?;
    let body = read_body(reader, &headers).await?;

    Ok(RequestOutcome::Request(Request {
        version,
        // unwrap is ok; the method was checked against METHODS above
        method: Method::from_bytes(method.as_bytes()).unwrap(),
        path: path.to_string(),
        headers,
        body,
        status: None,
        stream_id: None,
    }))
}

/// Reads and parses an HTTP/1.x response, e.g. from an upstream origin.
///
/// Status codes 204, 304, and 1xx imply an empty body. A response with
/// neither `content-length` nor chunked framing also yields an empty body.
pub async fn read_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    path: &str,
) -> Result<Request, Error> {
    let line = read_line(reader).await?;
    let mut parts = line.split_whitespace();
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(Error::MalformedStatusLine);
    };
    if !VERSIONS.contains(&version) {
        return Err(Error::UnsupportedVersion);
    }
    let status =
        StatusCode::from_bytes(status.as_bytes()).map_err(|_| Error::MalformedStatusLine)?;

    let headers = read_headers(reader).await?;
    let body = if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        Bytes::new()
    } else {
        read_body(reader, &headers).await?
    };

    Ok(Request {
        // unwrap is ok; version was checked against VERSIONS above
        version: version_from_str(version).unwrap(),
        method: Method::GET,
        path: path.to_string(),
        headers,
        body,
        status: Some(status),
        stream_id: None,
    })
}

/// Aligns the framing headers of `request` with its fully buffered body:
/// `transfer-encoding` is dropped and `content-length` set to the body
/// length, or removed for an empty body.
pub fn set_content_length(request: &mut Request) {
    request.headers.remove("transfer-encoding");
    if request.body.is_empty() {
        request.headers.remove("content-length");
    } else {
        // unwrap is ok; an integer is a valid header value
        request.headers.insert(
            "content-length",
            HeaderValue::from_str(&request.body.len().to_string()).unwrap(),
        );
    }
}

/// The range was unsatisfiable. Maps to HTTP 416.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RangeError;

/// Parses a `range` header value of the shape `bytes=(\d*)-(\d*)` against
/// a resource of `len` bytes into inclusive `[start, end]` positions.
///
/// Suffix ranges (`bytes=-N`) take the last `min(N, len)` bytes; open-ended
/// ranges (`bytes=N-`) run to the end of the resource.
///
/// # Errors
///
/// Returns [`RangeError`] when both bounds are empty, when a bound is not
/// an integer, or when `0 ≤ start ≤ end < len` is violated.
pub fn range_bounds(header: &str, len: u64) -> Result<(u64, u64), RangeError> {
    let value = header.strip_prefix("bytes=").ok_or(RangeError)?;
    let value = value.split(',').next().unwrap_or("");
    let (start, end) = value.split_once('-').ok_or(RangeError)?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        (true, true) => Err(RangeError),
        // suffix: the last N bytes
        (true, false) => {
            let suffix: u64 = end.parse().map_err(|_| RangeError)?;
            if len == 0 {
                return Err(RangeError);
            }
            Ok((len - suffix.min(len), len - 1))
        }
        // open-ended: from start to the end of the resource
        (false, true) => {
            let start: u64 = start.parse().map_err(|_| RangeError)?;
            if start >= len {
                return Err(RangeError);
            }
            Ok((start, len - 1))
        }
        (false, false) => {
            let start: u64 = start.parse().map_err(|_| RangeError)?;
            let end: u64 = end.parse().map_err(|_| RangeError)?;
            if start > end || end >= len {
                return Err(RangeError);
            }
            Ok((start, end))
        }
    }
}

/// Parses a `cookie` header into name→value pairs.
///
/// Pairs are split on `;`, then on the first `=`; names and values are
/// trimmed. Pairs without a `=` are dropped.
#[must_use]
pub fn cookies(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in header.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            cookies.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    cookies
}

/// Formats a `set-cookie` header value.
#[must_use]
pub fn set_cookie(
    name: &str,
    value: &str,
    path: Option<&str>,
    domain: Option<&str>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
) -> String {
    let mut cookie = format!("{name}={value}");
    if let Some(path) = path {
        cookie.push_str("; Path=");
        cookie.push_str(path);
    }
    if let Some(domain) = domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if let Some(max_age) = max_age {
        cookie.push_str("; Max-Age=");
        cookie.push_str(&max_age.to_string());
    }
    if secure {
        cookie.push_str("; Secure");
    }
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    cookie
}

/// Decodes a query component: `+` becomes a space and `%XX` escapes are
/// resolved. Returns `None` on truncated or non-hex escapes.
#[must_use]
pub fn query_unescape(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

/// Parses an `application/x-www-form-urlencoded` body into a map.
/// Both names and values are [`query_unescape`]d; undecodable pairs are dropped.
#[must_use]
pub fn form(body: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in body.split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if name.is_empty() {
            continue;
        }
        if let (Some(name), Some(value)) = (query_unescape(name), query_unescape(value)) {
            map.insert(name, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8]) -> Result<RequestOutcome, Error> {
        let mut reader = BufReader::new(bytes);
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn request_line() {
        let outcome = parse(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let RequestOutcome::Request(request) = outcome else {
            panic!("expected a request");
        };
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, "/index.html");
        assert_eq!(request.version, Version::HTTP_11);
        assert_eq!(request.host(), Some("example.com"));
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_method() {
        assert!(matches!(
            parse(b"BREW /pot HTTP/1.1\r\n\r\n").await,
            Err(Error::UnsupportedMethod)
        ));
        assert!(matches!(
            parse(b"GET /pot HTTP/9.9\r\n\r\n").await,
            Err(Error::UnsupportedVersion)
        ));
        assert!(matches!(
            parse(b"GET\r\n\r\n").await,
            Err(Error::MalformedRequestLine)
        ));
    }

    #[tokio::test]
    async fn h2_prior_knowledge_handoff() {
        let outcome = parse(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await.unwrap();
        assert!(matches!(outcome, RequestOutcome::H2PriorKnowledge));
    }

    #[tokio::test]
    async fn headers_are_lowercased_and_trimmed() {
        let RequestOutcome::Request(request) = parse(
            b"GET / HTTP/1.1\r\nHost: a\r\nX-Custom-Header:   padded   \r\nnocolonhere\r\n\r\n",
        )
        .await
        .unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(request.header("x-custom-header"), Some("padded"));
        assert_eq!(request.headers.len(), 2);
    }

    #[tokio::test]
    async fn content_length_body() {
        let RequestOutcome::Request(request) =
            parse(b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap()
        else {
            panic!("expected a request");
        };
        assert_eq!(&request.body[..], b"hello");
    }

    #[tokio::test]
    async fn chunked_body() {
        let RequestOutcome::Request(request) = parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(&request.body[..], b"hello world");
    }

    #[tokio::test]
    async fn round_trip() {
        let mut request = Request::empty();
        request.method = Method::POST;
        request.path = "/api/update?force=true".to_string();
        request
            .headers
            .insert("host", HeaderValue::from_static("example.com"));
        request
            .headers
            .insert("content-length", HeaderValue::from_static("9"));
        request.body = Bytes::from_static(b"some data");

        let emitted = request.to_bytes();
        let mut reader = BufReader::new(&emitted[..]);
        let RequestOutcome::Request(parsed) = read_request(&mut reader).await.unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(parsed.method, request.method);
        assert_eq!(parsed.path, request.path);
        assert_eq!(parsed.headers, request.headers);
        assert_eq!(parsed.body, request.body);
    }

    #[tokio::test]
    async fn response_status_variants() {
        let mut reader =
            BufReader::new(&b"HTTP/1.1 200\r\nContent-Length: 2\r\n\r\nok"[..]);
        let response = read_response(&mut reader, "/").await.unwrap();
        assert_eq!(response.status, Some(StatusCode::OK));
        assert_eq!(&response.body[..], b"ok");

        // a reason phrase is accepted too, and 304 never has a body
        let mut reader =
            BufReader::new(&b"HTTP/1.1 304 Not Modified\r\nContent-Length: 2\r\n\r\n"[..]);
        let response = read_response(&mut reader, "/").await.unwrap();
        assert_eq!(response.status, Some(StatusCode::NOT_MODIFIED));
        assert!(response.body.is_empty());
    }

    #[test]
    fn range_semantics() {
        assert_eq!(range_bounds("bytes=0-0", 100), Ok((0, 0)));
        assert_eq!(range_bounds("bytes=0-99", 100), Ok((0, 99)));
        assert_eq!(range_bounds("bytes=-10", 100), Ok((90, 99)));
        assert_eq!(range_bounds("bytes=50-", 100), Ok((50, 99)));
        assert_eq!(range_bounds("bytes=99-99", 100), Ok((99, 99)));
        assert_eq!(range_bounds("bytes=100-", 100), Err(RangeError));
        assert_eq!(range_bounds("bytes=50-40", 100), Err(RangeError));
        assert_eq!(range_bounds("bytes=-", 100), Err(RangeError));
        assert_eq!(range_bounds("lines=1-2", 100), Err(RangeError));
        // suffix longer than the resource takes all of it
        assert_eq!(range_bounds("bytes=-200", 100), Ok((0, 99)));
    }

    #[test]
    fn cookie_pairs() {
        let cookies = cookies("a=1; b = 2 ;malformed; c=x=y");
        assert_eq!(cookies.get("a").unwrap(), "1");
        assert_eq!(cookies.get("b").unwrap(), "2");
        assert_eq!(cookies.get("c").unwrap(), "x=y");
        assert_eq!(cookies.len(), 3);
    }

    #[test]
    fn set_cookie_attributes() {
        let cookie = set_cookie("id", "token", Some("/"), None, Some(1800), false, true);
        assert_eq!(cookie, "id=token; Path=/; Max-Age=1800; HttpOnly");
    }

    #[test]
    fn form_decoding() {
        let form = form("response=abc%2B%2F&data=one+two&empty=");
        assert_eq!(form.get("response").unwrap(), "abc+/");
        assert_eq!(form.get("data").unwrap(), "one two");
        assert_eq!(form.get("empty").unwrap(), "");
    }
}
