//! Serialising responses in the protocol the request arrived on, with the
//! negotiated content encoding.
//!
//! The [`Reply`] builder guarantees the required headers are present and
//! that [`RESERVED_HEADERS`] supplied by callers are stripped exactly once.

use crate::prelude::{networking::*, *};
use crate::{compression, error, h2};

/// Header names the writer owns; caller-supplied copies are dropped.
pub const RESERVED_HEADERS: &[&str] = &[
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "alt-svc",
    "server",
    "content-type",
    "date",
    "vary",
];

const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// A response before protocol framing.
#[derive(Debug)]
#[must_use]
pub struct Reply {
    /// Response status.
    pub status: StatusCode,
    /// Identity (unencoded) body.
    pub body: Bytes,
    /// `content-type`; `text/html; charset=utf-8` when [`None`].
    pub content_type: Option<String>,
    /// Additional headers, merged lowercase with [`RESERVED_HEADERS`] dropped.
    pub headers: HeaderMap,
}
impl Reply {
    /// Creates a reply with `status` and `body`.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: None,
            headers: HeaderMap::new(),
        }
    }
    /// The minimal HTML error page for `status`.
    pub fn error(status: StatusCode) -> Self {
        Self::new(status, error::error_html(status))
    }
    /// Sets the `content-type`.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
    /// Replaces the additional headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Picks the content encoding for a response from the client's
/// `accept-encoding`. The value `*` expands to `zstd, gzip, deflate`;
/// the first server-preferred encoding the client accepts wins.
#[must_use]
pub fn negotiate_encoding(accept_encoding: Option<&str>) -> Option<&'static str> {
    let accept = accept_encoding?.trim();
    if accept.is_empty() {
        return None;
    }
    let accept = if accept == "*" {
        "zstd, gzip, deflate"
    } else {
        accept
    };
    let accepted: Vec<&str> = accept
        .split(',')
        .map(|enc| enc.trim().split(';').next().unwrap_or("").trim())
        .collect();
    compression::ENCODINGS
        .iter()
        .find(|enc| accepted.contains(*enc))
        .copied()
}

fn merged_extra_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut merged = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if RESERVED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            merged.push((name, value.to_string()));
        }
    }
    merged
}

/// Serialises and sends `reply` on `stream`, framed for the protocol
/// `request` arrived on.
///
/// HTTP/1.x responses advertise `connection: keep-alive` but the caller
/// closes the connection after this returns; HTTP/2 responses end their
/// stream with the DATA frame.
///
/// # Errors
///
/// Passes errors from writing to the stream.
pub async fn send<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Request,
    reply: Reply,
    config: &Config,
) -> io::Result<()> {
    let encoding = negotiate_encoding(request.header("accept-encoding"));

    let body: Bytes = match encoding {
        Some(encoding) if !reply.body.is_empty() => {
            match compression::compress_bytes(&reply.body, encoding) {
                Ok(encoded) => Bytes::from(encoded),
                Err(err) => {
                    error!("Error compressing response: {err}");
                    Bytes::clone(&reply.body)
                }
            }
        }
        _ => Bytes::clone(&reply.body),
    };
    // an encoding is only declared when the body was actually encoded
    let encoding = encoding.filter(|_| !reply.body.is_empty());

    let content_type = reply
        .content_type
        .as_deref()
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    let server = config.server_header();
    let date = httpdate::fmt_http_date(SystemTime::now());
    let extra = merged_extra_headers(&reply.headers);

    if request.version == Version::HTTP_2 {
        let Some(stream_id) = request.stream_id else {
            return Ok(());
        };
        let status = reply.status.as_u16().to_string();
        let length = body.len().to_string();
        let mut fields: Vec<(&str, &str)> = vec![
            (":status", &status),
            ("server", &server),
            ("content-length", &length),
            ("content-type", content_type),
            ("vary", "Accept-Encoding"),
            ("date", &date),
        ];
        if let Some(encoding) = encoding {
            fields.push(("content-encoding", encoding));
        }
        for (name, value) in &extra {
            fields.push((name, value));
        }
        let block = crate::hpack::encode(fields);
        return h2::write_response(stream, stream_id, &block, &body).await;
    }

    let mut head = String::with_capacity(256);
    head.push_str("HTTP/1.1 ");
    head.push_str(&reply.status.as_u16().to_string());
    if let Some(reason) = reply.status.canonical_reason() {
        head.push(' ');
        head.push_str(reason);
    }
    head.push_str("\r\n");
    head.push_str(&format!("server: {server}\r\n"));
    head.push_str("connection: keep-alive\r\n");
    head.push_str(&format!("content-length: {}\r\n", body.len()));
    head.push_str(&format!("content-type: {content_type}\r\n"));
    head.push_str("vary: Accept-Encoding\r\n");
    head.push_str(&format!("date: {date}\r\n"));
    if let Some(encoding) = encoding {
        head.push_str(&format!("content-encoding: {encoding}\r\n"));
    }
    for (name, value) in &extra {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}
