//! The server-side HTTP/2 receive path: enough framing to reach the first
//! HEADERS frame of a connection and to answer it.
//!
//! Frames carry a 9-byte header: a 24-bit payload length, an 8-bit type,
//! 8 bits of flags, one reserved bit, and a 31-bit stream identifier, all
//! big-endian. One HEADERS frame with END_HEADERS set is assumed;
//! CONTINUATION frames and subsequent streams are not handled.

use crate::hpack;
use crate::prelude::{networking::*, *};

/// The 24-byte constant starting every HTTP/2 connection.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
/// The tail of [`PREFACE`] remaining after the HTTP/1.x framer has
/// consumed the `PRI * HTTP/2.0\r\n` request line.
pub const PREFACE_REMAINDER: &[u8] = b"\r\nSM\r\n\r\n";

/// Frame types (RFC 7540 §6).
pub mod frame {
    /// DATA
    pub const DATA: u8 = 0x0;
    /// HEADERS
    pub const HEADERS: u8 = 0x1;
    /// SETTINGS
    pub const SETTINGS: u8 = 0x4;
    /// PING
    pub const PING: u8 = 0x6;
    /// GOAWAY
    pub const GOAWAY: u8 = 0x7;
    /// WINDOW_UPDATE
    pub const WINDOW_UPDATE: u8 = 0x8;
    /// CONTINUATION
    pub const CONTINUATION: u8 = 0x9;
}
/// Frame flags.
pub mod flags {
    /// ACK, on SETTINGS and PING frames
    pub const ACK: u8 = 0x1;
    /// END_STREAM, on HEADERS and DATA frames
    pub const END_STREAM: u8 = 0x1;
    /// END_HEADERS, on HEADERS frames
    pub const END_HEADERS: u8 = 0x4;
    /// PADDED, on HEADERS and DATA frames
    pub const PADDED: u8 = 0x8;
    /// PRIORITY, on HEADERS frames
    pub const PRIORITY: u8 = 0x20;
}

/// Largest frame payload accepted before the connection is aborted.
const MAX_FRAME_LEN: usize = 1 << 20;

/// An error from the HTTP/2 framer. Each aborts the connection.
#[derive(Debug)]
pub enum Error {
    /// The client preface was not [`PREFACE`].
    BadPreface,
    /// The first frame was not a SETTINGS frame on stream 0.
    ExpectedSettings,
    /// The `:scheme` pseudo-header was neither `http` nor `https`.
    UnsupportedScheme(String),
    /// A HEADERS frame was malformed (padding or priority fields
    /// overrunning the payload).
    MalformedHeaders,
    /// A frame payload exceeded [`MAX_FRAME_LEN`].
    FrameTooLarge,
    /// The header block could not be decoded.
    Hpack(hpack::Error),
    /// An input-output error occurred.
    Io(io::Error),
}
impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
impl From<hpack::Error> for Error {
    #[inline]
    fn from(err: hpack::Error) -> Self {
        Self::Hpack(err)
    }
}
impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::BadPreface => io::Error::new(io::ErrorKind::InvalidData, "bad preface"),
            Error::ExpectedSettings => {
                io::Error::new(io::ErrorKind::InvalidData, "expected SETTINGS on stream 0")
            }
            Error::UnsupportedScheme(scheme) => io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported scheme: {scheme}"),
            ),
            Error::MalformedHeaders => {
                io::Error::new(io::ErrorKind::InvalidData, "malformed HEADERS frame")
            }
            Error::FrameTooLarge => {
                io::Error::new(io::ErrorKind::InvalidData, "frame exceeds size limit")
            }
            Error::Hpack(e) => io::Error::new(io::ErrorKind::InvalidData, e.as_str()),
            Error::Io(io) => io,
        }
    }
}

/// A decoded frame header and its payload.
#[derive(Debug)]
pub struct Frame {
    /// Frame type, see [`frame`].
    pub kind: u8,
    /// Frame flags, see [`flags`].
    pub flags: u8,
    /// Stream identifier with the reserved bit cleared.
    pub stream_id: u32,
    /// The raw payload.
    pub payload: Vec<u8>,
}

/// Reads one frame.
///
/// # Errors
///
/// Fails on input-output errors and payloads over [`MAX_FRAME_LEN`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, Error> {
    let mut header = [0; 9];
    reader.read_exact(&mut header).await?;

    let len = usize::from(header[0]) << 16 | usize::from(header[1]) << 8 | usize::from(header[2]);
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge);
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        kind: header[3],
        flags: header[4],
        stream_id: u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff,
        payload,
    })
}

/// Writes one frame. The reserved stream-id bit is always cleared.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: u8,
    frame_flags: u8,
    stream_id: u32,
    payload: &[u8],
) -> io::Result<()> {
    let len = payload.len() as u32;
    let mut header = [0; 9];
    header[0] = (len >> 16) as u8;
    header[1] = (len >> 8) as u8;
    header[2] = len as u8;
    header[3] = kind;
    header[4] = frame_flags;
    header[5..9].copy_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await
}

/// Parses a SETTINGS payload into (identifier, value) pairs.
#[must_use]
pub fn parse_settings(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(6)
        .map(|chunk| {
            (
                u16::from_be_bytes([chunk[0], chunk[1]]),
                u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
            )
        })
        .collect()
}

/// Accepts an HTTP/2 connection up to its first HEADERS frame and returns
/// the decoded request.
///
/// With `prior_knowledge` the HTTP/1.x framer has already consumed the
/// `PRI * HTTP/2.0` request line and only [`PREFACE_REMAINDER`] is read;
/// otherwise (h2 negotiated over ALPN) the full 24-byte preface is read.
///
/// In both cases: the client SETTINGS frame is received on stream 0, an
/// empty server SETTINGS and a SETTINGS ACK are sent, and frames are then
/// processed until a HEADERS frame arrives. PING frames are echoed with
/// ACK, WINDOW_UPDATE frames are ignored, and further SETTINGS frames are
/// acknowledged.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    prior_knowledge: bool,
) -> Result<Request, Error> {
    let expected: &[u8] = if prior_knowledge {
        PREFACE_REMAINDER
    } else {
        PREFACE
    };
    let mut preface = vec![0; expected.len()];
    stream.read_exact(&mut preface).await?;
    if preface != expected {
        return Err(Error::BadPreface);
    }

    let first = read_frame(stream).await?;
    if first.kind != frame::SETTINGS || first.stream_id != 0 {
        return Err(Error::ExpectedSettings);
    }
    let settings = parse_settings(&first.payload);
    debug!("Client sent {} HTTP/2 settings", settings.len());

    write_frame(stream, frame::SETTINGS, 0, 0, &[]).await?;
    write_frame(stream, frame::SETTINGS, flags::ACK, 0, &[]).await?;

    loop {
        let frame = read_frame(stream).await?;
        match frame.kind {
            frame::SETTINGS => {
                if frame.flags & flags::ACK == 0 {
                    write_frame(stream, frame::SETTINGS, flags::ACK, 0, &[]).await?;
                }
            }
            frame::HEADERS => return request_from_headers(&frame),
            frame::PING => {
                write_frame(stream, frame::PING, flags::ACK, 0, &frame.payload).await?;
            }
            frame::WINDOW_UPDATE => {}
            kind => debug!("Unhandled frame type {kind}"),
        }
    }
}

fn request_from_headers(frame: &Frame) -> Result<Request, Error> {
    let mut block = frame.payload.as_slice();
    if frame.flags & flags::PADDED != 0 {
        let pad = usize::from(*block.first().ok_or(Error::MalformedHeaders)?);
        block = block
            .get(1..block.len().checked_sub(pad).ok_or(Error::MalformedHeaders)?)
            .ok_or(Error::MalformedHeaders)?;
    }
    if frame.flags & flags::PRIORITY != 0 {
        // 4 bytes of stream dependency and 1 of weight
        block = block.get(5..).ok_or(Error::MalformedHeaders)?;
    }

    let fields = hpack::Decoder::new().decode(block)?;

    let mut request = Request::empty();
    request.version = Version::HTTP_2;
    request.stream_id = Some(frame.stream_id);
    for (name, value) in fields {
        match name.as_str() {
            ":method" => {
                request.method =
                    Method::from_bytes(value.as_bytes()).unwrap_or(Method::GET);
            }
            ":path" => request.path = value,
            ":scheme" => {
                if value != "http" && value != "https" {
                    return Err(Error::UnsupportedScheme(value));
                }
            }
            ":authority" => {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    request.headers.insert("host", value);
                }
            }
            _ if name.starts_with(':') => {}
            _ => {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(&value),
                ) {
                    request.headers.insert(name, value);
                }
            }
        }
    }
    Ok(request)
}

/// Sends a response on `stream_id`: one HEADERS frame carrying
/// `header_block` with END_HEADERS, then one DATA frame with END_STREAM.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    stream_id: u32,
    header_block: &[u8],
    body: &[u8],
) -> io::Result<()> {
    write_frame(
        writer,
        frame::HEADERS,
        flags::END_HEADERS,
        stream_id,
        header_block,
    )
    .await?;
    write_frame(writer, frame::DATA, flags::END_STREAM, stream_id, body).await
}
