//! Content-encoding codecs over a byte reader.
//!
//! Supports the three encodings the proxy negotiates: gzip, deflate
//! (raw DEFLATE, at best compression), and zstd (default level).

use std::io::{self, Read};

use flate2::read::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder};
use flate2::Compression;

/// The encodings the proxy can produce, in server preference order.
pub const ENCODINGS: &[&str] = &["zstd", "gzip", "deflate"];

/// Is `name` one of [`ENCODINGS`]?
#[must_use]
pub fn supported(name: &str) -> bool {
    ENCODINGS.contains(&name)
}

fn unsupported(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported encoding: {name}"),
    )
}

/// Returns a reader producing the `algorithm`-encoded bytes of `reader`.
///
/// # Errors
///
/// Fails with `unsupported encoding` for unknown algorithms, and passes
/// zstd context-creation errors.
pub fn compress<'a, R: Read + 'a>(
    reader: R,
    algorithm: &str,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match algorithm {
        "deflate" => Box::new(DeflateEncoder::new(reader, Compression::best())),
        "gzip" => Box::new(GzEncoder::new(reader, Compression::default())),
        "zstd" => Box::new(zstd::stream::read::Encoder::new(reader, 0)?),
        other => return Err(unsupported(other)),
    })
}

/// The inverse of [`compress`].
///
/// # Errors
///
/// Fails with `unsupported encoding` for unknown algorithms.
pub fn decompress<'a, R: Read + 'a>(
    reader: R,
    algorithm: &str,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match algorithm {
        "deflate" => Box::new(DeflateDecoder::new(reader)),
        "gzip" => Box::new(GzDecoder::new(reader)),
        "zstd" => Box::new(zstd::stream::read::Decoder::new(reader)?),
        other => return Err(unsupported(other)),
    })
}

/// [`compress`] from a byte slice to a `Vec`.
pub fn compress_bytes(data: &[u8], algorithm: &str) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    compress(data, algorithm)?.read_to_end(&mut out)?;
    Ok(out)
}

/// [`decompress`] from a byte slice to a `Vec`.
pub fn decompress_bytes(data: &[u8], algorithm: &str) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2 + 64);
    decompress(data, algorithm)?.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: &[u8] = b"A reasonably repetitive payload payload payload for the codecs.";

    #[test]
    fn round_trips() {
        for algorithm in ENCODINGS {
            let encoded = compress_bytes(DATA, algorithm).unwrap();
            assert_ne!(encoded, DATA, "{algorithm} left the data untouched");
            let decoded = decompress_bytes(&encoded, algorithm).unwrap();
            assert_eq!(decoded, DATA, "{algorithm} did not round-trip");
        }
    }

    #[test]
    fn unknown_algorithm() {
        let err = decompress_bytes(DATA, "br").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("unsupported encoding"));
        assert!(compress_bytes(DATA, "lzma").is_err());
    }
}
