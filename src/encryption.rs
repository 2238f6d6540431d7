//! Encryption for incoming traffic, implemented through streams.
//!
//! Based on [`rustls`] through [`tokio_rustls`]. [`Encryption`] implements both
//! [`AsyncRead`] and [`AsyncWrite`] to enable seamless integration with the
//! [`tokio`] runtime, regardless of whether the connection is encrypted.

use crate::prelude::{networking::*, *};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::ReadBuf;
use tokio_rustls::TlsAcceptor;

/// An optionally encrypted stream.
#[derive(Debug)]
pub enum Encryption {
    /// A TLS encrypted TCP stream.
    TcpTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// An unencrypted TCP stream for use with non-secure HTTP.
    Tcp(TcpStream),
}
impl Encryption {
    /// Creates a new [`Encryption`] from a TCP `stream`.
    ///
    /// Performs the TLS handshake if `server_config` is [`Some`].
    ///
    /// # Errors
    ///
    /// Will return an error if the TLS handshake failed.
    pub async fn new_tcp(
        stream: TcpStream,
        server_config: Option<&Arc<rustls::ServerConfig>>,
    ) -> io::Result<Self> {
        match server_config {
            None => Ok(Self::Tcp(stream)),
            Some(config) => {
                let acceptor = TlsAcceptor::from(Arc::clone(config));
                let stream = acceptor.accept(stream).await?;
                Ok(Self::TcpTls(Box::new(stream)))
            }
        }
    }

    /// Gets the agreed upon ALPN protocol.
    ///
    /// If the underlying stream is not TLS, this function returns `None`.
    /// Else, a value of `None` means no protocol was agreed
    /// (because no protocols were offered or accepted by the peer).
    #[inline]
    #[must_use]
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Self::TcpTls(s) => s.get_ref().1.alpn_protocol(),
            Self::Tcp(_) => None,
        }
    }
    /// Is the underlying stream encrypted?
    #[inline]
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::TcpTls(_))
    }
}
impl AsyncRead for Encryption {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::TcpTls(tls) => Pin::new(tls).poll_read(cx, buf),
        }
    }
}
impl AsyncWrite for Encryption {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::TcpTls(tls) => Pin::new(tls).poll_write(cx, buf),
        }
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::TcpTls(tls) => Pin::new(tls).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::TcpTls(tls) => Pin::new(tls).poll_shutdown(cx),
        }
    }
}
