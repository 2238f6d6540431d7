//! Iridium: a TLS-terminating HTTP reverse proxy and static content
//! server with an in-memory edge cache and a CAPTCHA-capable WAF.
//!
//! The crate is structured around one task per accepted connection:
//! [`run`] binds the listening socket (TLS with ALPN `h2`/`http/1.1` on
//! 443 when certificate material is configured, plain HTTP on 80
//! otherwise), every connection parses one request through [`parse`] or
//! [`h2`], and [`dispatch`] produces the response.

pub mod cache;
pub mod cert;
pub mod compression;
pub mod config;
pub mod dispatch;
pub mod encryption;
pub mod error;
pub mod h2;
pub mod hpack;
pub mod host;
pub mod logging;
pub mod minify;
pub mod parse;
pub mod prelude;
pub mod redirect;
pub mod response;
pub mod seal;
pub mod upstream;
pub mod waf;

use prelude::{networking::*, *};

pub use dispatch::Context;
pub use encryption::Encryption;
pub use parse::Request;

/// The server product name.
pub const SERVER_NAME: &str = "Iridium";
/// The server version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A buffered, optionally encrypted connection. Reads are buffered;
/// writes pass straight through.
pub type Stream = BufReader<Encryption>;

/// The deadline for reading one request off an idle connection.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The ALPN protocols offered on TLS listeners, preferred first.
#[must_use]
pub fn alpn() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

/// Where the proxy binds its sockets. The defaults are the production
/// ports; tests override them (0 picks a free port).
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// TLS port, used when certificate material is configured.
    pub https_port: u16,
    /// Plain port: the main listener without TLS, the redirector with.
    pub http_port: u16,
    /// Spawn the plaintext redirector alongside a TLS listener.
    pub redirect: bool,
}
impl Default for RunConfig {
    fn default() -> Self {
        Self {
            https_port: 443,
            http_port: 80,
            redirect: true,
        }
    }
}
impl RunConfig {
    /// The production defaults: 443 with TLS, 80 without.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Custom ports, with the redirector disabled. For tests.
    #[must_use]
    pub fn with_ports(https_port: u16, http_port: u16) -> Self {
        Self {
            https_port,
            http_port,
            redirect: false,
        }
    }
}

/// Builds the TLS server configuration from `tls.cert_file` and
/// `tls.key_file`: ALPN `h2` + `http/1.1`, minimum TLS 1.2.
/// Returns [`None`] when no certificate material is configured.
///
/// # Errors
///
/// Fails when the files cannot be read or contain no usable material.
pub fn tls_server_config(config: &Config) -> io::Result<Option<Arc<rustls::ServerConfig>>> {
    if config.tls.cert_file.is_empty() || config.tls.key_file.is_empty() {
        return Ok(None);
    }
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(std::fs::File::open(
        &config.tls.cert_file,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(std::fs::File::open(
        &config.tls.key_file,
    )?))?
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key in key file"))?;

    let mut tls = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    tls.alpn_protocols = alpn();
    Ok(Some(Arc::new(tls)))
}

/// Binds the listening socket and spawns the accept loop (and, for TLS,
/// the plaintext redirector). Returns the bound address and the accept
/// task's handle.
///
/// # Errors
///
/// Fails when the socket cannot be bound or the TLS material is invalid.
pub async fn spawn(
    ctx: Arc<Context>,
    run_config: RunConfig,
) -> io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let tls = tls_server_config(&ctx.config)?;

    let port = if tls.is_some() {
        run_config.https_port
    } else {
        run_config.http_port
    };
    let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await?;
    let addr = listener.local_addr()?;

    if tls.is_some() && run_config.redirect {
        let http_port = run_config.http_port;
        tokio::spawn(async move {
            if let Err(err) = redirect::run(http_port).await {
                error!("HTTP redirector failed: {err}");
            }
        });
    }

    let handle = tokio::spawn(accept(listener, ctx, tls));
    Ok((addr, handle))
}

/// Runs the proxy forever on `run_config`'s ports.
///
/// # Errors
///
/// Fails when binding fails; accepted-connection failures are logged,
/// never fatal.
pub async fn run(ctx: Arc<Context>, run_config: RunConfig) -> io::Result<()> {
    let (addr, handle) = spawn(ctx, run_config).await?;
    println!("{SERVER_NAME} is running on port {}", addr.port());
    handle
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}

async fn accept(
    listener: TcpListener,
    ctx: Arc<Context>,
    tls: Option<Arc<rustls::ServerConfig>>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let ctx = Arc::clone(&ctx);
                let tls = tls.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(socket, addr, &ctx, tls.as_ref()).await {
                        debug!("Connection from {addr} failed: {err}");
                    }
                });
            }
            Err(err) => {
                error!("Failed to accept connection: {err}");
            }
        }
    }
}

/// Handles one accepted connection: optional TLS handshake, one request
/// parsed in the negotiated protocol, one dispatched response, close.
pub(crate) async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    ctx: &Context,
    tls: Option<&Arc<rustls::ServerConfig>>,
) -> io::Result<()> {
    let encrypted = Encryption::new_tcp(socket, tls).await?;
    let alpn_h2 = encrypted.alpn_protocol() == Some(b"h2".as_slice());
    let scheme = if encrypted.is_tls() { "https" } else { "http" };
    let mut stream: Stream = BufReader::new(encrypted);

    let request = if alpn_h2 {
        match timeout(READ_TIMEOUT, h2::accept(&mut stream, false)).await {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Ok(()),
        }
    } else {
        match timeout(READ_TIMEOUT, parse::read_request(&mut stream)).await {
            Ok(Ok(parse::RequestOutcome::Request(request))) => request,
            Ok(Ok(parse::RequestOutcome::H2PriorKnowledge)) => {
                h2::accept(&mut stream, true).await.map_err(io::Error::from)?
            }
            Ok(Err(parse::Error::UnexpectedEnd)) => return Ok(()),
            Ok(Err(err)) => {
                // malformed request: answer 400, then close
                ctx.logs.error(&err);
                let placeholder = Request::empty();
                response::send(
                    &mut stream,
                    &placeholder,
                    Reply::error(StatusCode::BAD_REQUEST),
                    &ctx.config,
                )
                .await?;
                let _ = stream.shutdown().await;
                // drain what the client already sent so the close is graceful
                let _ = timeout(Duration::from_millis(100), async {
                    let mut sink = [0; 512];
                    while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                })
                .await;
                return Ok(());
            }
            Err(_) => return Ok(()),
        }
    };

    dispatch::handle(&mut stream, request, addr, scheme, ctx).await?;
    stream.shutdown().await
}
