//! The plaintext-to-TLS redirector on port 80.
//!
//! Every request is answered with `301 Moved Permanently` to
//! `https://<host><path>`. The request body is never read; this is fine
//! for GET and HEAD, and preserved for everything else.

use crate::prelude::{networking::*, *};

/// Read and write deadline per redirect connection.
const DEADLINE: Duration = Duration::from_secs(5);

/// Accepts connections on `port` forever, redirecting each to HTTPS.
///
/// # Errors
///
/// Fails when the port cannot be bound; per-connection failures are
/// logged and never take the listener down.
pub async fn run(port: u16) -> io::Result<()> {
    let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await?;
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    if let Err(err) = handle(stream).await {
                        debug!("Redirect connection failed: {err}");
                    }
                });
            }
            Err(err) => error!("Failed to accept redirect connection: {err}"),
        }
    }
}

async fn handle(stream: TcpStream) -> io::Result<()> {
    let mut stream = BufReader::new(stream);

    let (path, host) = timeout(DEADLINE, read_head(&mut stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "redirect read deadline"))??;

    let response = match host {
        None => "HTTP/1.1 400 Bad Request\r\n\r\n".to_string(),
        Some(host) => format!(
            "HTTP/1.1 301 Moved Permanently\r\n\
             server: {SERVER_NAME}/{VERSION}\r\n\
             connection: close\r\n\
             date: {date}\r\n\
             location: https://{host}{path}\r\n\
             \r\n",
            date = httpdate::fmt_http_date(SystemTime::now()),
        ),
    };
    timeout(DEADLINE, async {
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "redirect write deadline"))?
}

async fn read_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<(String, Option<String>)> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let path = line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut host = None;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await.unwrap_or(0);
        if read == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                host = Some(value.trim().to_string());
            }
        }
    }
    Ok((path, host))
}
