//! The per-request dispatcher: validates the authority, resolves the
//! host, runs the WAF, and produces the response from the edge cache,
//! inline content, the filesystem, or an upstream origin.
//!
//! The location walk consults only the first examined location: a
//! non-matching first location yields 404 immediately. This mirrors the
//! deployed router and is preserved on purpose.

use crate::prelude::{networking::*, *};
use crate::{cache, error, host, logging, parse, response, seal, upstream, waf};
use crate::cache::CachedFile;
use crate::waf::Verdict;

/// Shared state of a running proxy, created once at startup and passed to
/// every connection task.
#[derive(Debug)]
pub struct Context {
    /// The parsed configuration record.
    pub config: Config,
    /// All virtual hosts, immutable after startup.
    pub hosts: Vec<Host>,
    /// The process-wide edge cache.
    pub cache: EdgeCache,
    /// The sealed-token key.
    pub key: seal::Key,
    /// Access, error, and WAF log sinks.
    pub logs: logging::Logs,
}

/// Serves one parsed request on `stream` and returns when the response
/// (if any) has been written. `scheme` is `https` when the connection is
/// TLS-terminated.
pub async fn handle<S: AsyncWrite + Unpin>(
    stream: &mut S,
    mut request: Request,
    addr: SocketAddr,
    scheme: &'static str,
    ctx: &Context,
) -> io::Result<()> {
    let client_ip = addr.ip().to_string();

    let Some(host_name) = request.host().map(str::to_string) else {
        return serve_error(stream, &request, StatusCode::BAD_REQUEST, ctx).await;
    };
    let Some(matched) = host::find(&ctx.hosts, &host_name) else {
        let reply = Reply::new(StatusCode::OK, error::fallback_html());
        return response::send(stream, &request, reply, &ctx.config).await;
    };

    let mut clearance = None;
    match waf::check(&request, &ctx.config, &ctx.key, &ctx.logs).await {
        Verdict::Allow => {}
        Verdict::Block { close: true, reason } => {
            // no response bytes; the client sees the connection drop
            if let Some(reason) = reason {
                debug!("WAF closed connection: {reason}");
            }
            return Ok(());
        }
        Verdict::Block { close: false, reason } => {
            if let Some(reason) = reason {
                debug!("WAF refused request: {reason}");
            }
            return serve_challenge(stream, &request, &client_ip, &host_name, ctx).await;
        }
        Verdict::Challenge => {
            return serve_challenge(stream, &request, &client_ip, &host_name, ctx).await;
        }
        Verdict::AllowReplay {
            request: replay,
            token,
        } => {
            request = replay;
            clearance = Some(token);
        }
    }

    ctx.logs
        .request(&request.method, &request.path, request.version_str(), &client_ip);

    for location in &matched.locations {
        if !location.matches(&request.path) {
            // only the first location is ever consulted
            return serve_error(stream, &request, StatusCode::NOT_FOUND, ctx).await;
        }
        return serve_location(
            stream, &request, location, matched, &client_ip, &host_name, scheme, clearance, ctx,
        )
        .await;
    }
    serve_error(stream, &request, StatusCode::NOT_FOUND, ctx).await
}

async fn serve_error<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Request,
    status: StatusCode,
    ctx: &Context,
) -> io::Result<()> {
    response::send(stream, request, Reply::error(status), &ctx.config).await
}

async fn serve_challenge<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Request,
    client_ip: &str,
    host_name: &str,
    ctx: &Context,
) -> io::Result<()> {
    let captcha = &ctx.config.waf.captcha;
    if !captcha.enabled {
        return serve_error(stream, request, StatusCode::FORBIDDEN, ctx).await;
    }
    if captcha.site_key.is_empty() || captcha.site_key == "your-site-key" {
        ctx.logs.error("captcha sitekey is not set in config");
        return serve_error(stream, request, StatusCode::FORBIDDEN, ctx).await;
    }
    if captcha.provider.is_empty() {
        ctx.logs.error("captcha provider is not set in config");
        return serve_error(stream, request, StatusCode::FORBIDDEN, ctx).await;
    }
    match waf::challenge_page(request, client_ip, host_name, &ctx.config, &ctx.key) {
        Ok(page) => {
            let reply = Reply::new(StatusCode::FORBIDDEN, page);
            response::send(stream, request, reply, &ctx.config).await
        }
        Err(err) => {
            ctx.logs.error(format!("error sealing challenge data: {err}"));
            serve_error(stream, request, StatusCode::INTERNAL_SERVER_ERROR, ctx).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_location<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Request,
    location: &Location,
    matched: &Host,
    client_ip: &str,
    host_name: &str,
    scheme: &'static str,
    clearance: Option<String>,
    ctx: &Context,
) -> io::Result<()> {
    let settings = &matched.edge_cache;
    let cacheable = settings.enabled && cache::eligible(&request.path, &settings.extensions);
    let ttl = settings.duration_seconds;

    if cacheable {
        if let Some(entry) = ctx.cache.get(&request.path).await {
            return serve_cache_hit(stream, request, location, entry, clearance, ctx).await;
        }
    }

    if let Some(content) = &location.content {
        let body = substitute(content, request, client_ip, host_name, scheme);
        let mut headers = HeaderMap::new();
        append_clearance(&mut headers, clearance.as_deref());
        let reply = Reply::new(StatusCode::OK, body).with_headers(headers);
        return response::send(stream, request, reply, &ctx.config).await;
    }
    if let Some(root) = &location.root {
        return serve_file(
            stream, request, location, root, cacheable, ttl, clearance, ctx,
        )
        .await;
    }
    if let Some(target) = &location.proxy {
        return serve_upstream(
            stream, request, target, client_ip, cacheable, ttl, clearance, ctx,
        )
        .await;
    }
    serve_error(stream, request, StatusCode::NOT_FOUND, ctx).await
}

async fn serve_cache_hit<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Request,
    location: &Location,
    entry: CachedFile,
    clearance: Option<String>,
    ctx: &Context,
) -> io::Result<()> {
    let mime = mime_for_path(&entry.path);
    let mut headers = location_headers(location);
    for (name, value) in &entry.headers {
        headers.insert(name.clone(), value.clone());
    }
    let last_modified = entry
        .headers
        .get("last-modified")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    headers.insert("x-cache", HeaderValue::from_static("HIT"));
    if let Ok(age) = HeaderValue::from_str(&entry.age().to_string()) {
        headers.insert("age", age);
    }
    append_clearance(&mut headers, clearance.as_deref());

    if let (Some(since), Some(last_modified)) =
        (request.header("if-modified-since"), last_modified.as_deref())
    {
        if since == last_modified {
            let reply = Reply::new(StatusCode::NOT_MODIFIED, Bytes::new()).with_headers(headers);
            return response::send(stream, request, reply, &ctx.config).await;
        }
    }

    if mime.starts_with("video/") || mime.starts_with("audio/") {
        headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
        if let Some(range) = request.header("range") {
            let len = entry.body.len() as u64;
            let Ok((start, end)) = parse::range_bounds(range, len) else {
                ctx.logs.error(format!("unsatisfiable range: {range}"));
                return serve_error(stream, request, StatusCode::RANGE_NOT_SATISFIABLE, ctx).await;
            };
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{len}")) {
                headers.insert("content-range", value);
            }
            let body = entry.body.slice(start as usize..end as usize + 1);
            let reply = Reply::new(StatusCode::PARTIAL_CONTENT, body)
                .with_content_type(mime)
                .with_headers(headers);
            return response::send(stream, request, reply, &ctx.config).await;
        }
    }

    let reply = Reply::new(StatusCode::OK, entry.body)
        .with_content_type(mime)
        .with_headers(headers);
    response::send(stream, request, reply, &ctx.config).await
}

#[allow(clippy::too_many_arguments)]
async fn serve_file<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Request,
    location: &Location,
    root: &str,
    cacheable: bool,
    ttl: i64,
    clearance: Option<String>,
    ctx: &Context,
) -> io::Result<()> {
    // the location root itself must exist and be a directory
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => {}
        other => {
            if let Err(err) = other {
                ctx.logs.error(format!("location root {root}: {err}"));
            }
            return serve_error(stream, request, StatusCode::INTERNAL_SERVER_ERROR, ctx).await;
        }
    }

    let Some(decoded) = parse::query_unescape(request.path.get(1..).unwrap_or("")) else {
        return serve_error(stream, request, StatusCode::BAD_REQUEST, ctx).await;
    };
    // never read through `./` segments or absolute paths
    if decoded.contains("./") || Path::new(&decoded).is_absolute() {
        return serve_error(stream, request, StatusCode::NOT_FOUND, ctx).await;
    }
    let file_path = Path::new(root).join(&decoded);

    let meta = match tokio::fs::metadata(&file_path).await {
        Ok(meta) => meta,
        Err(err) => {
            ctx.logs.error(format!("{}: {err}", file_path.display()));
            return serve_error(stream, request, file_status(&err), ctx).await;
        }
    };
    if meta.is_dir() {
        return serve_error(stream, request, StatusCode::NOT_FOUND, ctx).await;
    }
    let body = match tokio::fs::read(&file_path).await {
        Ok(data) => Bytes::from(data),
        Err(err) => {
            ctx.logs.error(format!("{}: {err}", file_path.display()));
            return serve_error(stream, request, file_status(&err), ctx).await;
        }
    };

    let last_modified = meta
        .modified()
        .map(httpdate::fmt_http_date)
        .unwrap_or_default();
    let mime = mime_for_path(&file_path);
    let mut headers = location_headers(location);
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert("last-modified", value);
    }

    if mime.starts_with("video/") || mime.starts_with("audio/") {
        headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
        if let Some(range) = request.header("range") {
            let len = body.len() as u64;
            let Ok((start, end)) = parse::range_bounds(range, len) else {
                ctx.logs.error(format!("unsatisfiable range: {range}"));
                return serve_error(stream, request, StatusCode::RANGE_NOT_SATISFIABLE, ctx).await;
            };
            if cacheable {
                headers.insert("x-cache", HeaderValue::from_static("MISS"));
                ctx.cache
                    .put(CachedFile::new(
                        request.path.clone(),
                        Bytes::clone(&body),
                        ttl,
                        headers.clone(),
                    ))
                    .await;
            }
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{len}")) {
                headers.insert("content-range", value);
            }
            append_clearance(&mut headers, clearance.as_deref());
            let reply = Reply::new(StatusCode::PARTIAL_CONTENT, body.slice(start as usize..end as usize + 1))
                .with_content_type(mime)
                .with_headers(headers);
            return response::send(stream, request, reply, &ctx.config).await;
        }
    }

    if cacheable {
        headers.insert("x-cache", HeaderValue::from_static("MISS"));
        ctx.cache
            .put(CachedFile::new(
                request.path.clone(),
                Bytes::clone(&body),
                ttl,
                headers.clone(),
            ))
            .await;
    }

    if request.header("if-modified-since") == Some(last_modified.as_str()) {
        let mut headers = location_headers(location);
        if let Ok(value) = HeaderValue::from_str(&last_modified) {
            headers.insert("last-modified", value);
        }
        append_clearance(&mut headers, clearance.as_deref());
        let reply = Reply::new(StatusCode::NOT_MODIFIED, Bytes::new()).with_headers(headers);
        return response::send(stream, request, reply, &ctx.config).await;
    }

    append_clearance(&mut headers, clearance.as_deref());
    let reply = Reply::new(StatusCode::OK, body)
        .with_content_type(mime)
        .with_headers(headers);
    response::send(stream, request, reply, &ctx.config).await
}

#[allow(clippy::too_many_arguments)]
async fn serve_upstream<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Request,
    target: &str,
    client_ip: &str,
    mut cacheable: bool,
    mut ttl: i64,
    clearance: Option<String>,
    ctx: &Context,
) -> io::Result<()> {
    let origin = match upstream::forward(request, target, client_ip).await {
        Ok(origin) => origin,
        Err(err) => {
            ctx.logs.error(&err);
            return serve_error(stream, request, err.status(), ctx).await;
        }
    };

    if let Some(cache_control) = origin.header("cache-control") {
        tighten_cache(cache_control, &mut cacheable, &mut ttl);
    }

    let status = origin.status.unwrap_or(StatusCode::OK);
    let mut headers = origin.headers.clone();
    if cacheable && status == StatusCode::OK && ctx.cache.get(&request.path).await.is_none() {
        headers.insert("x-cache", HeaderValue::from_static("MISS"));
        ctx.cache
            .put(CachedFile::new(
                request.path.clone(),
                Bytes::clone(&origin.body),
                ttl,
                headers.clone(),
            ))
            .await;
    }

    let content_type = origin
        .header("content-type")
        .unwrap_or("text/html; charset=utf-8")
        .to_string();
    append_clearance(&mut headers, clearance.as_deref());
    let reply = Reply::new(status, origin.body)
        .with_content_type(content_type)
        .with_headers(headers);
    response::send(stream, request, reply, &ctx.config).await
}

/// Applies `cache-control` directives from the origin: `no-store`,
/// `no-cache`, and `private` disable caching; `max-age=n` tightens the TTL.
fn tighten_cache(cache_control: &str, cacheable: &mut bool, ttl: &mut i64) {
    for part in cache_control.split(',') {
        let part = part.trim();
        if part == "no-store" || part == "no-cache" || part == "private" {
            *cacheable = false;
            return;
        }
        if let Some(age) = part.strip_prefix("max-age=") {
            if let Ok(age) = age.parse::<i64>() {
                if age < *ttl {
                    *ttl = age;
                }
            }
        }
    }
}

/// Substitutes the `$variable` placeholders of an inline-content body.
fn substitute(
    content: &str,
    request: &Request,
    client_ip: &str,
    host_name: &str,
    scheme: &str,
) -> String {
    content
        .replace("$user_agent", request.header("user-agent").unwrap_or(""))
        .replace("$remote_addr", client_ip)
        .replace("$host", host_name)
        .replace("$path", &request.path)
        .replace("$method", request.method.as_str())
        .replace("$scheme", scheme)
}

fn location_headers(location: &Location) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(map) = &location.headers {
        for (name, value) in map {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }
    headers
}

fn append_clearance(headers: &mut HeaderMap, clearance: Option<&str>) {
    if let Some(token) = clearance {
        let cookie = parse::set_cookie(
            waf::CLEARANCE_COOKIE,
            token,
            Some("/"),
            None,
            Some(waf::CLEARANCE_MAX_AGE),
            false,
            true,
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.insert("set-cookie", value);
        }
    }
}

fn file_status(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn mime_for_path(path: impl AsRef<Path>) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}
