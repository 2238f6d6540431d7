//! The in-memory edge cache: a keyed store of response bodies and headers
//! with per-entry TTLs and an extension-based eligibility filter.
//!
//! Keys are request paths, as-is. Expired entries are evicted lazily by
//! the first [`EdgeCache::get`] that observes them. There is deliberately
//! no single-flight guarantee: two concurrent misses may both fetch and
//! both insert; the last writer wins.

use crate::prelude::*;
use tokio::sync::Mutex;

/// Extensions considered cacheable when a host configures none.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".woff", ".woff2", ".ttf", ".eot",
    ".ico", ".mp4", ".webm", ".ogg", ".mp3", ".wav", ".flac", ".aac", ".txt", ".pdf",
];

/// Headers stripped from every entry on insert; they describe the original
/// transfer, not the cached representation.
pub const FILTERED_HEADERS: &[&str] = &[
    "set-cookie",
    "x-cache",
    "range",
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// The TTL used when a host supplies a non-positive duration.
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// A cached response body with its filtered headers.
#[derive(Debug, Clone)]
pub struct CachedFile {
    /// The identity (unencoded) body.
    pub body: Bytes,
    /// How long the entry stays fresh after [`CachedFile::added`].
    pub ttl: Duration,
    /// When the entry was inserted.
    pub added: Instant,
    /// The request path this entry was stored under.
    pub path: String,
    /// Response headers, with [`FILTERED_HEADERS`] removed.
    pub headers: HeaderMap,
}
impl CachedFile {
    /// Creates an entry. A non-positive `ttl_seconds` falls back to 60
    /// minutes, and [`FILTERED_HEADERS`] are stripped from `headers`.
    #[must_use]
    pub fn new(path: String, body: Bytes, ttl_seconds: i64, mut headers: HeaderMap) -> Self {
        for name in FILTERED_HEADERS {
            headers.remove(*name);
        }
        let ttl = if ttl_seconds <= 0 {
            DEFAULT_TTL
        } else {
            Duration::from_secs(ttl_seconds as u64)
        };
        Self {
            body,
            ttl,
            added: Instant::now(),
            path,
            headers,
        }
    }
    /// Seconds since the entry was inserted.
    #[must_use]
    pub fn age(&self) -> u64 {
        self.added.elapsed().as_secs()
    }
    fn fresh(&self) -> bool {
        self.added.elapsed() < self.ttl
    }
}

/// The process-wide edge cache. Owned by the [`Context`] and shared by
/// every connection task; operations are atomic per key.
#[derive(Debug, Default)]
pub struct EdgeCache {
    files: Mutex<HashMap<String, CachedFile>>,
}
impl EdgeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a fresh entry for `key`, evicting it instead when its TTL has
    /// passed.
    pub async fn get(&self, key: &str) -> Option<CachedFile> {
        let mut lock = self.files.lock().await;
        match lock.get(key) {
            Some(file) if file.fresh() => Some(file.clone()),
            Some(_) => {
                lock.remove(key);
                None
            }
            None => None,
        }
    }

    /// Inserts `file` under its path, replacing any previous entry.
    pub async fn put(&self, file: CachedFile) {
        let mut lock = self.files.lock().await;
        debug!("Caching {}", file.path);
        lock.insert(file.path.clone(), file);
    }
}

/// Is `path` eligible for edge caching under the configured extension
/// allow-list? An empty list means [`DEFAULT_EXTENSIONS`]. Matching is
/// case-sensitive.
#[must_use]
pub fn eligible(path: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        DEFAULT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    } else {
        extensions
            .iter()
            .any(|ext| !ext.is_empty() && path.ends_with(ext.as_str()))
    }
}
