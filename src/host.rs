//! Handling of multiple virtual hosts on one instance of Iridium.
//!
//! A [`Host`] binds a domain to an ordered sequence of [`Location`]s and
//! its edge-cache settings. Hosts are parsed from the `*.yml`/`*.yaml`
//! files in `<data_dir>/hosts` at startup and are immutable thereafter;
//! a starter `example.com` host is written when the directory is absent.

use crate::prelude::*;
use serde::Deserialize;

/// The starter host file written on first run.
pub const DEFAULT_HOST: &str = r#"# Default host configuration. This file has been created automatically.
# You can edit this file to add your own host configurations.

domain: example.com
locations:
  - match: /
    content: |
      <!DOCTYPE html>
      <html>
        <head><title>Welcome to Iridium!</title></head>
        <body>
          <center>
            <h1>Welcome to Iridium!</h1>
            <p>This is the default page served by Iridium.</p>
            <hr>
            <p>Iridium</p>
          </center>
        </body>
      </html>
"#;

/// A virtual host: the match target for the request authority.
#[derive(Debug, Clone, Deserialize)]
pub struct Host {
    /// Domain compared against the request `host`, ASCII case-insensitively.
    pub domain: String,
    /// Ordered locations; only the first matching one is evaluated.
    #[serde(default)]
    pub locations: Vec<Location>,
    /// Edge-cache settings for this host.
    #[serde(default)]
    pub edge_cache: EdgeCacheSettings,
}

/// A rule binding a path pattern to a handler.
///
/// Exactly one of `content`, `root`, and `proxy` should be set; when
/// several are, they take precedence in that order.
#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    /// An exact path, or a prefix when ending in `*`.
    #[serde(rename = "match")]
    pub pattern: String,
    /// Literal response body, with `$variable` substitution.
    #[serde(default)]
    pub content: Option<String>,
    /// Filesystem root to serve files from.
    #[serde(default)]
    pub root: Option<String>,
    /// Upstream origin, `host[:port]`.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Additional response headers.
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}
impl Location {
    /// Does this location match `path`? A pattern ending in `*` prefix
    /// matches; any other pattern must be equal.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => self.pattern == path,
        }
    }
}

/// Per-host edge-cache settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EdgeCacheSettings {
    /// Whether eligible responses are cached at all.
    pub enabled: bool,
    /// Entry TTL in seconds. Non-positive values fall back to 60 minutes.
    pub duration_seconds: i64,
    /// Extension allow-list; empty means the default list.
    pub extensions: Vec<String>,
}

/// Loads every host file in `<data_dir>/hosts`, creating the directory
/// and the starter host when it does not exist. Unparsable files are
/// logged and skipped.
///
/// # Errors
///
/// Fails when the hosts directory cannot be created or enumerated.
pub fn load(data_dir: &Path) -> io::Result<Vec<Host>> {
    let hosts_dir = data_dir.join("hosts");
    if !hosts_dir.exists() {
        std::fs::create_dir_all(&hosts_dir)?;
        let path = hosts_dir.join("default.yml");
        std::fs::write(&path, DEFAULT_HOST)?;
        info!("Created default host file at {}", path.display());
        let host = serde_yaml::from_str(DEFAULT_HOST)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        return Ok(vec![host]);
    }

    let mut hosts = Vec::new();
    for entry in std::fs::read_dir(&hosts_dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if path.is_dir() || !is_yaml {
            continue;
        }
        info!("Loading host configuration from {}", path.display());
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                error!("Failed to read host file {}: {err}", path.display());
                continue;
            }
        };
        match serde_yaml::from_str::<Host>(&raw) {
            Ok(host) => hosts.push(host),
            Err(err) => error!("Failed to parse host file {}: {err}", path.display()),
        }
    }
    Ok(hosts)
}

/// Resolves `domain` to a host by ASCII case-insensitive equality.
/// The first match wins.
#[must_use]
pub fn find<'a>(hosts: &'a [Host], domain: &str) -> Option<&'a Host> {
    hosts
        .iter()
        .find(|host| host.domain.eq_ignore_ascii_case(domain))
}
