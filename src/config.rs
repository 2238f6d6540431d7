//! The proxy configuration: one immutable, typed record parsed from
//! `<data_dir>/config.yaml` at startup and passed by reference from there
//! on. A default configuration file is written on first run.

use crate::prelude::*;
use serde::Deserialize;

/// The configuration written on first run.
pub const DEFAULT_CONFIG: &str = r#"# Iridium Reverse Proxy Configuration File

waf:
  enabled: false
  # Block requests with User-Agent headers matching common library/tool patterns, such as curl, wget, Postman, etc.
  block_libraries: true
  # Block requests with User-Agent headers matching common web crawlers and bots, such as Googlebot, Bingbot, etc.
  block_crawlers: true
  # Block requests with empty User-Agent headers.
  block_empty_ua: true

  # Block IPs known to be associated with VPNs, Tor nodes, and open proxies.
  block_vpns: true
  block_tor: true
  block_proxies: true

  # List of countries to block (ISO 3166-1 alpha-2 codes). Example: ["CN", "RU"]
  blocked_countries: []
  # List of IPs or CIDR ranges to block.
  blocked_ips: []

  captcha:
    enabled: false
    # Options: hcaptcha, recaptcha, turnstile
    provider: hcaptcha
    site_key: your-site-key
    secret_key: your-secret-key

logging:
  access_log: access.log
  error_log: error.log

server:
  port: 8080
  # Print the server version in the "Server" header of HTTP responses.
  show_server_version: true
  # Options: none, zstd, gzip, deflate
  encoding: none
"#;

/// The whole configuration record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Web Application Firewall settings.
    pub waf: WafConfig,
    /// Log file names.
    pub logging: LoggingConfig,
    /// Server behavior.
    pub server: ServerConfig,
    /// TLS certificate material.
    pub tls: TlsConfig,
}

/// `waf.*` settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WafConfig {
    /// Master switch for the policy filter.
    pub enabled: bool,
    /// Block library/tool user agents (curl, wget, Postman, ...).
    pub block_libraries: bool,
    /// Block crawler/bot user agents (Googlebot, bingbot, ...).
    pub block_crawlers: bool,
    /// Block requests without a user agent.
    pub block_empty_ua: bool,
    /// Accepted for compatibility; IP-reputation blocking is not applied.
    pub block_vpns: bool,
    /// Accepted for compatibility; IP-reputation blocking is not applied.
    pub block_tor: bool,
    /// Accepted for compatibility; IP-reputation blocking is not applied.
    pub block_proxies: bool,
    /// Accepted for compatibility; geo blocking is not applied.
    pub blocked_countries: Vec<String>,
    /// Accepted for compatibility; address blocking is not applied.
    pub blocked_ips: Vec<String>,
    /// CAPTCHA clearance settings.
    pub captcha: CaptchaConfig,
    /// Key sealing clearance cookies and CAPTCHA context. A fresh key is
    /// generated at startup when unset.
    pub encryption_key: Option<String>,
}
impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            block_libraries: true,
            block_crawlers: true,
            block_empty_ua: true,
            block_vpns: true,
            block_tor: true,
            block_proxies: true,
            blocked_countries: Vec::new(),
            blocked_ips: Vec::new(),
            captcha: CaptchaConfig::default(),
            encryption_key: None,
        }
    }
}

/// `waf.captcha.*` settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    /// Serve an interactive challenge instead of a bare 403.
    pub enabled: bool,
    /// One of `hcaptcha`, `recaptcha`, `turnstile`.
    pub provider: String,
    /// The provider site key embedded in the challenge page.
    pub site_key: String,
    /// The provider secret used against the `siteverify` endpoint.
    pub secret_key: String,
}
impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: String::from("hcaptcha"),
            site_key: String::new(),
            secret_key: String::new(),
        }
    }
}

/// `logging.*` settings: file names under `<data_dir>/logs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Access log file name.
    pub access_log: String,
    /// Error log file name.
    pub error_log: String,
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            access_log: String::from("access.log"),
            error_log: String::from("error.log"),
        }
    }
}

/// `server.*` settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Accepted for compatibility; the listener binds the standard ports.
    pub port: u16,
    /// Include the version in the `server` response header.
    pub show_server_version: bool,
    /// Accepted for compatibility; encoding is negotiated per request.
    pub encoding: String,
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            show_server_version: true,
            encoding: String::from("none"),
        }
    }
}

/// `tls.*` settings. TLS is enabled when both paths are set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain path.
    pub cert_file: String,
    /// PEM private key path.
    pub key_file: String,
}

impl Config {
    /// The `server` header value.
    #[must_use]
    pub fn server_header(&self) -> String {
        if self.server.show_server_version {
            format!("{SERVER_NAME}/{VERSION}")
        } else {
            SERVER_NAME.to_string()
        }
    }
}

/// The per-user data directory: `%APPDATA%\Iridium` on Windows,
/// `$HOME/.iridium` elsewhere, falling back to the working directory.
#[must_use]
pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        match std::env::var_os("APPDATA") {
            Some(appdata) => Path::new(&appdata).join("Iridium"),
            None => PathBuf::from("."),
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".iridium"),
            None => PathBuf::from("."),
        }
    }
}

/// Path of the configuration file inside `data_dir`.
#[must_use]
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.yaml")
}

/// Loads the configuration from `data_dir`, writing [`DEFAULT_CONFIG`]
/// there first when no file exists yet.
///
/// # Errors
///
/// Fails when the directory or file cannot be created or read, or when
/// the YAML does not parse.
pub fn load(data_dir: &Path) -> io::Result<Config> {
    let path = config_path(data_dir);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(data_dir)?;
            std::fs::write(&path, DEFAULT_CONFIG)?;
            info!("Created default configuration at {}", path.display());
            DEFAULT_CONFIG.to_string()
        }
        Err(err) => return Err(err),
    };
    serde_yaml::from_str(&raw)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let config: Config = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(!config.waf.enabled);
        assert!(config.waf.block_libraries);
        assert_eq!(config.waf.captcha.provider, "hcaptcha");
        assert_eq!(config.logging.access_log, "access.log");
        assert!(config.server.show_server_version);
        assert!(config.tls.cert_file.is_empty());
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config: Config = serde_yaml::from_str("server:\n  port: 9000\n").unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(config.waf.block_empty_ua);
        assert_eq!(config.logging.error_log, "error.log");
    }

    #[test]
    fn server_header_respects_version_flag() {
        let mut config = Config::default();
        assert_eq!(config.server_header(), format!("Iridium/{VERSION}"));
        config.server.show_server_version = false;
        assert_eq!(config.server_header(), "Iridium");
    }
}
