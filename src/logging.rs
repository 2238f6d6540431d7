//! Append-only log sinks under `<data_dir>/logs`: the access, error, and
//! WAF logs. Every line is prefixed `[YYYY/MM/DD HH:MM:SS]` and mirrored
//! to the `log` facade.

use crate::config::LoggingConfig;
use crate::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug)]
struct Sink {
    file: Mutex<File>,
}
impl Sink {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
    fn append(&self, line: &str) {
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(file, "[{}] {line}", timestamp()) {
            error!("Failed to write log line: {err}");
        }
    }
}

/// The three log files of a running proxy.
#[derive(Debug)]
pub struct Logs {
    access: Sink,
    errors: Sink,
    waf: Sink,
}
impl Logs {
    /// Opens (creating when needed) the log files under
    /// `<data_dir>/logs`, named per the `logging` configuration; the WAF
    /// log is always `waf.log`.
    ///
    /// # Errors
    ///
    /// Fails when the directory or a file cannot be created.
    pub fn open(data_dir: &Path, config: &LoggingConfig) -> io::Result<Self> {
        let dir = data_dir.join("logs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            access: Sink::open(&dir.join(&config.access_log))?,
            errors: Sink::open(&dir.join(&config.error_log))?,
            waf: Sink::open(&dir.join("waf.log"))?,
        })
    }

    /// Logs a served request: `METHOD path VERSION - Host: <client ip>`.
    pub fn request(&self, method: &Method, path: &str, version: &str, client_ip: &str) {
        let line = format!("{method} {path} {version} - Host: {client_ip}");
        info!("{line}");
        self.access.append(&line);
    }

    /// Logs an internal error.
    pub fn error(&self, err: impl Display) {
        let line = format!("Error: {err}");
        error!("{line}");
        self.errors.append(&line);
    }

    /// Logs a WAF decision.
    pub fn waf(&self, line: &str) {
        info!("WAF: {line}");
        self.waf.append(line);
    }
}

fn timestamp() -> String {
    let now = time::OffsetDateTime::now_utc();
    format!(
        "{:04}/{:02}/{:02} {:02}:{:02}:{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_timestamped_and_appended() {
        let dir = std::env::temp_dir().join(format!("iridium-logs-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let logs = Logs::open(&dir, &LoggingConfig::default()).unwrap();
        logs.request(&Method::GET, "/index.html", "HTTP/1.1", "1.2.3.4");
        logs.request(&Method::POST, "/submit", "HTTP/1.1", "1.2.3.4");
        logs.error("boom");
        logs.waf("Blocked request with empty User-Agent");

        let access = std::fs::read_to_string(dir.join("logs/access.log")).unwrap();
        let lines: Vec<&str> = access.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("GET /index.html HTTP/1.1 - Host: 1.2.3.4"));

        let errors = std::fs::read_to_string(dir.join("logs/error.log")).unwrap();
        assert!(errors.contains("Error: boom"));
        let waf = std::fs::read_to_string(dir.join("logs/waf.log")).unwrap();
        assert!(waf.contains("empty User-Agent"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn timestamp_shape() {
        let ts = timestamp();
        // [YYYY/MM/DD HH:MM:SS]
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "/");
        assert_eq!(&ts[7..8], "/");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(&ts[13..14], ":");
    }
}
