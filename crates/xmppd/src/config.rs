//! Server configuration: defaults, `key = value` config file, CLI overlay.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::XmppError;

/// Log verbosity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name, case-insensitively. Unknown names fall back
    /// to `Info`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    /// The tracing filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Flat server configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// XMPP domain served by this instance
    pub domain: String,
    /// TCP port for client connections
    pub port: u16,
    /// Bind address
    pub bind_address: String,
    /// Root of the per-user data directories
    pub datadir: PathBuf,
    /// Log file path
    pub logfile: PathBuf,
    /// Log verbosity
    pub loglevel: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            port: 5222,
            bind_address: "0.0.0.0".to_string(),
            datadir: PathBuf::from("./data"),
            logfile: PathBuf::from("./xmppd.log"),
            loglevel: LogLevel::Info,
        }
    }
}

impl Config {
    /// Overlay values from a line-oriented `key = value` file.
    ///
    /// Blank lines and `#` comments are skipped; unknown keys are
    /// ignored.
    pub fn load_file(&mut self, path: &Path) -> Result<(), XmppError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| XmppError::config(format!("cannot read {}: {}", path.display(), e)))?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "domain" => self.domain = value.to_string(),
                "port" => {
                    self.port = value.parse().map_err(|_| {
                        XmppError::config(format!("invalid port value: {}", value))
                    })?;
                }
                "bind_address" => self.bind_address = value.to_string(),
                "datadir" => self.datadir = PathBuf::from(value),
                "logfile" => self.logfile = PathBuf::from(value),
                "loglevel" => self.loglevel = LogLevel::parse(value),
                _ => {}
            }
        }
        Ok(())
    }

    /// The socket address to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.domain, "localhost");
        assert_eq!(cfg.port, 5222);
        assert_eq!(cfg.bind_address, "0.0.0.0");
        assert_eq!(cfg.loglevel, LogLevel::Info);
    }

    #[test]
    fn file_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xmppd.conf");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# test config").unwrap();
        writeln!(f, "domain = example.org").unwrap();
        writeln!(f, "port = 15222").unwrap();
        writeln!(f, "loglevel = debug").unwrap();
        writeln!(f, "unknown_key = whatever").unwrap();
        writeln!(f).unwrap();

        let mut cfg = Config::default();
        cfg.load_file(&path).unwrap();
        assert_eq!(cfg.domain, "example.org");
        assert_eq!(cfg.port, 15222);
        assert_eq!(cfg.loglevel, LogLevel::Debug);
        // untouched keys keep their defaults
        assert_eq!(cfg.bind_address, "0.0.0.0");
    }

    #[test]
    fn bad_port_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xmppd.conf");
        std::fs::write(&path, "port = not-a-number\n").unwrap();
        let mut cfg = Config::default();
        assert!(cfg.load_file(&path).is_err());
    }

    #[test]
    fn loglevel_parsing() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("bogus"), LogLevel::Info);
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut cfg = Config::default();
        assert!(cfg.load_file(Path::new("/nonexistent/xmppd.conf")).is_err());
    }
}
