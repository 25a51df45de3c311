//! Configuration module
//!
//! CLI argument parsing with environment variable support, plus the
//! free-form metadata map handed to listener/handler `init`.

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Metadata option key for the pending-connection queue size
pub const MD_BACKLOG: &str = "backlog";

/// Metadata option key enabling PROXY protocol unwrapping
pub const MD_PROXY_PROTOCOL: &str = "proxy_protocol";

/// Metadata option key bounding the PROXY protocol header read
pub const MD_PROXY_HEADER_TIMEOUT: &str = "proxy_header_timeout";

/// Default pending-connection queue size
pub const DEFAULT_BACKLOG: usize = 128;

/// CLI arguments
///
/// Supports environment variables with RELAYD_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Modular proxy runtime: pluggable listeners and handlers")]
pub struct CliArgs {
    /// Listen address
    #[arg(long, env = "RELAYD_ADDR", default_value = "0.0.0.0:8443")]
    pub addr: String,

    /// Service name used in logs and recorder entries
    #[arg(long, env = "RELAYD_SERVICE", default_value = "relayd")]
    pub service: String,

    /// Listener type (registry key)
    #[arg(long, env = "RELAYD_LISTENER", default_value = "http2")]
    pub listener: String,

    /// Handler type (registry key)
    #[arg(long, env = "RELAYD_HANDLER", default_value = "redu")]
    pub handler: String,

    /// TLS certificate file path
    #[arg(long, env = "RELAYD_CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key file path
    #[arg(long, env = "RELAYD_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Pending-connection queue size for multiplexed listeners
    #[arg(long, env = "RELAYD_BACKLOG", default_value_t = DEFAULT_BACKLOG)]
    pub backlog: usize,

    /// Expect a PROXY protocol header on accepted connections
    #[arg(long, env = "RELAYD_PROXY_PROTOCOL", default_value_t = false)]
    pub proxy_protocol: bool,

    /// Bound on reading the PROXY protocol header (default: 10s)
    #[arg(long, env = "RELAYD_PROXY_HEADER_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub proxy_header_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(long, env = "RELAYD_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub tls_handshake_timeout: Duration,

    /// TCP connect timeout for the direct router (default: 5s)
    #[arg(long, env = "RELAYD_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY on accepted and dialed streams (default: true)
    #[arg(long, env = "RELAYD_TCP_NODELAY", default_value_t = true)]
    pub tcp_nodelay: bool,

    /// Log level: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "RELAYD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations that clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err("cert_file and key_file must be provided together".to_string());
        }
        if self.backlog == 0 {
            return Err("backlog must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Free-form, string-keyed options handed to listener/handler `init`.
///
/// Values are `toml::Value` so the map can be populated from CLI flags or a
/// TOML table without separate plumbing per option.
#[derive(Debug, Clone, Default)]
pub struct Metadata(HashMap<String, toml::Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<toml::Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_integer())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Duration from either a humantime string ("10s") or integer seconds
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        match self.0.get(key)? {
            toml::Value::String(s) => humantime::parse_duration(s).ok(),
            toml::Value::Integer(n) if *n >= 0 => Some(Duration::from_secs(*n as u64)),
            _ => None,
        }
    }
}
