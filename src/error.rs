use std::io;
use thiserror::Error;

/// Unified error type for the proxy core.
///
/// Every variant is scoped to a single connection except `Closed` and
/// `Listener`, which are terminal outcomes of a listener.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Peer denied by the rate limiter
    #[error("rate limit exceeded")]
    RateLimited,

    /// Destination matched a bypass rule
    #[error("destination bypassed")]
    Bypassed,

    /// Upstream dial failed
    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),

    /// I/O error during the relay phase
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// Listener has been closed
    #[error("listener closed")]
    Closed,

    /// Listener became non-functional after a fatal transport error
    #[error("listener error: {0}")]
    Listener(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Whether this error ends the listener rather than a single connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProxyError::Closed | ProxyError::Listener(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_display() {
        let err = ProxyError::RateLimited;
        assert_eq!(format!("{}", err), "rate limit exceeded");
    }

    #[test]
    fn test_bypassed_display() {
        let err = ProxyError::Bypassed;
        assert_eq!(format!("{}", err), "destination bypassed");
    }

    #[test]
    fn test_dial_display() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err = ProxyError::Dial(io_err);
        let display = format!("{}", err);
        assert!(display.contains("dial failed"));
        assert!(display.contains("connection refused"));
    }

    #[test]
    fn test_transport_display() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe");
        let err = ProxyError::Transport(io_err);
        let display = format!("{}", err);
        assert!(display.contains("transport error"));
        assert!(display.contains("broken pipe"));
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(ProxyError::Closed.is_terminal());
        assert!(ProxyError::Listener("bind failed".to_string()).is_terminal());
        assert!(!ProxyError::RateLimited.is_terminal());
        assert!(!ProxyError::Bypassed.is_terminal());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[test]
    fn test_config_display() {
        let err = ProxyError::Config("bad backlog".to_string());
        let display = format!("{}", err);
        assert!(display.contains("configuration error"));
        assert!(display.contains("bad backlog"));
    }
}
