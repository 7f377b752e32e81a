//! Error types for the broker and the pool

use std::io;
use thiserror::Error;

/// Broker error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("No proxy available")]
    NoProxy,

    #[error("No working judges")]
    NoJudges,

    #[error("Closed")]
    Closed,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Geo lookup error: {0}")]
    Geo(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl Error {
    pub fn provider<S: Into<String>>(msg: S) -> Self {
        Error::Provider(msg.into())
    }

    pub fn probe<S: Into<String>>(msg: S) -> Self {
        Error::Probe(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn geo<S: Into<String>>(msg: S) -> Self {
        Error::Geo(msg.into())
    }

    /// Whether the error is a timeout of a network operation
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Probe(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_proxy_display() {
        assert_eq!(Error::NoProxy.to_string(), "No proxy available");
    }

    #[test]
    fn test_error_creation() {
        let e = Error::provider("fetch failed");
        assert!(matches!(e, Error::Provider(_)));
        assert_eq!(e.to_string(), "Provider error: fetch failed");
    }

    #[test]
    fn test_timeout_classification() {
        assert!(Error::timeout("read").is_timeout());
        assert!(!Error::probe("refused").is_timeout());
    }
}
