//! Error types for the proxy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::http::RequestError;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while serving requests or starting the proxy.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The client sent a request we refuse to proxy.
    #[error("Bad request: {0}")]
    Request(#[from] RequestError),

    /// Hostname could not be resolved to an address.
    #[error("DNS resolution failed for {host}: {message}")]
    Resolution { host: String, message: String },

    /// Could not open a connection to the origin.
    #[error("Connection to origin {addr} failed: {source}")]
    OriginConnect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The origin connection failed mid-transfer.
    #[error("Origin {addr} I/O error: {source}")]
    OriginIo {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The origin did not answer within the configured timeout.
    #[error("Origin {addr} timed out after {timeout:?}")]
    OriginTimeout { addr: SocketAddr, timeout: Duration },

    /// A persisted store could not be loaded or updated.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the on-disk stores (host store, freshness index, payloads).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}
