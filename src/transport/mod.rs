//! Client-facing transport.
//!
//! Accepts TCP connections from clients and runs each one through the
//! request pipeline in its own task.

pub mod tcp;

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::fetch::FetchOutcome;

/// Maximum size of a request head (request line plus headers).
pub const MAX_REQUEST_SIZE: usize = 8192;

/// Logger for request outcomes on one client connection.
pub struct RequestLogger {
    client: SocketAddr,
}

impl RequestLogger {
    pub fn new(client: SocketAddr) -> Self {
        Self { client }
    }

    pub fn rejected(&self, error: &ProxyError, elapsed_ms: f64) {
        info!(
            client = %self.client,
            error = %error,
            total_ms = elapsed_ms,
            "REJECTED"
        );
    }

    pub fn blocked(&self, host: &str, elapsed_ms: f64) {
        info!(client = %self.client, host, total_ms = elapsed_ms, "BLOCKED");
    }

    pub fn cached(&self, url: &str, bytes: usize, elapsed_ms: f64) {
        info!(client = %self.client, url, bytes, total_ms = elapsed_ms, "CACHED");
    }

    pub fn fetched(&self, url: &str, outcome: FetchOutcome, stale: bool, elapsed_ms: f64) {
        info!(
            client = %self.client,
            url,
            bytes = outcome.bytes,
            end = ?outcome.end,
            refresh = stale,
            total_ms = elapsed_ms,
            "FETCHED"
        );
    }

    pub fn failed(&self, url: &str, error: &ProxyError, relayed: u64, elapsed_ms: f64) {
        warn!(
            client = %self.client,
            url,
            error = %error,
            relayed,
            total_ms = elapsed_ms,
            "FAILED"
        );
    }

    pub fn closed(&self, reason: &str) {
        debug!(client = %self.client, reason, "Connection closed");
    }
}
