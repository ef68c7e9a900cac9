//! Cacheproxy - a caching forward HTTP proxy.
//!
//! Intercepts plaintext `GET` requests, refuses blocklisted hosts, resolves
//! and remembers origin addresses, and serves repeated requests from a
//! TTL-based on-disk cache while streaming fresh responses to the client.

pub mod cache;
pub mod clock;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod http;
pub mod pipeline;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod transport;

pub use error::{ProxyError, Result, StoreError};
pub use proxy::{ProxyConfig, ProxyServer, run};
