//! Request filtering.
//!
//! Refuses requests whose host matches the operator blocklist before any
//! DNS or origin traffic happens.

mod blocklist;

pub use blocklist::Blocklist;

use crate::http::{ProxyRequest, Status, error_response};

/// Check if a request should be blocked and return the Forbidden response.
///
/// Returns `Some(response)` if the host is blocked, `None` if the request
/// may proceed.
pub fn filter_request(blocklist: &Blocklist, request: &ProxyRequest) -> Option<Vec<u8>> {
    if blocklist.is_blocked(&request.host) {
        Some(error_response(
            Status::Forbidden,
            request.version,
            request.keep_alive,
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::status_code;

    #[test]
    fn blocked_host_gets_forbidden() {
        let blocklist = Blocklist::from_lines("evil.example.com\n");
        let request = ProxyRequest::parse(b"GET http://evil.example.com/path HTTP/1.1\r\n\r\n").unwrap();

        let response = filter_request(&blocklist, &request).unwrap();

        assert_eq!(status_code(&response), Some(403));
    }

    #[test]
    fn allowed_host_passes() {
        let blocklist = Blocklist::from_lines("evil.example.com\n");
        let request = ProxyRequest::parse(b"GET http://good.example.org/ HTTP/1.1\r\n\r\n").unwrap();

        assert!(filter_request(&blocklist, &request).is_none());
    }
}
