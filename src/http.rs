//! HTTP request parsing and synthesized error responses.
//!
//! Only the request line and the `Connection` header are interpreted. The
//! raw request bytes are kept so they can be forwarded to the origin as-is.

const SCHEME_DELIMITER: &str = "://";

/// Errors for requests the proxy refuses to forward. All map to 400.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("empty or non-UTF-8 request line")]
    Malformed,
    #[error("target {0:?} is not an absolute URL")]
    MissingScheme(String),
    #[error("method {0:?} is not supported")]
    BadMethod(String),
    #[error("version {0:?} is not supported")]
    BadVersion(String),
    #[error("target {0:?} has no host")]
    EmptyHost(String),
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
}

/// Supported HTTP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.0" => Some(HttpVersion::Http10),
            "HTTP/1.1" => Some(HttpVersion::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// A validated proxy request. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    /// Absolute target URL, used as the content cache key.
    pub url: String,
    /// Lowercased host between the scheme delimiter and the next `/`.
    pub host: String,
    pub path: String,
    pub version: HttpVersion,
    pub keep_alive: bool,
    /// The request exactly as received, forwarded to the origin unmodified.
    pub raw: Vec<u8>,
}

impl ProxyRequest {
    /// Parse and validate a request head.
    ///
    /// Checks run in a fixed order: absolute target, `GET` method, then
    /// version. The first failure wins.
    pub fn parse(raw: &[u8]) -> Result<Self, RequestError> {
        let line = request_line(raw).ok_or(RequestError::Malformed)?;
        let mut tokens = line.split_whitespace();
        let method = tokens.next().ok_or(RequestError::Malformed)?;
        let target = tokens.next().unwrap_or_default();
        let version = tokens.next().unwrap_or_default();

        let Some(scheme_end) = target.find(SCHEME_DELIMITER) else {
            return Err(RequestError::MissingScheme(target.to_string()));
        };
        if method != "GET" {
            return Err(RequestError::BadMethod(method.to_string()));
        }
        let version =
            HttpVersion::parse(version).ok_or_else(|| RequestError::BadVersion(version.to_string()))?;

        let (host, path) = split_authority(&target[scheme_end + SCHEME_DELIMITER.len()..]);
        if host.is_empty() {
            return Err(RequestError::EmptyHost(target.to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            url: target.to_string(),
            host: host.to_ascii_lowercase(),
            path: path.to_string(),
            version,
            keep_alive: is_keep_alive(raw),
            raw: raw.to_vec(),
        })
    }
}

/// Split `host/path...` at the first `/`. A target with no path yields `/`.
fn split_authority(rest: &str) -> (&str, &str) {
    match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    }
}

fn request_line(raw: &[u8]) -> Option<&str> {
    let end = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
    let line = std::str::from_utf8(&raw[..end]).ok()?.trim();
    if line.is_empty() { None } else { Some(line) }
}

/// Whether any header line is `Connection: keep-alive`.
///
/// Evaluated on the raw bytes so the answer is available for requests that
/// fail validation.
pub fn is_keep_alive(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    text.lines().skip(1).any(|line| {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        name.trim().eq_ignore_ascii_case("connection")
            && value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"))
    })
}

/// Version to use in a synthesized status line: the request's own version
/// when it is supported, otherwise HTTP/1.1.
pub fn response_version(raw: &[u8]) -> HttpVersion {
    request_line(raw)
        .and_then(|line| line.split_whitespace().nth(2))
        .and_then(HttpVersion::parse)
        .unwrap_or(HttpVersion::Http11)
}

/// Error classes the proxy synthesizes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    BadRequest,
    Forbidden,
    NotFound,
    BadGateway,
    GatewayTimeout,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::BadGateway => 502,
            Status::GatewayTimeout => 504,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::BadGateway => "Bad Gateway",
            Status::GatewayTimeout => "Gateway Timeout",
        }
    }

    fn body(self) -> String {
        format!(
            "<!DOCTYPE html><html><title>{reason}</title><pre><h1>HTTP {code} {reason}</h1></pre></html>\r\n",
            code = self.code(),
            reason = self.reason()
        )
    }
}

/// Build a complete error response: status line, headers and HTML body.
pub fn error_response(status: Status, version: HttpVersion, keep_alive: bool) -> Vec<u8> {
    let body = status.body();
    let connection = if keep_alive { "keep-alive" } else { "close" };
    let mut response = format!(
        "{} {} {}\r\nContent-Type: text/html\r\nConnection: {}\r\nContent-Length: {}\r\n\r\n",
        version.as_str(),
        status.code(),
        status.reason(),
        connection,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}

/// Parse the status code out of a response's status line.
pub fn status_code(response: &[u8]) -> Option<u16> {
    let line = request_line(response)?;
    line.split_whitespace().nth(1)?.parse().ok()
}
