//! HTTP Host header extraction

use thiserror::Error;
use tracing::trace;

/// Maximum number of headers parsed from the request head
const MAX_HEADERS: usize = 96;

/// Request methods recognized when classifying an unknown stream
const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"HEAD ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"TRACE ",
    b"CONNECT ",
];

/// HTTP host extraction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    /// The header block has not been fully received yet
    #[error("HTTP request head incomplete")]
    Incomplete,

    #[error("Host header not found")]
    HostHeaderNotFound,

    #[error("Malformed HTTP request: {0}")]
    Malformed(String),

    #[error("Invalid host header: {0}")]
    InvalidHost(String),
}

/// Result of checking whether a buffer starts like an HTTP request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPrefix {
    /// Starts with a known method followed by a space
    Yes,
    /// Too short to tell, but consistent with a known method
    Maybe,
    No,
}

/// Check whether `data` starts with an HTTP request line
pub fn request_prefix(data: &[u8]) -> RequestPrefix {
    let mut maybe = false;
    for method in HTTP_METHODS {
        if data.starts_with(method) {
            return RequestPrefix::Yes;
        }
        if data.len() < method.len() && method.starts_with(data) {
            maybe = true;
        }
    }

    if maybe {
        RequestPrefix::Maybe
    } else {
        RequestPrefix::No
    }
}

/// Extract the target host from an HTTP/1.x request head
///
/// The Host header wins; an absolute-form request target
/// (`GET http://host/path HTTP/1.1`) is used when no Host header is present.
/// The returned host is normalized and has any port removed.
pub fn extract_host(data: &[u8]) -> Result<String, HostError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(data) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(HostError::Incomplete),
        Err(e) => return Err(HostError::Malformed(e.to_string())),
    }

    let host = match request
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("host"))
    {
        Some(header) => std::str::from_utf8(header.value)
            .map_err(|_| HostError::InvalidHost("Invalid UTF-8 in host header".to_string()))?
            .to_string(),
        None => request
            .path
            .and_then(authority_from_target)
            .ok_or(HostError::HostHeaderNotFound)?,
    };

    let hostname = crate::normalize_domain(strip_port(host.trim()));
    if !crate::is_valid_domain(&hostname) {
        return Err(HostError::InvalidHost(hostname));
    }

    trace!("Extracted HTTP host: {}", hostname);
    Ok(hostname)
}

/// Authority of an absolute-form request target
fn authority_from_target(target: &str) -> Option<String> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        None
    } else {
        Some(authority.to_string())
    }
}

/// Remove a port from a host value ("example.com:8080" -> "example.com",
/// "[::1]:8080" -> "[::1]")
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}
