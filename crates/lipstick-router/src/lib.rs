//! Domain sniffing for raw inbound connections
//!
//! Inspects the leading bytes of a TCP stream to find the domain it is
//! destined for, either from the SNI extension of a TLS ClientHello or from
//! the Host header of a plaintext HTTP request. The bytes read along the way
//! are handed back so the stream can be relayed untouched.

pub mod http;
pub mod sni;
pub mod sniff;

pub use http::HostError;
pub use sni::SniError;
pub use sniff::{sniff, SniffError, SniffLimits, Sniffed};

/// Where a sniffed domain came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainSource {
    /// TLS ClientHello server_name extension
    TlsSni,
    /// HTTP Host header (or absolute-form request target)
    HttpHost,
}

impl std::fmt::Display for DomainSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainSource::TlsSni => write!(f, "tls-sni"),
            DomainSource::HttpHost => write!(f, "http-host"),
        }
    }
}

/// Normalize a domain for registry lookups: trims whitespace, drops a
/// trailing dot and lower-cases it
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Check that a domain only contains characters valid in a hostname or IP literal
pub fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b':' | b'[' | b']'))
        && !domain.starts_with('.')
        && !domain.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("API.Example.com"), "api.example.com");
        assert_eq!(normalize_domain("example.com."), "example.com");
        assert_eq!(normalize_domain("  example.com "), "example.com");
    }

    #[test]
    fn test_is_valid_domain() {
        assert!(is_valid_domain("api.example.com"));
        assert!(is_valid_domain("192.168.1.1"));
        assert!(is_valid_domain("my_service.internal"));
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("bad host.com"));
        assert!(!is_valid_domain(".example.com"));
        assert!(!is_valid_domain("a..b"));
        assert!(!is_valid_domain(&"a".repeat(254)));
    }
}
