//! Async domain sniffing over an unknown byte stream

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::http::{self, HostError, RequestPrefix};
use crate::sni::{self, SniError};
use crate::DomainSource;

/// Size of a single read while sniffing
const READ_CHUNK: usize = 4096;

/// Byte and time budget for locating a domain indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffLimits {
    /// Maximum number of bytes buffered before giving up
    pub max_bytes: usize,
    /// Maximum time spent waiting for the domain indicator
    pub timeout: Duration,
}

impl Default for SniffLimits {
    fn default() -> Self {
        Self {
            max_bytes: 32 * 1024,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a successful sniff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    /// Normalized target domain
    pub domain: String,
    pub source: DomainSource,
    /// Every byte read from the stream while sniffing, in order
    pub prefix: Bytes,
}

#[derive(Debug, Error)]
pub enum SniffError {
    /// No domain indicator within the byte/time budget, or the stream is not
    /// TLS or HTTP at all
    #[error("No domain found: {0}")]
    NoDomainFound(String),

    /// A TLS or HTTP prefix was recognized but is truncated or invalid
    #[error("Malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("IO error while sniffing: {0}")]
    Io(#[from] std::io::Error),
}

enum Step {
    Found(String, DomainSource),
    NeedMore,
    Failed(SniffError),
}

/// Read from `stream` until the target domain is known
///
/// Returns the domain along with all bytes consumed, which the caller must
/// replay to whoever receives the rest of the stream. Nothing beyond what the
/// parsers needed is read, except for the tail of the last read chunk.
pub async fn sniff<R>(stream: &mut R, limits: &SniffLimits) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match tokio::time::timeout(limits.timeout, sniff_inner(stream, limits.max_bytes)).await {
        Ok(result) => result,
        Err(_) => Err(SniffError::NoDomainFound(format!(
            "no domain indicator within {:?}",
            limits.timeout
        ))),
    }
}

async fn sniff_inner<R>(stream: &mut R, max_bytes: usize) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = BytesMut::with_capacity(READ_CHUNK.min(max_bytes));
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let want = READ_CHUNK.min(max_bytes.saturating_sub(buffer.len()));
        if want == 0 {
            return Err(SniffError::NoDomainFound(format!(
                "no domain indicator within {} bytes",
                max_bytes
            )));
        }

        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(if buffer.is_empty() {
                SniffError::NoDomainFound("connection closed before any data".to_string())
            } else {
                SniffError::MalformedProtocol(format!(
                    "connection closed after {} bytes of an incomplete prefix",
                    buffer.len()
                ))
            });
        }
        buffer.extend_from_slice(&chunk[..n]);
        trace!("Sniffer buffered {} bytes", buffer.len());

        match classify(&buffer) {
            Step::Found(domain, source) => {
                debug!("Sniffed domain {} via {} ({} bytes)", domain, source, buffer.len());
                return Ok(Sniffed {
                    domain,
                    source,
                    prefix: buffer.freeze(),
                });
            }
            Step::NeedMore => continue,
            Step::Failed(e) => return Err(e),
        }
    }
}

fn classify(data: &[u8]) -> Step {
    if sni::is_tls_handshake(data) {
        return match sni::extract_sni(data) {
            Ok(domain) => Step::Found(domain, DomainSource::TlsSni),
            Err(SniError::Incomplete) => Step::NeedMore,
            Err(SniError::NoServerName) => Step::Failed(SniffError::NoDomainFound(
                "ClientHello without server_name".to_string(),
            )),
            Err(e) => Step::Failed(SniffError::MalformedProtocol(e.to_string())),
        };
    }

    match http::request_prefix(data) {
        RequestPrefix::Yes => match http::extract_host(data) {
            Ok(domain) => Step::Found(domain, DomainSource::HttpHost),
            Err(HostError::Incomplete) => Step::NeedMore,
            Err(HostError::HostHeaderNotFound) => Step::Failed(SniffError::NoDomainFound(
                "HTTP request without Host header".to_string(),
            )),
            Err(e) => Step::Failed(SniffError::MalformedProtocol(e.to_string())),
        },
        RequestPrefix::Maybe => Step::NeedMore,
        RequestPrefix::No => {
            Step::Failed(SniffError::NoDomainFound("unrecognized protocol".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn client_hello(hostname: &str) -> Vec<u8> {
        let mut entry = vec![0x00];
        entry.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        entry.extend_from_slice(hostname.as_bytes());
        let mut ext = vec![0x00, 0x00];
        ext.extend_from_slice(&((entry.len() + 2) as u16).to_be_bytes());
        ext.extend_from_slice(&(entry.len() as u16).to_be_bytes());
        ext.extend_from_slice(&entry);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.extend_from_slice(&[0x00, 0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = vec![0x01, 0x00];
        handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    async fn sniff_bytes(chunks: Vec<Vec<u8>>, limits: SniffLimits) -> Result<Sniffed, SniffError> {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            for chunk in chunks {
                if client.write_all(&chunk).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        });
        sniff(&mut server, &limits).await
    }

    #[tokio::test]
    async fn test_sniff_tls_in_small_chunks() {
        let hello = client_hello("api.example.com");
        let chunks = hello.chunks(7).map(|c| c.to_vec()).collect();

        let sniffed = sniff_bytes(chunks, SniffLimits::default()).await.unwrap();
        assert_eq!(sniffed.domain, "api.example.com");
        assert_eq!(sniffed.source, DomainSource::TlsSni);
        assert_eq!(&sniffed.prefix[..], &hello[..]);
    }

    #[tokio::test]
    async fn test_sniff_http_host() {
        let request = b"GET /index HTTP/1.1\r\nHost: web.example.com:8080\r\n\r\n".to_vec();
        let chunks = vec![request[..3].to_vec(), request[3..20].to_vec(), request[20..].to_vec()];

        let sniffed = sniff_bytes(chunks, SniffLimits::default()).await.unwrap();
        assert_eq!(sniffed.domain, "web.example.com");
        assert_eq!(sniffed.source, DomainSource::HttpHost);
        assert_eq!(&sniffed.prefix[..], &request[..]);
    }

    #[tokio::test]
    async fn test_sniff_prefix_plus_remainder_reproduces_stream() {
        let mut payload = client_hello("api.example.com");
        payload.extend_from_slice(&[0x17, 0x03, 0x03, 0x00, 0x03, 0xaa, 0xbb, 0xcc]);
        let original = payload.clone();

        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(&payload).await.unwrap();
        drop(client);

        let sniffed = sniff(&mut server, &SniffLimits::default()).await.unwrap();
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();

        let mut replayed = sniffed.prefix.to_vec();
        replayed.extend_from_slice(&rest);
        assert_eq!(replayed, original);
    }

    #[tokio::test]
    async fn test_sniff_unrecognized_protocol() {
        let result = sniff_bytes(vec![b"SSH-2.0-OpenSSH_9.0\r\n".to_vec()], SniffLimits::default()).await;
        assert!(matches!(result, Err(SniffError::NoDomainFound(_))));
    }

    #[tokio::test]
    async fn test_sniff_http_without_host() {
        let result = sniff_bytes(
            vec![b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n".to_vec()],
            SniffLimits::default(),
        )
        .await;
        assert!(matches!(result, Err(SniffError::NoDomainFound(_))));
    }

    #[tokio::test]
    async fn test_sniff_truncated_client_hello() {
        let hello = client_hello("api.example.com");
        let result = sniff_bytes(vec![hello[..20].to_vec()], SniffLimits::default()).await;
        assert!(matches!(result, Err(SniffError::MalformedProtocol(_))));
    }

    #[tokio::test]
    async fn test_sniff_empty_stream() {
        let result = sniff_bytes(Vec::new(), SniffLimits::default()).await;
        assert!(matches!(result, Err(SniffError::NoDomainFound(_))));
    }

    #[tokio::test]
    async fn test_sniff_byte_budget() {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend_from_slice(format!("X-Padding: {}\r\n", "a".repeat(200)).as_bytes());
        let limits = SniffLimits {
            max_bytes: 64,
            ..SniffLimits::default()
        };

        let result = sniff_bytes(vec![request], limits).await;
        assert!(matches!(result, Err(SniffError::NoDomainFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sniff_time_budget() {
        let (_client, mut server) = tokio::io::duplex(1024);
        let limits = SniffLimits {
            timeout: Duration::from_millis(200),
            ..SniffLimits::default()
        };

        let result = sniff(&mut server, &limits).await;
        assert!(matches!(result, Err(SniffError::NoDomainFound(_))));
    }
}
