//! TLS ClientHello SNI extraction

use thiserror::Error;
use tracing::trace;

/// TLS record content type for handshake messages
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for server_name
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// server_name entry type for host_name
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Largest TLS plaintext record fragment (2^14) plus the allowed expansion
const MAX_RECORD_LEN: usize = 16384 + 2048;

/// SNI extraction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    /// More bytes are needed before the ClientHello can be parsed
    #[error("ClientHello incomplete")]
    Incomplete,

    /// The ClientHello parsed but carries no server_name extension
    #[error("ClientHello has no server_name extension")]
    NoServerName,

    #[error("Malformed ClientHello: {0}")]
    Malformed(String),

    #[error("Invalid SNI hostname: {0}")]
    InvalidSni(String),
}

/// Returns true if `data` starts like a TLS handshake record
pub fn is_tls_handshake(data: &[u8]) -> bool {
    data.first() == Some(&CONTENT_TYPE_HANDSHAKE)
}

/// Extract SNI from the leading bytes of a TLS connection
///
/// `data` must start at the first TLS record. The ClientHello may be split
/// across several handshake records; they are reassembled until the whole
/// handshake message is available. Returns [`SniError::Incomplete`] when the
/// buffer ends before that point.
pub fn extract_sni(data: &[u8]) -> Result<String, SniError> {
    let mut handshake: Vec<u8> = Vec::new();
    let mut offset = 0;

    loop {
        if data.len() < offset + 5 {
            return Err(SniError::Incomplete);
        }

        let content_type = data[offset];
        if content_type != CONTENT_TYPE_HANDSHAKE {
            return Err(SniError::Malformed(format!(
                "unexpected record type 0x{:02x}",
                content_type
            )));
        }

        let major_version = data[offset + 1];
        if major_version != 0x03 {
            return Err(SniError::Malformed(format!(
                "unsupported record version {}.{}",
                major_version,
                data[offset + 2]
            )));
        }

        let record_len = u16::from_be_bytes([data[offset + 3], data[offset + 4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return Err(SniError::Malformed(format!(
                "invalid record length {}",
                record_len
            )));
        }

        let fragment_start = offset + 5;
        let fragment_end = fragment_start + record_len;
        if data.len() < fragment_end {
            return Err(SniError::Incomplete);
        }

        handshake.extend_from_slice(&data[fragment_start..fragment_end]);
        offset = fragment_end;

        if handshake.len() < 4 {
            continue;
        }

        if handshake[0] != HANDSHAKE_CLIENT_HELLO {
            return Err(SniError::Malformed(format!(
                "expected ClientHello, got handshake type {}",
                handshake[0]
            )));
        }

        let body_len =
            ((handshake[1] as usize) << 16) | ((handshake[2] as usize) << 8) | handshake[3] as usize;
        if handshake.len() >= 4 + body_len {
            return parse_client_hello(&handshake[4..4 + body_len]);
        }
    }
}

/// Parse a complete ClientHello body (after the 4-byte handshake header)
fn parse_client_hello(body: &[u8]) -> Result<String, SniError> {
    let mut reader = Reader::new(body);

    // Client version (2 bytes) + random (32 bytes)
    reader.skip(2 + 32)?;

    let session_id_len = reader.u8()? as usize;
    reader.skip(session_id_len)?;

    let cipher_suites_len = reader.u16()? as usize;
    if cipher_suites_len % 2 != 0 {
        return Err(SniError::Malformed("odd cipher suites length".to_string()));
    }
    reader.skip(cipher_suites_len)?;

    let compression_methods_len = reader.u8()? as usize;
    reader.skip(compression_methods_len)?;

    // Extensions are optional in a ClientHello
    if reader.remaining() == 0 {
        return Err(SniError::NoServerName);
    }

    let extensions_len = reader.u16()? as usize;
    let mut extensions = Reader::new(reader.take(extensions_len)?);

    while extensions.remaining() > 0 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext_data = extensions.take(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(ext_data);
        }
    }

    Err(SniError::NoServerName)
}

/// Parse the server_name extension data
fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    let mut reader = Reader::new(data);
    let list_len = reader.u16()? as usize;
    let mut list = Reader::new(reader.take(list_len)?);

    while list.remaining() > 0 {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;

        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let hostname = std::str::from_utf8(name)
            .map_err(|_| SniError::InvalidSni("Invalid UTF-8 in hostname".to_string()))?;

        if hostname.is_empty() {
            return Err(SniError::InvalidSni("Empty hostname".to_string()));
        }

        let hostname = crate::normalize_domain(hostname);
        if !crate::is_valid_domain(&hostname) {
            return Err(SniError::InvalidSni(hostname));
        }

        trace!("Extracted SNI hostname: {}", hostname);
        return Ok(hostname);
    }

    Err(SniError::NoServerName)
}

/// Bounds-checked big-endian cursor over a complete structure
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SniError> {
        if self.remaining() < len {
            return Err(SniError::Malformed(format!(
                "field of {} bytes overruns structure ({} left)",
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), SniError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
