//! SNI extraction from a TLS ClientHello
//!
//! Only enough of the first record is read to find the server name. The
//! bytes consumed are kept by the caller and replayed to whoever completes
//! the handshake.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Server name, lowercased without a trailing dot
    Found(String),
    /// A ClientHello without the server_name extension
    NoSni,
    /// Not a TLS handshake record
    NotTls,
    /// Fewer bytes than the record header declares
    Incomplete,
    Malformed,
}

/// Read the first TLS record into `buf` (appending to whatever the caller
/// already read), stopping at `max_bytes`
pub async fn read_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> io::Result<()> {
    let mut chunk = [0u8; 2048];

    loop {
        let wanted = match record_len(buf) {
            Some(len) => (RECORD_HEADER_LEN + len).min(max_bytes),
            None => RECORD_HEADER_LEN,
        };
        if buf.len() >= wanted || (buf.len() >= 1 && buf[0] != CONTENT_TYPE_HANDSHAKE) {
            return Ok(());
        }

        let limit = (wanted - buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..limit]).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn record_len(data: &[u8]) -> Option<usize> {
    if data.len() < RECORD_HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([data[3], data[4]]) as usize)
}

/// Parse the server name out of a buffered ClientHello
pub fn parse_sni(data: &[u8]) -> SniResult {
    if data.is_empty() {
        return SniResult::Incomplete;
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return SniResult::NotTls;
    }
    let Some(len) = record_len(data) else {
        return SniResult::Incomplete;
    };
    if data.len() < RECORD_HEADER_LEN + len {
        return SniResult::Incomplete;
    }

    let handshake = &data[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len];
    match parse_client_hello(handshake) {
        Some(result) => result,
        None => SniResult::Malformed,
    }
}

/// Handshake message: type(1) length(3) version(2) random(32) session_id
/// cipher_suites compression_methods extensions
fn parse_client_hello(handshake: &[u8]) -> Option<SniResult> {
    let mut r = Reader::new(handshake);
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Some(SniResult::NotTls);
    }
    let body_len = r.u24()?;
    let mut body = Reader::new(r.take(body_len)?);

    body.skip(2 + 32)?;
    let session_id = body.u8()? as usize;
    body.skip(session_id)?;
    let suites = body.u16()? as usize;
    body.skip(suites)?;
    let compression = body.u8()? as usize;
    body.skip(compression)?;

    if body.is_empty() {
        return Some(SniResult::NoSni);
    }
    let extensions_len = body.u16()? as usize;
    let mut extensions = Reader::new(body.take(extensions_len)?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext = extensions.take(ext_len)?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(ext);
        }
    }
    Some(SniResult::NoSni)
}

fn parse_server_name(ext: &[u8]) -> Option<SniResult> {
    let mut r = Reader::new(ext);
    let list_len = r.u16()? as usize;
    let mut list = Reader::new(r.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == NAME_TYPE_HOST {
            let host = std::str::from_utf8(name).ok()?;
            if host.is_empty() {
                return None;
            }
            return Some(SniResult::Found(
                host.trim_end_matches('.').to_ascii_lowercase(),
            ));
        }
    }
    Some(SniResult::NoSni)
}

/// Bounds-checked big-endian cursor
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal well-formed ClientHello, with the server_name extension when
    /// `server_name` is set
    pub(crate) fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = server_name {
            let name = name.as_bytes();
            let mut list = vec![NAME_TYPE_HOST];
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name);

            let mut ext = (list.len() as u16).to_be_bytes().to_vec();
            ext.extend_from_slice(&list);

            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }
        // supported_versions, to put something after server_name
        extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[7u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_parse_sni_found() {
        let hello = client_hello(Some("ABC123.Cloud.Example.com."));
        assert_eq!(
            parse_sni(&hello),
            SniResult::Found("abc123.cloud.example.com".to_string())
        );
    }

    #[test]
    fn test_parse_sni_absent() {
        assert_eq!(parse_sni(&client_hello(None)), SniResult::NoSni);
    }

    #[test]
    fn test_parse_not_tls() {
        assert_eq!(
            parse_sni(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            SniResult::NotTls
        );
    }

    #[test]
    fn test_parse_incomplete() {
        let hello = client_hello(Some("example.com"));
        assert_eq!(parse_sni(&hello[..3]), SniResult::Incomplete);
        assert_eq!(parse_sni(&hello[..hello.len() - 1]), SniResult::Incomplete);
    }

    #[test]
    fn test_parse_malformed_lengths() {
        let mut hello = client_hello(Some("example.com"));
        // Inflate the handshake length past the record
        hello[6] = 0xff;
        assert_eq!(parse_sni(&hello), SniResult::Malformed);
    }

    #[tokio::test]
    async fn test_read_client_hello_stops_at_record_end() {
        let hello = client_hello(Some("example.com"));
        let mut input = hello.clone();
        input.extend_from_slice(b"trailing application data");

        let mut reader = &input[..];
        let mut buf = Vec::new();
        read_client_hello(&mut reader, &mut buf, 16 * 1024).await.unwrap();
        assert_eq!(buf, hello);
    }

    #[tokio::test]
    async fn test_read_client_hello_keeps_prefix() {
        let hello = client_hello(Some("example.com"));
        let mut buf = hello[..1].to_vec();
        let mut reader = &hello[1..];
        read_client_hello(&mut reader, &mut buf, 16 * 1024).await.unwrap();
        assert_eq!(parse_sni(&buf), SniResult::Found("example.com".to_string()));
    }

    #[tokio::test]
    async fn test_read_client_hello_not_tls_returns_early() {
        let mut reader = &b"SSH-2.0-OpenSSH_9.6\r\n"[..];
        let mut buf = Vec::new();
        read_client_hello(&mut reader, &mut buf, 1024).await.unwrap();
        assert_eq!(parse_sni(&buf), SniResult::NotTls);
    }
}
