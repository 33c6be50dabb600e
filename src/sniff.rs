//! Protocol classification from a connection's first bytes, and a stream
//! wrapper that replays those bytes before reading from the socket

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const SSH_BANNER: &[u8] = b"SSH-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    Ssh,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tls => "tls",
            Protocol::Ssh => "ssh",
            Protocol::Http => "http",
        }
    }
}

/// Classify buffered bytes. `None` means more bytes are needed to decide.
pub fn classify(prefix: &[u8]) -> Option<Protocol> {
    let first = *prefix.first()?;
    if first == 0x16 {
        return Some(Protocol::Tls);
    }
    if first != SSH_BANNER[0] {
        return Some(Protocol::Http);
    }

    let n = prefix.len().min(SSH_BANNER.len());
    if prefix[..n] != SSH_BANNER[..n] {
        return Some(Protocol::Http);
    }
    if n < SSH_BANNER.len() {
        return None;
    }
    Some(Protocol::Ssh)
}

/// Read until the buffered prefix can be classified. A peer that closes
/// early is classified on what it sent; an empty read is an error.
pub async fn sniff<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut Vec<u8>) -> io::Result<Protocol> {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(protocol) = classify(buf) {
            return Ok(protocol);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before sending data",
                ));
            }
            return Ok(Protocol::Http);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Yields `prefix` first, then reads from `inner`. Writes go straight
/// through.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(&[0x16, 0x03, 0x01]), Some(Protocol::Tls));
        assert_eq!(classify(b"SSH-2.0-OpenSSH_9.6"), Some(Protocol::Ssh));
        assert_eq!(classify(b"GET / HTTP/1.1"), Some(Protocol::Http));
        assert_eq!(classify(b"SS"), None);
        assert_eq!(classify(b"SX"), Some(Protocol::Http));
        assert_eq!(classify(b""), None);
    }

    #[tokio::test]
    async fn test_sniff_reads_until_decided() {
        let mut reader = &b"SSH-2.0-client\r\n"[..];
        let mut buf = Vec::new();
        assert_eq!(sniff(&mut reader, &mut buf).await.unwrap(), Protocol::Ssh);
        assert!(buf.starts_with(b"SSH-"));
    }

    #[tokio::test]
    async fn test_sniff_empty_connection() {
        let mut reader = &b""[..];
        let mut buf = Vec::new();
        assert!(sniff(&mut reader, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays_then_reads() {
        let inner = &b" world"[..];
        let mut stream = PrefixedStream::new(b"hello".to_vec(), inner);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_prefixed_stream_small_reads() {
        let mut stream = PrefixedStream::new(b"abc".to_vec(), &b"d"[..]);
        let mut byte = [0u8; 1];
        let mut out = Vec::new();
        while stream.read(&mut byte).await.unwrap() == 1 {
            out.push(byte[0]);
        }
        assert_eq!(out, b"abcd");
    }

    #[tokio::test]
    async fn test_prefixed_stream_writes_pass_through() {
        use tokio::io::AsyncWriteExt;
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(Vec::new(), client);
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
