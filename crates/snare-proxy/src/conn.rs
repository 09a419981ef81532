use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;

use crate::message::TlsInfo;

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Replays a prefix of already-read bytes before falling through to the
/// inner stream. This is what carries peeked bytes across the MITM decision
/// boundary into the TLS handshake.
pub(crate) struct Prebuffered<S> {
    prefix: BytesMut,
    stream: S,
}

impl<S> Prebuffered<S> {
    pub(crate) fn new(prefix: impl Into<Bytes>, stream: S) -> Self {
        Self {
            prefix: BytesMut::from(&prefix.into()[..]),
            stream,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(out.remaining());
            let chunk = self.prefix.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// The client-facing byte stream. Starts plain; each MITM handshake wraps
/// the current stream (with its unread bytes re-prepended) in another TLS
/// layer.
pub(crate) enum ClientStream {
    Plain(TcpStream),
    Secure(Box<TlsStream<Prebuffered<ClientStream>>>),
}

impl ClientStream {
    pub(crate) fn tls_info(&self) -> Option<TlsInfo> {
        match self {
            Self::Plain(_) => None,
            Self::Secure(tls) => {
                let (_, connection) = tls.get_ref();
                Some(TlsInfo {
                    sni: connection.server_name().map(str::to_string),
                    alpn: connection.alpn_protocol().map(<[u8]>::to_vec),
                    cipher_suite: connection
                        .negotiated_cipher_suite()
                        .map(|suite| format!("{:?}", suite.suite())),
                })
            }
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Secure(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Secure(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Secure(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Secure(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One accepted client connection with its unconsumed read buffer and the
/// currently armed deadlines. Deadlines are applied around each suspension
/// point rather than checked per byte.
pub(crate) struct ClientConn {
    pub(crate) stream: ClientStream,
    pub(crate) read_buf: Vec<u8>,
    pub(crate) secure: bool,
    pub(crate) tls: Option<TlsInfo>,
    pub(crate) remote_addr: String,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl ClientConn {
    pub(crate) fn new(stream: TcpStream, remote_addr: String) -> Self {
        Self {
            stream: ClientStream::Plain(stream),
            read_buf: Vec::new(),
            secure: false,
            tls: None,
            remote_addr,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub(crate) fn resume_after_handshake(
        stream: TlsStream<Prebuffered<ClientStream>>,
        remote_addr: String,
    ) -> Self {
        let stream = ClientStream::Secure(Box::new(stream));
        let tls = stream.tls_info();
        Self {
            stream,
            read_buf: Vec::new(),
            secure: true,
            tls,
            remote_addr,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Splits the connection into its stream and unconsumed buffer, for
    /// wrapping in a TLS handshake.
    pub(crate) fn into_parts(self) -> (ClientStream, Vec<u8>, String) {
        (self.stream, self.read_buf, self.remote_addr)
    }

    pub(crate) fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    pub(crate) fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// One read into the buffer, honoring the armed read deadline. Returns
    /// the number of bytes read; zero is EOF.
    pub(crate) async fn read_more(&mut self) -> io::Result<usize> {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = with_deadline(self.read_deadline, self.stream.read(&mut chunk)).await?;
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Looks at the next byte without consuming it. `None` means the peer
    /// closed before sending anything. Header and read timers must not start
    /// until this returns: the client has not committed to a request yet.
    pub(crate) async fn peek_one(&mut self) -> io::Result<Option<u8>> {
        while self.read_buf.is_empty() {
            if self.read_more().await? == 0 {
                return Ok(None);
            }
        }
        Ok(Some(self.read_buf[0]))
    }

    /// Reads until `pattern` is buffered, returning everything up to and
    /// including it. `None` on a clean EOF before any bytes arrived.
    pub(crate) async fn read_until_pattern(
        &mut self,
        pattern: &[u8],
        max_bytes: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, pattern) {
                let end = start + pattern.len();
                return Ok(Some(self.read_buf.drain(..end).collect()));
            }
            if self.read_buf.len() > max_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head exceeded configured limit",
                ));
            }
            if self.read_more().await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message boundary was reached",
                ));
            }
        }
    }

    pub(crate) async fn read_exact_buffered(&mut self, exact_len: usize) -> io::Result<Vec<u8>> {
        while self.read_buf.len() < exact_len {
            if self.read_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before fixed-length body completed",
                ));
            }
        }
        Ok(self.read_buf.drain(..exact_len).collect())
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        with_deadline(self.write_deadline, self.stream.write_all(bytes)).await
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        with_deadline(self.write_deadline, self.stream.flush()).await
    }
}

pub(crate) async fn with_deadline<T, F>(deadline: Option<Instant>, future: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))?,
        None => future.await,
    }
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn prebuffered_replays_prefix_before_inner_stream() {
        let inner = std::io::Cursor::new(b" world".to_vec());
        let mut stream = Prebuffered::new(Bytes::from_static(b"hello"), inner);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.expect("read all");
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn with_deadline_times_out_pending_reads() {
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        let result = with_deadline(deadline, std::future::pending::<io::Result<()>>()).await;
        let error = result.expect_err("must time out");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn with_deadline_disarmed_runs_to_completion() {
        let value = with_deadline(None, async { Ok(7_u8) }).await.expect("ok");
        assert_eq!(value, 7);
    }

    #[test]
    fn subsequence_search_finds_first_occurrence() {
        assert_eq!(find_subsequence(b"abc\r\n\r\nrest", b"\r\n\r\n"), Some(3));
        assert_eq!(find_subsequence(b"abc", b"\r\n\r\n"), None);
        assert_eq!(find_subsequence(b"abc", b""), Some(0));
    }
}
