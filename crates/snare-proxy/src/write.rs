use std::io;
use std::time::Duration;

use snare_http::{is_text_event_stream, status_has_no_body};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use crate::conn::{ClientConn, IO_CHUNK_SIZE};
use crate::message::{Body, Response};

/// Raw bytes of a successful CONNECT response. Written directly so no
/// content-length or keep-alive framing can leak into the tunnel.
pub(crate) const CONNECT_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushPolicy {
    EveryChunk,
    SseBoundary,
}

impl FlushPolicy {
    fn wants_flush(self, chunk: &[u8]) -> bool {
        match self {
            Self::EveryChunk => true,
            Self::SseBoundary => contains_sse_boundary(chunk),
        }
    }
}

fn contains_sse_boundary(chunk: &[u8]) -> bool {
    crate::conn::find_subsequence(chunk, b"\n\n").is_some()
        || crate::conn::find_subsequence(chunk, b"\n\r\n").is_some()
}

/// Writes `res` to the client, applying the connection-close discipline and
/// the body-framing variants. Returns whether the connection must close
/// afterwards.
///
/// `server_closing` reflects proxy shutdown; `request_close` the client's
/// `Connection: close`. A successful CONNECT never closes, whatever either
/// flag says.
pub(crate) async fn write_response(
    conn: &mut ClientConn,
    write_timeout: Option<Duration>,
    server_closing: bool,
    request_close: bool,
    mut res: Response,
) -> io::Result<bool> {
    if let Some(timeout) = write_timeout {
        conn.set_write_deadline(Some(Instant::now() + timeout));
    }

    res.close = server_closing || request_close || res.close;
    if res.is_connect_ok() {
        res.close = false;
    }
    if res.close {
        res.head.headers.append("Connection", "close");
    }
    let close = res.close;

    let result = write_framed(conn, res).await;

    // Drain whatever made it into buffers, even after a failed write.
    if result.is_err() {
        let _ = conn.flush().await;
    } else {
        conn.flush().await?;
    }
    conn.set_write_deadline(None);

    result.map(|_| close)
}

async fn write_framed(conn: &mut ClientConn, mut res: Response) -> io::Result<()> {
    if res.is_connect_ok() {
        return conn.write_all(CONNECT_OK).await;
    }

    if res.request_method.eq_ignore_ascii_case("HEAD") || status_has_no_body(res.head.status) {
        return write_header_only(conn, &res).await;
    }

    match res.body.take() {
        Body::Empty => {
            res.head.headers.remove("Transfer-Encoding");
            res.head.headers.set("Content-Length", "0");
            conn.write_all(&res.head.serialize()).await
        }
        Body::Full(bytes) => {
            res.head.headers.remove("Transfer-Encoding");
            res.head
                .headers
                .set("Content-Length", bytes.len().to_string());
            conn.write_all(&res.head.serialize()).await?;
            conn.write_all(&bytes).await
        }
        Body::Stream(reader) => {
            let policy = if is_text_event_stream(&res.head.headers) {
                FlushPolicy::SseBoundary
            } else {
                FlushPolicy::EveryChunk
            };
            res.head.headers.remove("Content-Length");
            res.head.headers.set("Transfer-Encoding", "chunked");
            conn.write_all(&res.head.serialize()).await?;
            conn.flush().await?;
            write_chunked_body(conn, reader, policy).await
        }
        Body::Tunnel(_) => Err(io::Error::other(
            "tunnel bodies are written by the tunnel, not the response writer",
        )),
        Body::Poisoned => panic!("response body was already consumed by an upgrade tunnel"),
    }
}

/// Status line, headers, optional `Trailer:` declaration and the end-of-header
/// CRLF, serialized by hand. HEAD responses and zero-body statuses take this
/// path so no body framing is emitted for them.
async fn write_header_only(conn: &mut ClientConn, res: &Response) -> io::Result<()> {
    let mut out = res.head.serialize();
    if !res.head.trailers.is_empty() && res.head.headers.get("Trailer").is_none() {
        // serialize() ends with the blank line; splice the Trailer field in
        // front of it.
        out.truncate(out.len() - 2);
        out.extend_from_slice(b"Trailer: ");
        out.extend_from_slice(res.head.trailers.join(", ").as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
    }
    conn.write_all(&out).await
}

/// Re-frames a streaming body as chunked transfer coding, flushing at the
/// policy's boundaries so streamed responses reach the client promptly.
async fn write_chunked_body(
    conn: &mut ClientConn,
    mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    policy: FlushPolicy,
) -> io::Result<()> {
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            conn.write_all(b"0\r\n\r\n").await?;
            return Ok(());
        }
        conn.write_all(format!("{read:X}\r\n").as_bytes()).await?;
        conn.write_all(&chunk[..read]).await?;
        conn.write_all(b"\r\n").await?;
        if policy.wants_flush(&chunk[..read]) {
            conn.flush().await?;
        }
    }
}
