use std::io;
use std::sync::Arc;

use snare_http::{parse_chunk_size_line, parse_request_head, upgrade_type, BodyMode, RequestHead};
use snare_observe::{Event, EventType, FlowContext, TraceContext};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

use crate::conn::{ClientConn, Prebuffered};
use crate::dispatch;
use crate::error::{error_response, is_closed_conn_error, ProxyError};
use crate::hooks::{is_truthy_header_value, Hooks};
use crate::message::{restore_upgrade_headers, Body, BoxedTunnel, Request, Response};
use crate::write::write_response;
use crate::{Proxy, TERMINATE_TLS_HEADER};

/// Tunnel copy buffers, per direction.
const TUNNEL_COPY_BUF_SIZE: usize = 32 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;

pub(crate) enum Flow {
    Continue(ClientConn),
    Close,
}

pub(crate) async fn serve_connection<H: Hooks>(
    proxy: Arc<Proxy<H>>,
    stream: TcpStream,
    remote_addr: String,
) {
    let mut conn = ClientConn::new(stream, remote_addr);
    loop {
        match handle_one(&proxy, conn).await {
            Flow::Continue(next) => conn = next,
            Flow::Close => break,
        }
    }
}

/// One request/response cycle of the per-connection state machine.
async fn handle_one<H: Hooks>(proxy: &Proxy<H>, mut conn: ClientConn) -> Flow {
    let mut req = match read_request(proxy, &mut conn).await {
        Ok(Some(req)) => req,
        Ok(None) => {
            emit_closed(proxy, &conn, "peer_closed", None);
            return Flow::Close;
        }
        Err(error) => {
            let reason = match error.kind() {
                io::ErrorKind::TimedOut => "read_timeout",
                io::ErrorKind::InvalidData => "parse_error",
                _ if is_closed_conn_error(&error) => "peer_closed",
                _ => "read_error",
            };
            emit_closed(proxy, &conn, reason, Some(&error.to_string()));
            return Flow::Close;
        }
    };

    let context = flow_context(&conn, &req);
    let mut event = Event::new(EventType::RequestRead, context.clone())
        .with_attribute("method", req.head.method.clone())
        .with_attribute("path", req.head.path.clone());
    if req.is_connect() {
        if let Some(length) = req.head.headers.get("Content-Length") {
            event = event.with_attribute("ignored_content_length", length);
        }
    }
    proxy.emit(event);

    if proxy.closing() {
        emit_closed(proxy, &conn, "shutting_down", None);
        return Flow::Close;
    }

    if req.is_connect() {
        return handle_connect(proxy, conn, req, context).await;
    }

    if req.head.scheme.is_empty() {
        req.head.scheme = if conn.secure { "https" } else { "http" }.to_string();
    }

    let req_close = req.head.connection_close;
    let req_upgrade = upgrade_type(&req.head.headers);

    if let Err(error) = proxy.hooks.modify_request(&mut req) {
        return write_error(proxy, conn, &req.head, req_close, error, &context).await;
    }
    // The modifier chain strips hop-by-hop headers; put the upgrade pair back
    // so protocol switches survive it.
    if let Some(upgrade) = &req_upgrade {
        restore_upgrade_headers(&mut req.head.headers, upgrade);
    }

    let request_head = req.head.clone();
    let mut res = match proxy.hooks.round_trip(req).await {
        Ok(res) => res,
        Err(error) => {
            return write_error(proxy, conn, &request_head, req_close, error, &context).await;
        }
    };
    // The round tripper may rebind the response; tie it back to the client's
    // request so framing decisions see the original method.
    res.request_method = request_head.method.clone();

    let res_upgrade = upgrade_type(&res.head.headers);
    if let Err(error) = proxy.hooks.modify_response(&mut res) {
        return write_error(proxy, conn, &request_head, req_close, error, &context).await;
    }
    if let Some(upgrade) = &res_upgrade {
        restore_upgrade_headers(&mut res.head.headers, upgrade);
    }

    if res.head.status == 101 {
        return handle_upgrade(proxy, conn, res, context).await;
    }

    finish_response(proxy, conn, req_close, res, &context).await
}

/// The deadline discipline around reading one request.
///
/// The idle deadline covers the wait for the first byte; header and read
/// timers only start once the client has committed to a request, so a
/// long-lived idle connection never eats into per-request budgets.
async fn read_request<H: Hooks>(
    proxy: &Proxy<H>,
    conn: &mut ClientConn,
) -> io::Result<Option<Request>> {
    let idle_deadline = proxy.config.idle_timeout.map(|d| Instant::now() + d);
    conn.set_read_deadline(idle_deadline);

    if conn.peek_one().await?.is_none() {
        return Ok(None);
    }

    let t0 = Instant::now();
    let header_deadline = proxy.config.read_header_timeout.map(|d| t0 + d);
    conn.set_read_deadline(header_deadline);

    let raw = match conn
        .read_until_pattern(b"\r\n\r\n", proxy.config.max_head_bytes)
        .await?
    {
        Some(raw) => raw,
        None => return Ok(None),
    };

    let mut head = parse_request_head(&raw)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;

    if head.host.is_empty() {
        if let Some(host) = head.headers.get("Host") {
            head.host = host.to_string();
        }
    }
    let trace = TraceContext::derive(head.headers.get(&proxy.config.request_id_header));

    if proxy.config.read_header_timeout != proxy.config.read_timeout {
        conn.set_read_deadline(proxy.config.read_timeout.map(|d| t0 + d));
    }

    let body = read_request_body(proxy, conn, &mut head).await?;

    Ok(Some(Request {
        body,
        remote_addr: conn.remote_addr.clone(),
        trace,
        tls: conn.tls.clone(),
        head,
    }))
}

/// Buffers the request body so the round tripper can take ownership of the
/// request. Chunked bodies are decoded and re-declared as a plain length.
async fn read_request_body<H: Hooks>(
    proxy: &Proxy<H>,
    conn: &mut ClientConn,
    head: &mut RequestHead,
) -> io::Result<Body> {
    let limit = proxy.config.max_request_body_bytes;
    match head.body_mode {
        BodyMode::None | BodyMode::CloseDelimited => Ok(Body::Empty),
        BodyMode::ContentLength(length) => {
            if length as usize > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request body exceeds configured limit",
                ));
            }
            let body = conn.read_exact_buffered(length as usize).await?;
            Ok(Body::Full(body.into()))
        }
        BodyMode::Chunked => {
            let mut body = Vec::new();
            loop {
                let line = conn
                    .read_until_pattern(b"\r\n", CHUNK_LINE_LIMIT)
                    .await?
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before chunk size line",
                        )
                    })?;
                let size = parse_chunk_size_line(&line)
                    .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
                if size == 0 {
                    // Trailer section: lines until the empty one.
                    loop {
                        let trailer = conn
                            .read_until_pattern(b"\r\n", CHUNK_LINE_LIMIT)
                            .await?
                            .ok_or_else(|| {
                                io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "connection closed inside chunked trailers",
                                )
                            })?;
                        if trailer == b"\r\n" {
                            break;
                        }
                    }
                    break;
                }
                if body.len() + size as usize > limit {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "request body exceeds configured limit",
                    ));
                }
                body.extend_from_slice(&conn.read_exact_buffered(size as usize).await?);
                let terminator = conn.read_exact_buffered(2).await?;
                if terminator != b"\r\n" {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid chunk terminator",
                    ));
                }
            }

            head.headers.remove("Transfer-Encoding");
            head.headers.set("Content-Length", body.len().to_string());
            head.body_mode = if body.is_empty() {
                BodyMode::None
            } else {
                BodyMode::ContentLength(body.len() as u64)
            };
            Ok(if body.is_empty() {
                Body::Empty
            } else {
                Body::Full(body.into())
            })
        }
    }
}

async fn handle_connect<H: Hooks>(
    proxy: &Proxy<H>,
    conn: ClientConn,
    mut req: Request,
    context: FlowContext,
) -> Flow {
    let terminate_tls = req
        .head
        .headers
        .get(TERMINATE_TLS_HEADER)
        .map(is_truthy_header_value)
        .unwrap_or(false);
    req.head.headers.remove(TERMINATE_TLS_HEADER);

    proxy.emit(Event::new(EventType::ConnectReceived, context.clone()));

    if let Err(error) = proxy.hooks.modify_request(&mut req) {
        let req_close = req.head.connection_close;
        return write_error(proxy, conn, &req.head, req_close, error, &context).await;
    }

    let wants_mitm = proxy.mitm.is_some() && proxy.hooks.should_mitm(&req);
    proxy.emit(
        Event::new(EventType::ConnectDecision, context.clone()).with_attribute(
            "action",
            if wants_mitm { "mitm" } else { "tunnel" },
        ),
    );

    if wants_mitm {
        handle_mitm(proxy, conn, req, context).await
    } else {
        handle_tunnel(proxy, conn, req, terminate_tls, context).await
    }
}

/// The MITM path: acknowledge the CONNECT, sniff one byte, and either
/// terminate TLS with a forged leaf or fall back to parsing plaintext over
/// the "tunnel".
async fn handle_mitm<H: Hooks>(
    proxy: &Proxy<H>,
    mut conn: ClientConn,
    req: Request,
    context: FlowContext,
) -> Flow {
    let mut res = Response::connect_ok(&req.head);
    if let Err(error) = proxy.hooks.modify_response(&mut res) {
        let req_close = req.head.connection_close;
        return write_error(proxy, conn, &req.head, req_close, error, &context).await;
    }
    match write_response(
        &mut conn,
        proxy.config.write_timeout,
        proxy.closing(),
        false,
        res,
    )
    .await
    {
        Ok(_) => {}
        Err(error) => {
            emit_closed(proxy, &conn, "write_error", Some(&error.to_string()));
            return Flow::Close;
        }
    }

    conn.set_read_deadline(proxy.config.idle_timeout.map(|d| Instant::now() + d));
    let first = match conn.peek_one().await {
        Ok(Some(byte)) => byte,
        Ok(None) => {
            emit_closed(proxy, &conn, "peer_closed", None);
            return Flow::Close;
        }
        Err(error) => {
            emit_closed(proxy, &conn, "read_error", Some(&error.to_string()));
            return Flow::Close;
        }
    };

    // 0x16 is the TLS handshake record type; anything else means the client
    // is pushing opaque or plaintext bytes through the "tunnel". Those bytes
    // stay buffered for the next request parse either way.
    if first != 0x16 {
        return Flow::Continue(conn);
    }

    let Some(engine) = proxy.mitm.as_ref() else {
        return Flow::Close;
    };
    proxy.emit(Event::new(EventType::MitmStarted, context.clone()));

    let (stream, read_buf, remote_addr) = conn.into_parts();
    let acceptor = TlsAcceptor::from(engine.server_config(Some(&req.head.host)));
    let handshake = acceptor.accept(Prebuffered::new(read_buf, stream));

    let accepted = match proxy.config.mitm_tls_handshake_timeout {
        Some(timeout) => tokio::time::timeout(timeout, handshake)
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "MITM TLS handshake timed out",
                ))
            }),
        None => handshake.await,
    };

    let tls = match accepted {
        Ok(tls) => tls,
        Err(error) => {
            proxy.hooks.handshake_error(&req.head, &error);
            proxy.emit(
                Event::new(EventType::TlsHandshakeFailed, context)
                    .with_attribute("error", error.to_string()),
            );
            return Flow::Close;
        }
    };

    let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(snare_mitm::ALPN_H2);
    if negotiated_h2 {
        let authority = req.head.host.clone();
        let _ = proxy
            .hooks
            .h2_proxy(proxy.close_signal(), Box::new(tls) as BoxedTunnel, authority)
            .await;
        return Flow::Close;
    }

    // Plaintext HTTP/1.1 continues over the decrypted stream.
    Flow::Continue(ClientConn::resume_after_handshake(tls, remote_addr))
}

/// The opaque tunnel path for CONNECT.
async fn handle_tunnel<H: Hooks>(
    proxy: &Proxy<H>,
    conn: ClientConn,
    req: Request,
    terminate_tls: bool,
    context: FlowContext,
) -> Flow {
    let dispatched = dispatch::connect(&proxy.hooks, &proxy.config, &req, terminate_tls).await;
    let (mut res, upstream) = match dispatched {
        Ok(result) => result,
        Err(error) => {
            let req_close = req.head.connection_close;
            return write_error(proxy, conn, &req.head, req_close, error, &context).await;
        }
    };

    if let Err(error) = proxy.hooks.modify_response(&mut res) {
        let req_close = req.head.connection_close;
        return write_error(proxy, conn, &req.head, req_close, error, &context).await;
    }

    if !res.is_success() {
        // CONNECT was rejected upstream; relay the rejection and keep the
        // connection usable.
        return finish_response(proxy, conn, req.head.connection_close, res, &context).await;
    }

    let Some(upstream) = upstream else {
        let error = ProxyError::Message("connect returned no upstream stream".to_string());
        let req_close = req.head.connection_close;
        return write_error(proxy, conn, &req.head, req_close, error, &context).await;
    };

    tunnel(proxy, conn, "CONNECT", res, upstream, context).await;
    Flow::Close
}

/// 101 Switching Protocols: the response body must be the upstream byte
/// stream; afterwards it is replaced with a sentinel that panics on misuse.
async fn handle_upgrade<H: Hooks>(
    proxy: &Proxy<H>,
    conn: ClientConn,
    mut res: Response,
    context: FlowContext,
) -> Flow {
    let upgrade = upgrade_type(&res.head.headers).unwrap_or_else(|| "unknown".to_string());
    let stream = match res.body.take() {
        Body::Tunnel(stream) => stream,
        _ => {
            emit_closed(
                proxy,
                &conn,
                "upgrade_without_stream",
                Some("switching-protocols response carried no tunnel body"),
            );
            return Flow::Close;
        }
    };
    res.body = Body::Poisoned;

    tunnel(proxy, conn, &upgrade, res, stream, context).await;
    Flow::Close
}

/// Writes the response headers, drains bytes the client already sent into
/// the upstream, then copies raw bytes both ways until either side ends.
async fn tunnel<H: Hooks>(
    proxy: &Proxy<H>,
    mut conn: ClientConn,
    name: &str,
    res: Response,
    mut upstream: BoxedTunnel,
    context: FlowContext,
) {
    if let Err(error) = write_response(
        &mut conn,
        proxy.config.write_timeout,
        proxy.closing(),
        false,
        res,
    )
    .await
    {
        emit_closed(proxy, &conn, "write_error", Some(&error.to_string()));
        return;
    }

    if !conn.read_buf.is_empty() {
        let buffered = std::mem::take(&mut conn.read_buf);
        if let Err(error) = upstream.write_all(&buffered).await {
            emit_closed(proxy, &conn, "tunnel_error", Some(&error.to_string()));
            return;
        }
    }

    proxy.emit(Event::new(EventType::TunnelOpened, context.clone()).with_attribute("name", name));
    let started = Instant::now();
    conn.set_read_deadline(None);
    conn.set_write_deadline(None);

    let result = bicopy(&mut conn.stream, &mut upstream).await;

    let mut event = Event::new(EventType::TunnelClosed, context)
        .with_attribute("name", name)
        .with_attribute("duration_ms", started.elapsed().as_millis().to_string());
    match result {
        Ok((from_client, from_upstream)) => {
            event = event
                .with_attribute("bytes_from_client", from_client.to_string())
                .with_attribute("bytes_from_upstream", from_upstream.to_string());
        }
        Err(error) => {
            event = event.with_attribute("error", error.to_string());
        }
    }
    proxy.emit(event);
}

/// Concurrent two-directional raw copy. The first EOF or error in either
/// direction ends the tunnel; the surviving side gets a write shutdown so the
/// peer observes the close.
async fn bicopy<A, B>(client: &mut A, upstream: &mut B) -> io::Result<(u64, u64)>
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut client_buf = vec![0_u8; TUNNEL_COPY_BUF_SIZE];
    let mut upstream_buf = vec![0_u8; TUNNEL_COPY_BUF_SIZE];
    let mut from_client = 0_u64;
    let mut from_upstream = 0_u64;

    loop {
        tokio::select! {
            read = client.read(&mut client_buf) => {
                let read = read?;
                if read == 0 {
                    let _ = upstream.shutdown().await;
                    return Ok((from_client, from_upstream));
                }
                upstream.write_all(&client_buf[..read]).await?;
                upstream.flush().await?;
                from_client += read as u64;
            }
            read = upstream.read(&mut upstream_buf) => {
                let read = read?;
                if read == 0 {
                    let _ = client.shutdown().await;
                    return Ok((from_client, from_upstream));
                }
                client.write_all(&upstream_buf[..read]).await?;
                client.flush().await?;
                from_upstream += read as u64;
            }
        }
    }
}

/// Synthesizes and writes an error response, passing it through the response
/// modifiers best-effort first.
async fn write_error<H: Hooks>(
    proxy: &Proxy<H>,
    conn: ClientConn,
    request_head: &RequestHead,
    req_close: bool,
    error: ProxyError,
    context: &FlowContext,
) -> Flow {
    let mut res = error_response(request_head, &error, proxy.config.without_warning);
    let _ = proxy.hooks.modify_response(&mut res);

    proxy.emit(
        Event::new(EventType::ResponseWritten, context.clone())
            .with_attribute("status", res.head.status.to_string())
            .with_attribute("error", error.to_string())
            .with_attribute("error_code", error.code()),
    );
    write_and_flow(proxy, conn, req_close, res).await
}

async fn finish_response<H: Hooks>(
    proxy: &Proxy<H>,
    conn: ClientConn,
    req_close: bool,
    res: Response,
    context: &FlowContext,
) -> Flow {
    proxy.emit(
        Event::new(EventType::ResponseWritten, context.clone())
            .with_attribute("status", res.head.status.to_string()),
    );
    write_and_flow(proxy, conn, req_close, res).await
}

async fn write_and_flow<H: Hooks>(
    proxy: &Proxy<H>,
    mut conn: ClientConn,
    req_close: bool,
    res: Response,
) -> Flow {
    match write_response(
        &mut conn,
        proxy.config.write_timeout,
        proxy.closing(),
        req_close,
        res,
    )
    .await
    {
        Ok(false) => Flow::Continue(conn),
        Ok(true) => {
            emit_closed(proxy, &conn, "connection_close", None);
            Flow::Close
        }
        Err(error) => {
            let reason = if is_closed_conn_error(&error) {
                "peer_closed"
            } else {
                "write_error"
            };
            emit_closed(proxy, &conn, reason, Some(&error.to_string()));
            Flow::Close
        }
    }
}

fn flow_context(conn: &ClientConn, req: &Request) -> FlowContext {
    let default_port = if conn.secure { 443 } else { 80 };
    FlowContext {
        trace_id: req.trace.id.clone(),
        client_addr: conn.remote_addr.clone(),
        host: req.head.hostname().to_string(),
        port: req.head.port().unwrap_or(default_port),
    }
}

fn emit_closed<H: Hooks>(proxy: &Proxy<H>, conn: &ClientConn, reason: &str, error: Option<&str>) {
    let mut event = Event::new(
        EventType::StreamClosed,
        FlowContext {
            trace_id: String::new(),
            client_addr: conn.remote_addr.clone(),
            host: String::new(),
            port: 0,
        },
    )
    .with_attribute("reason", reason);
    if let Some(error) = error {
        event = event.with_attribute("error", error);
    }
    proxy.emit(event);
}
