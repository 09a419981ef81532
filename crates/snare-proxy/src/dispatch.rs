use std::io;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use snare_http::{parse_response_head, BodyMode, RequestHead, ResponseHead};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;

use crate::error::ProxyError;
use crate::hooks::{Hooks, UpstreamProxy, UpstreamScheme};
use crate::message::{Body, BoxedTunnel, Request, Response};
use crate::ProxyConfig;

/// Largest error body accepted from an upstream proxy's CONNECT rejection.
const MAX_PROXY_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Resolves how a CONNECT request reaches its target: the embedder's connect
/// hook, a configured upstream proxy, or a direct dial. On success the
/// response is a synthesized `200 OK` and the tunnel is ready; a non-2xx
/// upstream answer comes back without a tunnel.
pub(crate) async fn connect<H: Hooks>(
    hooks: &H,
    config: &ProxyConfig,
    req: &Request,
    terminate_tls: bool,
) -> Result<(Response, Option<BoxedTunnel>), ProxyError> {
    match hooks.connect(req, terminate_tls).await {
        Ok((response, tunnel)) => return Ok((response, Some(tunnel))),
        Err(ProxyError::ConnectFallback) => {}
        Err(error) => return Err(error),
    }

    let (response, tunnel) = match hooks.proxy_url(req)? {
        None => {
            let stream = dial(hooks, config, req.head.host.clone()).await?;
            (
                Response::connect_ok(&req.head),
                Some(Box::new(stream) as BoxedTunnel),
            )
        }
        Some(upstream) => match upstream.scheme {
            UpstreamScheme::Http | UpstreamScheme::Https => {
                connect_via_http_proxy(hooks, config, req, &upstream).await?
            }
            UpstreamScheme::Socks5 => {
                let stream = connect_via_socks5(config, req, &upstream).await?;
                (
                    Response::connect_ok(&req.head),
                    Some(Box::new(stream) as BoxedTunnel),
                )
            }
            UpstreamScheme::Socks4 => {
                return Err(ProxyError::UnsupportedProxyScheme(
                    upstream.scheme.as_str().to_string(),
                ))
            }
        },
    };

    match (terminate_tls, tunnel) {
        (true, Some(stream)) => {
            let stream = terminate_tls_upstream(hooks, config, &req.head, stream).await?;
            Ok((response, Some(stream)))
        }
        (_, tunnel) => Ok((response, tunnel)),
    }
}

async fn dial<H: Hooks>(
    hooks: &H,
    config: &ProxyConfig,
    addr: String,
) -> Result<TcpStream, ProxyError> {
    let dialed = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, hooks.dial(addr))
            .await
            .map_err(|_| {
                ProxyError::Upstream(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timed out",
                ))
            })?,
        None => hooks.dial(addr).await,
    };
    dialed.map_err(ProxyError::Upstream)
}

/// CONNECT through an upstream HTTP(S) proxy. The client's CONNECT headers
/// are cloned onto the upstream request; a 2xx from the upstream is replaced
/// by our own synthesized `200 OK`, anything else is relayed to the client
/// rebound to its request.
async fn connect_via_http_proxy<H: Hooks>(
    hooks: &H,
    config: &ProxyConfig,
    req: &Request,
    upstream: &UpstreamProxy,
) -> Result<(Response, Option<BoxedTunnel>), ProxyError> {
    let stream = dial(hooks, config, upstream.address()).await?;
    let mut stream: BoxedTunnel = if upstream.scheme == UpstreamScheme::Https {
        Box::new(client_handshake(hooks, config, &upstream.host, Box::new(stream)).await?)
    } else {
        Box::new(stream)
    };

    let mut head = RequestHead {
        method: "CONNECT".to_string(),
        target: req.head.host.clone(),
        scheme: String::new(),
        host: req.head.host.clone(),
        path: String::new(),
        version: snare_http::HttpVersion::Http11,
        headers: req.head.headers.clone(),
        body_mode: BodyMode::None,
        connection_close: false,
    };
    if head.headers.get("Host").is_none() {
        head.headers.set("Host", req.head.host.clone());
    }
    stream
        .write_all(&head.serialize())
        .await
        .map_err(ProxyError::Upstream)?;
    stream.flush().await.map_err(ProxyError::Upstream)?;

    let raw = read_head(&mut stream, config.max_head_bytes)
        .await
        .map_err(ProxyError::Upstream)?;
    let response_head = parse_response_head(&raw, "CONNECT").map_err(|error| {
        ProxyError::Upstream(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("upstream proxy sent an invalid CONNECT response: {error}"),
        ))
    })?;

    if response_head.is_success() {
        // Discard the upstream body (a 2xx CONNECT answer has none) and
        // answer the client with our own response.
        return Ok((Response::connect_ok(&req.head), Some(stream)));
    }

    let body = read_rejection_body(&mut stream, &response_head).await;
    let close = response_head.connection_close;
    let response = Response {
        head: response_head,
        body: match body {
            Some(bytes) if !bytes.is_empty() => Body::Full(bytes),
            _ => Body::Empty,
        },
        close,
        request_method: req.head.method.clone(),
    };
    Ok((response, None))
}

async fn connect_via_socks5(
    config: &ProxyConfig,
    req: &Request,
    upstream: &UpstreamProxy,
) -> Result<Socks5Stream<TcpStream>, ProxyError> {
    let target = (
        req.head.hostname().to_string(),
        req.head.port().unwrap_or(443),
    );
    let proxy_addr = upstream.address();

    let connect = async {
        match (&upstream.username, &upstream.password) {
            (Some(username), Some(password)) => {
                Socks5Stream::connect_with_password(
                    proxy_addr.as_str(),
                    target,
                    username,
                    password,
                )
                .await
            }
            _ => Socks5Stream::connect(proxy_addr.as_str(), target).await,
        }
    };

    let connected = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| {
            ProxyError::Upstream(io::Error::new(
                io::ErrorKind::TimedOut,
                "SOCKS5 connect timed out",
            ))
        })?,
        None => connect.await,
    };
    connected.map_err(|error| ProxyError::Upstream(io::Error::other(error)))
}

/// Client-side TLS handshake toward the upstream, used for `https` upstream
/// proxies and for header-requested TLS termination.
async fn terminate_tls_upstream<H: Hooks>(
    hooks: &H,
    config: &ProxyConfig,
    head: &RequestHead,
    stream: BoxedTunnel,
) -> Result<BoxedTunnel, ProxyError> {
    let tls = client_handshake(hooks, config, head.hostname(), stream).await?;
    Ok(Box::new(tls))
}

async fn client_handshake<H: Hooks>(
    hooks: &H,
    config: &ProxyConfig,
    host: &str,
    stream: BoxedTunnel,
) -> Result<tokio_rustls::client::TlsStream<BoxedTunnel>, ProxyError> {
    let connector = TlsConnector::from(hooks.upstream_tls_config());
    let server_name = ServerName::try_from(host.to_string()).map_err(|error| {
        ProxyError::Handshake(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid TLS server name {host:?}: {error}"),
        ))
    })?;

    let handshake = connector.connect(server_name, stream);
    let connected = match config.tls_handshake_timeout {
        Some(timeout) => tokio::time::timeout(timeout, handshake).await.map_err(|_| {
            ProxyError::Handshake(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream TLS handshake timed out",
            ))
        })?,
        None => handshake.await,
    };
    connected.map_err(ProxyError::Handshake)
}

/// Reads a response head byte by byte so no tunnel bytes are overread.
async fn read_head<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    max_bytes: usize,
) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(256);
    let mut byte = [0_u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before response headers completed",
            ));
        }
        data.push(byte[0]);
        if data.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upstream response head exceeded configured limit",
            ));
        }
    }
    Ok(data)
}

/// Best-effort read of a rejected CONNECT's body; only declared lengths are
/// trusted, and only up to a fixed bound.
async fn read_rejection_body<S: AsyncRead + Unpin + ?Sized>(
    stream: &mut S,
    head: &ResponseHead,
) -> Option<Bytes> {
    match head.body_mode {
        BodyMode::ContentLength(length) if length as usize <= MAX_PROXY_ERROR_BODY_BYTES => {
            let mut body = vec![0_u8; length as usize];
            match stream.read_exact(&mut body).await {
                Ok(_) => Some(Bytes::from(body)),
                Err(_) => None,
            }
        }
        _ => None,
    }
}
