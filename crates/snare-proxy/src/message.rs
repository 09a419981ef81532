use bytes::Bytes;
use snare_http::{BodyMode, Headers, RequestHead, ResponseHead};
use snare_observe::TraceContext;
use tokio::io::{AsyncRead, AsyncWrite};

/// Raw byte stream usable for tunneling in both directions.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> TunnelStream for T {}

pub type BoxedTunnel = Box<dyn TunnelStream>;

/// Message payload as the handler sees it.
///
/// `Poisoned` replaces an upgrade body after its tunnel completes; touching
/// it afterwards is a bug in the embedder and panics.
pub enum Body {
    Empty,
    Full(Bytes),
    Stream(Box<dyn AsyncRead + Send + Sync + Unpin>),
    Tunnel(BoxedTunnel),
    Poisoned,
}

impl Body {
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Full(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub(crate) fn take(&mut self) -> Body {
        std::mem::replace(self, Body::Empty)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Body::Stream"),
            Self::Tunnel(_) => f.write_str("Body::Tunnel"),
            Self::Poisoned => f.write_str("Body::Poisoned"),
        }
    }
}

/// Negotiated TLS facts captured after a MITM handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsInfo {
    pub sni: Option<String>,
    pub alpn: Option<Vec<u8>>,
    pub cipher_suite: Option<String>,
}

#[derive(Debug)]
pub struct Request {
    pub head: RequestHead,
    pub body: Body,
    pub remote_addr: String,
    pub trace: TraceContext,
    pub tls: Option<TlsInfo>,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.head.is_connect()
    }
}

#[derive(Debug)]
pub struct Response {
    pub head: ResponseHead,
    pub body: Body,
    /// Close the client connection after writing. The writer forces this off
    /// for successful CONNECT responses.
    pub close: bool,
    /// Method of the request this response answers; HEAD and CONNECT change
    /// body framing on the wire.
    pub request_method: String,
}

impl Response {
    pub fn new(status: u16, request_method: &str) -> Self {
        Self {
            head: ResponseHead::new(status),
            body: Body::Empty,
            close: false,
            request_method: request_method.to_string(),
        }
    }

    /// The synthesized `200 OK` answering a CONNECT. No headers, no body; the
    /// writer emits it byte-exactly.
    pub fn connect_ok(request_head: &RequestHead) -> Self {
        let mut head = ResponseHead::new(200);
        head.version = request_head.version;
        Self {
            head,
            body: Body::Empty,
            close: false,
            request_method: request_head.method.clone(),
        }
    }

    pub fn with_body_bytes(mut self, content_type: &str, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        self.head.headers.set("Content-Type", content_type);
        self.head.headers.set("Content-Length", bytes.len().to_string());
        self.head.body_mode = BodyMode::ContentLength(bytes.len() as u64);
        self.body = Body::Full(bytes);
        self
    }

    pub fn is_success(&self) -> bool {
        self.head.is_success()
    }

    pub fn is_connect_ok(&self) -> bool {
        self.request_method.eq_ignore_ascii_case("CONNECT") && self.head.is_success()
    }
}

/// Re-adds the hop-by-hop upgrade pair stripped by the modifier chain so
/// protocol switches survive modification.
pub fn restore_upgrade_headers(headers: &mut Headers, upgrade: &str) {
    headers.set("Connection", "Upgrade");
    headers.set("Upgrade", upgrade);
}
