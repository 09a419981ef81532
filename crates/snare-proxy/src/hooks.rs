use std::future::Future;
use std::io;
use std::sync::Arc;

use snare_http::RequestHead;
use tokio::net::TcpStream;

use crate::error::ProxyError;
use crate::message::{BoxedTunnel, Request, Response};
use crate::CloseSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Https,
    Socks5,
    Socks4,
}

impl UpstreamScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
            Self::Socks4 => "socks4",
        }
    }
}

/// Upstream proxy selection returned by the `proxy_url` hook, typically fed
/// from a PAC evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpstreamProxy {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The embedder's policy surface. The proxy composes these capabilities; it
/// does not inherit an interface. Every method has a default so embedders
/// implement only what they use.
pub trait Hooks: Send + Sync + 'static {
    /// Pre-dispatch request transform. Failing writes a synthesized error
    /// response instead of dispatching.
    fn modify_request(&self, _req: &mut Request) -> Result<(), ProxyError> {
        Ok(())
    }

    /// Post-roundtrip response transform.
    fn modify_response(&self, _res: &mut Response) -> Result<(), ProxyError> {
        Ok(())
    }

    /// Plaintext HTTP upstream call for non-CONNECT requests.
    fn round_trip(
        &self,
        _req: Request,
    ) -> impl Future<Output = Result<Response, ProxyError>> + Send {
        async {
            Err(ProxyError::Message(
                "no round tripper configured".to_string(),
            ))
        }
    }

    /// CONNECT dial override. Returning [`ProxyError::ConnectFallback`]
    /// hands the request to the built-in dial path.
    fn connect(
        &self,
        _req: &Request,
        _terminate_tls: bool,
    ) -> impl Future<Output = Result<(Response, BoxedTunnel), ProxyError>> + Send {
        async { Err(ProxyError::ConnectFallback) }
    }

    /// Chooses an upstream proxy for the request, `None` for a direct dial.
    fn proxy_url(&self, _req: &Request) -> Result<Option<UpstreamProxy>, ProxyError> {
        Ok(None)
    }

    /// Direct TCP dial. The dispatcher bounds this with the configured
    /// connect timeout.
    fn dial(&self, addr: String) -> impl Future<Output = io::Result<TcpStream>> + Send {
        async move { TcpStream::connect(&addr).await }
    }

    /// Decides per CONNECT request whether to terminate TLS and re-enter the
    /// HTTP loop (true) or open an opaque tunnel (false).
    fn should_mitm(&self, _req: &Request) -> bool {
        false
    }

    /// Observational: the client-side TLS termination failed.
    fn handshake_error(&self, _req: &RequestHead, _error: &io::Error) {}

    /// Terminal handoff of an `h2`-negotiated TLS stream to the HTTP/2 proxy
    /// subsystem. The close signal turns true on proxy shutdown. The default
    /// closes the stream.
    fn h2_proxy(
        &self,
        _shutdown: CloseSignal,
        stream: BoxedTunnel,
        _authority: String,
    ) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            drop(stream);
            Ok(())
        }
    }

    /// TLS client config used when terminating TLS toward upstreams.
    fn upstream_tls_config(&self) -> Arc<rustls::ClientConfig> {
        snare_mitm::upstream_client_config()
    }
}

/// Hook set with every default in place: direct dialing, no MITM, no
/// round-tripper.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl Hooks for DefaultHooks {}

/// `X-Martian-Terminate-Tls` values the proxy accepts as "on".
pub fn is_truthy_header_value(value: &str) -> bool {
    matches!(
        value.trim(),
        "1" | "t" | "T" | "true" | "TRUE" | "True"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values_follow_bool_parsing() {
        for value in ["1", "t", "T", "true", "TRUE", "True", " true "] {
            assert!(is_truthy_header_value(value), "{value:?} must be truthy");
        }
        for value in ["0", "false", "", "yes", "on"] {
            assert!(!is_truthy_header_value(value), "{value:?} must be falsy");
        }
    }

    #[test]
    fn upstream_proxy_formats_dial_address() {
        let upstream = UpstreamProxy {
            scheme: UpstreamScheme::Http,
            host: "corp-proxy".to_string(),
            port: 3128,
            username: None,
            password: None,
        };
        assert_eq!(upstream.address(), "corp-proxy:3128");
    }
}
