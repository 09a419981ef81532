use std::io;

use snare_http::{BodyMode, RequestHead};

use crate::message::{Body, Response};

/// Errors surfaced by hooks and the dispatch path. Everything that reaches
/// the client is shaped into a 502/503/504-family response by
/// [`error_response`].
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Sentinel returned by a `connect` hook to request the built-in CONNECT
    /// path. Never user-visible.
    #[error("connect fallback")]
    ConnectFallback,
    #[error("unsupported proxy scheme: {0}")]
    UnsupportedProxyScheme(String),
    /// Connect-specific rejection carrying its own status code.
    #[error("connect denied ({status}): {message}")]
    Denied { status: u16, message: String },
    #[error("modifier failed: {0}")]
    Modifier(String),
    #[error("upstream error: {0}")]
    Upstream(#[source] io::Error),
    #[error("TLS handshake with upstream failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("{0}")]
    Message(String),
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectFallback => "connect_fallback",
            Self::UnsupportedProxyScheme(_) => "unsupported_proxy_scheme",
            Self::Denied { .. } => "connect_denied",
            Self::Modifier(_) => "modifier_failed",
            Self::Upstream(_) => "upstream_error",
            Self::Handshake(_) => "upstream_handshake_failed",
            Self::Message(_) => "proxy_error",
        }
    }

    /// Status the synthesized error response carries: timeouts map to 504,
    /// unreachable upstreams to 503, everything else to 502.
    pub fn response_status(&self) -> u16 {
        match self {
            Self::Denied { status, .. } => *status,
            Self::Upstream(error) | Self::Handshake(error) => match error.kind() {
                io::ErrorKind::TimedOut => 504,
                io::ErrorKind::ConnectionRefused => 503,
                _ => 502,
            },
            _ => 502,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(error: io::Error) -> Self {
        Self::Upstream(error)
    }
}

/// Shapes an error into the response written back to the client. Unless the
/// embedder opted out, a `Warning` header carries the underlying error text.
pub fn error_response(request: &RequestHead, error: &ProxyError, without_warning: bool) -> Response {
    let mut response = Response::new(error.response_status(), &request.method);
    response.head.headers.set("Content-Length", "0");
    response.head.body_mode = BodyMode::None;
    response.body = Body::Empty;
    if !without_warning {
        response
            .head
            .headers
            .set("Warning", format!("199 snare-proxy {:?}", error.to_string()));
    }
    response
}

/// EOF-ish errors: the peer went away, which is routine and logged at debug
/// granularity rather than treated as a failure.
pub fn is_closed_conn_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestHead {
        snare_http::parse_request_head(
            b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .expect("valid head")
    }

    #[test]
    fn timeouts_become_gateway_timeout() {
        let error = ProxyError::Upstream(io::Error::new(io::ErrorKind::TimedOut, "dial timed out"));
        assert_eq!(error.response_status(), 504);
    }

    #[test]
    fn refused_upstreams_become_service_unavailable() {
        let error = ProxyError::Upstream(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(error.response_status(), 503);
    }

    #[test]
    fn everything_else_becomes_bad_gateway() {
        assert_eq!(ProxyError::Modifier("boom".to_string()).response_status(), 502);
        assert_eq!(
            ProxyError::UnsupportedProxyScheme("socks4".to_string()).response_status(),
            502
        );
    }

    #[test]
    fn denied_errors_carry_their_own_status() {
        let error = ProxyError::Denied {
            status: 403,
            message: "blocked by policy".to_string(),
        };
        assert_eq!(error.response_status(), 403);
    }

    #[test]
    fn warning_header_is_optional() {
        let request = request();
        let error = ProxyError::Message("upstream exploded".to_string());

        let with_warning = error_response(&request, &error, false);
        let warning = with_warning.head.headers.get("Warning").expect("warning header");
        assert!(warning.starts_with("199 snare-proxy"));
        assert!(warning.contains("upstream exploded"));

        let without_warning = error_response(&request, &error, true);
        assert_eq!(without_warning.head.headers.get("Warning"), None);
        assert_eq!(without_warning.head.headers.get("Content-Length"), Some("0"));
    }
}
