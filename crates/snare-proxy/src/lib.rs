//! An intercepting HTTP/HTTPS forward proxy core.
//!
//! Accepts client HTTP/1.1 traffic, tunnels or terminates TLS with forged
//! leaves under an operator-supplied root CA, and relays requests upstream
//! directly or through a chained proxy. Policy lives in the embedder's
//! [`Hooks`]; this crate owns the per-connection state machine.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use snare_mitm::MitmEngine;
use snare_observe::{Event, EventSink, NoopEventSink};
use tokio::net::TcpListener;
use tokio::sync::watch;

mod conn;
mod dispatch;
mod error;
mod handler;
mod hooks;
mod message;
pub mod pac;
mod write;

pub use error::{error_response, is_closed_conn_error, ProxyError};
pub use hooks::{is_truthy_header_value, DefaultHooks, Hooks, UpstreamProxy, UpstreamScheme};
pub use message::{
    restore_upgrade_headers, Body, BoxedTunnel, Request, Response, TlsInfo, TunnelStream,
};

/// CONNECT requests carrying a truthy value here ask the proxy to terminate
/// TLS toward the upstream. Consumed before the modifier chain runs.
pub const TERMINATE_TLS_HEADER: &str = "X-Martian-Terminate-Tls";

/// Observes proxy shutdown; `*signal.borrow()` turns true once
/// [`Proxy::shutdown`] has been called. Handed to long-running hook work such
/// as the HTTP/2 proxy subsystem.
pub type CloseSignal = watch::Receiver<bool>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Wait budget for the first byte of the next request. Zero/None keeps
    /// idle connections open indefinitely.
    pub idle_timeout: Option<Duration>,
    /// Budget for the whole request once its first byte arrived.
    pub read_timeout: Option<Duration>,
    /// Budget for request line and headers once the first byte arrived.
    pub read_header_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Client-side TLS handshakes toward upstreams.
    pub tls_handshake_timeout: Option<Duration>,
    /// Server-side handshake when terminating an intercepted client.
    pub mitm_tls_handshake_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Header whose value seeds the per-request trace id.
    pub request_id_header: String,
    /// Suppresses the `Warning` header on synthesized error responses.
    pub without_warning: bool,
    pub max_head_bytes: usize,
    pub max_request_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 0,
            idle_timeout: Some(Duration::from_secs(30)),
            read_timeout: None,
            read_header_timeout: Some(Duration::from_secs(10)),
            write_timeout: None,
            tls_handshake_timeout: Some(Duration::from_secs(10)),
            mitm_tls_handshake_timeout: Some(Duration::from_secs(10)),
            connect_timeout: Some(Duration::from_secs(10)),
            request_id_header: "X-Request-Id".to_string(),
            without_warning: false,
            max_head_bytes: 64 * 1024,
            max_request_body_bytes: 64 * 1024 * 1024,
        }
    }
}

pub struct Proxy<H: Hooks> {
    pub(crate) config: ProxyConfig,
    pub(crate) hooks: H,
    pub(crate) mitm: Option<Arc<MitmEngine>>,
    pub(crate) sink: Arc<dyn EventSink>,
    shutdown: watch::Sender<bool>,
}

impl<H: Hooks> Proxy<H> {
    pub fn new(config: ProxyConfig, hooks: H) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            hooks,
            mitm: None,
            sink: Arc::new(NoopEventSink),
            shutdown,
        }
    }

    /// Enables the MITM path. Without an engine every `should_mitm` answer
    /// is ignored and CONNECTs tunnel.
    pub fn with_mitm(mut self, engine: Arc<MitmEngine>) -> Self {
        self.mitm = Some(engine);
        self
    }

    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn mitm_engine(&self) -> Option<&Arc<MitmEngine>> {
        self.mitm.as_ref()
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind((self.config.listen_addr.as_str(), self.config.listen_port)).await
    }

    /// Accept loop: one task per connection, until [`Proxy::shutdown`].
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let proxy = Arc::clone(&self);
                    tokio::spawn(handler::serve_connection(
                        proxy,
                        stream,
                        peer_addr.to_string(),
                    ));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Signals shutdown: the accept loop stops and connection handlers close
    /// after the in-flight response.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub(crate) fn closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn close_signal(&self) -> CloseSignal {
        self.shutdown.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        self.sink.emit(event);
    }
}
