#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snare_mitm::{insecure_client_config, upstream_client_config, MitmConfig, MitmEngine, RootAuthority};
use snare_observe::VecEventSink;
use snare_proxy::{
    BoxedTunnel, Hooks, Proxy, ProxyConfig, ProxyError, Request, Response, UpstreamProxy,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub secure: bool,
}

/// Hook set driven by canned responses, recording everything it sees.
#[derive(Default)]
pub struct TestHooks {
    pub mitm_all: bool,
    pub insecure_upstream_tls: bool,
    pub upstream: Mutex<Option<UpstreamProxy>>,
    pub responses: Mutex<VecDeque<Response>>,
    pub seen: Mutex<Vec<RequestRecord>>,
    pub h2_handoff: Mutex<Option<String>>,
}

impl TestHooks {
    pub fn push_response(&self, response: Response) {
        self.responses.lock().expect("lock poisoned").push_back(response);
    }

    pub fn with_upstream(self, upstream: UpstreamProxy) -> Self {
        *self.upstream.lock().expect("lock poisoned") = Some(upstream);
        self
    }

    pub fn seen_requests(&self) -> Vec<RequestRecord> {
        self.seen.lock().expect("lock poisoned").clone()
    }

    pub fn h2_authority(&self) -> Option<String> {
        self.h2_handoff.lock().expect("lock poisoned").clone()
    }

    fn record(&self, req: &Request) {
        self.seen.lock().expect("lock poisoned").push(RequestRecord {
            method: req.head.method.clone(),
            scheme: req.head.scheme.clone(),
            host: req.head.host.clone(),
            path: req.head.path.clone(),
            headers: req
                .head
                .headers
                .iter()
                .map(|header| (header.name.clone(), header.value.clone()))
                .collect(),
            body: req.body.bytes().map(|bytes| bytes.to_vec()).unwrap_or_default(),
            secure: req.tls.is_some(),
        });
    }
}

impl Hooks for TestHooks {
    fn modify_request(&self, req: &mut Request) -> Result<(), ProxyError> {
        self.record(req);
        Ok(())
    }

    fn round_trip(&self, _req: Request) -> impl Future<Output = Result<Response, ProxyError>> + Send {
        let next = self.responses.lock().expect("lock poisoned").pop_front();
        async move {
            next.ok_or_else(|| ProxyError::Message("no canned response queued".to_string()))
        }
    }

    fn proxy_url(&self, _req: &Request) -> Result<Option<UpstreamProxy>, ProxyError> {
        Ok(self.upstream.lock().expect("lock poisoned").clone())
    }

    fn should_mitm(&self, _req: &Request) -> bool {
        self.mitm_all
    }

    fn h2_proxy(
        &self,
        _shutdown: snare_proxy::CloseSignal,
        stream: BoxedTunnel,
        authority: String,
    ) -> impl Future<Output = std::io::Result<()>> + Send {
        *self.h2_handoff.lock().expect("lock poisoned") = Some(authority);
        async move {
            drop(stream);
            Ok(())
        }
    }

    fn upstream_tls_config(&self) -> Arc<rustls::ClientConfig> {
        if self.insecure_upstream_tls {
            insecure_client_config()
        } else {
            upstream_client_config()
        }
    }
}

pub fn test_mitm_engine() -> Arc<MitmEngine> {
    let root = RootAuthority::generate("snare test CA", "snare", Duration::from_secs(86_400))
        .expect("generate CA");
    Arc::new(MitmEngine::new(root, MitmConfig::default()).expect("build engine"))
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub proxy: Arc<Proxy<TestHooks>>,
    pub sink: VecEventSink,
    pub task: JoinHandle<std::io::Result<()>>,
}

pub async fn start_proxy(hooks: TestHooks, mitm: Option<Arc<MitmEngine>>) -> RunningProxy {
    start_proxy_with_config(ProxyConfig::default(), hooks, mitm).await
}

pub async fn start_proxy_with_config(
    config: ProxyConfig,
    hooks: TestHooks,
    mitm: Option<Arc<MitmEngine>>,
) -> RunningProxy {
    let sink = VecEventSink::default();
    let mut proxy = Proxy::new(config, hooks).with_event_sink(sink.clone());
    if let Some(engine) = mitm {
        proxy = proxy.with_mitm(engine);
    }
    let proxy = Arc::new(proxy);
    let listener = proxy.bind_listener().await.expect("bind proxy listener");
    let addr = listener.local_addr().expect("proxy local addr");
    let task = tokio::spawn(Arc::clone(&proxy).run_with_listener(listener));
    RunningProxy {
        addr,
        proxy,
        sink,
        task,
    }
}

pub async fn connect_to(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect to proxy")
}

/// Reads until the end of a header block, returning everything read so far.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut data = Vec::new();
    let mut byte = [0_u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("head read timed out")
            .expect("head read failed");
        if read == 0 {
            break;
        }
        data.push(byte[0]);
    }
    data
}

pub async fn read_exact_bytes<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Vec<u8> {
    let mut data = vec![0_u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut data))
        .await
        .expect("exact read timed out")
        .expect("exact read failed");
    data
}

/// Keeps reading until `needle` shows up or the deadline passes.
pub async fn read_until_contains<S: AsyncRead + Unpin>(
    stream: &mut S,
    collected: &mut Vec<u8>,
    needle: &[u8],
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut chunk = [0_u8; 1024];
    while !contains(collected, needle) {
        let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .expect("read timed out waiting for needle")
            .expect("read failed");
        assert!(read > 0, "stream closed before {needle:?} arrived");
        collected.extend_from_slice(&chunk[..read]);
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

pub async fn write_all<S: AsyncWriteExt + Unpin>(stream: &mut S, bytes: &[u8]) {
    stream.write_all(bytes).await.expect("write failed");
    stream.flush().await.expect("flush failed");
}

pub fn response_with_body(status: u16, method: &str, body: &str) -> Response {
    Response::new(status, method).with_body_bytes("text/plain", body.to_string())
}
