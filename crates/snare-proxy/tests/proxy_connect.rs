mod support;

use std::sync::Arc;
use std::time::Duration;

use snare_observe::EventType;
use snare_proxy::{UpstreamProxy, UpstreamScheme, TERMINATE_TLS_HEADER};
use support::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const CONNECT_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

async fn spawn_echo_upstream() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept upstream");
        let mut buf = [0_u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if stream.write_all(&buf[..read]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (addr, task)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_connect_tunnels_raw_bytes_both_ways() {
    let (upstream_addr, upstream_task) = spawn_echo_upstream().await;
    let running = start_proxy(TestHooks::default(), None).await;

    let mut tcp = connect_to(running.addr).await;
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port(),
        upstream_addr.port()
    );
    write_all(&mut tcp, connect.as_bytes()).await;

    let ok = read_exact_bytes(&mut tcp, CONNECT_OK.len()).await;
    assert_eq!(ok, CONNECT_OK);

    write_all(&mut tcp, b"opaque bytes").await;
    let echoed = read_exact_bytes(&mut tcp, b"opaque bytes".len()).await;
    assert_eq!(echoed, b"opaque bytes");

    drop(tcp);
    upstream_task.await.expect("upstream task");

    // Tunnel lifecycle is observable.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = running.sink.snapshot();
    assert!(events.iter().any(|e| e.kind == EventType::TunnelOpened));
    let closed = events
        .iter()
        .find(|e| e.kind == EventType::TunnelClosed)
        .expect("tunnel close event");
    assert!(closed.attributes.contains_key("duration_ms"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_buffered_client_bytes_reach_the_upstream() {
    let (upstream_addr, upstream_task) = spawn_echo_upstream().await;
    let running = start_proxy(TestHooks::default(), None).await;

    let mut tcp = connect_to(running.addr).await;
    // The first tunnel payload rides in the same segment as the CONNECT.
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\nearly",
        upstream_addr.port(),
        upstream_addr.port()
    );
    write_all(&mut tcp, connect.as_bytes()).await;

    let ok = read_exact_bytes(&mut tcp, CONNECT_OK.len()).await;
    assert_eq!(ok, CONNECT_OK);
    let echoed = read_exact_bytes(&mut tcp, b"early".len()).await;
    assert_eq!(echoed, b"early");

    drop(tcp);
    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upstream_http_proxy_connect_clones_headers_and_synthesizes_200() {
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake proxy");
    let proxy_addr = proxy_listener.local_addr().expect("fake proxy addr");
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = proxy_listener.accept().await.expect("accept");
        let head = read_head(&mut stream).await;
        let text = String::from_utf8_lossy(&head);
        assert!(
            text.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"),
            "{text}"
        );
        // The client's CONNECT headers were cloned onto the upstream CONNECT.
        assert!(text.contains("X-Test-Header: 1"), "{text}");
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\nX-Upstream: corp\r\n\r\n")
            .await
            .expect("write 200");
        // Echo one payload to prove the tunnel runs through us.
        let mut buf = [0_u8; 5];
        stream.read_exact(&mut buf).await.expect("read payload");
        stream.write_all(&buf).await.expect("echo payload");
    });

    let hooks = TestHooks::default().with_upstream(UpstreamProxy {
        scheme: UpstreamScheme::Http,
        host: proxy_addr.ip().to_string(),
        port: proxy_addr.port(),
        username: None,
        password: None,
    });
    let running = start_proxy(hooks, None).await;

    let mut tcp = connect_to(running.addr).await;
    write_all(
        &mut tcp,
        b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nX-Test-Header: 1\r\n\r\n",
    )
    .await;

    // Our own 200, not the upstream's: byte-exact, upstream headers dropped.
    let ok = read_exact_bytes(&mut tcp, CONNECT_OK.len()).await;
    assert_eq!(ok, CONNECT_OK);

    write_all(&mut tcp, b"probe").await;
    let echoed = read_exact_bytes(&mut tcp, 5).await;
    assert_eq!(echoed, b"probe");

    drop(tcp);
    upstream_task.await.expect("fake proxy task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upstream_proxy_rejection_is_relayed_to_the_client() {
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake proxy");
    let proxy_addr = proxy_listener.local_addr().expect("fake proxy addr");
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = proxy_listener.accept().await.expect("accept");
        let _ = read_head(&mut stream).await;
        stream
            .write_all(
                b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 6\r\n\r\ndenied",
            )
            .await
            .expect("write 407");
    });

    let hooks = TestHooks::default().with_upstream(UpstreamProxy {
        scheme: UpstreamScheme::Http,
        host: proxy_addr.ip().to_string(),
        port: proxy_addr.port(),
        username: None,
        password: None,
    });
    let running = start_proxy(hooks, None).await;

    let mut tcp = connect_to(running.addr).await;
    write_all(
        &mut tcp,
        b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
    )
    .await;

    let mut collected = Vec::new();
    read_until_contains(&mut tcp, &mut collected, b"denied").await;
    let text = String::from_utf8_lossy(&collected);
    assert!(text.starts_with("HTTP/1.1 407"), "{text}");

    upstream_task.await.expect("fake proxy task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn socks4_directives_are_rejected_as_unsupported() {
    let hooks = TestHooks::default().with_upstream(UpstreamProxy {
        scheme: UpstreamScheme::Socks4,
        host: "127.0.0.1".to_string(),
        port: 1080,
        username: None,
        password: None,
    });
    let running = start_proxy(hooks, None).await;

    let mut tcp = connect_to(running.addr).await;
    write_all(
        &mut tcp,
        b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
    )
    .await;

    let mut collected = Vec::new();
    read_until_contains(&mut tcp, &mut collected, b"\r\n\r\n").await;
    let text = String::from_utf8_lossy(&collected);
    assert!(text.starts_with("HTTP/1.1 502"), "{text}");
    assert!(text.contains("Warning: 199 snare-proxy"), "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminate_tls_header_wraps_the_upstream_in_tls() {
    // A TLS upstream that answers one plaintext-over-TLS exchange.
    let engine = test_mitm_engine();
    let server_config = engine.server_config(Some("127.0.0.1"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = listener.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let acceptor = TlsAcceptor::from(server_config);
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut tls = acceptor.accept(tcp).await.expect("upstream TLS accept");
        let mut buf = [0_u8; 5];
        tls.read_exact(&mut buf).await.expect("read hello");
        assert_eq!(&buf, b"hello");
        tls.write_all(b"world").await.expect("write world");
        tls.shutdown().await.ok();
    });

    let hooks = TestHooks {
        insecure_upstream_tls: true,
        ..TestHooks::default()
    };
    let running = start_proxy(hooks, None).await;

    let mut tcp = connect_to(running.addr).await;
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n{TERMINATE_TLS_HEADER}: true\r\n\r\n",
        port = upstream_addr.port()
    );
    write_all(&mut tcp, connect.as_bytes()).await;

    let ok = read_exact_bytes(&mut tcp, CONNECT_OK.len()).await;
    assert_eq!(ok, CONNECT_OK);

    // The client speaks plaintext; the proxy terminated TLS upstream.
    write_all(&mut tcp, b"hello").await;
    let reply = read_exact_bytes(&mut tcp, 5).await;
    assert_eq!(reply, b"world");

    upstream_task.await.expect("upstream task");

    // The header was consumed before the modifier chain ran.
    let seen = running.proxy.hooks().seen_requests();
    let connect_record = seen
        .iter()
        .find(|r| r.method == "CONNECT")
        .expect("CONNECT recorded");
    assert!(
        !connect_record
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(TERMINATE_TLS_HEADER)),
        "terminate-TLS header must be stripped before modifiers"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_upstream_becomes_a_gateway_error() {
    let hooks = TestHooks::default();
    let mut config = snare_proxy::ProxyConfig::default();
    config.connect_timeout = Some(Duration::from_millis(500));
    let running = start_proxy_with_config(config, hooks, None).await;

    let mut tcp = connect_to(running.addr).await;
    // Port 1 on loopback: refused (or filtered) immediately.
    write_all(
        &mut tcp,
        b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n",
    )
    .await;

    let mut collected = Vec::new();
    read_until_contains(&mut tcp, &mut collected, b"\r\n\r\n").await;
    let text = String::from_utf8_lossy(&collected);
    assert!(
        text.starts_with("HTTP/1.1 503") || text.starts_with("HTTP/1.1 502") || text.starts_with("HTTP/1.1 504"),
        "{text}"
    );
}
