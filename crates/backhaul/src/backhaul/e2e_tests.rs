use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};

use crate::backhaul::{
    backoff::RetryPolicy,
    client::{
        local::LocalOptions,
        session::{ClientSession, SessionEvent, SessionOptions},
    },
    server::{
        edge::{Edge, EdgeOptions, RequestHook, RequestInfo},
        ingress::{IngressOptions, MultiplexedIngress},
        registry::{RegistryOptions, TunnelRegistry},
    },
};

struct Relay {
    edge: SocketAddr,
    registry: Arc<TunnelRegistry>,
    requests: mpsc::UnboundedReceiver<RequestInfo>,
    _shutdown: watch::Sender<bool>,
}

async fn start_relay(shared: bool) -> Relay {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (ingress, tunnel_port) = if shared {
        let ingress = Arc::new(MultiplexedIngress::new(IngressOptions::default()));
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind ingress");
        let port = ln.local_addr().expect("addr").port();
        let serving = ingress.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let _ = serving.listen_and_serve(ln, rx).await;
        });
        (Some(ingress), Some(port))
    } else {
        (None, None)
    };

    let registry = TunnelRegistry::new(RegistryOptions {
        max_tcp_sockets: 2,
        ingress,
        bind_host: "127.0.0.1".into(),
        grace: Duration::from_secs(60),
        ..Default::default()
    });

    let (req_tx, requests) = mpsc::unbounded_channel();
    let on_request: RequestHook = Arc::new(move |r: &RequestInfo| {
        let _ = req_tx.send(r.clone());
    });
    let edge = Edge::new(
        EdgeOptions {
            domains: vec!["relay.test".into()],
            tunnel_port,
            on_request: Some(on_request),
            ..Default::default()
        },
        registry.clone(),
    );
    let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind edge");
    let addr = ln.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = edge.listen_and_serve(ln, shutdown_rx).await;
    });

    Relay {
        edge: addr,
        registry,
        requests,
        _shutdown: shutdown_tx,
    }
}

const HELLO_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Custom-Header: Abc\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

/// A local HTTP service that answers every request with `hello` and reports the head it saw.
async fn hello_service() -> (u16, mpsc::UnboundedReceiver<String>) {
    let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind local");
    let port = ln.local_addr().expect("addr").port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = ln.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let Some(head) = read_head(&mut s).await else {
                    return;
                };
                let _ = tx.send(head);
                let _ = s.write_all(HELLO_RESPONSE).await;
            });
        }
    });
    (port, rx)
}

/// A local service that accepts any upgrade and then echoes.
async fn echo_upgrade_service() -> u16 {
    let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind local");
    let port = ln.local_addr().expect("addr").port();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = ln.accept().await {
            tokio::spawn(async move {
                if read_head(&mut s).await.is_none() {
                    return;
                }
                let _ = s
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
                    )
                    .await;
                let (mut r, mut w) = s.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

async fn read_head(s: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match s.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

fn session_for(relay: &Relay, local_port: u16, subdomain: &str) -> (ClientSession, mpsc::UnboundedReceiver<SessionEvent>) {
    ClientSession::new(SessionOptions {
        control_host: format!("http://{}", relay.edge),
        subdomain: Some(subdomain.into()),
        headers: BTreeMap::new(),
        local: LocalOptions {
            host: "127.0.0.1".into(),
            port: local_port,
            ..Default::default()
        },
        rewrite_host: true,
        retry: RetryPolicy::Constant {
            delay: Duration::from_millis(20),
            max_attempts: None,
        },
    })
}

async fn public_get(edge: SocketAddr, host: &str, path: &str) -> String {
    let mut s = TcpStream::connect(edge).await.expect("connect edge");
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    s.write_all(req.as_bytes()).await.expect("write");
    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), s.read_to_end(&mut out)).await;
    String::from_utf8_lossy(&out).into_owned()
}

async fn next_url(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> String {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(SessionEvent::Url(url))) => return url,
            Ok(Some(_)) => continue,
            other => panic!("no url event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn public_request_reaches_local_service() {
    let mut relay = start_relay(false).await;
    let (local_port, mut seen) = hello_service().await;
    let (session, mut events) = session_for(&relay, local_port, "myapp");

    let info = tokio::time::timeout(Duration::from_secs(5), session.open())
        .await
        .expect("open in time")
        .expect("open");
    assert_eq!(info.id, "myapp");
    assert_eq!(info.max_conn, 2);
    assert!(relay.registry.has_client("myapp"));
    assert!(
        next_url(&mut events).await.starts_with("http://myapp."),
        "url should carry the tunnel id"
    );

    let resp = public_get(relay.edge, "myapp.relay.test", "/hello?x=1").await;
    assert_eq!(resp.as_bytes(), HELLO_RESPONSE, "response must be relayed unchanged");

    let head = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("local saw request")
        .expect("head");
    assert!(head.starts_with("GET /hello?x=1 HTTP/1.1\r\n"), "{head}");
    assert!(
        head.contains("\r\nHost: 127.0.0.1\r\n"),
        "host should be rewritten with its case kept: {head}"
    );

    let req = relay.requests.recv().await.expect("hook fired");
    assert_eq!(req.tunnel_id, "myapp");
    assert_eq!(req.method, "GET");
    assert_eq!(req.path, "/hello?x=1");

    // Served links are replaced; a second request still gets through.
    let resp = public_get(relay.edge, "myapp.relay.test", "/again").await;
    assert!(resp.ends_with("hello"), "{resp}");

    session.close();
    relay.registry.close_all();
}

#[tokio::test]
async fn upgrade_is_spliced_end_to_end() {
    let relay = start_relay(false).await;
    let local_port = echo_upgrade_service().await;
    let (session, _events) = session_for(&relay, local_port, "sockets");
    tokio::time::timeout(Duration::from_secs(5), session.open())
        .await
        .expect("open in time")
        .expect("open");

    let mut s = TcpStream::connect(relay.edge).await.expect("connect edge");
    s.write_all(
        b"GET /ws HTTP/1.1\r\nHost: sockets.relay.test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
    )
    .await
    .expect("write");

    let head = tokio::time::timeout(Duration::from_secs(5), read_head(&mut s))
        .await
        .expect("head in time")
        .expect("head");
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");

    s.write_all(b"ping").await.expect("write frame");
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), s.read_exact(&mut buf))
        .await
        .expect("echo in time")
        .expect("echo");
    assert_eq!(&buf, b"ping");

    session.close();
    relay.registry.close_all();
}

#[tokio::test]
async fn shared_ingress_routes_by_id_line() {
    let relay = start_relay(true).await;
    let (local_port, _seen) = hello_service().await;
    let (session, mut events) = session_for(&relay, local_port, "shared-app");

    let info = tokio::time::timeout(Duration::from_secs(5), session.open())
        .await
        .expect("open in time")
        .expect("open");
    assert!(info.shared_tunnel);
    let _ = next_url(&mut events).await;

    let resp = public_get(relay.edge, "shared-app.relay.test", "/").await;
    assert_eq!(resp.as_bytes(), HELLO_RESPONSE);

    session.close();
    relay.registry.close_all();
}

#[tokio::test]
async fn closing_the_session_frees_the_tunnel_after_grace() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = TunnelRegistry::new(RegistryOptions {
        bind_host: "127.0.0.1".into(),
        grace: Duration::from_millis(200),
        ..Default::default()
    });
    let edge = Edge::new(
        EdgeOptions {
            domains: vec!["relay.test".into()],
            ..Default::default()
        },
        registry.clone(),
    );
    let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind edge");
    let addr = ln.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = edge.listen_and_serve(ln, shutdown_rx).await;
    });
    let relay = Relay {
        edge: addr,
        registry: registry.clone(),
        requests: mpsc::unbounded_channel().1,
        _shutdown: shutdown_tx,
    };

    let (local_port, _seen) = hello_service().await;
    let (session, mut events) = session_for(&relay, local_port, "short-lived");
    tokio::time::timeout(Duration::from_secs(5), session.open())
        .await
        .expect("open in time")
        .expect("open");
    let _ = next_url(&mut events).await;

    session.close();
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.has_client("short-lived") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("tunnel removed once its sockets are gone");

    let resp = public_get(addr, "short-lived.relay.test", "/").await;
    assert!(resp.starts_with("HTTP/1.1 404"), "{resp}");
}
