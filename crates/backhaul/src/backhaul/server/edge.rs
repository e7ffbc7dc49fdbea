use std::{collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::{Bytes, BytesMut};
use hyper::{Request, body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::backhaul::{
    net,
    server::{
        client::{ProxyError, RequestHead},
        registry::{NewClientInfo, TunnelRegistry},
    },
    stream::PrefixedStream,
};

pub const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

/// One proxied inbound request, as reported to the `on_request` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub tunnel_id: String,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub remote_address: Option<String>,
}

pub type RequestHook = Arc<dyn Fn(&RequestInfo) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EdgeOptions {
    /// Base domains tunnels live under. Empty means "guess from the host".
    pub domains: Vec<String>,
    /// Advertise `https://` URLs.
    pub secure: bool,
    /// Shared ingress port advertised to clients instead of a per-tunnel port.
    pub tunnel_port: Option<u16>,
    pub on_request: Option<RequestHook>,
}

impl std::fmt::Debug for EdgeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeOptions")
            .field("domains", &self.domains)
            .field("secure", &self.secure)
            .field("tunnel_port", &self.tunnel_port)
            .finish_non_exhaustive()
    }
}

/// Public front door: routes inbound traffic to tunnels by Host subdomain and serves
/// the allocation API on the bare domain.
pub struct Edge {
    opts: EdgeOptions,
    registry: Arc<TunnelRegistry>,
    api: Router,
}

#[derive(Clone)]
struct ApiState {
    registry: Arc<TunnelRegistry>,
    secure: bool,
    tunnel_port: Option<u16>,
}

impl Edge {
    pub fn new(opts: EdgeOptions, registry: Arc<TunnelRegistry>) -> Arc<Self> {
        let api = api_router(ApiState {
            registry: registry.clone(),
            secure: opts.secure,
            tunnel_port: opts.tunnel_port,
        });
        Arc::new(Self {
            opts,
            registry,
            api,
        })
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(addr = %ln.local_addr()?, "edge: listening");
        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
                res = ln.accept() => {
                    let (s, peer) = match res {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            net::pause_after_accept_error("edge", &err).await;
                            continue;
                        }
                    };
                    let this = self.clone();
                    tokio::spawn(async move { this.serve_conn(s, peer).await });
                }
            }
        }
        Ok(())
    }

    async fn serve_conn(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let mut buf = BytesMut::with_capacity(4096);
        let (head, head_len) = loop {
            match stream.read_buf(&mut buf).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(peer = %peer, err = %err, "edge: read failed");
                    return;
                }
            }
            match parse_head(&buf) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) if buf.len() < MAX_HEAD_BYTES => continue,
                Ok(None) => {
                    tracing::debug!(peer = %peer, "edge: request head too large");
                    return;
                }
                Err(err) => {
                    tracing::debug!(peer = %peer, err = %err, "edge: malformed request head");
                    return;
                }
            }
        };

        if head.header("upgrade").is_some() {
            let rest = buf.split_off(head_len).freeze();
            self.serve_upgrade(head, PrefixedStream::new(rest, stream), peer)
                .await;
            return;
        }

        let io = TokioIo::new(PrefixedStream::new(buf.freeze(), stream));
        let svc = service_fn(move |req: Request<Incoming>| {
            let this = self.clone();
            async move { this.route(req, peer).await }
        });
        if let Err(err) = hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .auto_date_header(false)
            .serve_connection(io, svc)
            .await
        {
            tracing::debug!(peer = %peer, err = %err, "edge: connection ended");
        }
    }

    async fn serve_upgrade(
        &self,
        head: RequestHead,
        inbound: PrefixedStream<TcpStream>,
        peer: SocketAddr,
    ) {
        let host = head
            .header("host")
            .map(|h| String::from_utf8_lossy(h).into_owned());
        let Some(id) = host.and_then(|h| subdomain_of(&h, &self.opts.domains)) else {
            tracing::debug!(peer = %peer, "edge: upgrade without tunnel host dropped");
            return;
        };
        let Some(client) = self.registry.get_client(&id) else {
            tracing::debug!(peer = %peer, id = %id, "edge: upgrade for unknown tunnel dropped");
            return;
        };
        client.handle_upgrade(&head, inbound).await;
    }

    async fn route(&self, req: Request<Incoming>, peer: SocketAddr) -> Result<Response, ProxyError> {
        let Some(host) = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
        else {
            return Ok((StatusCode::BAD_REQUEST, "Host header is required").into_response());
        };

        let Some(id) = subdomain_of(&host, &self.opts.domains) else {
            let resp = self
                .api
                .clone()
                .oneshot(req)
                .await
                .unwrap_or_else(|never: Infallible| match never {});
            return Ok(resp);
        };

        let Some(client) = self.registry.get_client(&id) else {
            return Ok((StatusCode::NOT_FOUND, "404").into_response());
        };

        if let Some(hook) = &self.opts.on_request {
            hook(&RequestInfo {
                tunnel_id: id,
                method: req.method().to_string(),
                path: req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_else(|| "/".to_string()),
                headers: req
                    .headers()
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.as_str().to_string(),
                            String::from_utf8_lossy(v.as_bytes()).into_owned(),
                        )
                    })
                    .collect(),
                remote_address: Some(peer.ip().to_string()),
            });
        }

        let resp = client.handle_request(req).await?;
        Ok(resp.map(Body::new))
    }
}

/// Parse a request head. `Ok(None)` means more bytes are needed.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    let head = RequestHead {
        method: req.method.unwrap_or("GET").to_string(),
        target: req.path.unwrap_or("/").to_string(),
        version: req.version.unwrap_or(1),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), Bytes::copy_from_slice(h.value)))
            .collect(),
    };
    Ok(Some((head, len)))
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// The tunnel id a `Host` header points at, if any.
///
/// With configured domains the id is whatever precedes one of them. Without, the
/// first label of `*.localhost` or of a host with at least three labels is used.
pub fn subdomain_of(host: &str, domains: &[String]) -> Option<String> {
    let host = strip_port(host.trim()).trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.parse::<std::net::IpAddr>().is_ok() {
        return None;
    }

    if !domains.is_empty() {
        return domains.iter().find_map(|d| {
            let d = d.trim().trim_matches('.').to_ascii_lowercase();
            host.strip_suffix(&d)
                .and_then(|p| p.strip_suffix('.'))
                .filter(|p| !p.is_empty())
                .map(str::to_string)
        });
    }

    let labels: Vec<&str> = host.split('.').collect();
    let enough = if labels.last() == Some(&"localhost") {
        labels.len() >= 2
    } else {
        labels.len() >= 3
    };
    enough.then(|| labels[0].to_string())
}

fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(allocate_random))
        .route("/{id}", get(allocate_requested))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocationBody {
    id: String,
    port: u16,
    url: String,
    domain: String,
    max_conn_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    shared_tunnel: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404")
}

async fn allocate_random(
    State(st): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !query.contains_key("new") {
        return not_found().await.into_response();
    }
    allocate(&st, None, &headers).await
}

async fn allocate_requested(
    State(st): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    allocate(&st, Some(id.as_str()), &headers).await
}

async fn allocate(st: &ApiState, requested: Option<&str>, headers: &HeaderMap) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let domain = strip_port(&host).to_string();
    let scheme = if st.secure { "https" } else { "http" };

    let res = st
        .registry
        .new_client_with(requested, &domain, |id| format!("{scheme}://{id}.{host}"))
        .await;
    match res {
        Ok(info) => {
            tracing::info!(id = %info.id, requested = ?requested, "edge: tunnel allocated");
            (StatusCode::OK, Json(allocation_body(info, st.tunnel_port))).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                message: err.to_string(),
            }),
        )
            .into_response(),
    }
}

fn allocation_body(info: NewClientInfo, tunnel_port: Option<u16>) -> AllocationBody {
    AllocationBody {
        port: tunnel_port.unwrap_or(info.port),
        shared_tunnel: tunnel_port.map(|_| true),
        id: info.id,
        url: info.url,
        domain: info.domain,
        max_conn_count: info.max_conn_count,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::backhaul::server::registry::RegistryOptions;

    #[test]
    fn subdomain_with_configured_domains() {
        let domains = vec!["relay.example.com".to_string()];
        assert_eq!(
            subdomain_of("calm-otter-3.relay.example.com", &domains).as_deref(),
            Some("calm-otter-3")
        );
        assert_eq!(
            subdomain_of("Calm-Otter-3.Relay.Example.com:8080", &domains).as_deref(),
            Some("calm-otter-3")
        );
        assert_eq!(subdomain_of("relay.example.com", &domains), None);
        assert_eq!(subdomain_of("other.example.com", &domains), None);
    }

    #[test]
    fn subdomain_guessed_from_host() {
        assert_eq!(subdomain_of("abc.example.com", &[]).as_deref(), Some("abc"));
        assert_eq!(subdomain_of("abc.localhost:3000", &[]).as_deref(), Some("abc"));
        assert_eq!(subdomain_of("example.com", &[]), None);
        assert_eq!(subdomain_of("localhost:3000", &[]), None);
        assert_eq!(subdomain_of("127.0.0.1:80", &[]), None);
        assert_eq!(subdomain_of("[::1]:80", &[]), None);
    }

    #[test]
    fn head_parsing_keeps_case_order_and_reports_length() {
        let raw = b"GET /ws HTTP/1.1\r\nHost: a.relay.test\r\nUpgrade: websocket\r\nX-B: 2\r\n\r\n\x81\x00";
        let (head, len) = parse_head(raw).expect("parse").expect("complete");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/ws");
        assert_eq!(head.version, 1);
        assert_eq!(head.headers[0].0, "Host");
        assert_eq!(head.headers[2], ("X-B".to_string(), Bytes::from_static(b"2")));
        assert_eq!(&raw[len..], b"\x81\x00");

        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: a").expect("parse").is_none());
        assert!(parse_head(b"\x00\x01 nonsense\r\n\r\n").is_err());
    }

    async fn start_edge(opts: EdgeOptions) -> (SocketAddr, Arc<TunnelRegistry>) {
        let registry = TunnelRegistry::new(RegistryOptions {
            bind_host: "127.0.0.1".into(),
            grace: Duration::from_secs(60),
            ..Default::default()
        });
        let edge = Edge::new(opts, registry.clone());
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _keep = tx;
            let _ = edge.listen_and_serve(ln, rx).await;
        });
        (addr, registry)
    }

    async fn raw_exchange(addr: SocketAddr, req: &[u8]) -> String {
        let mut s = TcpStream::connect(addr).await.expect("connect");
        s.write_all(req).await.expect("write");
        let mut out = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), s.read_to_end(&mut out)).await;
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn missing_host_is_400_and_unknown_tunnel_is_404() {
        let (addr, _) = start_edge(EdgeOptions::default()).await;

        let resp = raw_exchange(addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");

        let resp = raw_exchange(
            addr,
            b"GET / HTTP/1.1\r\nHost: nobody.localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 404"), "{resp}");

        let resp = raw_exchange(
            addr,
            b"GET /not/an/endpoint HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 404"), "{resp}");
    }

    #[tokio::test]
    async fn control_api_allocates_random_and_requested_ids() {
        let (addr, registry) = start_edge(EdgeOptions::default()).await;
        let host = format!("localhost:{}", addr.port());

        let resp = raw_exchange(
            addr,
            format!("GET /?new HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        let body = resp.split("\r\n\r\n").nth(1).expect("body");
        let v: serde_json::Value = serde_json::from_str(body).expect("json");
        let id = v["id"].as_str().expect("id").to_string();
        assert!(registry.has_client(&id));
        assert_eq!(v["url"], format!("http://{id}.{host}"));
        assert_eq!(v["domain"], "localhost");
        assert_eq!(v["maxConnCount"], 10);
        assert!(v.get("sharedTunnel").is_none());

        let resp = raw_exchange(
            addr,
            format!("GET /my-app HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await;
        let body = resp.split("\r\n\r\n").nth(1).expect("body");
        let v: serde_json::Value = serde_json::from_str(body).expect("json");
        assert_eq!(v["id"], "my-app");
        assert!(registry.has_client("my-app"));
        registry.close_all();
    }

    #[tokio::test]
    async fn shared_ingress_allocation_advertises_tunnel_port() {
        let (addr, registry) = start_edge(EdgeOptions {
            tunnel_port: Some(7000),
            ..Default::default()
        })
        .await;
        let resp = raw_exchange(
            addr,
            b"GET /?new HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        let body = resp.split("\r\n\r\n").nth(1).expect("body");
        let v: serde_json::Value = serde_json::from_str(body).expect("json");
        assert_eq!(v["port"], 7000);
        assert_eq!(v["sharedTunnel"], true);
        registry.close_all();
    }

    #[tokio::test]
    async fn upgrade_for_unknown_tunnel_is_dropped() {
        let (addr, _) = start_edge(EdgeOptions::default()).await;
        let resp = raw_exchange(
            addr,
            b"GET /ws HTTP/1.1\r\nHost: ghost.localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await;
        assert!(resp.is_empty(), "{resp}");
    }
}
