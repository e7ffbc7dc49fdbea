use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use hyper::{
    Request, Response,
    body::{Body, Incoming},
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
    time::Instant,
};

use crate::backhaul::{
    net::splice,
    server::pool::{ConnectionProvider, PoolError, PoolEvent, PoolStats, SocketPool},
    stream::PeerState,
};

pub const DEFAULT_GRACE: Duration = Duration::from_millis(1000);

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("proxy: upstream handshake: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("proxy: upstream request: {0}")]
    Upstream(#[source] hyper::Error),
    #[error("proxy: invalid request target: {0}")]
    InvalidTarget(#[from] http::uri::InvalidUri),
}

/// The request line and headers of an upgrade request, as they arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor HTTP/1 version.
    pub version: u8,
    /// Header names keep their original case; order is preserved.
    pub headers: Vec<(String, Bytes)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

struct Inner {
    id: String,
    serial: u64,
    pool: SocketPool,
    closed: watch::Sender<bool>,
}

/// One tunnel on the public side: proxies inbound traffic over its socket pool.
///
/// The client closes itself when its pool stays empty for the grace period, or when
/// the pool reports an error.
#[derive(Clone)]
pub struct ServerClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClient")
            .field("id", &self.inner.id)
            .field("serial", &self.inner.serial)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerClient {
    pub fn new(
        id: impl Into<String>,
        pool: SocketPool,
        events: mpsc::UnboundedReceiver<PoolEvent>,
        grace: Duration,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let client = Self {
            inner: Arc::new(Inner {
                id: id.into(),
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                pool,
                closed,
            }),
        };
        tokio::spawn(lifecycle(client.clone(), events, grace));
        client
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Distinguishes clients that reused the same id over time.
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn pool(&self) -> &SocketPool {
        &self.inner.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once `close()` ran.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        self.inner.pool.destroy();
        tracing::info!(id = %self.inner.id, "client: closed");
    }

    /// Send `req` through one pool socket and return the upstream response unbuffered.
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<Incoming>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        tracing::debug!(id = %self.inner.id, method = %req.method(), uri = %req.uri(), "client: >");
        let res = self.forward(req).await;
        match &res {
            Ok(resp) => {
                tracing::debug!(id = %self.inner.id, status = resp.status().as_u16(), "client: <")
            }
            Err(err) => {
                metrics::counter!("backhaul_proxy_errors_total").increment(1);
                tracing::warn!(id = %self.inner.id, err = %err, "client: proxy request failed");
            }
        }
        res
    }

    async fn forward<B>(&self, req: Request<B>) -> Result<Response<Incoming>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let sock = ConnectionProvider::acquire(&self.inner.pool).await?;
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(sock))
            .await
            .map_err(ProxyError::Handshake)?;

        let id = self.inner.id.clone();
        let pool_closed = self.inner.pool.closed();
        tokio::spawn(async move {
            tokio::select! {
                res = conn => {
                    if let Err(err) = res {
                        tracing::debug!(id = %id, err = %err, "client: upstream connection ended");
                    }
                }
                _ = pool_closed => {}
            }
        });

        let (mut parts, body) = req.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        parts.uri = target.parse()?;

        sender
            .send_request(Request::from_parts(parts, body))
            .await
            .map_err(ProxyError::Upstream)
    }

    /// Replay `head` on a pool socket and splice it with `inbound`.
    ///
    /// `inbound` is closed without a response when no socket can be had or it already
    /// hung up.
    pub async fn handle_upgrade<S>(&self, head: &RequestHead, mut inbound: S)
    where
        S: AsyncRead + AsyncWrite + PeerState + Unpin + Send,
    {
        tracing::debug!(id = %self.inner.id, target = %head.target, "client: > [up]");
        let mut sock = match ConnectionProvider::acquire(&self.inner.pool).await {
            Ok(sock) => sock,
            Err(err) => {
                abort_upgrade(&self.inner.id, "no_socket", &err.to_string());
                let _ = inbound.shutdown().await;
                return;
            }
        };

        if inbound.is_peer_closed() {
            abort_upgrade(&self.inner.id, "inbound_closed", "peer hung up");
            drop(sock);
            let _ = inbound.shutdown().await;
            return;
        }

        if let Err(err) = sock.write_all(&head.serialize()).await {
            abort_upgrade(&self.inner.id, "write_failed", &err.to_string());
            let _ = inbound.shutdown().await;
            return;
        }

        tracing::debug!(id = %self.inner.id, target = %head.target, "client: < [up]");
        tokio::select! {
            (up, down) = splice(&mut inbound, &mut sock) => {
                tracing::debug!(id = %self.inner.id, up, down, "client: upgrade finished");
            }
            _ = self.inner.pool.closed() => {
                tracing::debug!(id = %self.inner.id, "client: upgrade ended by close");
            }
        }
    }
}

fn abort_upgrade(id: &str, reason: &'static str, detail: &str) {
    metrics::counter!("backhaul_upgrade_aborted_total").increment(1);
    tracing::debug!(id = %id, reason, detail, "client: upgrade aborted");
}

async fn lifecycle(
    client: ServerClient,
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
    grace: Duration,
) {
    let mut closed = client.inner.closed.subscribe();
    let mut deadline = Some(Instant::now() + grace);
    let mut events_open = true;

    loop {
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => return,
            _ = expiry => {
                tracing::info!(id = %client.id(), "client: no sockets within grace period");
                client.close();
                return;
            }
            ev = events.recv(), if events_open => match ev {
                Some(PoolEvent::Online) => {
                    tracing::debug!(id = %client.id(), "client: online");
                    deadline = None;
                }
                Some(PoolEvent::Offline) => {
                    tracing::debug!(id = %client.id(), "client: offline");
                    deadline = Some(Instant::now() + grace);
                }
                Some(PoolEvent::Error(err)) => {
                    tracing::warn!(id = %client.id(), err = %err, "client: pool error");
                    client.close();
                    return;
                }
                None => events_open = false,
            }
        }
    }
}
