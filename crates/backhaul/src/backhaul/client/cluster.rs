use std::{
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use regex::bytes::Regex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, watch},
};

use crate::backhaul::{
    backoff::RetryPolicy,
    client::{
        local::LocalConnector,
        rewrite::{ByteTransform, HostHeaderRewriter},
    },
    net,
    stream::{BoxedStream, PeerState},
};

const READ_BUF_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Tunnel id; sent as the first line when the relay uses a shared ingress port.
    pub client_id: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub shared_tunnel: bool,
    pub local: LocalConnector,
    /// When set, the first `Host:` header relayed to the local service is replaced by this.
    pub rewrite_host: Option<String>,
    pub retry: RetryPolicy,
}

impl ClusterOptions {
    fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    #[error("connection refused: {addr} (check your firewall settings)")]
    RemoteRefused { addr: String },
    #[error("remote connect to {addr} failed: {reason}")]
    RemoteConnect { addr: String, reason: String },
}

pub type LinkId = u64;

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Open(LinkId),
    Error(LinkId, LinkError),
    Dead(LinkId),
    Request(LinkId, TunnelRequest),
}

/// Spawns links: each one a relay connection paired with a local connection.
///
/// Every link ends with exactly one `Dead` event; replacing it is up to the owner.
#[derive(Debug)]
pub struct ConnectionCluster {
    opts: Arc<ClusterOptions>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
    next_id: AtomicU64,
}

impl ConnectionCluster {
    pub fn new(
        opts: ClusterOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            opts: Arc::new(opts),
            events,
            shutdown,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn open(&self) -> LinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let link = Link {
            id,
            opts: self.opts.clone(),
            events: self.events.clone(),
        };
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => {
                    tracing::debug!(link = link.id, "link: closed by session");
                }
                _ = link.run() => {}
            }
            link.emit(LinkEvent::Dead(link.id));
        });
        id
    }
}

struct Link {
    id: LinkId,
    opts: Arc<ClusterOptions>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Link {
    fn emit(&self, ev: LinkEvent) {
        let _ = self.events.send(ev);
    }

    async fn run(&self) {
        let addr = self.opts.remote_addr();
        tracing::debug!(
            link = self.id,
            local = %self.opts.local.addr(),
            remote = %addr,
            "link: establishing"
        );

        let mut remote = match TcpStream::connect((self.opts.remote_host.as_str(), self.opts.remote_port)).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(link = self.id, remote = %addr, err = %err, "link: remote connect failed");
                let error = if err.kind() == io::ErrorKind::ConnectionRefused {
                    LinkError::RemoteRefused { addr }
                } else {
                    LinkError::RemoteConnect {
                        addr,
                        reason: err.to_string(),
                    }
                };
                self.emit(LinkEvent::Error(self.id, error));
                // Pace the replacement so an unreachable relay is not hammered.
                if let Some(delay) = self.opts.retry.delay_for(1) {
                    tokio::time::sleep(delay).await;
                }
                return;
            }
        };
        let _ = remote.set_nodelay(true);

        if self.opts.shared_tunnel && !self.opts.client_id.is_empty() {
            tracing::debug!(link = self.id, id = %self.opts.client_id, "link: sending client id for shared ingress");
            let line = format!("{}\n", self.opts.client_id);
            if let Err(err) = remote.write_all(line.as_bytes()).await {
                tracing::debug!(link = self.id, err = %err, "link: handshake write failed");
                return;
            }
        }

        self.emit(LinkEvent::Open(self.id));

        // Nothing is read from the relay until the local side is connected.
        let Some(local) = self.connect_local(&remote).await else {
            return;
        };
        tracing::debug!(link = self.id, "link: connected locally");
        self.splice(remote, local).await;
        tracing::debug!(link = self.id, "link: remote closed");
    }

    async fn connect_local(&self, remote: &TcpStream) -> Option<BoxedStream> {
        let mut attempt = 0u32;
        loop {
            if remote.is_peer_closed() {
                tracing::debug!(link = self.id, "link: remote closed before pairing");
                return None;
            }

            match self.opts.local.connect().await {
                Ok(local) => return Some(local),
                Err(err) if net::is_transient_connect_error(&err) => {
                    attempt += 1;
                    metrics::counter!("backhaul_link_retries_total").increment(1);
                    let Some(delay) = self.opts.retry.delay_for(attempt) else {
                        tracing::warn!(link = self.id, err = %err, attempts = attempt, "link: local retries exhausted");
                        return None;
                    };
                    tracing::debug!(
                        link = self.id,
                        local = %self.opts.local.addr(),
                        err = %err,
                        retry_in = %humantime::format_duration(delay),
                        "link: local connect failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::warn!(link = self.id, local = %self.opts.local.addr(), err = %err, "link: local connect failed");
                    return None;
                }
            }
        }
    }

    /// Relay until either side reaches EOF: a half-closed relay connection is a dead link.
    async fn splice(&self, remote: TcpStream, local: BoxedStream) {
        let (mut remote_rd, mut remote_wr) = remote.into_split();
        let (mut local_rd, mut local_wr) = tokio::io::split(local);
        let mut rewriter = self
            .opts
            .rewrite_host
            .as_ref()
            .map(|h| HostHeaderRewriter::new(h.clone()));

        let to_local = async {
            let mut buf = vec![0u8; READ_BUF_BYTES];
            loop {
                let n = match remote_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if let Some(req) = sniff_request(&chunk) {
                    self.emit(LinkEvent::Request(self.id, req));
                }
                let chunk = match rewriter.as_mut() {
                    Some(rw) => rw.transform(chunk),
                    None => chunk,
                };
                if local_wr.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = local_wr.shutdown().await;
        };

        let to_remote = async {
            if let Err(err) = tokio::io::copy(&mut local_rd, &mut remote_wr).await {
                tracing::debug!(link = self.id, err = %err, "link: local read ended with error");
            }
            let _ = remote_wr.shutdown().await;
        };

        tokio::select! {
            _ = to_local => {}
            _ = to_remote => {}
        }
    }
}

fn request_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?-u)^(\w+) (\S+)").expect("static regex"))
}

/// Best-effort `METHOD PATH` detection at the start of a chunk.
pub fn sniff_request(chunk: &[u8]) -> Option<TunnelRequest> {
    let caps = request_line_re().captures(chunk)?;
    Some(TunnelRequest {
        method: String::from_utf8_lossy(caps.get(1)?.as_bytes()).into_owned(),
        path: String::from_utf8_lossy(caps.get(2)?.as_bytes()).into_owned(),
    })
}
