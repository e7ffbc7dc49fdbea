use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::sync::{mpsc, watch};

use crate::backhaul::{
    backoff::RetryPolicy,
    client::{
        cluster::{ClusterOptions, ConnectionCluster, LinkError, LinkEvent, TunnelRequest},
        control::{AllocationError, ControlClient, TunnelInfo},
        local::{LocalConnector, LocalOptions},
    },
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Base URL of the relay's control endpoint, e.g. `https://relay.example.com`.
    pub control_host: String,
    pub subdomain: Option<String>,
    /// Extra headers sent with the allocation request.
    pub headers: BTreeMap<String, String>,
    pub local: LocalOptions,
    /// Rewrite the first `Host` header to the local host name.
    pub rewrite_host: bool,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Allocating,
    Established,
    Closed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Public URL; sent once, when the first link opens.
    Url(String),
    Error(LinkError),
    Request(TunnelRequest),
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session: closed before the tunnel was established")]
    Cancelled,
    #[error("session: open() called twice")]
    AlreadyOpened,
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("session: local connector: {0:#}")]
    Local(anyhow::Error),
}

/// A tunnel as seen from the private side.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

struct Inner {
    opts: SessionOptions,
    state: Mutex<SessionState>,
    info: Mutex<Option<TunnelInfo>>,
    open_links: AtomicUsize,
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.state())
            .field("open_links", &self.open_links())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    pub fn new(opts: SessionOptions) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let inner = Inner {
            opts,
            state: Mutex::new(SessionState::Idle),
            info: Mutex::new(None),
            open_links: AtomicUsize::new(0),
            shutdown,
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> Option<TunnelInfo> {
        self.inner
            .info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn id(&self) -> Option<String> {
        self.info().map(|i| i.id)
    }

    pub fn url(&self) -> Option<String> {
        self.info().map(|i| i.url)
    }

    pub fn cached_url(&self) -> Option<String> {
        self.info().and_then(|i| i.cached_url)
    }

    pub fn open_links(&self) -> usize {
        self.inner.open_links.load(Ordering::Relaxed)
    }

    /// Allocate a tunnel and start `max_conn` links.
    ///
    /// Allocation failures are retried per the session's retry policy; with the default
    /// policy this only returns once allocation succeeded or the session was closed.
    pub async fn open(&self) -> Result<TunnelInfo, SessionError> {
        if !self.transition(SessionState::Idle, SessionState::Allocating) {
            return Err(match self.state() {
                SessionState::Closed => SessionError::Cancelled,
                _ => SessionError::AlreadyOpened,
            });
        }

        let res = self.establish().await;
        if res.is_err() {
            // A failed open leaves the session reusable unless close() won the race.
            self.transition(SessionState::Allocating, SessionState::Idle);
        }
        res
    }

    async fn establish(&self) -> Result<TunnelInfo, SessionError> {
        let opts = &self.inner.opts;
        let local = LocalConnector::new(&opts.local).map_err(SessionError::Local)?;
        let control = ControlClient::new(&opts.control_host, opts.headers.clone())?;

        let info = self.allocate(&control).await?;

        if !self.transition(SessionState::Allocating, SessionState::Established) {
            return Err(SessionError::Cancelled);
        }
        *self.inner.info.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());

        let (remote_host, remote_port) = info.remote_addr();
        tracing::info!(
            id = %info.id,
            url = %info.url,
            remote = %format!("{remote_host}:{remote_port}"),
            max_conn = info.max_conn,
            shared = info.shared_tunnel,
            "session: tunnel allocated"
        );

        let cluster_opts = ClusterOptions {
            client_id: info.id.clone(),
            remote_host,
            remote_port,
            shared_tunnel: info.shared_tunnel,
            local,
            rewrite_host: opts
                .rewrite_host
                .then(|| opts.local.host_or_default().to_string()),
            retry: opts.retry.clone(),
        };
        self.spawn_supervisor(cluster_opts, info.max_conn);

        Ok(info)
    }

    /// Stop all links and emit `Close`. Safe to call any number of times.
    pub fn close(&self) {
        {
            let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if *st == SessionState::Closed {
                return;
            }
            *st = SessionState::Closed;
        }
        self.inner.shutdown.send_replace(true);
        let _ = self.inner.events.send(SessionEvent::Close);
        tracing::info!("session: closed");
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *st != from {
            return false;
        }
        *st = to;
        true
    }

    async fn allocate(&self, control: &ControlClient) -> Result<TunnelInfo, SessionError> {
        let opts = &self.inner.opts;
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut attempt = 0u32;

        loop {
            let res = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return Err(SessionError::Cancelled),
                res = control.allocate(opts.subdomain.as_deref()) => res,
            };

            let err = match res {
                Ok(info) => return Ok(info),
                Err(err) => err,
            };

            attempt += 1;
            let Some(delay) = opts.retry.delay_for(attempt) else {
                tracing::warn!(err = %err, attempts = attempt, "session: giving up on allocation");
                return Err(err.into());
            };
            tracing::warn!(
                host = %opts.control_host,
                err = %err,
                retry_in = %humantime::format_duration(delay),
                "session: tunnel server unavailable; retrying"
            );

            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn spawn_supervisor(&self, opts: ClusterOptions, max_conn: usize) {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let mut shutdown = self.inner.shutdown.subscribe();
        let cluster = ConnectionCluster::new(opts, link_tx, shutdown.clone());
        let inner = self.inner.clone();

        for _ in 0..max_conn {
            cluster.open();
        }

        tokio::spawn(async move {
            let mut url_sent = false;
            let mut opened: HashSet<u64> = HashSet::new();

            loop {
                let ev = tokio::select! {
                    _ = shutdown.wait_for(|closed| *closed) => break,
                    ev = link_rx.recv() => match ev {
                        Some(ev) => ev,
                        None => break,
                    },
                };

                match ev {
                    LinkEvent::Open(id) => {
                        opened.insert(id);
                        let total = inner.open_links.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(link = id, total, "session: link open");
                        if !url_sent {
                            url_sent = true;
                            let url = inner
                                .info
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .as_ref()
                                .map(|i| i.url.clone())
                                .unwrap_or_default();
                            let _ = inner.events.send(SessionEvent::Url(url));
                        }
                    }
                    LinkEvent::Error(id, err) => {
                        tracing::debug!(link = id, err = %err, "session: link error");
                        let _ = inner.events.send(SessionEvent::Error(err));
                    }
                    LinkEvent::Request(_, req) => {
                        let _ = inner.events.send(SessionEvent::Request(req));
                    }
                    LinkEvent::Dead(id) => {
                        if opened.remove(&id) {
                            inner.open_links.fetch_sub(1, Ordering::Relaxed);
                        }
                        if *shutdown.borrow() {
                            continue;
                        }
                        tracing::debug!(link = id, total = inner.open_links.load(Ordering::Relaxed), "session: link dead; reopening");
                        cluster.open();
                    }
                }
            }
            inner.open_links.store(0, Ordering::Relaxed);
        });
    }
}
