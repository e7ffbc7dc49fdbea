use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
};

use crate::backhaul::{
    server::ingress::{MultiplexedIngress, SocketHandler},
    stream::{BoxedStream, PrefixedStream},
};

pub const DEFAULT_MAX_TCP_SOCKETS: usize = 10;

/// `listen()` result in shared-ingress mode: no dedicated port.
pub const SHARED_INGRESS_PORT: u16 = 0;

/// Bytes kept from an idle socket before we stop reading it.
const IDLE_READ_LIMIT: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool: closed")]
    Closed,
    #[error("pool: listen() called twice")]
    AlreadyListening,
    #[error("pool: bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// Connected sockets went 0 -> 1.
    Online,
    /// Connected sockets dropped back to 0.
    Offline,
    /// The dedicated listener failed.
    Error(String),
}

#[derive(Clone)]
pub enum PoolMode {
    Dedicated { bind_host: String },
    Shared(Arc<MultiplexedIngress>),
}

impl std::fmt::Debug for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMode::Dedicated { bind_host } => f
                .debug_struct("Dedicated")
                .field("bind_host", bind_host)
                .finish(),
            PoolMode::Shared(_) => f.write_str("Shared"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub id: String,
    pub max_tcp_sockets: usize,
    pub mode: PoolMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connected_sockets: usize,
}

/// Something that hands out raw connections to the private side, one consumer each.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> Result<BoxedStream, PoolError>;
}

type ClaimTx = oneshot::Sender<oneshot::Sender<PooledSocket>>;
type ClaimRx = oneshot::Receiver<oneshot::Sender<PooledSocket>>;

struct IdleEntry {
    id: u64,
    claim: ClaimTx,
}

#[derive(Default)]
struct State {
    idle: VecDeque<IdleEntry>,
    waiters: VecDeque<oneshot::Sender<PooledSocket>>,
    connected: usize,
    next_idle: u64,
    listening: bool,
    closed: bool,
    handler: Option<SocketHandler>,
}

struct Inner {
    opts: PoolOptions,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<PoolEvent>,
    closed: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Give `sock` to the oldest pending consumer, or park it as idle.
    ///
    /// Returns the socket back with its claim receiver when it was parked.
    fn place(&self, mut sock: PooledSocket) -> Option<(u64, ClaimRx, PooledSocket)> {
        loop {
            let waiter = {
                let mut st = self.lock();
                if st.closed {
                    drop(st);
                    drop(sock);
                    return None;
                }
                match st.waiters.pop_front() {
                    Some(w) => w,
                    None => {
                        let (tx, rx) = oneshot::channel();
                        let id = st.next_idle;
                        st.next_idle += 1;
                        st.idle.push_back(IdleEntry { id, claim: tx });
                        return Some((id, rx, sock));
                    }
                }
            };
            match waiter.send(sock) {
                Ok(()) => return None,
                // Consumer gave up waiting.
                Err(back) => sock = back,
            }
        }
    }

    fn forget_idle(&self, id: u64) {
        let removed = {
            let mut st = self.lock();
            st.idle
                .iter()
                .position(|e| e.id == id)
                .and_then(|pos| st.idle.remove(pos))
        };
        drop(removed);
    }
}

/// Pool of raw connections opened by the private side of one tunnel.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct SocketPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPool")
            .field("id", &self.inner.opts.id)
            .field("mode", &self.inner.opts.mode)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SocketPool {
    pub fn new(opts: PoolOptions) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let inner = Inner {
            opts,
            state: Mutex::new(State::default()),
            events,
            closed,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.opts.id
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connected_sockets: self.inner.lock().connected,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the pool is destroyed. In-use sockets are expected to end then.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Start accepting sockets.
    ///
    /// Dedicated mode binds an ephemeral port on the configured host and returns it.
    /// Shared mode registers with the ingress and returns [`SHARED_INGRESS_PORT`].
    pub async fn listen(&self) -> Result<u16, PoolError> {
        {
            let mut st = self.inner.lock();
            if st.closed {
                return Err(PoolError::Closed);
            }
            if st.listening {
                return Err(PoolError::AlreadyListening);
            }
            st.listening = true;
        }

        match &self.inner.opts.mode {
            PoolMode::Shared(ingress) => {
                let weak = Arc::downgrade(&self.inner);
                let handler: SocketHandler = Arc::new(move |stream: BoxedStream| {
                    if let Some(inner) = weak.upgrade() {
                        SocketPool { inner }.offer(stream);
                    }
                });
                self.inner.lock().handler = Some(handler.clone());
                ingress.register(self.id(), handler);
                Ok(SHARED_INGRESS_PORT)
            }
            PoolMode::Dedicated { bind_host } => {
                let addr = format!("{bind_host}:0");
                let ln = TcpListener::bind((bind_host.as_str(), 0))
                    .await
                    .map_err(|source| PoolError::Bind {
                        addr: addr.clone(),
                        source,
                    })?;
                let port = ln
                    .local_addr()
                    .map_err(|source| PoolError::Bind { addr, source })?
                    .port();
                tracing::debug!(id = %self.id(), port, "pool: listening");
                tokio::spawn(accept_loop(self.clone(), ln));
                Ok(port)
            }
        }
    }

    /// Admit a raw connection, or drop it when the pool is full or closed.
    pub fn offer(&self, stream: BoxedStream) {
        let admitted = {
            let mut st = self.inner.lock();
            if st.closed || st.connected >= self.inner.opts.max_tcp_sockets {
                None
            } else {
                st.connected += 1;
                Some(st.connected == 1)
            }
        };
        let Some(first) = admitted else {
            metrics::counter!("backhaul_pool_rejected_total").increment(1);
            tracing::debug!(
                id = %self.id(),
                max = self.inner.opts.max_tcp_sockets,
                "pool: socket rejected"
            );
            drop(stream);
            return;
        };

        metrics::gauge!("backhaul_pool_sockets").increment(1.0);
        if first {
            let _ = self.inner.events.send(PoolEvent::Online);
        }
        let guard = ConnGuard {
            inner: self.inner.clone(),
        };
        let sock = PooledSocket::new(Bytes::new(), stream, guard);
        tokio::spawn(tend(self.inner.clone(), sock));
    }

    /// Hand out the oldest idle socket, or wait for the next admitted one.
    pub async fn claim(&self) -> Result<PooledSocket, PoolError> {
        enum Next {
            Idle(ClaimTx),
            Wait(oneshot::Receiver<PooledSocket>),
        }

        loop {
            let next = {
                let mut st = self.inner.lock();
                if st.closed {
                    return Err(PoolError::Closed);
                }
                match st.idle.pop_front() {
                    Some(entry) => Next::Idle(entry.claim),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        st.waiters.push_back(tx);
                        Next::Wait(rx)
                    }
                }
            };

            match next {
                Next::Idle(claim) => {
                    let (tx, rx) = oneshot::channel();
                    if claim.send(tx).is_err() {
                        continue;
                    }
                    // The socket may have hung up while we were claiming it.
                    if let Ok(sock) = rx.await {
                        return Ok(sock);
                    }
                }
                Next::Wait(rx) => return rx.await.map_err(|_| PoolError::Closed),
            }
        }
    }

    /// Stop admitting, fail pending consumers and end idle and in-use sockets.
    pub fn destroy(&self) {
        let (waiters, idle, handler) = {
            let mut st = self.inner.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            (
                std::mem::take(&mut st.waiters),
                std::mem::take(&mut st.idle),
                st.handler.take(),
            )
        };

        if let (PoolMode::Shared(ingress), Some(handler)) = (&self.inner.opts.mode, handler) {
            ingress.unregister_if(self.id(), &handler);
        }
        self.inner.closed.send_replace(true);
        tracing::debug!(
            id = %self.id(),
            pending = waiters.len(),
            idle = idle.len(),
            "pool: destroyed"
        );
        drop(waiters);
        drop(idle);
    }
}

#[async_trait]
impl ConnectionProvider for SocketPool {
    async fn acquire(&self) -> Result<BoxedStream, PoolError> {
        Ok(Box::new(self.claim().await?))
    }
}

async fn accept_loop(pool: SocketPool, ln: TcpListener) {
    let mut closed = pool.inner.closed.subscribe();
    loop {
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            res = ln.accept() => match res {
                Ok((s, peer)) => {
                    let _ = s.set_nodelay(true);
                    tracing::debug!(id = %pool.id(), peer = %peer, "pool: socket connected");
                    pool.offer(Box::new(s));
                }
                Err(err) => {
                    tracing::warn!(id = %pool.id(), err = %err, "pool: accept failed");
                    let _ = pool.inner.events.send(PoolEvent::Error(err.to_string()));
                    break;
                }
            }
        }
    }
}

/// Owns a socket from admission until a consumer takes it or it hangs up.
async fn tend(inner: Arc<Inner>, mut sock: PooledSocket) {
    loop {
        let Some((idle_id, mut claim, parked)) = inner.place(sock) else {
            return;
        };
        let PooledSocket { stream, guard } = parked;
        let (prefix, mut stream) = stream.into_parts();
        let mut buf = BytesMut::from(&prefix[..]);

        let reply = loop {
            if buf.len() >= IDLE_READ_LIMIT {
                break (&mut claim).await.ok();
            }
            tokio::select! {
                biased;
                res = &mut claim => break res.ok(),
                res = stream.read_buf(&mut buf) => match res {
                    Ok(0) | Err(_) => {
                        tracing::debug!(id = %inner.opts.id, "pool: idle socket closed");
                        inner.forget_idle(idle_id);
                        break None;
                    }
                    Ok(_) => {}
                },
            }
        };
        let Some(reply) = reply else {
            return;
        };

        match reply.send(PooledSocket::new(buf.freeze(), stream, guard)) {
            Ok(()) => return,
            Err(back) => sock = back,
        }
    }
}

struct ConnGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let offline = {
            let mut st = self.inner.lock();
            st.connected = st.connected.saturating_sub(1);
            st.connected == 0
        };
        metrics::gauge!("backhaul_pool_sockets").decrement(1.0);
        if offline {
            let _ = self.inner.events.send(PoolEvent::Offline);
        }
    }
}

pin_project_lite::pin_project! {
    /// A claimed pool socket. Dropping it closes the connection and releases its slot.
    pub struct PooledSocket {
        #[pin]
        stream: PrefixedStream<BoxedStream>,
        guard: ConnGuard,
    }
}

impl PooledSocket {
    fn new(prefix: Bytes, stream: BoxedStream, guard: ConnGuard) -> Self {
        Self {
            stream: PrefixedStream::new(prefix, stream),
            guard,
        }
    }
}

impl AsyncRead for PooledSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}
