use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpListener,
    sync::watch,
};

use crate::backhaul::{
    net,
    stream::{BoxedStream, PrefixedStream},
};

/// Receives a demultiplexed connection whose first readable byte follows the id line.
pub type SocketHandler = Arc<dyn Fn(BoxedStream) + Send + Sync>;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_HANDSHAKE_BYTES: usize = 100;

#[derive(Debug, Clone)]
pub struct IngressOptions {
    pub handshake_timeout: Duration,
    /// A connection that sent more than this without a newline is dropped.
    pub max_handshake_bytes: usize,
}

impl Default for IngressOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_handshake_bytes: DEFAULT_MAX_HANDSHAKE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reject {
    Timeout,
    Overflow,
    Eof,
    UnknownId,
}

impl Reject {
    fn as_str(self) -> &'static str {
        match self {
            Reject::Timeout => "timeout",
            Reject::Overflow => "overflow",
            Reject::Eof => "eof",
            Reject::UnknownId => "unknown_id",
        }
    }
}

/// One listener carrying the raw connections of many tunnels.
///
/// Each connection opens with `<tunnel id>\n`; the rest of the stream belongs to
/// whichever handler is registered under that id.
pub struct MultiplexedIngress {
    opts: IngressOptions,
    handlers: DashMap<String, SocketHandler>,
}

impl std::fmt::Debug for MultiplexedIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedIngress")
            .field("opts", &self.opts)
            .field("tunnels", &self.handlers.len())
            .finish()
    }
}

impl MultiplexedIngress {
    pub fn new(opts: IngressOptions) -> Self {
        Self {
            opts,
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, id: impl Into<String>, handler: SocketHandler) {
        self.handlers.insert(id.into(), handler);
    }

    pub fn unregister(&self, id: &str) {
        self.handlers.remove(id);
    }

    /// Remove `id` only while it still maps to `handler`.
    pub fn unregister_if(&self, id: &str, handler: &SocketHandler) {
        self.handlers.remove_if(id, |_, h| Arc::ptr_eq(h, handler));
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Hand `stream` to the handler registered under `id`. Returns false if there is none.
    pub fn dispatch(&self, id: &str, stream: BoxedStream) -> bool {
        let Some(handler) = self.handlers.get(id).map(|h| h.value().clone()) else {
            return false;
        };
        handler(stream);
        true
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(addr = %ln.local_addr()?, "ingress: listening");
        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
                res = ln.accept() => {
                    let (s, peer) = match res {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            net::pause_after_accept_error("ingress", &err).await;
                            continue;
                        }
                    };
                    let _ = s.set_nodelay(true);
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.accept_conn(s, peer.to_string()).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Read the id line off `stream` and dispatch it, or drop the connection.
    pub async fn accept_conn<S>(&self, mut stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let max = self.opts.max_handshake_bytes;
        let res =
            match tokio::time::timeout(self.opts.handshake_timeout, read_id_line(&mut stream, max))
                .await
            {
                Ok(res) => res,
                Err(_) => Err(Reject::Timeout),
            };

        let reject = match res {
            Ok((id, rest)) => {
                if self.dispatch(&id, Box::new(PrefixedStream::new(rest, stream))) {
                    tracing::debug!(id = %id, peer = %peer, "ingress: socket handed over");
                    return;
                }
                tracing::debug!(id = %id, peer = %peer, "ingress: unknown tunnel id");
                Reject::UnknownId
            }
            Err(reject) => reject,
        };

        metrics::counter!("backhaul_ingress_rejected_total", "reason" => reject.as_str())
            .increment(1);
        tracing::debug!(peer = %peer, reason = reject.as_str(), "ingress: connection dropped");
    }
}

/// Buffer until the first `\n`. Returns the trimmed id and whatever followed it.
async fn read_id_line<S>(stream: &mut S, max: usize) -> Result<(String, Bytes), Reject>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(max + 1);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return Err(Reject::Eof),
            Ok(_) => {}
        }
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line = buf.split_to(pos + 1);
            let id = String::from_utf8_lossy(&line[..pos]).trim().to_string();
            return Ok((id, buf.freeze()));
        }
        if buf.len() > max {
            return Err(Reject::Overflow);
        }
    }
}
