use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Cheap, non-consuming check whether the peer already hung up.
///
/// Only reports what is observable without reading: a pending EOF or socket error.
pub trait PeerState {
    fn is_peer_closed(&self) -> bool;
}

impl PeerState for tokio::net::TcpStream {
    fn is_peer_closed(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.peek(&mut probe).now_or_never() {
            Some(Ok(0)) | Some(Err(_)) => true,
            Some(Ok(_)) | None => false,
        }
    }
}

pin_project_lite::pin_project! {
    /// A stream that replays `prefix` before reading from `inner`.
    ///
    /// Used wherever bytes had to be read off a connection to make a routing decision
    /// and must be handed back untouched to whoever owns the connection next.
    pub struct PrefixedStream<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Unread prefix bytes and the wrapped stream.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: PeerState> PeerState for PrefixedStream<S> {
    fn is_peer_closed(&self) -> bool {
        self.prefix.is_empty() && self.inner.is_peer_closed()
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prefix_is_replayed_before_inner_bytes() {
        let (a, mut b) = tokio::io::duplex(64);
        b.write_all(b" world").await.expect("write");
        drop(b);

        let mut s = PrefixedStream::new(Bytes::from_static(b"hello"), a);
        let mut out = String::new();
        s.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn peer_closed_probe_sees_eof() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("addr");
        let client = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let (server, _) = ln.accept().await.expect("accept");

        assert!(!server.is_peer_closed());
        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(server.is_peer_closed());

        let wrapped = PrefixedStream::new(Bytes::from_static(b"x"), server);
        assert!(!wrapped.is_peer_closed());
    }
}
