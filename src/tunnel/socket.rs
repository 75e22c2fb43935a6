//! A single tunnel socket: one raw TCP connection dialed in by a remote client.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;

/// A TCP connection dialed in by a tunnel client, available for exactly one
/// HTTP transaction (or one upgraded connection) before it is consumed.
///
/// `TunnelSocket` itself implements `AsyncRead`/`AsyncWrite` (delegating to
/// the underlying `TcpStream`) so it can be handed to hyper directly via
/// `hyper_util::rt::TokioIo`. Dropping it is the single point at which the
/// owning [`super::agent::TunnelAgent`] learns the connection is gone —
/// whether because hyper finished using it, it errored, or the idle reaper
/// expired it. This mirrors spec.md §3's "the agent does not track it
/// further" ownership note: bookkeeping happens through ordinary Rust drop
/// semantics rather than an explicit return call.
pub struct TunnelSocket {
    stream: TcpStream,
    remote_addr: IpAddr,
    closed_tx: UnboundedSender<()>,
}

impl TunnelSocket {
    pub(crate) fn new(stream: TcpStream, remote_addr: IpAddr, closed_tx: UnboundedSender<()>) -> Self {
        Self {
            stream,
            remote_addr,
            closed_tx,
        }
    }

    /// The peer address this socket was accepted from, normalized (see
    /// [`normalize_addr`]).
    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    pub(crate) fn set_nodelay(&self, nodelay: bool) {
        let _ = self.stream.set_nodelay(nodelay);
    }
}

impl Drop for TunnelSocket {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(());
    }
}

impl AsyncRead for TunnelSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Fold an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) down to its embedded
/// IPv4 form, so distinct-client-IP accounting doesn't double-count a dual
/// stack listener's view of the same peer. Addresses that aren't
/// IPv4-mapped pass through unchanged.
pub fn normalize_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
    }
}
