//! Transport seam: how the pool establishes raw connections.

use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use connpool_core::{Context, Endpoint, Network};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
#[cfg(unix)]
use tokio::net::UnixStream;

/// Establishes raw duplex connections to an endpoint.
///
/// The pool races every dial against the caller's [`Context`]; the context is
/// also handed to the dialer for transports that want to observe it directly.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// The raw stream produced by a successful dial.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `endpoint`.
    async fn dial(&self, endpoint: &Endpoint, ctx: &Context) -> io::Result<Self::Stream>;
}

/// Dials TCP and Unix domain sockets with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDialer;

#[async_trait]
impl Dialer for NetDialer {
    type Stream = NetStream;

    async fn dial(&self, endpoint: &Endpoint, _ctx: &Context) -> io::Result<NetStream> {
        match endpoint.network {
            Network::Tcp => Ok(NetStream::Tcp(TcpStream::connect(&endpoint.address).await?)),
            Network::Tcp4 => connect_family(&endpoint.address, true).await.map(NetStream::Tcp),
            Network::Tcp6 => connect_family(&endpoint.address, false).await.map(NetStream::Tcp),
            #[cfg(unix)]
            Network::Unix => Ok(NetStream::Unix(UnixStream::connect(&endpoint.address).await?)),
            #[cfg(not(unix))]
            Network::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }
}

/// Try every resolved address of one family in order, keeping the last error.
async fn connect_family(address: &str, v4: bool) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host(address).await?.filter(|a| a.is_ipv4() == v4) {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {} address for {address}", if v4 { "IPv4" } else { "IPv6" }),
        )
    }))
}

/// A stream produced by [`NetDialer`].
#[derive(Debug)]
pub enum NetStream {
    /// A TCP connection.
    Tcp(TcpStream),
    /// A Unix domain socket connection.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
