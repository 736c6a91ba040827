//! Managed connections and their admission permits.
//!
//! A connection captures the idle set and the open-connection semaphore that
//! were current when it was dialed, never the pool itself. Releasing it either
//! parks it in that idle set, or gives its admission token back and closes the
//! raw stream. Exactly one of the two happens, once.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};

use connpool_core::{Bounded, ContainerError, Context, ContextError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{error, trace, warn};

use crate::error::PoolError;

/// Ownership of one admission token in an open-connection semaphore.
///
/// The token is given back exactly once: by [`Permit::release`] or on drop.
#[derive(Debug)]
pub(crate) struct Permit {
    semaphore: Option<Arc<Bounded<()>>>,
}

impl Permit {
    /// A permit for a pool without an open-connection limit.
    pub(crate) fn unlimited() -> Self {
        Self { semaphore: None }
    }

    /// Take a token from `semaphore`, waiting until `ctx` fires.
    pub(crate) async fn acquire(
        semaphore: Arc<Bounded<()>>,
        ctx: &Context,
    ) -> Result<Self, ContextError> {
        match semaphore.push((), ctx).await {
            Ok(()) => Ok(Self {
                semaphore: Some(semaphore),
            }),
            Err(ContainerError::Absent) => Ok(Self::unlimited()),
            Err(ContainerError::Canceled) => Err(ContextError::Canceled),
            Err(ContainerError::DeadlineExceeded) => Err(ContextError::DeadlineExceeded),
        }
    }

    /// Give the token back. Subsequent calls do nothing.
    pub(crate) fn release(&mut self) -> Result<(), PoolError> {
        match self.semaphore.take() {
            Some(semaphore) => semaphore
                .try_pop()
                .ok_or(PoolError::AccountingInvariantViolation),
            None => Ok(()),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!(event = "permit_release_failed", error = %err);
            debug_assert!(false, "{err}");
        }
    }
}

/// Idle sets hold connections in this form.
pub(crate) type IdleSet<S> = Bounded<Idle<S>>;

/// A dialed connection together with what it captured at dial time.
#[derive(Debug)]
pub(crate) struct Idle<S> {
    stream: S,
    permit: Permit,
    idle: Weak<IdleSet<S>>,
}

impl<S> Idle<S> {
    pub(crate) fn new(stream: S, permit: Permit, idle: Option<&Arc<IdleSet<S>>>) -> Self {
        Self {
            stream,
            permit,
            idle: idle.map(Arc::downgrade).unwrap_or_default(),
        }
    }

    /// Park in the captured idle set, or come back when it is full or gone.
    fn recycle(self) -> Result<(), Self> {
        match self.idle.upgrade() {
            Some(set) => set.try_push(self),
            None => Err(self),
        }
    }

    /// Release the token and drop the stream without a graceful shutdown.
    pub(crate) fn discard(self) {
        let Idle { stream, permit, .. } = self;
        drop(permit);
        drop(stream);
    }
}

impl<S: AsyncWrite + Unpin> Idle<S> {
    /// Release the token, then shut the stream down.
    async fn shutdown(self) -> Result<(), PoolError> {
        let Idle {
            mut stream,
            mut permit,
            ..
        } = self;
        let released = permit.release();
        let closed = stream.shutdown().await.map_err(PoolError::Close);
        released?;
        closed
    }
}

/// A pooled connection.
///
/// Reads and writes go straight to the raw stream. Call [`PooledConn::close`]
/// when done: the connection goes back to the pool for reuse if there is room,
/// otherwise it is closed for real. Dropping it has the same effect, minus the
/// graceful shutdown and the error report.
#[derive(Debug)]
pub struct PooledConn<S> {
    inner: Option<Idle<S>>,
}

impl<S> PooledConn<S> {
    pub(crate) fn new(inner: Idle<S>) -> Self {
        Self { inner: Some(inner) }
    }

    /// The raw stream, unless the connection has been released.
    pub fn get_ref(&self) -> Option<&S> {
        self.inner.as_ref().map(|i| &i.stream)
    }

    /// Mutable access to the raw stream, unless the connection has been released.
    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.inner.as_mut().map(|i| &mut i.stream)
    }

    /// Whether [`PooledConn::close`] has already run.
    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    fn stream(&mut self) -> io::Result<&mut S> {
        self.get_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection released"))
    }
}

impl<S: AsyncWrite + Unpin> PooledConn<S> {
    /// Release the connection.
    ///
    /// Returns it to the idle set it was dialed under if that set still exists
    /// and has room. Otherwise frees its open-connection slot and shuts the
    /// stream down, reporting a failed shutdown as [`PoolError::Close`].
    /// Calling `close` again is a no-op.
    pub async fn close(&mut self) -> Result<(), PoolError> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        match inner.recycle() {
            Ok(()) => {
                trace!(event = "connection_recycled");
                Ok(())
            }
            Err(inner) => {
                trace!(event = "connection_closed");
                inner.shutdown().await.inspect_err(|err| {
                    warn!(event = "connection_close_failed", error = %err);
                })
            }
        }
    }
}

impl<S> Drop for PooledConn<S> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Err(inner) = inner.recycle() {
                inner.discard();
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PooledConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PooledConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    /// Shuts the raw stream down in place. This does not release the
    /// connection; use [`PooledConn::close`] for that.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}
