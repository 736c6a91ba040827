//! Bounded connection pool.
//!
//! Two limits are enforced independently. The idle set caps how many
//! connections wait around for reuse; the open-connection semaphore caps how
//! many exist at once, idle or in use. Both live behind hot-swappable slots so
//! reconfiguration never invalidates a container a connection still points at.

use std::fmt;
use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use connpool_core::{BoundedSlot, Context, Endpoint, Network};
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::conn::{Idle, IdleSet, Permit, PooledConn};
use crate::dialer::{Dialer, NetDialer};
use crate::error::PoolError;

/// Idle capacity of a freshly created pool.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 2;

/// A point-in-time view of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Capacity of the idle set.
    pub max_idle: usize,
    /// Connections holding an admission token, idle or in use. `None` when
    /// the pool has no open-connection limit.
    pub open: Option<usize>,
    /// Open-connection limit, `0` meaning unlimited.
    pub max_open: usize,
}

/// A pool of reusable connections to a single endpoint.
///
/// All operations take `&self`; share the pool behind an `Arc`.
pub struct Pool<D: Dialer = NetDialer> {
    endpoint: Endpoint,
    dialer: D,
    idle: BoundedSlot<Idle<D::Stream>>,
    /// Absent means unlimited.
    open: BoundedSlot<()>,
    reconfigure: Mutex<()>,
}

impl Pool<NetDialer> {
    /// A pool dialing `address` over `network` with the default limits: two
    /// idle connections, no open-connection limit.
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self::with_dialer(Endpoint::new(network, address), NetDialer)
    }

    /// A pool built from configuration, with both limits applied.
    pub fn from_config(config: &PoolConfig) -> Self {
        let pool = Self::new(config.network, config.address.clone());
        pool.set_max_idle_conns(config.max_idle_conns);
        pool.set_max_open_conns(config.max_open_conns);
        pool
    }
}

impl<D: Dialer> Pool<D> {
    /// A pool dialing `endpoint` through a custom dialer, with the default limits.
    pub fn with_dialer(endpoint: Endpoint, dialer: D) -> Self {
        debug!(
            event = "pool_created",
            network = %endpoint.network,
            address = %endpoint.address,
            max_idle = DEFAULT_MAX_IDLE_CONNS,
        );
        Self {
            endpoint,
            dialer,
            idle: BoundedSlot::new(DEFAULT_MAX_IDLE_CONNS),
            open: BoundedSlot::new(0),
            reconfigure: Mutex::new(()),
        }
    }

    /// The endpoint this pool dials.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The dialer this pool uses.
    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Number of idle connections.
    pub fn len(&self) -> usize {
        self.idle.len()
    }

    /// Whether no idle connection is available.
    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }

    /// Capacity of the idle set, i.e. the maximum number of idle connections.
    pub fn cap(&self) -> usize {
        self.idle.capacity()
    }

    /// Same as [`Pool::cap`].
    pub fn max_idle_conns(&self) -> usize {
        self.idle.capacity()
    }

    /// The open-connection limit, `0` meaning unlimited.
    pub fn max_open_conns(&self) -> usize {
        self.open.capacity()
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            max_idle: self.idle.capacity(),
            open: self.open.load().map(|semaphore| semaphore.len()),
            max_open: self.open.capacity(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.reconfigure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Limit the number of idle connections, `0` disabling reuse.
    ///
    /// The value is clamped to the open-connection limit when there is one.
    /// Shrinking or growing swaps in a new idle set; connections idling in the
    /// old one are closed and their open-connection slots freed.
    pub fn set_max_idle_conns(&self, n: usize) {
        let _guard = self.lock();
        self.resize_idle(n);
    }

    /// Limit the number of open connections, `0` meaning unlimited.
    ///
    /// Lowers the idle limit first if it would exceed `n`. Connections dialed
    /// under the previous limit keep counting against it until they close.
    pub fn set_max_open_conns(&self, n: usize) {
        let _guard = self.lock();
        if n > 0 {
            self.resize_idle(self.idle.capacity().min(n));
        }
        let previous = self.open.capacity();
        if previous != n {
            self.open.resize(n);
            debug!(
                event = "open_limit_changed",
                address = %self.endpoint.address,
                from = previous,
                to = n,
            );
        }
    }

    /// Callers must hold the reconfiguration lock.
    fn resize_idle(&self, n: usize) {
        let max_open = self.open.capacity();
        let n = if max_open > 0 { n.min(max_open) } else { n };

        let Some(previous) = self.idle.resize(n) else {
            return;
        };
        let drained = previous.drain();
        debug!(
            event = "idle_limit_changed",
            address = %self.endpoint.address,
            from = previous.capacity(),
            to = n,
            closed = drained.len(),
        );
        for conn in drained {
            conn.discard();
        }
    }

    /// Get a connection, reusing an idle one when available.
    pub async fn get(&self) -> Result<PooledConn<D::Stream>, PoolError> {
        self.get_with_context(&Context::background()).await
    }

    /// Get a connection before `ctx` fires, reusing an idle one when available.
    ///
    /// When the open-connection limit is reached this waits for whichever
    /// comes first: a connection returning to the idle set, or another one
    /// closing and freeing its slot. Reconfiguring either limit meanwhile
    /// makes the wait start over against the new containers.
    pub async fn get_with_context(
        &self,
        ctx: &Context,
    ) -> Result<PooledConn<D::Stream>, PoolError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        loop {
            let idle_swapped = self.idle.swapped();
            let open_swapped = self.open.swapped();
            tokio::pin!(idle_swapped, open_swapped);
            idle_swapped.as_mut().enable();
            open_swapped.as_mut().enable();

            let idle = self.idle.load();
            if let Some(conn) = idle.as_ref().and_then(|set| set.try_pop()) {
                trace!(event = "connection_reused", idle = self.idle.len());
                return Ok(PooledConn::new(conn));
            }

            let Some(semaphore) = self.open.load() else {
                return self.connect(Permit::unlimited(), ctx).await;
            };

            tokio::select! {
                biased;
                permit = Permit::acquire(semaphore, ctx) => {
                    return self.connect(permit?, ctx).await;
                }
                conn = wait_for_idle(idle.as_ref(), ctx) => {
                    trace!(event = "connection_reused", waited = true);
                    return Ok(PooledConn::new(conn));
                }
                _ = &mut idle_swapped => {}
                _ = &mut open_swapped => {}
            }
            trace!(event = "limits_changed_while_waiting", endpoint = %self.endpoint);
        }
    }

    /// Dial a fresh connection, bypassing the idle set but still respecting
    /// the open-connection limit.
    pub async fn dial(&self) -> Result<PooledConn<D::Stream>, PoolError> {
        self.dial_with_context(&Context::background()).await
    }

    /// Dial a fresh connection before `ctx` fires.
    pub async fn dial_with_context(
        &self,
        ctx: &Context,
    ) -> Result<PooledConn<D::Stream>, PoolError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        let permit = self.admit(ctx).await?;
        self.connect(permit, ctx).await
    }

    /// Take a token from the current open-connection semaphore, following it
    /// across reconfigurations.
    async fn admit(&self, ctx: &Context) -> Result<Permit, PoolError> {
        loop {
            let swapped = self.open.swapped();
            tokio::pin!(swapped);
            swapped.as_mut().enable();

            let Some(semaphore) = self.open.load() else {
                return Ok(Permit::unlimited());
            };
            tokio::select! {
                biased;
                permit = Permit::acquire(semaphore, ctx) => return Ok(permit?),
                _ = &mut swapped => {}
            }
            trace!(event = "limits_changed_while_waiting", endpoint = %self.endpoint);
        }
    }

    /// Dial while holding `permit`. The permit is released if the dial fails
    /// or is cancelled.
    async fn connect(
        &self,
        permit: Permit,
        ctx: &Context,
    ) -> Result<PooledConn<D::Stream>, PoolError> {
        let stream = match ctx.run(self.dialer.dial(&self.endpoint, ctx)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(event = "dial_failed", endpoint = %self.endpoint, error = %err);
                return Err(PoolError::Dial(err));
            }
            Err(reason) => return Err(reason.into()),
        };
        trace!(event = "connection_dialed", endpoint = %self.endpoint);

        let idle = self.idle.load();
        Ok(PooledConn::new(Idle::new(stream, permit, idle.as_ref())))
    }
}

/// Wait for a connection to arrive in `idle`. Never resolves when there is no
/// idle set or `ctx` fires first; the admission branch reports the latter.
async fn wait_for_idle<S>(idle: Option<&Arc<IdleSet<S>>>, ctx: &Context) -> Idle<S> {
    match idle {
        Some(set) => match set.pop(ctx).await {
            Ok(conn) => conn,
            Err(_) => future::pending().await,
        },
        None => future::pending().await,
    }
}

impl<D: Dialer> fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", &self.endpoint)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A pool shared between tasks.
pub type SharedPool<D = NetDialer> = Arc<Pool<D>>;
