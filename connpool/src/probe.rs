//! Load loop driving a pool through acquire/release cycles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use connpool::{Context, Dialer, PoolStats, SharedPool};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub requests: usize,
    pub concurrency: usize,
    /// Per-acquisition timeout.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub stats: PoolStats,
}

/// Run `requests` get/close cycles spread over `concurrency` tasks.
pub async fn run<D: Dialer>(pool: SharedPool<D>, opts: ProbeOptions) -> ProbeReport {
    let started = Instant::now();
    let remaining = Arc::new(AtomicUsize::new(opts.requests));
    let succeeded = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..opts.concurrency.max(1))
        .map(|worker| {
            let pool = pool.clone();
            let remaining = remaining.clone();
            let succeeded = succeeded.clone();
            tokio::spawn(async move {
                while take_one(&remaining) {
                    let ctx = match opts.timeout {
                        Some(timeout) => Context::with_timeout(timeout),
                        None => Context::background(),
                    };
                    let result = match pool.get_with_context(&ctx).await {
                        Ok(mut conn) => conn.close().await,
                        Err(err) => Err(err),
                    };
                    match result {
                        Ok(()) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => warn!(event = "probe_request_failed", worker, error = %err),
                    }
                }
                debug!(event = "probe_worker_done", worker);
            })
        })
        .collect();

    for worker in workers {
        if let Err(err) = worker.await {
            warn!(event = "probe_worker_panicked", error = %err);
        }
    }

    let succeeded = succeeded.load(Ordering::Relaxed);
    ProbeReport {
        succeeded,
        failed: opts.requests - succeeded,
        elapsed: started.elapsed(),
        stats: pool.stats(),
    }
}

fn take_one(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}
