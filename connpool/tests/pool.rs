//! Pool behaviour against scripted and real TCP endpoints.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connpool::{Context, Dialer, Endpoint, Network, Pool, PoolError};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;

// ---------------------------
// Helpers
// ---------------------------

/// In-memory dialer that keeps the far end of every stream it hands out.
#[derive(Default)]
struct ScriptedDialer {
    dials: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
    peers: Mutex<Vec<DuplexStream>>,
}

impl ScriptedDialer {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn peer(&self, index: usize) -> DuplexStream {
        let mut peers = self.peers.lock().unwrap();
        let (placeholder, _) = duplex(1);
        std::mem::replace(&mut peers[index], placeholder)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    type Stream = DuplexStream;

    async fn dial(&self, _endpoint: &Endpoint, _ctx: &Context) -> io::Result<DuplexStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let (near, far) = duplex(1024);
        self.peers.lock().unwrap().push(far);
        Ok(near)
    }
}

fn scripted_pool(dialer: ScriptedDialer) -> Arc<Pool<ScriptedDialer>> {
    Arc::new(Pool::with_dialer(
        Endpoint::new(Network::Tcp, "scripted:0"),
        dialer,
    ))
}

/// Accepts and holds every connection so clients never see EOF.
async fn listener() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });
    (address, accepted)
}

/// The accept loop runs on its own task; give it a moment to catch up.
async fn settle(counter: &AtomicUsize, expected: usize) -> usize {
    for _ in 0..200 {
        if counter.load(Ordering::SeqCst) >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    counter.load(Ordering::SeqCst)
}

// ---------------------------
// Tests
// ---------------------------

#[tokio::test]
async fn sequential_get_close_over_tcp_matches_limits() {
    // (max_idle, max_open, expected_len, expected_cap, count)
    let cases = [
        (0, 0, 0, 0, 1),
        (1, 0, 1, 1, 1),
        (1, 1, 1, 1, 1),
        (10, 10, 1, 10, 1),
        (10, 1, 1, 1, 1),
        (100, 100, 1, 100, 1),
        (100, 1, 1, 1, 1),
        (2048, 2048, 1, 2048, 1),
        (2048, 1, 1, 1, 1),
        (4, 0, 1, 4, 10),
    ];

    for (max_idle, max_open, expected_len, expected_cap, count) in cases {
        // Arrange
        let (address, accepted) = listener().await;
        let pool = Pool::new(Network::Tcp, address);
        pool.set_max_idle_conns(max_idle);
        pool.set_max_open_conns(max_open);

        // Act
        for _ in 0..count {
            let mut conn = pool.get().await.unwrap();
            conn.close().await.unwrap();
        }

        // Assert
        assert_eq!(pool.cap(), expected_cap, "cap for {max_idle}/{max_open}");
        assert_eq!(pool.len(), expected_len, "len for {max_idle}/{max_open}");
        let expected_dials = if max_idle == 0 { count } else { 1 };
        assert_eq!(settle(&accepted, expected_dials).await, expected_dials);
    }
}

#[tokio::test]
async fn releasing_n_held_connections_keeps_min_of_n_and_capacity() {
    for capacity in [0usize, 1, 3, 8] {
        for held in [0usize, 1, 3, 5, 12] {
            // Arrange
            let pool = scripted_pool(ScriptedDialer::default());
            pool.set_max_idle_conns(capacity);
            let mut conns = Vec::new();
            for _ in 0..held {
                conns.push(pool.get().await.unwrap());
            }

            // Act
            for conn in &mut conns {
                conn.close().await.unwrap();
            }

            // Assert
            assert_eq!(pool.len(), held.min(capacity), "K={capacity} N={held}");
            assert_eq!(pool.cap(), capacity);
        }
    }
}

#[test]
fn new_pool_has_default_limits() {
    let pool = Pool::new(Network::Tcp, "127.0.0.1:1");

    assert_eq!(pool.cap(), 2);
    assert_eq!(pool.len(), 0);
    assert_eq!(pool.max_open_conns(), 0);
    assert_eq!(pool.stats().open, None);
}

#[test]
fn idle_limit_is_clamped_to_open_limit() {
    let pool = Pool::new(Network::Tcp, "127.0.0.1:1");

    pool.set_max_open_conns(3);
    pool.set_max_idle_conns(10);
    assert_eq!(pool.cap(), 3);

    pool.set_max_open_conns(0);
    pool.set_max_idle_conns(10);
    assert_eq!(pool.cap(), 10);

    pool.set_max_open_conns(4);
    assert_eq!(pool.cap(), 4);
    assert_eq!(pool.max_open_conns(), 4);
}

#[tokio::test]
async fn no_reuse_and_no_limit_keeps_nothing_idle() {
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_idle_conns(0);
    pool.set_max_open_conns(0);

    let mut conn = pool.get().await.unwrap();
    conn.close().await.unwrap();

    assert_eq!(pool.len(), 0);
    assert_eq!(pool.cap(), 0);
}

#[tokio::test(start_paused = true)]
async fn open_limit_blocks_the_next_dial_until_a_close() {
    // Arrange
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_idle_conns(0);
    pool.set_max_open_conns(2);
    let mut a = pool.dial().await.unwrap();
    let _b = pool.dial().await.unwrap();

    let timed_out = pool
        .dial_with_context(&Context::with_timeout(Duration::from_millis(50)))
        .await;
    assert!(matches!(timed_out, Err(PoolError::DeadlineExceeded)));
    assert_eq!(pool.dialer().dials(), 2);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.dial().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    // Act
    a.close().await.unwrap();

    // Assert
    waiter.await.unwrap().unwrap();
    assert_eq!(pool.dialer().dials(), 3);
}

#[tokio::test]
async fn cancelled_context_dials_nothing_and_changes_nothing() {
    // Arrange
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_open_conns(1);
    let mut idle = pool.get().await.unwrap();
    idle.close().await.unwrap();
    let before = pool.stats();
    let ctx = Context::new();
    ctx.cancel();

    // Act
    let got = pool.get_with_context(&ctx).await;
    let dialed = pool.dial_with_context(&ctx).await;

    // Assert
    assert!(matches!(got, Err(PoolError::Canceled)));
    assert!(matches!(dialed, Err(PoolError::Canceled)));
    assert_eq!(pool.dialer().dials(), 1);
    assert_eq!(pool.stats(), before);
}

#[tokio::test(start_paused = true)]
async fn blocked_get_receives_the_connection_returned_to_idle() {
    // Arrange
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_idle_conns(1);
    pool.set_max_open_conns(1);
    let mut a = pool.get().await.unwrap();
    a.write_all(b"from a").await.unwrap();

    let b = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!b.is_finished());

    // Act
    a.close().await.unwrap();
    let mut b = b.await.unwrap().unwrap();

    // Assert: same underlying stream, no second dial.
    assert_eq!(pool.dialer().dials(), 1);
    b.write_all(b", then b").await.unwrap();
    let mut peer = pool.dialer().peer(0);
    let mut buf = [0u8; 14];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from a, then b");
}

#[tokio::test]
async fn closing_twice_releases_one_token() {
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_idle_conns(0);
    pool.set_max_open_conns(2);
    let mut a = pool.get().await.unwrap();
    let _b = pool.get().await.unwrap();

    a.close().await.unwrap();
    a.close().await.unwrap();

    assert_eq!(pool.stats().open, Some(1));
}

#[tokio::test(start_paused = true)]
async fn failed_dial_gives_its_token_back() {
    // Arrange
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_open_conns(1);
    pool.dialer().fail.store(true, Ordering::SeqCst);

    // Act
    let err = pool.get().await.unwrap_err();

    // Assert
    match err {
        PoolError::Dial(source) => assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(pool.stats().open, Some(0));

    pool.dialer().fail.store(false, Ordering::SeqCst);
    let ctx = Context::with_timeout(Duration::from_millis(50));
    assert!(pool.get_with_context(&ctx).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn deadline_during_dial_releases_the_token() {
    let pool = scripted_pool(ScriptedDialer::slow(Duration::from_secs(5)));
    pool.set_max_open_conns(1);

    let err = pool
        .get_with_context(&Context::with_timeout(Duration::from_millis(20)))
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::DeadlineExceeded));
    assert!(err.is_cancellation());
    assert_eq!(pool.stats().open, Some(0));
}

#[tokio::test]
async fn shrinking_idle_set_closes_idle_connections() {
    // Arrange
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_open_conns(2);
    let mut a = pool.get().await.unwrap();
    let mut b = pool.get().await.unwrap();
    a.close().await.unwrap();
    b.close().await.unwrap();
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.stats().open, Some(2));

    // Act
    pool.set_max_idle_conns(0);

    // Assert
    assert_eq!(pool.len(), 0);
    assert_eq!(pool.stats().open, Some(0));
    for index in 0..2 {
        let mut peer = pool.dialer().peer(index);
        let mut buf = Vec::new();
        assert_eq!(peer.read_to_end(&mut buf).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn connection_dialed_before_idle_resize_closes_on_release() {
    let pool = scripted_pool(ScriptedDialer::default());
    let mut stale = pool.get().await.unwrap();

    pool.set_max_idle_conns(5);
    stale.close().await.unwrap();

    assert_eq!(pool.len(), 0);
    assert_eq!(pool.cap(), 5);
}

#[tokio::test]
async fn connection_dialed_before_open_resize_releases_the_old_token() {
    // Arrange
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_idle_conns(0);
    pool.set_max_open_conns(1);
    let mut old = pool.get().await.unwrap();

    // Act: the new limit starts with a clean slate.
    pool.set_max_open_conns(2);
    let mut fresh_a = pool.get().await.unwrap();
    let mut fresh_b = pool.get().await.unwrap();
    assert_eq!(pool.stats().open, Some(2));

    // Assert: releasing the old connection does not touch the new semaphore.
    old.close().await.unwrap();
    assert_eq!(pool.stats().open, Some(2));
    fresh_a.close().await.unwrap();
    fresh_b.close().await.unwrap();
    assert_eq!(pool.stats().open, Some(0));
}

#[tokio::test(start_paused = true)]
async fn raising_the_open_limit_wakes_a_blocked_dial() {
    // Arrange
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_open_conns(1);
    let _held = pool.dial().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.dial_with_context(&Context::with_timeout(Duration::from_secs(2)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    // Act
    pool.set_max_open_conns(5);

    // Assert
    let _fresh = waiter.await.unwrap().unwrap();
    assert_eq!(pool.dialer().dials(), 2);
    assert_eq!(pool.stats().open, Some(1));
}

#[tokio::test(start_paused = true)]
async fn lifting_the_open_limit_wakes_a_blocked_get() {
    // Arrange
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_open_conns(1);
    let _held = pool.get().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    // Act
    pool.set_max_open_conns(0);

    // Assert
    let _fresh = waiter.await.unwrap().unwrap();
    assert_eq!(pool.dialer().dials(), 2);
    assert_eq!(pool.stats().open, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_exceed_the_open_limit() {
    // Arrange
    const LIMIT: usize = 3;
    let pool = scripted_pool(ScriptedDialer::default());
    pool.set_max_idle_conns(1);
    pool.set_max_open_conns(LIMIT);
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    // Act
    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let (pool, in_use, peak) = (pool.clone(), in_use.clone(), peak.clone());
            tokio::spawn(async move {
                for _ in 0..20 {
                    let mut conn = pool.get().await.unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_use.fetch_sub(1, Ordering::SeqCst);
                    conn.close().await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // Assert
    assert!(peak.load(Ordering::SeqCst) <= LIMIT);
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.open, Some(1));
}

#[tokio::test]
async fn dropping_a_connection_returns_it_to_the_pool() {
    let pool = scripted_pool(ScriptedDialer::default());

    drop(pool.get().await.unwrap());

    assert_eq!(pool.len(), 1);
    assert!(!pool.is_empty());
}
