//! Outbound connection cache.
//!
//! Idle TLS-capable sockets are pooled per resolved host in LIFO order,
//! bounded by a pair of file-descriptor limits: crossing the soft limit
//! triggers a proportional background purge, the hard limit rejects new
//! work outright. A cache miss runs an optimistic race between the
//! requesting task's own connect and a background reserve connector, with
//! either side's result usable by the other.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::location::Location;
use crate::resolver::ResolvedHost;
use crate::stream::paced::PacedIo;
use crate::stream::socket_not_closed_by_peer;
use crate::stream::tls::{ClientTls, client_handshake};
use crate::tls;

/// Overall deadline for a primary connect attempt.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// First checkpoint of the doubling connect schedule.
const CONNECT_DELAY_SEED: Duration = Duration::from_millis(8);

/// Per-address deadline for reserve connectors.
const RESERVE_CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

const DEFAULT_SOFT_LIMIT: usize = 10_000;
const DEFAULT_HARD_LIMIT: usize = 15_000;

pub(crate) fn exceed(value: usize, limit: usize) -> usize {
    value.saturating_sub(limit)
}

/// One pooled socket: the OS connection plus, once the first request has
/// handshaken, its TLS session. Keeping the session attached lets the next
/// user of the socket skip the handshake.
#[derive(Debug)]
pub(crate) struct PooledSocket {
    io: SocketIo,
}

#[derive(Debug)]
pub(crate) enum SocketIo {
    Plain(PacedIo),
    Tls(Box<ClientTls>),
    /// Transient state while the plain socket is being handshaken.
    Detached,
}

impl PooledSocket {
    fn plain(stream: TcpStream) -> Self {
        Self {
            io: SocketIo::Plain(PacedIo::new(stream, None)),
        }
    }

    #[cfg(unix)]
    fn fd(&self) -> Option<std::os::fd::RawFd> {
        match &self.io {
            SocketIo::Plain(io) => Some(io.as_raw_fd()),
            SocketIo::Tls(tls) => Some(tls.get_ref().0.as_raw_fd()),
            SocketIo::Detached => None,
        }
    }

    /// OS-level liveness probe; cached sockets must pass this before reuse.
    pub(crate) fn still_open(&self) -> bool {
        self.fd().is_some_and(socket_not_closed_by_peer)
    }

    /// The attached TLS session, creating it (and running the client
    /// handshake) when this socket is fresh. Re-binds the cancellation
    /// flag in either case.
    pub(crate) async fn ensure_tls(
        &mut self,
        location: &Location,
        cancel: Option<Arc<std::sync::atomic::AtomicBool>>,
    ) -> Result<&mut ClientTls, Error> {
        match &mut self.io {
            SocketIo::Tls(tls) => {
                tls.get_mut().0.set_cancel(cancel);
            }
            SocketIo::Plain(_) => {
                let SocketIo::Plain(mut paced) = std::mem::replace(&mut self.io, SocketIo::Detached)
                else {
                    unreachable!();
                };
                paced.set_cancel(cancel);

                let identity = location.identity();
                let config = if identity.is_empty() {
                    tls::client_config()?
                } else {
                    tls::client_config_for(&identity)?
                };

                let stream = client_handshake(config, paced, location.host()).await?;
                self.io = SocketIo::Tls(Box::new(stream));
            }
            SocketIo::Detached => {
                return Err(Error::message("socket lost its stream"));
            }
        }

        match &mut self.io {
            SocketIo::Tls(tls) => Ok(tls),
            _ => unreachable!(),
        }
    }
}

/// A connection checked out of the cache, held for the lifetime of one
/// request. Dropping the checkout without [`Checkout::release`] discards
/// the socket instead of returning it to the pool.
#[derive(Debug)]
pub(crate) struct Checkout {
    cache: Arc<ConnCache>,
    socket: Option<PooledSocket>,
    pub(crate) reused: bool,
    pub(crate) host: Arc<ResolvedHost>,
}

impl Checkout {
    pub(crate) fn socket_mut(&mut self) -> &mut PooledSocket {
        self.socket
            .as_mut()
            .expect("socket only taken on release or drop")
    }

    /// Return the socket (and its TLS session) to the pool for reuse.
    pub(crate) fn release(mut self) {
        if let Some(socket) = self.socket.take() {
            let cache = self.cache.clone();
            let host = self.host.clone();
            cache.release(socket, &host, true);
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if self.socket.take().is_some() {
            self.cache.active.fetch_sub(1, Ordering::Relaxed);
            trace!("checkout dropped, socket discarded");
        }
    }
}

type Bucket = Mutex<Vec<PooledSocket>>;

/// The per-process cache of outbound sockets.
pub(crate) struct ConnCache {
    soft: AtomicUsize,
    hard: AtomicUsize,

    /// Sockets currently held by requests.
    active: AtomicUsize,
    /// Sockets currently idle in buckets.
    cached: AtomicUsize,

    /// Largest host id ever released into the cache.
    max_bucket_id: AtomicUsize,
    buckets: RwLock<Vec<Arc<Bucket>>>,

    purging: AtomicBool,
    /// Guards the shutdown flag the purge worker sleeps on.
    purge_state: Mutex<bool>,
    purge_cond: Condvar,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ConnCache {
    pub(crate) fn new() -> Arc<Self> {
        let cache = Arc::new(Self {
            soft: AtomicUsize::new(DEFAULT_SOFT_LIMIT),
            hard: AtomicUsize::new(DEFAULT_HARD_LIMIT),
            active: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
            max_bucket_id: AtomicUsize::new(0),
            buckets: RwLock::new(Vec::new()),
            purging: AtomicBool::new(false),
            purge_state: Mutex::new(false),
            purge_cond: Condvar::new(),
            worker: Mutex::new(None),
        });

        let worker_cache = Arc::downgrade(&cache);
        let handle = std::thread::Builder::new()
            .name("veranda-purge".into())
            .spawn(move || purge_worker(worker_cache))
            .expect("spawn purge worker");
        *cache.worker.lock() = Some(handle);

        cache
    }

    pub(crate) fn set_fd_limits(&self, soft: usize, hard: usize) {
        self.soft.store(soft, Ordering::Relaxed);
        self.hard.store(hard, Ordering::Relaxed);
    }

    pub(crate) fn active_sockets(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn cached_sockets(&self) -> usize {
        self.cached.load(Ordering::Relaxed)
    }

    fn total_sockets(&self) -> usize {
        self.active_sockets() + self.cached_sockets()
    }

    fn exceed_soft(&self) -> usize {
        exceed(self.total_sockets(), self.soft.load(Ordering::Relaxed))
    }

    fn at_hard_limit(&self) -> bool {
        self.total_sockets() >= self.hard.load(Ordering::Relaxed)
    }

    fn bucket(&self, id: usize) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().get(id) {
            return bucket.clone();
        }

        let mut buckets = self.buckets.write();
        while buckets.len() <= id {
            buckets.push(Arc::new(Mutex::new(Vec::new())));
        }
        buckets[id].clone()
    }

    fn pop_cached(&self, bucket: &Bucket) -> Option<PooledSocket> {
        let socket = bucket.lock().pop()?;
        self.cached.fetch_sub(1, Ordering::Relaxed);
        Some(socket)
    }

    /// Acquire a connection for `host`, reusing a cached socket when one
    /// is alive, otherwise racing a fresh connect against the background
    /// reserve connector.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        host: &Arc<ResolvedHost>,
    ) -> Result<Checkout, Error> {
        if self.at_hard_limit() {
            return Err(Error::message("output connections limit reached"));
        }

        let bucket = self.bucket(host.id as usize);

        while let Some(socket) = self.pop_cached(&bucket) {
            if socket.still_open() {
                if bucket.lock().is_empty() {
                    // Available connections exhausted; refill optimistically.
                    self.spawn_reserve(host);
                }
                trace!(host = %host.host, "reusing cached connection");
                return Ok(self.checkout(host, socket, true));
            }
            trace!(host = %host.host, "dead cached connection dropped");
        }

        // Cache miss: race our own connect against a reserve connector.
        self.spawn_reserve(host);

        let addr = host.addrs[0];
        let mut connect = Box::pin(TcpStream::connect(addr));
        let start = Instant::now();
        let deadline = start + CONNECT_DEADLINE;
        let mut delay = CONNECT_DELAY_SEED;

        let stream = loop {
            let checkpoint = deadline.min(start + delay);
            match tokio::time::timeout_at(checkpoint, connect.as_mut()).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(error)) => {
                    return Err(Error::msg(format!("can not connect to {}", host.host))(error));
                }
                Err(_) if checkpoint < deadline => {
                    delay += delay;

                    // The racer may have deposited a socket meanwhile.
                    while let Some(socket) = self.pop_cached(&bucket) {
                        if !socket.still_open() {
                            continue;
                        }
                        debug!(host = %host.host, "adopting deposited connection");
                        // Hand our in-flight attempt to a background
                        // finisher; its result enriches the cache.
                        let cache = self.clone();
                        let finish_host = host.clone();
                        tokio::spawn(async move {
                            if let Ok(stream) = connect.await {
                                cache.release(PooledSocket::plain(stream), &finish_host, false);
                            }
                        });
                        return Ok(self.checkout(host, socket, false));
                    }
                }
                Err(_) => {
                    return Err(Error::message(format!("can not connect to {}", host.host)));
                }
            }
        };

        let _ = stream.set_nodelay(true);
        Ok(self.checkout(host, PooledSocket::plain(stream), false))
    }

    /// Scheduler-free acquisition: only a live cached socket will do.
    #[allow(dead_code)]
    pub(crate) fn connect_direct(
        self: &Arc<Self>,
        host: &Arc<ResolvedHost>,
    ) -> Result<Checkout, Error> {
        if self.at_hard_limit() {
            return Err(Error::message("output connections limit reached"));
        }

        let bucket = self.bucket(host.id as usize);
        while let Some(socket) = self.pop_cached(&bucket) {
            if socket.still_open() {
                if bucket.lock().is_empty() && tokio::runtime::Handle::try_current().is_ok() {
                    self.spawn_reserve(host);
                }
                return Ok(self.checkout(host, socket, true));
            }
        }

        Err(Error::message("direct connection failed"))
    }

    fn checkout(self: &Arc<Self>, host: &Arc<ResolvedHost>, socket: PooledSocket, reused: bool) -> Checkout {
        self.active.fetch_add(1, Ordering::Relaxed);
        Checkout {
            cache: self.clone(),
            socket: Some(socket),
            reused,
            host: host.clone(),
        }
    }

    /// Background task opportunistically opening one extra socket for
    /// `host`. Failures are swallowed; a success is released into the
    /// cache as if freshly used.
    fn spawn_reserve(self: &Arc<Self>, host: &Arc<ResolvedHost>) {
        let cache = self.clone();
        let host = host.clone();
        tokio::spawn(async move {
            for addr in &host.addrs {
                match tokio::time::timeout(RESERVE_CONNECT_TIMEOUT, TcpStream::connect(*addr)).await
                {
                    Ok(Ok(stream)) => {
                        trace!(host = %host.host, "reserve connection established");
                        cache.release(PooledSocket::plain(stream), &host, false);
                        return;
                    }
                    Ok(Err(_)) | Err(_) => continue,
                }
            }
        });
    }

    /// Return a socket to its host bucket, or discard it at the hard
    /// limit. `from_active` distinguishes request sockets from reserve
    /// deposits.
    fn release(&self, socket: PooledSocket, host: &Arc<ResolvedHost>, from_active: bool) {
        if !self.at_hard_limit() {
            let id = host.id as usize;
            let mut max = self.max_bucket_id.load(Ordering::Relaxed);
            while max < id {
                match self.max_bucket_id.compare_exchange_weak(
                    max,
                    id,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => max = actual,
                }
            }

            self.cached.fetch_add(1, Ordering::Relaxed);
            if from_active {
                self.active.fetch_sub(1, Ordering::Relaxed);
            }
            self.bucket(id).lock().push(socket);
        } else if from_active {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }

        if self.cached_sockets() > 0 && self.exceed_soft() > 0 {
            self.suggest_purge();
        }
    }

    /// Wake the purge worker if pressure warrants it.
    fn suggest_purge(&self) {
        if self
            .purging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cached = self.cached_sockets();
        let max_id = self.max_bucket_id.load(Ordering::Relaxed);

        if cached > purge_floor(max_id) {
            let active = self.active_sockets();
            let delta = exceed(
                self.hard.load(Ordering::Relaxed),
                self.soft.load(Ordering::Relaxed),
            );

            if purge_pressure(active, cached, delta) {
                debug!(active, cached, "suggesting cache purge");
                self.purge_cond.notify_one();
                // The worker clears the purging flag when done.
                return;
            }
        }

        self.purging.store(false, Ordering::Release);
    }

    /// Remove a pressure-proportional fraction of every bucket.
    fn purge(&self) {
        let frac256 = purge_frac256(self.exceed_soft(), self.cached_sockets());
        let max_id = self.max_bucket_id.load(Ordering::Relaxed);
        let mut processed: u64 = 0;

        debug!(frac256, "purging connection cache");

        for id in 0..=max_id {
            if *self.purge_state.lock() {
                return;
            }

            let Some(bucket) = self.buckets.read().get(id).cloned() else {
                continue;
            };
            let qsize = bucket.lock().len();
            if qsize == 0 {
                continue;
            }

            let mut purge_count = (qsize * frac256) >> 8;
            if purge_count == 0 {
                if qsize <= 2 {
                    // Small bucket: only drop the head if it died.
                    if let Some(socket) = self.pop_cached(&bucket) {
                        if socket.still_open() {
                            self.cached.fetch_add(1, Ordering::Relaxed);
                            bucket.lock().push(socket);
                        } else {
                            self.throttle_purge(&mut processed);
                        }
                    }
                    continue;
                }
                purge_count = 1;
            }

            while purge_count > 0 {
                let Some(socket) = self.pop_cached(&bucket) else {
                    break;
                };
                drop(socket);
                self.throttle_purge(&mut processed);
                purge_count -= 1;
            }
        }
    }

    /// Pace discards to roughly 6400 sockets per second.
    fn throttle_purge(&self, processed: &mut u64) {
        if (*processed & 0x3f) == 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        *processed += 1;
    }

    /// Stop the purge worker and drop every cached socket. Used by tests
    /// and process teardown; the cache is unusable afterwards.
    pub(crate) fn shutdown(&self) {
        {
            let mut shutdown = self.purge_state.lock();
            *shutdown = true;
        }
        self.purge_cond.notify_all();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            // The worker itself may be the one dropping the last cache
            // reference; it must not try to join itself.
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!("purge worker panicked");
            }
        }

        let buckets = self.buckets.read().clone();
        for bucket in buckets {
            let mut bucket = bucket.lock();
            self.cached.fetch_sub(bucket.len(), Ordering::Relaxed);
            bucket.clear();
        }
    }
}

impl Drop for ConnCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnCache")
            .field("active", &self.active_sockets())
            .field("cached", &self.cached_sockets())
            .finish()
    }
}

/// Purge worker loop, parked on the condvar between purges.
///
/// Holds the cache only weakly so dropping the last user reference lets
/// the thread wind down on its next heartbeat.
fn purge_worker(cache: std::sync::Weak<ConnCache>) {
    loop {
        let Some(cache) = cache.upgrade() else {
            return;
        };

        let signalled = {
            let mut shutdown = cache.purge_state.lock();
            if *shutdown {
                return;
            }
            let result = cache
                .purge_cond
                .wait_for(&mut shutdown, Duration::from_millis(500));
            if *shutdown {
                return;
            }
            !result.timed_out()
        };

        if signalled {
            cache.purge();
            cache.purging.store(false, Ordering::Release);
        }
    }
}

/// Below this many cached sockets a purge is never worth it.
fn purge_floor(max_bucket_id: usize) -> usize {
    (max_bucket_id / 16).max(64)
}

/// Purge trigger: closeness to the hard limit plus uselessness of the
/// cache, both in 256ths, crossing unity.
fn purge_pressure(active: usize, cached: usize, delta: usize) -> bool {
    let closeness = ((active + 1) << 8) / (delta + 1);
    let uselessness = ((cached + 1) << 8) / (active + 1);
    closeness + uselessness >= 256
}

/// Fraction of each bucket to remove, in 256ths, clamped to [1/32, 1].
fn purge_frac256(exceed_soft: usize, cached: usize) -> usize {
    ((exceed_soft << 8) / (cached + 1)).clamp(256 / 32, 256)
}

/// The process-wide outbound cache.
pub(crate) fn socket_cache() -> &'static Arc<ConnCache> {
    static CACHE: OnceLock<Arc<ConnCache>> = OnceLock::new();
    CACHE.get_or_init(ConnCache::new)
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::net::TcpListener;

    use crate::resolver::resolve;

    async fn listener() -> (TcpListener, Arc<ResolvedHost>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = resolve("127.0.0.1", port).await.unwrap();
        (listener, host)
    }

    fn accept_forever(listener: TcpListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
    }

    #[test]
    fn purge_math() {
        assert_eq!(purge_floor(0), 64);
        assert_eq!(purge_floor(4096), 256);

        // Little pressure, useful cache: no purge.
        assert!(!purge_pressure(100, 10, 1000));
        // Deep into the soft zone with an idle cache: purge.
        assert!(purge_pressure(900, 800, 1000));
        // Cache far larger than the in-flight set: purge.
        assert!(purge_pressure(1, 600, 1000));

        assert_eq!(purge_frac256(0, 100), 8);
        assert_eq!(purge_frac256(50, 99), 128);
        assert_eq!(purge_frac256(1000, 10), 256);
    }

    #[test]
    fn exceed_is_saturating() {
        assert_eq!(exceed(10, 4), 6);
        assert_eq!(exceed(4, 10), 0);
        assert_eq!(exceed(4, 4), 0);
    }

    #[tokio::test]
    async fn hard_limit_rejects_without_connecting() {
        let _ = tracing_subscriber::fmt::try_init();

        let cache = ConnCache::new();
        cache.set_fd_limits(0, 1);

        let (listener, host) = listener().await;
        accept_forever(listener);

        let held = cache.connect(&host).await.unwrap();
        assert_eq!(cache.active_sockets(), 1);

        let err = cache.connect(&host).await.unwrap_err();
        assert!(err.to_string().contains("output connections limit reached"));

        drop(held);
        assert_eq!(cache.active_sockets(), 0);
        cache.shutdown();
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let _ = tracing_subscriber::fmt::try_init();

        let cache = ConnCache::new();
        let (listener, host) = listener().await;
        accept_forever(listener);

        let conn = cache.connect(&host).await.unwrap();
        assert!(!conn.reused);
        assert_eq!(cache.active_sockets(), 1);
        conn.release();
        assert_eq!(cache.active_sockets(), 0);
        assert!(cache.cached_sockets() >= 1);

        let conn = cache.connect(&host).await.unwrap();
        assert!(conn.reused);
        conn.release();
    }

    #[tokio::test]
    async fn dead_cached_socket_is_probed_and_discarded() {
        let _ = tracing_subscriber::fmt::try_init();

        let cache = ConnCache::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = resolve("127.0.0.1", port).await.unwrap();

        // Seed the cache by hand so no reserve connector is racing yet.
        let (planted, accepted) = tokio::join!(
            async { TcpStream::connect(("127.0.0.1", port)).await.unwrap() },
            async { listener.accept().await.unwrap().0 }
        );
        cache.release(PooledSocket::plain(planted), &host, false);
        assert_eq!(cache.cached_sockets(), 1);

        // Close the server side; the cached socket is now dead.
        drop(accepted);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let conn = cache.connect(&host).await.unwrap();
        assert!(!conn.reused, "dead socket must not be handed out");
        drop(conn);
        cache.shutdown();
    }

    #[tokio::test]
    async fn purge_removes_proportional_fraction() {
        let _ = tracing_subscriber::fmt::try_init();

        let cache = ConnCache::new();
        // Generous limits while planting so no purge gets suggested yet.
        cache.set_fd_limits(500, 1000);

        let (listener, host) = listener().await;
        accept_forever(listener);

        // Plant 100 idle sockets in one bucket.
        for _ in 0..100 {
            let stream = TcpStream::connect(host.addrs[0]).await.unwrap();
            cache.release(PooledSocket::plain(stream), &host, false);
        }
        assert_eq!(cache.cached_sockets(), 100);

        // Now apply pressure limits: exceed_soft=96,
        // frac256=clamp(96*256/101, 8, 256)=243, so 100*243/256 = 94
        // sockets go.
        cache.set_fd_limits(4, 8);
        cache.purge();
        assert_eq!(cache.cached_sockets(), 6);

        cache.shutdown();
        assert_eq!(cache.cached_sockets(), 0);
    }

    #[tokio::test]
    async fn purge_keeps_live_heads_of_small_buckets() {
        let _ = tracing_subscriber::fmt::try_init();

        let cache = ConnCache::new();
        cache.set_fd_limits(0, 1000);

        let (listener, host) = listener().await;
        accept_forever(listener);

        let stream = TcpStream::connect(host.addrs[0]).await.unwrap();
        cache.release(PooledSocket::plain(stream), &host, false);

        // One live socket, fraction rounds to zero: the head is probed
        // and kept.
        cache.purge();
        assert_eq!(cache.cached_sockets(), 1);
        cache.shutdown();
    }

    #[tokio::test]
    async fn direct_connect_only_serves_from_cache() {
        let _ = tracing_subscriber::fmt::try_init();

        let cache = ConnCache::new();
        let (listener, host) = listener().await;

        let err = cache.connect_direct(&host).unwrap_err();
        assert!(err.to_string().contains("direct connection failed"));

        accept_forever(listener);
        let conn = cache.connect(&host).await.unwrap();
        conn.release();

        let conn = cache.connect_direct(&host).unwrap();
        assert!(conn.reused);
    }
}
