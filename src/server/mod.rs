//! Inbound HTTPS serving.
//!
//! Each server owns one OS thread running a current-thread runtime. A
//! listener task accepts sockets and enqueues read jobs; a dispatcher
//! task drains the single-consumer jobs queue and spawns each job. Read
//! jobs wait out the adaptive idle keepalive, drive the TLS handshake,
//! parse one request and hand it to the user callback; write jobs answer
//! and chain the next read on the same connection.

use std::io::Write as _;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use rustls::ServerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, trace, warn};

pub(crate) mod limiter;

use self::limiter::{InboundGuard, inbound};
use crate::error::Error;
use crate::http::{self, ResponseError};
use crate::location::Location;
use crate::stream::paced::PacedIo;
use crate::stream::tls::{ReadPoll, ServerTlsStream};
use crate::tls;

/// Pause after an `EMFILE` accept failure instead of busy-looping.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

type Callback = Arc<dyn Fn(ServerRequest) + Send + Sync>;

/// One accepted connection: the TLS stream plus its slot in the inbound
/// counter.
#[derive(Debug)]
struct ServerConn {
    stream: ServerTlsStream,
    _guard: InboundGuard,
}

enum Job {
    /// Wait for, parse and dispatch the next request on a connection.
    Read(ServerConn),
    /// Answer a request and chain the next read.
    Write {
        conn: ServerConn,
        body: Vec<u8>,
        encoding: Option<&'static str>,
        error: Option<ResponseError>,
        headers: String,
    },
    /// 503 for a request dropped without a reply.
    Fail(ServerConn),
    /// Stop the dispatcher (and with it the server).
    Shutdown,
}

struct Shared {
    jobs: UnboundedSender<Job>,
    callback: Callback,
    config: Arc<ServerConfig>,
}

/// An HTTPS server bound to one location.
///
/// The server identity comes from the location userinfo:
/// `https://cert=<path>;key=<path>@host:port/`. Dropping the server shuts
/// it down and joins its thread.
pub struct Server {
    jobs: UnboundedSender<Job>,
    local_addr: SocketAddr,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Server {
    /// Bind `addr` and serve each parsed request through `callback`.
    pub fn bind<F>(addr: &str, callback: F) -> Result<Self, Error>
    where
        F: Fn(ServerRequest) + Send + Sync + 'static,
    {
        let location = Location::parse(addr)?;
        let config = tls::server_config(&location)?;
        let listener = bind_listener(&location)?;
        let local_addr = listener
            .local_addr()
            .map_err(Error::msg("can not read bound address"))?;

        let (jobs, queue) = unbounded_channel();
        let shared = Arc::new(Shared {
            jobs: jobs.clone(),
            callback: Arc::new(callback),
            config,
        });

        let thread = std::thread::Builder::new()
            .name("veranda-server".into())
            .spawn(move || serve_thread(listener, queue, shared))
            .map_err(Error::msg("can not spawn server thread"))?;

        debug!(%local_addr, "server bound");

        Ok(Self {
            jobs,
            local_addr,
            thread: Some(thread),
        })
    }

    /// The address the listener actually bound (port 0 resolves here).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Bind with deferred accept so connections surface once data arrives.
fn bind_listener(location: &Location) -> Result<std::net::TcpListener, Error> {
    use socket2::{Domain, Protocol, Socket, Type};

    // No host in the location means the dual-stack wildcard.
    let ip: IpAddr = if location.host().is_empty() {
        Ipv6Addr::UNSPECIFIED.into()
    } else {
        location
            .host()
            .parse()
            .map_err(Error::msg(format!("can not bind to {}", location.host())))?
    };
    let addr = SocketAddr::new(ip, location.port());

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::msg("socket open error"))?;
    if location.host().is_empty() {
        let _ = socket.set_only_v6(false);
    }
    socket
        .set_reuse_address(true)
        .map_err(Error::msg("socket reuse error"))?;
    socket
        .set_nonblocking(true)
        .map_err(Error::msg("socket nonblocking error"))?;

    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;

        let secs: libc::c_int = 1;
        #[allow(unsafe_code)]
        // Safety: plain setsockopt on a socket we own; `secs` outlives
        // the call.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_DEFER_ACCEPT,
                std::ptr::from_ref(&secs).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!("TCP_DEFER_ACCEPT not applied");
        }
    }

    socket
        .bind(&addr.into())
        .map_err(Error::msg(format!("can not bind {addr}")))?;
    socket
        .listen(1024)
        .map_err(Error::msg(format!("can not listen on {addr}")))?;

    Ok(socket.into())
}

fn serve_thread(listener: std::net::TcpListener, mut queue: UnboundedReceiver<Job>, shared: Arc<Shared>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("server runtime");

    runtime.block_on(async move {
        let listener = TcpListener::from_std(listener).expect("listener registration");
        let acceptor = tokio::spawn(accept_loop(listener, shared.clone()));

        // Single consumer of the jobs queue.
        while let Some(job) = queue.recv().await {
            if matches!(job, Job::Shutdown) {
                // Put the token back for any other consumer, then stop.
                let _ = shared.jobs.send(Job::Shutdown);
                break;
            }
            let shared = shared.clone();
            tokio::spawn(job.run(shared));
        }

        acceptor.abort();
    });
    // Dropping the runtime aborts the in-flight connection jobs.
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let limiter = inbound();
                if limiter.exceed_hard() > 0 {
                    trace!(%peer, "inbound hard limit reached, closing");
                    drop(stream);
                    continue;
                }

                let _ = stream.set_nodelay(true);
                let guard = InboundGuard::new(limiter.clone());
                let conn = ServerConn {
                    stream: ServerTlsStream::new(
                        PacedIo::new(stream, None),
                        peer,
                        shared.config.clone(),
                    ),
                    _guard: guard,
                };

                if shared.jobs.send(Job::Read(conn)).is_err() {
                    return;
                }
            }
            Err(error) if error.raw_os_error() == Some(libc::EMFILE) => {
                // Out of descriptors; give the process a moment instead
                // of spinning on accept.
                warn!("accept failed: out of file descriptors");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(error) => {
                debug!(%error, "accept failed");
            }
        }
    }
}

impl Job {
    async fn run(self, shared: Arc<Shared>) {
        match self {
            Job::Read(conn) => read_job(conn, shared).await,
            Job::Write {
                conn,
                body,
                encoding,
                error,
                headers,
            } => write_job(conn, body, encoding, error, headers, shared).await,
            Job::Fail(conn) => fail_job(conn, shared).await,
            Job::Shutdown => {}
        }
    }
}

async fn read_job(mut conn: ServerConn, shared: Arc<Shared>) {
    let keepalive = inbound().unused_keepalive_timeout();

    match conn.stream.poll_read_t(keepalive).await {
        Ok(ReadPoll::Ready) => {}
        Ok(ReadPoll::TimedOut) => {
            trace!("idle keepalive elapsed, closing");
            conn.stream.shutdown().await;
            return;
        }
        Ok(ReadPoll::PeerClosed) => return,
        Err(error) => {
            debug!(%error, "connection failed while idle");
            conn.stream.close();
            return;
        }
    }

    if let Err(error) = conn.stream.handshake().await {
        debug!(%error, "server handshake failed");
        conn.stream.close();
        return;
    }

    let parsed = match http::read_request(&mut conn.stream).await {
        Ok(parsed) => parsed,
        Err(error) => {
            debug!(%error, "request read failed");
            conn.stream.close();
            return;
        }
    };

    // Method dispatch by leading character.
    let is_post = parsed
        .method
        .as_bytes()
        .first()
        .is_some_and(|c| c.eq_ignore_ascii_case(&b'P'));
    let accepts_gzip = parsed.accepts_gzip();
    let peer = conn.stream.peer_addr();

    let request = ServerRequest {
        conn: Some(conn),
        jobs: shared.jobs.clone(),
        method: parsed.method,
        path: parsed.path,
        query: parsed.query,
        headers: parsed.headers,
        body: parsed.body,
        peer,
        is_post,
        accepts_gzip,
    };

    (shared.callback)(request);
}

async fn write_job(
    mut conn: ServerConn,
    body: Vec<u8>,
    encoding: Option<&'static str>,
    error: Option<ResponseError>,
    headers: String,
    shared: Arc<Shared>,
) {
    let head = http::build_response_head(error, encoding, body.len(), &headers);

    let result = async {
        conn.stream.write_all(&head).await?;
        if !body.is_empty() {
            conn.stream.write_all(&body).await?;
        }
        conn.stream.flush().await
    }
    .await;

    match result {
        Ok(()) => {
            // Same connection, next request.
            let _ = shared.jobs.send(Job::Read(conn));
        }
        Err(error) => {
            debug!(%error, "response write failed");
            conn.stream.close();
        }
    }
}

const FAIL_ANSWER: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n";

async fn fail_job(mut conn: ServerConn, shared: Arc<Shared>) {
    let result = async {
        conn.stream.write_all(FAIL_ANSWER).await?;
        conn.stream.flush().await
    }
    .await;

    match result {
        Ok(()) => {
            let _ = shared.jobs.send(Job::Read(conn));
        }
        Err(_) => conn.stream.close(),
    }
}

/// One inbound request handed to the server callback.
///
/// Dropping the request without answering sends a 503 on the caller's
/// behalf. Answering hands the connection to a write job and, after the
/// response, chains the next read on the same connection.
pub struct ServerRequest {
    conn: Option<ServerConn>,
    jobs: UnboundedSender<Job>,
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    peer: SocketAddr,
    is_post: bool,
    accepts_gzip: bool,
}

impl ServerRequest {
    pub fn scheme(&self) -> &'static str {
        "https"
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path with the leading `/` stripped.
    pub fn service(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn remote_host(&self) -> String {
        self.peer.ip().to_string()
    }

    /// Request payload: the body for POST-shaped requests, the query
    /// string otherwise.
    pub fn data(&self) -> &[u8] {
        if self.is_post {
            &self.body
        } else {
            self.query.as_bytes()
        }
    }

    /// Whether a gzip-compressed reply is possible for this client.
    pub fn can_compress(&self) -> bool {
        self.accepts_gzip
    }

    /// Send a 2xx reply with the given body.
    pub fn send_reply(self, data: Vec<u8>) {
        self.send_reply_with_headers(data, String::new());
    }

    /// Send a 2xx reply with extra response headers (each line must end
    /// with `\r\n`).
    pub fn send_reply_with_headers(mut self, data: Vec<u8>, headers: String) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let (body, encoding) = if self.accepts_gzip {
            match gzip(&data) {
                Some(compressed) => (compressed, Some("gzip")),
                None => (data, None),
            }
        } else {
            (data, None)
        };

        let _ = self.jobs.send(Job::Write {
            conn,
            body,
            encoding,
            error: None,
            headers,
        });
    }

    /// Answer with one of the fixed error statuses.
    pub fn send_error(mut self, error: ResponseError) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let _ = self.jobs.send(Job::Write {
            conn,
            body: Vec::new(),
            encoding: None,
            error: Some(error),
            headers: String::new(),
        });
    }
}

impl Drop for ServerRequest {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // The callback never answered; 503 on its behalf.
            let _ = self.jobs.send(Job::Fail(conn));
        }
    }
}

impl std::fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Gzip `data`, but only when that actually shrinks it.
fn gzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;
    (compressed.len() < data.len()).then_some(compressed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gzip_only_when_smaller() {
        let repetitive = vec![b'a'; 4096];
        let compressed = gzip(&repetitive).expect("repetitive data compresses");
        assert!(compressed.len() < repetitive.len());

        // Tiny payloads grow under gzip framing.
        assert!(gzip(b"ok").is_none());
    }
}
