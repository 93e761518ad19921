//! # Veranda: pooled HTTPS transport for lightweight RPC clients and servers
//!
//! Veranda is the HTTPS leg of a request/reply framework: a client that
//! keeps a self-regulating cache of TLS connections per resolved host, and
//! a server that accepts, handshakes and answers HTTP/1.1 requests over
//! TLS, all on top of tokio and rustls.
//!
//! ## Architecture Overview
//!
//! The crate is built from a few tightly coupled pieces:
//!
//! - **`stream`**: the byte layer. `PacedIo` wraps
//!   a socket as the source/sink the TLS session consumes, observing a
//!   shared cancellation flag on every read; the TLS streams on top drive
//!   handshakes, hostname verification and idle-wait with timeout.
//! - **`client`**: the outbound side. A process-wide connection cache
//!   pools idle sockets per host in LIFO order under soft/hard
//!   file-descriptor limits, races fresh connects against background
//!   reserve connectors on a miss, and purges proportionally under
//!   pressure. A request job drives acquire → handshake → send → receive
//!   → release.
//! - **`server`**: the inbound side. Each [`Server`] owns one OS thread
//!   with a cooperative runtime; accepted connections flow through a
//!   single-consumer jobs queue as read, write and fail jobs, with an
//!   idle keepalive that shrinks as the inbound socket count approaches
//!   its hard limit.
//! - **`tls`** / **`verify`** / **`options`**: rustls config construction
//!   from process-wide options, including the permissive default
//!   verifier, the verify-callback hook and RFC 6125 hostname checks.
//!
//! ## Client
//!
//! ```no_run
//! use veranda::{Message, request};
//!
//! # async fn example() -> Result<(), veranda::Error> {
//! let message = Message::new("https://example.com:8443/ping", "q=1");
//! let response = request(&message).await?;
//! println!("{}", String::from_utf8_lossy(&response.data));
//! # Ok(())
//! # }
//! ```
//!
//! Three schemes select how the message becomes a request: `https` (GET
//! with the data as query string), `posts` (POST with the data as body)
//! and `fulls` (the data is the complete request). A request's URL
//! userinfo may pin a client certificate: `https://cert=<path>;key=<path>@…`.
//!
//! ## Server
//!
//! ```no_run
//! use veranda::Server;
//!
//! # fn example() -> Result<(), veranda::Error> {
//! let server = Server::bind(
//!     "https://cert=/etc/pki/srv.pem;key=/etc/pki/srv.key@:8443/",
//!     |request| {
//!         let reply = request.data().to_vec();
//!         request.send_reply(reply);
//!     },
//! )?;
//! # drop(server);
//! # Ok(())
//! # }
//! ```
//!
//! A request dropped without a reply answers 503 on the callback's
//! behalf.
//!
//! ## Limits
//!
//! Both directions enforce a soft/hard descriptor budget: crossing the
//! soft limit starts reclamation (a background cache purge outbound, a
//! shrinking idle keepalive inbound), crossing the hard limit rejects new
//! work. See [`set_output_connection_limits`],
//! [`set_input_connection_limits`] and [`set_input_keepalive_timeouts`].

mod client;
mod error;
mod http;
mod location;
mod options;
mod resolver;
mod server;
mod stream;
mod tls;
mod verify;

pub use self::client::{Message, Response, request, request_with_cancel};
pub use self::error::Error;
pub use self::http::ResponseError;
pub use self::location::{ClientIdentity, Location};
pub use self::options::{HttpsOptions, KeyPasswordCallback, VerifyCallback, set_option};
pub use self::resolver::ResolvedHost;
pub use self::server::{Server, ServerRequest};
pub use self::verify::VerifyContext;

#[allow(dead_code)]
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Set the outbound socket budget. The soft limit triggers background
/// purging of the connection cache, the hard limit rejects new requests.
///
/// # Panics
///
/// Panics unless `hard > soft`.
pub fn set_output_connection_limits(soft: usize, hard: usize) {
    assert!(hard > soft, "invalid output fd limits");
    client::pool::socket_cache().set_fd_limits(soft, hard);
}

/// Set the inbound socket budget. The soft limit starts shrinking the
/// idle keepalive, the hard limit closes accepted sockets immediately.
///
/// # Panics
///
/// Panics unless `hard > soft`.
pub fn set_input_connection_limits(soft: usize, hard: usize) {
    assert!(hard > soft, "invalid input fd limits");
    server::limiter::inbound().set_fd_limits(soft, hard);
}

/// Set the idle keepalive bounds (seconds) for inbound connections.
///
/// # Panics
///
/// Panics unless `max_secs > min_secs`.
pub fn set_input_keepalive_timeouts(min_secs: u32, max_secs: u32) {
    assert!(max_secs > min_secs, "invalid input keepalive timeouts");
    server::limiter::inbound().set_keepalive_timeouts(min_secs, max_secs);
}

/// Tear down the outbound connection cache: drops every cached socket and
/// joins the purge worker. Intended for tests and orderly process exit;
/// the cache must not be used afterwards.
pub fn shutdown_connection_cache() {
    client::pool::socket_cache().shutdown();
}
