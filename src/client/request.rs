//! One outbound request, end to end.
//!
//! A request job acquires a pooled connection, handshakes if the socket is
//! fresh, writes the serialized request, waits for the kernel to drain the
//! send queue, reads the full response and either returns the socket to
//! the cache (success) or lets it close (any failure).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWriteExt;
use tracing::Instrument;
use tracing::{debug, trace_span};

use crate::client::pool::{Checkout, socket_cache};
use crate::error::Error;
use crate::http::{self, RequestKind};
use crate::location::Location;
use crate::resolver::resolve;

/// An outbound message: target address plus scheme-dependent payload.
#[derive(Debug, Clone)]
pub struct Message {
    /// `https://…` (GET, data is the query), `posts://…` (POST, data is
    /// the body) or `fulls://…` (data is the complete request).
    pub addr: String,
    pub data: String,
}

impl Message {
    pub fn new(addr: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            data: data.into(),
        }
    }
}

/// A successful (2xx) response.
#[derive(Debug)]
pub struct Response {
    pub data: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Issue `message` and wait for the response.
pub async fn request(message: &Message) -> Result<Response, Error> {
    run(message, None).await
}

/// Issue `message` with a cancellation flag shared with the caller.
///
/// Setting the flag makes in-flight I/O fail promptly with
/// [`Error::Cancelled`].
pub async fn request_with_cancel(
    message: &Message,
    cancel: Arc<AtomicBool>,
) -> Result<Response, Error> {
    run(message, Some(cancel)).await
}

fn is_cancelled(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed))
}

async fn run(message: &Message, cancel: Option<Arc<AtomicBool>>) -> Result<Response, Error> {
    let location = Location::parse(&message.addr)?;
    let kind = RequestKind::from_scheme(location.scheme())
        .ok_or_else(|| Error::message(format!("unsupported scheme: {}", location.scheme())))?;

    let span = trace_span!("request", host = location.host(), service = location.service());

    async {
        if is_cancelled(&cancel) {
            return Err(Error::Cancelled);
        }

        let host = resolve(location.host(), location.port()).await?;

        let mut conn = socket_cache().connect(&host).await?;
        debug!(reused = conn.reused, "connection acquired");

        match drive(&mut conn, &location, kind, message, cancel.clone()).await {
            Ok(response) => {
                conn.release();
                Ok(response)
            }
            Err(error) => {
                // The connection is dropped with the checkout.
                if error.is_cancelled() || is_cancelled(&cancel) {
                    Err(Error::Cancelled)
                } else {
                    Err(error)
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn drive(
    conn: &mut Checkout,
    location: &Location,
    kind: RequestKind,
    message: &Message,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<Response, Error> {
    let tls = conn.socket_mut().ensure_tls(location, cancel).await?;

    let bytes = http::build_request(kind, location, message.data.as_bytes());
    tls.write_all(&bytes).await?;
    tls.flush().await?;

    // Learn when the kernel drained the send queue; past this point the
    // request counts as sent even if the response never arrives.
    tls.get_ref().0.wait_until_written().await?;

    let response = http::read_response(tls).await?;

    if !(200..300).contains(&response.code) {
        return Err(Error::Protocol {
            code: response.code,
            first_line: response.first_line,
        });
    }

    Ok(Response {
        data: response.body,
        headers: response.headers,
    })
}
