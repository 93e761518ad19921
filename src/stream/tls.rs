//! TLS sessions over [`PacedIo`].
//!
//! The client side hands a connected socket to the TLS connector and runs
//! the post-handshake hostname check. The server side wraps an accepted
//! socket and drives its handshake lazily, on the first read job that
//! finds the connection readable.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{Instrument, trace, trace_span};

use crate::error::{Error, is_cancelled_io};
use crate::options::HttpsOptions;
use crate::stream::paced::PacedIo;
use crate::verify::check_cert_hostname;

/// A client TLS session bound to a pooled socket.
pub(crate) type ClientTls = tokio_rustls::client::TlsStream<PacedIo>;

/// Run the client handshake for `host` over an already-connected socket.
///
/// Cancellation raised by the underlying [`PacedIo`] surfaces as
/// [`Error::Cancelled`]. When `CheckCertificateHostname` is enabled the
/// peer certificate is matched against `host` per RFC 6125 after the
/// handshake completes.
pub(crate) async fn client_handshake(
    config: Arc<ClientConfig>,
    io: PacedIo,
    host: &str,
) -> Result<ClientTls, Error> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(Error::msg(format!("invalid server name: {host}")))?;
    let connector = TlsConnector::from(config);

    let span = trace_span!("tls", host);
    async {
        trace!("client handshake starting");
        let stream = connector
            .connect(server_name, io)
            .await
            .map_err(|error| {
                if is_cancelled_io(&error) {
                    Error::Cancelled
                } else {
                    Error::msg("tls handshake failed")(error)
                }
            })?;
        trace!("client handshake complete");

        if HttpsOptions::snapshot().check_certificate_hostname {
            let (_, session) = stream.get_ref();
            let peer = session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or_else(|| Error::message("no peer certificate presented"))?;

            if !check_cert_hostname(peer.as_ref(), host) {
                return Err(Error::message(format!(
                    "peer certificate does not match hostname {host}"
                )));
            }
            trace!("peer hostname verified");
        }

        Ok(stream)
    }
    .instrument(span)
    .await
}

/// Outcome of waiting for the next request on an inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadPoll {
    /// A byte is available; the next read will make progress.
    Ready,
    /// The peer closed cleanly while the connection was idle.
    PeerClosed,
    /// The idle keepalive timeout elapsed.
    TimedOut,
}

enum State {
    /// Accepted socket, handshake not yet driven.
    Plain { io: PacedIo, acceptor: TlsAcceptor },
    Tls(tokio_rustls::server::TlsStream<PacedIo>),
    Closed,
}

/// Server side of a TLS connection, handshaken on first use.
pub(crate) struct ServerTlsStream {
    state: State,
    peer: SocketAddr,
    peeked: Option<u8>,
}

impl ServerTlsStream {
    pub(crate) fn new(io: PacedIo, peer: SocketAddr, config: Arc<ServerConfig>) -> Self {
        Self {
            state: State::Plain {
                io,
                acceptor: TlsAcceptor::from(config),
            },
            peer,
            peeked: None,
        }
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Drive the TLS accept if it has not run yet. Re-driven (and a no-op)
    /// on every subsequent request on the same connection.
    pub(crate) async fn handshake(&mut self) -> io::Result<()> {
        if matches!(self.state, State::Plain { .. }) {
            let State::Plain { io, acceptor } = std::mem::replace(&mut self.state, State::Closed)
            else {
                unreachable!();
            };
            trace!("server handshake starting");
            let stream = acceptor.accept(io).await?;
            trace!("server handshake complete");
            self.state = State::Tls(stream);
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next request to arrive.
    ///
    /// Before the handshake this waits for raw readability. Afterwards it
    /// reads (and buffers) one decrypted byte, so a clean close_notify
    /// while idle is distinguished from a new request; the peer-close case
    /// performs the graceful shutdown before reporting.
    pub(crate) async fn poll_read_t(&mut self, timeout: Duration) -> io::Result<ReadPoll> {
        if self.peeked.is_some() {
            return Ok(ReadPoll::Ready);
        }

        match &mut self.state {
            State::Plain { io, .. } => {
                match tokio::time::timeout(timeout, io.get_ref().readable()).await {
                    Ok(ready) => {
                        ready?;
                        Ok(ReadPoll::Ready)
                    }
                    Err(_) => Ok(ReadPoll::TimedOut),
                }
            }
            State::Tls(stream) => {
                let mut byte = [0u8; 1];
                match tokio::time::timeout(timeout, stream.read(&mut byte)).await {
                    Ok(Ok(0)) => {
                        self.shutdown().await;
                        Ok(ReadPoll::PeerClosed)
                    }
                    Ok(Ok(_)) => {
                        self.peeked = Some(byte[0]);
                        Ok(ReadPoll::Ready)
                    }
                    Ok(Err(error)) if error.kind() == io::ErrorKind::UnexpectedEof => {
                        // Peer dropped the link without a close_notify.
                        self.close();
                        Ok(ReadPoll::PeerClosed)
                    }
                    Ok(Err(error)) => Err(error),
                    Err(_) => Ok(ReadPoll::TimedOut),
                }
            }
            State::Closed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )),
        }
    }

    /// Graceful close: send close_notify, then drop the session.
    pub(crate) async fn shutdown(&mut self) {
        if let State::Tls(stream) = &mut self.state {
            // A failed goodbye only loses the goodbye.
            let _ = AsyncWriteExt::shutdown(stream).await;
        }
        self.state = State::Closed;
    }

    /// Abrupt close without the TLS goodbye.
    pub(crate) fn close(&mut self) {
        self.state = State::Closed;
    }
}

impl std::fmt::Debug for ServerTlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Plain { .. } => "plain",
            State::Tls(_) => "tls",
            State::Closed => "closed",
        };
        f.debug_struct("ServerTlsStream")
            .field("state", &state)
            .field("peer", &self.peer)
            .finish()
    }
}

impl AsyncRead for ServerTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(byte) = this.peeked.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }

        match &mut this.state {
            State::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tls session not established",
            ))),
        }
    }
}

impl AsyncWrite for ServerTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match &mut self.get_mut().state {
            State::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tls session not established",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match &mut self.get_mut().state {
            State::Tls(stream) => Pin::new(stream).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match &mut self.get_mut().state {
            State::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}
