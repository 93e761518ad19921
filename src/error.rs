//! Error types surfaced to request and server callers.

use std::fmt;
use std::io;

use crate::BoxError;

/// An error produced while driving a request or serving a connection.
///
/// Connection-level failures are never retried transparently; they are
/// reported through this type. Cancellation is a first-class kind so that
/// callers can distinguish "the caller gave up" from "the network failed".
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request (or its task) was cancelled before completion.
    #[error("canceled")]
    Cancelled,

    /// The peer answered with an HTTP status outside of `2xx`.
    #[error("request failed({first_line})")]
    Protocol {
        /// Parsed HTTP status code.
        code: i32,
        /// The response status line, verbatim.
        first_line: String,
    },

    /// Any other failure: limits, local I/O, TLS state or verify errors.
    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    pub(crate) fn message<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::Other {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        move |error| Self::Other {
            message: message.into(),
            source: Some(error.into()),
        }
    }

    /// HTTP status code for `Protocol` errors, `None` otherwise.
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` for the cancellation kind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        if is_cancelled_io(&error) {
            Self::Cancelled
        } else {
            Self::Other {
                message: error.to_string(),
                source: Some(Box::new(error)),
            }
        }
    }
}

/// Marker carried inside an [`io::Error`] when a cancellation flag
/// interrupts I/O mid-operation.
///
/// The TLS layer sees an ordinary I/O failure and unwinds; the request job
/// recognizes the marker and collapses the whole chain into
/// [`Error::Cancelled`].
#[derive(Debug)]
pub(crate) struct CancelledIo;

impl fmt::Display for CancelledIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request canceled")
    }
}

impl std::error::Error for CancelledIo {}

pub(crate) fn cancelled_io() -> io::Error {
    io::Error::other(CancelledIo)
}

pub(crate) fn is_cancelled_io(error: &io::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = error.get_ref().map(|e| e as _);
    while let Some(inner) = source {
        if inner.is::<CancelledIo>() {
            return true;
        }
        source = inner.source();
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancellation_survives_wrapping() {
        let outer = io::Error::other(cancelled_io());
        assert!(is_cancelled_io(&outer));
        assert!(Error::from(outer).is_cancelled());

        let plain = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(!is_cancelled_io(&plain));
        assert!(!Error::from(plain).is_cancelled());
    }

    #[test]
    fn protocol_error_exposes_status() {
        let err = Error::Protocol {
            code: 503,
            first_line: "HTTP/1.1 503 Service Unavailable".into(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(
            err.to_string(),
            "request failed(HTTP/1.1 503 Service Unavailable)"
        );
    }
}
