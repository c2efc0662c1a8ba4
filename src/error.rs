//! Error types for request execution and WebSocket sessions.
//!
//! Every failure of a request attempt is reported as exactly one [`Error`]
//! on the attempt's event scope, and that same value is what the caller
//! receives from the response future or callback.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::destination::Destination;

/// A shareable error cause.
///
/// Causes are reference counted so that a single [`Error`] can be delivered
/// to every subscriber of an `Error` event and still reach the caller intact.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// The connection could not be established in time.
    Connect,
    /// No I/O progress was observed within the idle timeout.
    Idle,
    /// The request did not complete within the total request timeout.
    Request,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Connect => f.write_str("connect"),
            TimeoutKind::Idle => f.write_str("idle"),
            TimeoutKind::Request => f.write_str("request"),
        }
    }
}

/// Client error type.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request URI could not be parsed into a destination.
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// The destination was rejected for this kind of request.
    #[error("invalid destination {destination}: {reason}")]
    InvalidDestination {
        /// The rejected destination.
        destination: Destination,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Admission control refused the request.
    #[error("too many connections to {0}")]
    TooManyConnections(Destination),

    /// Connecting to the remote host failed.
    #[error("connect: {0}")]
    Connect(#[source] SharedError),

    /// Writing the request failed.
    #[error("write: {0}")]
    Write(#[source] SharedError),

    /// Reading the response failed.
    #[error("read: {0}")]
    Read(#[source] SharedError),

    /// The peer violated the protocol.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The WebSocket upgrade response did not validate.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// A WebSocket frame or aggregated message exceeded its size limit.
    #[error("frame too long: {size} bytes exceeds limit of {limit}")]
    FrameTooLong {
        /// Observed size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A timer fired before the request completed.
    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    /// The remote closed the connection before the response completed.
    #[error("connection closed by peer")]
    PeerClosed,

    /// A response consumer or frame handler failed.
    #[error("consumer: {0}")]
    Consumer(#[source] SharedError),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The redirect limit was reached, or the redirect chain loops.
    #[error("maximum redirects ({0}) reached")]
    MaxRedirects(usize),

    /// The client has been closed.
    #[error("client closed")]
    Closed,
}

/// The category of an [`Error`], for branching without matching payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed URI or rejected destination.
    User,
    /// Admission control refused the request.
    AdmissionRejected,
    /// Connect failed.
    ConnectFailed,
    /// Write failed.
    WriteFailed,
    /// Read failed or the peer closed early.
    PeerClosed,
    /// Protocol violation, handshake mismatch or oversized frame.
    ProtocolViolation,
    /// An invalid operation for the current session state.
    InvalidState,
    /// A timer fired.
    Timeout,
    /// A consumer or handler failed.
    ConsumerFailure,
    /// Cancelled by the caller.
    Cancellation,
    /// Redirect limit or loop.
    Redirect,
    /// The client was closed.
    Closed,
}

impl Error {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidUri(_) | Error::InvalidDestination { .. } => ErrorKind::User,
            Error::TooManyConnections(_) => ErrorKind::AdmissionRejected,
            Error::Connect(_) => ErrorKind::ConnectFailed,
            Error::Write(_) => ErrorKind::WriteFailed,
            Error::Read(_) | Error::PeerClosed => ErrorKind::PeerClosed,
            Error::Protocol(_) | Error::Handshake(_) | Error::FrameTooLong { .. } => {
                ErrorKind::ProtocolViolation
            }
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Timeout(TimeoutKind::Connect) => ErrorKind::ConnectFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Consumer(_) => ErrorKind::ConsumerFailure,
            Error::Cancelled => ErrorKind::Cancellation,
            Error::MaxRedirects(_) => ErrorKind::Redirect,
            Error::Closed => ErrorKind::Closed,
        }
    }

    /// Returns `true` if this error was produced by a timer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub(crate) fn connect(error: impl Into<crate::BoxError>) -> Self {
        Error::Connect(shared(error))
    }

    pub(crate) fn write(error: impl Into<crate::BoxError>) -> Self {
        Error::Write(shared(error))
    }

    pub(crate) fn read(error: impl Into<crate::BoxError>) -> Self {
        Error::Read(shared(error))
    }

    pub(crate) fn consumer(error: impl Into<crate::BoxError>) -> Self {
        Error::Consumer(shared(error))
    }
}

fn shared(error: impl Into<crate::BoxError>) -> SharedError {
    Arc::from(error.into())
}
