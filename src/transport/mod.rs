//! The transport boundary.
//!
//! Transports are responsible for establishing a connection to a remote server and shuffling bytes
//! back and forth. This crate never parses raw bytes: a transport reports decoded progress
//! (status, headers, body parts, completion) to the request through a [`Notifier`].
//!
//! After a successful WebSocket upgrade the connection is converted into a [`FrameSink`] for
//! outgoing frames, and reports incoming frames to a [`FrameHandler`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_core::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;

use crate::destination::Destination;
use crate::error::Error;
use crate::event::{Event, EventChannel};
use crate::ws::Frame;
use crate::BoxError;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;

/// Opens connections to destinations.
pub trait Transport: Send + Sync + 'static {
    /// Connect to a destination.
    fn connect(
        &self,
        destination: &Destination,
    ) -> BoxFuture<'static, Result<Box<dyn Connection>, BoxError>>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn connect(
        &self,
        destination: &Destination,
    ) -> BoxFuture<'static, Result<Box<dyn Connection>, BoxError>> {
        (**self).connect(destination)
    }
}

/// Process-unique identifier of a connection, for logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One transport connection.
pub trait Connection: fmt::Debug + Send + 'static {
    /// The identifier of this connection.
    fn id(&self) -> ConnectionId;

    /// Write a request without blocking.
    ///
    /// The returned future resolves once the request has been handed to the
    /// wire. The response is reported through `notifier` as it arrives.
    fn write(
        &mut self,
        request: http::Request<Bytes>,
        notifier: Notifier,
    ) -> BoxFuture<'static, Result<(), BoxError>>;

    /// Returns `true` while the connection can carry another request.
    fn is_open(&self) -> bool;

    /// Close the connection.
    fn close(&mut self);

    /// Hand the connection over to the WebSocket protocol after a `101` response.
    fn upgrade(
        self: Box<Self>,
        frames: Arc<dyn FrameHandler>,
    ) -> Result<Box<dyn FrameSink>, BoxError>;
}

/// Receives decoded frames from an upgraded connection.
pub trait FrameHandler: Send + Sync + 'static {
    /// A frame arrived.
    fn on_frame(&self, frame: Frame);

    /// The channel closed.
    fn on_closed(&self);
}

/// Writes frames to an upgraded connection.
///
/// Frames are queued for writing in the order `send` is called; the returned
/// future reports the outcome of that write. Implementations must not call
/// back into the [`FrameHandler`] from within `send`.
pub trait FrameSink: fmt::Debug + Send + Sync + 'static {
    /// Write one frame.
    fn send(&self, frame: Frame) -> BoxFuture<'static, Result<(), BoxError>>;

    /// Close the underlying channel.
    fn close(&self);
}

/// Progress reporting handle given to a transport for one request attempt.
///
/// Every notification also counts as I/O progress for the idle timeout. Transports may notify from
/// any thread, including synchronously from within [`Connection::write`].
#[derive(Debug, Clone)]
pub struct Notifier {
    destination: Destination,
    events: EventChannel,
    held: Arc<Mutex<Option<Vec<Event>>>>,
}

impl Notifier {
    pub(crate) fn new(destination: Destination, events: EventChannel) -> Self {
        Self {
            destination,
            events,
            held: Arc::new(Mutex::new(None)),
        }
    }

    /// A notifier which queues notifications until [`Notifier::release`] is called.
    pub(crate) fn held(destination: Destination, events: EventChannel) -> Self {
        Self {
            destination,
            events,
            held: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Dispatch queued notifications in arrival order and stop queueing.
    pub(crate) fn release(&self) {
        loop {
            let batch = {
                let mut held = self.held.lock();
                match held.as_mut() {
                    Some(queue) if !queue.is_empty() => std::mem::take(queue),
                    Some(_) => {
                        *held = None;
                        return;
                    }
                    None => return,
                }
            };
            for event in batch {
                self.events.trigger(event);
            }
        }
    }

    fn dispatch(&self, event: Event) {
        {
            let mut held = self.held.lock();
            if let Some(queue) = held.as_mut() {
                queue.push(event);
                return;
            }
        }
        self.events.trigger(event);
    }

    fn progress(&self, event: Event) {
        self.dispatch(Event::Touch);
        self.dispatch(event);
    }

    /// The request head was written.
    pub fn headers_written(&self) {
        self.progress(Event::HeadersWritten);
    }

    /// Request body progress.
    pub fn content_written(&self, written: u64, total: Option<u64>) {
        self.progress(Event::ContentWritten { written, total });
    }

    /// The response status line arrived.
    pub fn status(&self, status: StatusCode) {
        self.progress(Event::StatusReceived(status));
    }

    /// The response headers arrived.
    pub fn headers(&self, headers: HeaderMap) {
        self.progress(Event::HeadersReceived(headers));
    }

    /// A chunk of the response body arrived.
    pub fn content(&self, chunk: Bytes) {
        self.progress(Event::ContentPart(chunk));
    }

    /// The response is complete.
    pub fn complete(&self) {
        self.progress(Event::ContentCompleted);
    }

    /// The channel closed. Before completion this fails the request.
    pub fn closed(&self) {
        self.dispatch(Event::ChannelClosed);
        self.dispatch(Event::Error(self.destination.clone(), Error::PeerClosed));
    }

    /// Reading the response failed.
    pub fn error(&self, error: impl Into<BoxError>) {
        self.dispatch(Event::Error(self.destination.clone(), Error::read(error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn held_notifier_queues_until_released() {
        let events = EventChannel::root().create_child();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::StatusReceived, EventKind::ContentCompleted] {
            let seen = seen.clone();
            events.subscribe_permanently(kind, move |event| {
                seen.lock().push(event.kind());
                Ok(())
            });
        }

        let destination = Destination::from_uri(&"http://example.com/".parse().unwrap()).unwrap();
        let notifier = Notifier::held(destination, events);
        notifier.status(StatusCode::OK);
        notifier.complete();
        assert!(seen.lock().is_empty());

        notifier.release();
        assert_eq!(
            *seen.lock(),
            vec![EventKind::StatusReceived, EventKind::ContentCompleted]
        );

        seen.lock().clear();
        notifier.status(StatusCode::OK);
        assert_eq!(*seen.lock(), vec![EventKind::StatusReceived]);
    }
}
