//! Typed publish/subscribe channel used to decouple request lifecycle concerns.
//!
//! The client owns a root [`EventChannel`] which lives as long as the client.
//! Every request attempt gets a child scope from [`EventChannel::create_child`];
//! transport notifications, timers, connection management and the caller's
//! future are all wired to that child scope. A child never forwards events to
//! its parent by itself: a request chooses what to re-publish with
//! [`EventChannel::bridge`].
//!
//! Request scopes additionally enforce that at most one terminal event
//! ([`EventKind::Completed`] or [`EventKind::Error`]) is ever dispatched, no
//! matter how many producers race to trigger one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::destination::Destination;
use crate::error::Error;
use crate::BoxError;

/// A lifecycle signal with its payload.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// A connection attempt started.
    Connecting(Destination),
    /// The transport connected.
    Connected(Destination),
    /// A new connection was opened.
    CreatedConnection(Destination),
    /// A pooled connection was reused.
    ReusedConnection(Destination),
    /// A connection was returned to the pool.
    PooledConnection(Destination),
    /// A connection was closed instead of pooled.
    ClosedConnection(Destination),
    /// The request head was written.
    HeadersWritten,
    /// Request body progress.
    ContentWritten {
        /// Bytes written so far.
        written: u64,
        /// Total body length, when known.
        total: Option<u64>,
    },
    /// Any inbound or outbound I/O progress.
    Touch,
    /// The response status line arrived.
    StatusReceived(StatusCode),
    /// The response headers arrived.
    HeadersReceived(HeaderMap),
    /// A chunk of the response body arrived.
    ContentPart(Bytes),
    /// The transport delivered the whole response. The attempt completes once
    /// the response has been consumed.
    ContentCompleted,
    /// The transport channel closed.
    ChannelClosed,
    /// The request attempt completed.
    Completed(Destination),
    /// The request attempt failed.
    Error(Destination, Error),
}

/// The name of an [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// See [`Event::Connecting`].
    Connecting,
    /// See [`Event::Connected`].
    Connected,
    /// See [`Event::CreatedConnection`].
    CreatedConnection,
    /// See [`Event::ReusedConnection`].
    ReusedConnection,
    /// See [`Event::PooledConnection`].
    PooledConnection,
    /// See [`Event::ClosedConnection`].
    ClosedConnection,
    /// See [`Event::HeadersWritten`].
    HeadersWritten,
    /// See [`Event::ContentWritten`].
    ContentWritten,
    /// See [`Event::Touch`].
    Touch,
    /// See [`Event::StatusReceived`].
    StatusReceived,
    /// See [`Event::HeadersReceived`].
    HeadersReceived,
    /// See [`Event::ContentPart`].
    ContentPart,
    /// See [`Event::ContentCompleted`].
    ContentCompleted,
    /// See [`Event::ChannelClosed`].
    ChannelClosed,
    /// See [`Event::Completed`].
    Completed,
    /// See [`Event::Error`].
    Error,
}

impl EventKind {
    /// Terminal events end a request attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Completed | EventKind::Error)
    }
}

impl Event {
    /// The name of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connecting(_) => EventKind::Connecting,
            Event::Connected(_) => EventKind::Connected,
            Event::CreatedConnection(_) => EventKind::CreatedConnection,
            Event::ReusedConnection(_) => EventKind::ReusedConnection,
            Event::PooledConnection(_) => EventKind::PooledConnection,
            Event::ClosedConnection(_) => EventKind::ClosedConnection,
            Event::HeadersWritten => EventKind::HeadersWritten,
            Event::ContentWritten { .. } => EventKind::ContentWritten,
            Event::Touch => EventKind::Touch,
            Event::StatusReceived(_) => EventKind::StatusReceived,
            Event::HeadersReceived(_) => EventKind::HeadersReceived,
            Event::ContentPart(_) => EventKind::ContentPart,
            Event::ContentCompleted => EventKind::ContentCompleted,
            Event::ChannelClosed => EventKind::ChannelClosed,
            Event::Completed(_) => EventKind::Completed,
            Event::Error(_, _) => EventKind::Error,
        }
    }

    /// The destination this event is keyed by, if any.
    pub fn destination(&self) -> Option<&Destination> {
        match self {
            Event::Connecting(d)
            | Event::Connected(d)
            | Event::CreatedConnection(d)
            | Event::ReusedConnection(d)
            | Event::PooledConnection(d)
            | Event::ClosedConnection(d)
            | Event::Completed(d)
            | Event::Error(d, _) => Some(d),
            _ => None,
        }
    }
}

/// Identifies a subscription so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static>;

struct Subscriber {
    id: SubscriptionId,
    // Shared between every kind a run-once subscriber listens to.
    once: Option<Arc<AtomicBool>>,
    handler: Handler,
}

struct Scope {
    parent: Option<EventChannel>,
    subscribers: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
    terminated: Option<AtomicBool>,
}

/// A scope of the event bus.
///
/// Cloning the channel yields another handle to the same scope.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Scope>,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("child", &self.inner.parent.is_some())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::root()
    }
}

impl EventChannel {
    /// Create a process-wide root scope.
    pub fn root() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<EventChannel>) -> Self {
        let terminated = parent.as_ref().map(|_| AtomicBool::new(false));
        Self {
            inner: Arc::new(Scope {
                parent,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                terminated,
            }),
        }
    }

    /// Create a request scope below this one.
    pub fn create_child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// The parent scope, if this is a child.
    pub fn parent(&self) -> Option<&EventChannel> {
        self.inner.parent.as_ref()
    }

    /// Returns `true` once a terminal event has been dispatched on a request scope.
    pub fn is_terminated(&self) -> bool {
        self.inner
            .terminated
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, kinds: &[EventKind], once: bool, handler: Handler) -> SubscriptionId {
        let id = self.next_id();
        let once = once.then(|| Arc::new(AtomicBool::new(false)));
        let mut subscribers = self.inner.subscribers.lock();
        for kind in kinds {
            subscribers.entry(*kind).or_default().push(Subscriber {
                id,
                once: once.clone(),
                handler: handler.clone(),
            });
        }
        id
    }

    /// Subscribe a run-once handler, removed when it is first delivered.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.insert(&[kind], true, Arc::new(handler))
    }

    /// Subscribe a run-once handler to several events.
    ///
    /// The handler receives whichever of the events is triggered first, and is
    /// then removed from all of them.
    pub fn subscribe_first<F>(&self, kinds: &[EventKind], handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.insert(kinds, true, Arc::new(handler))
    }

    /// Subscribe a handler which stays registered until explicitly removed.
    pub fn subscribe_permanently<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.insert(&[kind], false, Arc::new(handler))
    }

    /// Remove a subscription from every event it listens to.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.inner.subscribers.lock();
        for list in subscribers.values_mut() {
            list.retain(|subscriber| subscriber.id != id);
        }
    }

    /// Re-publish events of this kind from a child scope to its parent.
    pub fn bridge(&self, kind: EventKind) {
        if let Some(parent) = self.inner.parent.clone() {
            self.subscribe_permanently(kind, move |event| {
                parent.trigger(event.clone());
                Ok(())
            });
        }
    }

    /// Dispatch an event to every subscriber of its kind, in subscription order.
    ///
    /// Returns `false` if the event was suppressed because a terminal event was
    /// already dispatched on this request scope.
    pub fn trigger(&self, event: Event) -> bool {
        let kind = event.kind();

        if kind.is_terminal() {
            if let Some(flag) = &self.inner.terminated {
                if flag.swap(true, Ordering::AcqRel) {
                    debug!(?kind, "suppressing duplicate terminal event");
                    return false;
                }
            }
        }

        let handlers: Vec<Handler> = {
            let mut subscribers = self.inner.subscribers.lock();
            let Some(list) = subscribers.get_mut(&kind) else {
                trace!(?kind, "no subscribers");
                return true;
            };

            let mut handlers = Vec::with_capacity(list.len());
            list.retain(|subscriber| match &subscriber.once {
                None => {
                    handlers.push(subscriber.handler.clone());
                    true
                }
                Some(claimed) => {
                    // Claim under the lock so concurrent triggers deliver a
                    // run-once handler at most once.
                    if !claimed.swap(true, Ordering::AcqRel) {
                        handlers.push(subscriber.handler.clone());
                    }
                    false
                }
            });
            handlers
        };

        for handler in handlers {
            if let Err(err) = handler(&event) {
                error!(?kind, error = %err, "event handler failed");
            }
        }

        if kind.is_terminal() && self.inner.terminated.is_some() {
            // Handlers commonly capture their own scope; dropping them here
            // breaks those cycles once the attempt is over.
            self.inner.subscribers.lock().clear();
        }

        true
    }

    #[cfg(test)]
    fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(&kind)
            .map_or(0, |list| list.len())
    }
}
