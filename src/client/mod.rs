//! The asynchronous request execution engine.
//!
//! [`Client::execute`] drives a request from admission through connect, write and response, and
//! resolves the returned [`ResponseFuture`] exactly once. Each attempt (the initial send and every
//! redirect hop) runs in its own child scope of the client's [`EventChannel`]: the transport,
//! timers, connection manager and the caller's resolution all meet there, and the observable
//! connection events are bridged to the client's root scope for metrics.
//!
//! # Example
//! ```no_run
//! # use tachyon::{Client, transport::mock::MockTransport};
//! # async fn run() -> Result<(), tachyon::Error> {
//! let client = Client::builder().transport(MockTransport::ok()).build();
//! let response = client.get("http://example.com/".parse().unwrap()).await?;
//! println!("Response: {:?}", response.status());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, Instrument};

use crate::admission::{AdmissionControl, Slot};
use crate::config::ClientConfig;
use crate::destination::Destination;
use crate::error::Error;
use crate::event::{Event, EventChannel, EventKind};
use crate::handler::{charset, consumer_error, AsyncCallback, BodyConsumer, BytesConsumer};
use crate::manager::ConnectionManager;
use crate::pool::PoolStats;
use crate::request::{RequestContext, RequestOptions, RequestParts, RequestState};
use crate::ws::{WebSocket, WebSocketUpgrade};
use crate::BoxError;

mod builder;
mod future;
mod redirect;

pub use self::builder::Builder;
pub use self::future::ResponseFuture;
use self::future::Cancel;

/// Events re-published from each request scope to the client's root scope.
const OBSERVABLE: [EventKind; 6] = [
    EventKind::CreatedConnection,
    EventKind::ReusedConnection,
    EventKind::PooledConnection,
    EventKind::ClosedConnection,
    EventKind::Completed,
    EventKind::Error,
];

/// Inner type for managing the client.
struct ClientRef {
    config: ClientConfig,
    manager: ConnectionManager,
    admission: Arc<dyn AdmissionControl>,
    events: EventChannel,
    runtime: Option<Handle>,
    callbacks: Option<Handle>,
    closed: AtomicBool,
}

impl ClientRef {
    fn spawn<F>(&self, future: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current()
                .map_err(|_| Error::InvalidState("no tokio runtime available"))?,
        };
        handle.spawn(future);
        Ok(())
    }
}

/// Counters describing a client's current load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ClientStats {
    /// Requests holding an admission slot.
    pub in_flight: usize,
    /// Idle pooled connections.
    pub pool: PoolStats,
}

/// A high-level async HTTP and WebSocket client.
///
/// Cloning the client is cheap, and clones share connections, admission control and events.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("manager", &self.inner.manager)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Validation {
    Http,
    WebSocket,
}

impl Client {
    /// Create a new, empty builder for clients.
    pub fn builder() -> Builder<()> {
        Builder::new()
    }

    /// The configuration requests start from.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The client-wide event scope.
    ///
    /// Connection lifecycle events and the terminal event of every attempt are re-published here,
    /// keyed by destination.
    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    /// Current load.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            in_flight: self.inner.admission.in_flight(),
            pool: self.inner.manager.pool().stats(),
        }
    }

    /// Close the client.
    ///
    /// Idle connections are closed and later requests fail with [`Error::Closed`]. Requests
    /// already in flight run to completion, but their connections are not pooled.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("closing client");
            self.inner.manager.pool().close();
        }
    }

    /// Returns `true` once [`Client::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send a request and buffer the response.
    pub fn request(&self, request: http::Request<Bytes>) -> ResponseFuture<http::Response<Bytes>> {
        self.execute(request, BytesConsumer::new())
    }

    /// Make a GET request to the given URI.
    pub fn get(&self, uri: Uri) -> ResponseFuture<http::Response<Bytes>> {
        let mut request = http::Request::new(Bytes::new());
        *request.uri_mut() = uri;
        self.request(request)
    }

    /// Execute a request, feeding the response to `consumer`.
    ///
    /// The returned future resolves exactly once, with the consumer's output or the first error
    /// of the request. Dropping it cancels the request.
    pub fn execute<C>(&self, request: http::Request<Bytes>, consumer: C) -> ResponseFuture<C::Output>
    where
        C: BodyConsumer,
    {
        let (tx, rx) = oneshot::channel();
        let cancel = self.submit(request, consumer, Resolver::Future(tx), Validation::Http);
        ResponseFuture::new(rx, cancel)
    }

    /// Execute a request and report the outcome to `callback`.
    ///
    /// The callback runs exactly once, on the callback runtime when one is configured.
    pub fn execute_with_callback<C, F>(&self, request: http::Request<Bytes>, consumer: C, callback: F)
    where
        C: BodyConsumer,
        F: AsyncCallback<C::Output>,
    {
        let resolver = Resolver::Callback {
            callback: Box::new(callback),
            runtime: self.inner.callbacks.clone(),
        };
        self.submit(request, consumer, resolver, Validation::Http);
    }

    /// Open a WebSocket.
    ///
    /// The request URI must use the `ws` or `wss` scheme. The future resolves once the upgrade
    /// response has been validated and the socket is open.
    pub fn websocket(
        &self,
        mut request: http::Request<Bytes>,
        mut upgrade: WebSocketUpgrade,
    ) -> ResponseFuture<WebSocket> {
        if let Err(error) = upgrade.prepare(request.headers_mut(), &self.inner.config.websocket) {
            return ResponseFuture::ready(Err(error));
        }
        let (tx, rx) = oneshot::channel();
        let cancel = self.submit(request, upgrade, Resolver::Future(tx), Validation::WebSocket);
        ResponseFuture::new(rx, cancel)
    }

    fn submit<C>(
        &self,
        request: http::Request<Bytes>,
        consumer: C,
        resolver: Resolver<C::Output>,
        validation: Validation,
    ) -> Option<Arc<dyn Cancel>>
    where
        C: BodyConsumer,
    {
        let inner = &self.inner;
        if self.is_closed() {
            resolver.resolve(Err(Error::Closed));
            return None;
        }

        let (head, body) = request.into_parts();
        let options = head
            .extensions
            .get::<RequestOptions>()
            .cloned()
            .unwrap_or_else(|| RequestOptions::from(&inner.config));

        let destination = match Destination::from_uri(&head.uri) {
            Ok(destination) => destination,
            Err(error) => {
                resolver.resolve(Err(error));
                return None;
            }
        };

        let rejection = match (validation, destination.is_websocket()) {
            (Validation::Http, true) => Some("websocket destinations require a websocket upgrade"),
            (Validation::WebSocket, false) => Some("websocket upgrades require a ws or wss uri"),
            _ => None,
        };
        if let Some(reason) = rejection {
            resolver.resolve(Err(Error::InvalidDestination {
                destination,
                reason,
            }));
            return None;
        }

        let mut parts = RequestParts {
            method: head.method,
            uri: head.uri,
            headers: head.headers,
            body,
        };
        if let Err(error) = parts.prepare(&destination, &options, inner.config.user_agent.as_deref()) {
            resolver.resolve(Err(error));
            return None;
        }

        let Some(slot) = Slot::acquire(&inner.admission, &destination) else {
            debug!(%destination, "admission refused");
            resolver.resolve(Err(Error::TooManyConnections(destination)));
            return None;
        };

        let deadline = options
            .request_timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Instant::now() + timeout);

        let exchange = Arc::new(Exchange {
            client: inner.clone(),
            consumer: Mutex::new(consumer),
            resolver: Mutex::new(Some(resolver)),
            slot: Mutex::new(Some(slot)),
            current: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            visited: Mutex::new(HashSet::new()),
            outcome: Mutex::new(None),
            deadline,
        });
        exchange
            .visited
            .lock()
            .insert((destination.clone(), parts.uri.path().to_owned()));

        exchange.start(parts, destination, options, 0);
        Some(exchange as Arc<dyn Cancel>)
    }
}

impl tower::Service<http::Request<Bytes>> for Client {
    type Response = http::Response<Bytes>;
    type Error = Error;
    type Future = ResponseFuture<http::Response<Bytes>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            return Poll::Ready(Err(Error::Closed));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Bytes>) -> Self::Future {
        self.request(request)
    }
}

enum Resolver<T> {
    Future(oneshot::Sender<Result<T, Error>>),
    Callback {
        callback: Box<dyn AsyncCallback<T>>,
        runtime: Option<Handle>,
    },
}

impl<T: Send + 'static> Resolver<T> {
    fn resolve(self, result: Result<T, Error>) {
        match self {
            Resolver::Future(tx) => {
                if tx.send(result).is_err() {
                    trace!("response future dropped before resolution");
                }
            }
            Resolver::Callback { callback, runtime } => {
                let run = move || match result {
                    Ok(output) => callback.on_completed(output),
                    Err(error) => callback.on_error(error),
                };
                match runtime.or_else(|| Handle::try_current().ok()) {
                    Some(handle) => {
                        handle.spawn(async move { run() });
                    }
                    None => run(),
                }
            }
        }
    }
}

enum Outcome<T> {
    Output(T),
    Redirect {
        parts: RequestParts,
        destination: Destination,
        options: RequestOptions,
        redirect_count: usize,
    },
}

/// One logical request: the initial attempt and any redirect hops.
struct Exchange<C: BodyConsumer> {
    client: Arc<ClientRef>,
    consumer: Mutex<C>,
    resolver: Mutex<Option<Resolver<C::Output>>>,
    slot: Mutex<Option<Slot>>,
    current: Mutex<Option<(EventChannel, Destination)>>,
    cancelled: AtomicBool,
    visited: Mutex<HashSet<(Destination, String)>>,
    outcome: Mutex<Option<Outcome<C::Output>>>,
    deadline: Option<Instant>,
}

impl<C: BodyConsumer> Exchange<C> {
    /// Start one attempt in a fresh child scope.
    fn start(
        self: &Arc<Self>,
        parts: RequestParts,
        destination: Destination,
        options: RequestOptions,
        redirect_count: usize,
    ) {
        let events = self.client.events.create_child();
        for kind in OBSERVABLE {
            events.bridge(kind);
        }

        let span = tracing::debug_span!(
            "request",
            %destination,
            method = %parts.method,
            attempt = redirect_count
        );

        let ctx = Arc::new(RequestContext::new(
            parts,
            destination.clone(),
            options,
            redirect_count,
            events.clone(),
            self.deadline,
        ));

        self.wire(&ctx);
        self.client.manager.register(&ctx);
        {
            let exchange = self.clone();
            events.subscribe_first(&[EventKind::Completed, EventKind::Error], move |event| {
                match event {
                    Event::Completed(_) => exchange.completed(),
                    Event::Error(_, error) => exchange.finish(Err(error.clone())),
                    _ => {}
                }
                Ok(())
            });
        }

        let cancelled = {
            let mut current = self.current.lock();
            *current = Some((events.clone(), destination.clone()));
            self.cancelled.load(Ordering::Acquire)
        };
        if cancelled {
            events.trigger(Event::Error(destination, Error::Cancelled));
            return;
        }

        let client = self.client.clone();
        let send = async move { client.manager.send(ctx).await }.instrument(span);
        if let Err(error) = self.client.spawn(send) {
            events.trigger(Event::Error(destination, error));
        }
    }

    /// Feed the response to the consumer as the transport reports it.
    fn wire(self: &Arc<Self>, ctx: &Arc<RequestContext>) {
        let events = &ctx.events;

        let (exchange, weak) = (self.clone(), Arc::downgrade(ctx));
        events.subscribe_permanently(EventKind::StatusReceived, move |event| {
            let (Event::StatusReceived(status), Some(ctx)) = (event, weak.upgrade()) else {
                return Ok(());
            };
            ctx.record_status(*status);
            if *status == StatusCode::SWITCHING_PROTOCOLS {
                ctx.mark_upgrade();
            }
            if ctx.options.follow_redirects && redirect::is_redirect(*status) {
                // Deferred until the headers show whether there is a location to follow.
                return Ok(());
            }
            exchange.consume(&ctx, |consumer| consumer.on_status(*status));
            Ok(())
        });

        let (exchange, weak) = (self.clone(), Arc::downgrade(ctx));
        events.subscribe_permanently(EventKind::HeadersReceived, move |event| {
            let (Event::HeadersReceived(headers), Some(ctx)) = (event, weak.upgrade()) else {
                return Ok(());
            };
            exchange.headers(&ctx, headers);
            Ok(())
        });

        let (exchange, weak) = (self.clone(), Arc::downgrade(ctx));
        events.subscribe_permanently(EventKind::ContentPart, move |event| {
            let (Event::ContentPart(chunk), Some(ctx)) = (event, weak.upgrade()) else {
                return Ok(());
            };
            if !exchange.is_redirecting() {
                exchange.consume(&ctx, |consumer| consumer.on_content_part(chunk));
            }
            Ok(())
        });

        let (exchange, weak) = (self.clone(), Arc::downgrade(ctx));
        events.subscribe(EventKind::ContentCompleted, move |_| {
            let Some(ctx) = weak.upgrade() else {
                return Ok(());
            };
            exchange.content_completed(&ctx);
            Ok(())
        });
    }

    fn consume(&self, ctx: &RequestContext, f: impl FnOnce(&mut C) -> Result<(), BoxError>) -> bool {
        let result = f(&mut self.consumer.lock());
        match result {
            Ok(()) => true,
            Err(error) => {
                ctx.poison();
                ctx.events
                    .trigger(Event::Error(ctx.destination.clone(), consumer_error(error)));
                false
            }
        }
    }

    fn headers(&self, ctx: &RequestContext, headers: &HeaderMap) {
        ctx.record_headers(headers);

        if let Some(status) = ctx.status() {
            if ctx.options.follow_redirects && redirect::is_redirect(status) {
                if let Some(location) = headers.get(LOCATION) {
                    self.plan_redirect(ctx, status, location);
                    return;
                }
                trace!(%status, "redirect without location");
                if !self.consume(ctx, |consumer| consumer.on_status(status)) {
                    return;
                }
            }
        }

        if !self.consume(ctx, |consumer| consumer.on_headers(headers)) {
            return;
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        self.consume(ctx, |consumer| {
            consumer.on_body_start(content_type, content_type.and_then(charset), content_length)
        });
    }

    fn plan_redirect(&self, ctx: &RequestContext, status: StatusCode, location: &HeaderValue) {
        match self.next_hop(ctx, status, location) {
            Ok(outcome) => {
                ctx.set_state(RequestState::Redirecting);
                *self.outcome.lock() = Some(outcome);
            }
            Err(error) => {
                ctx.events
                    .trigger(Event::Error(ctx.destination.clone(), error));
            }
        }
    }

    fn next_hop(
        &self,
        ctx: &RequestContext,
        status: StatusCode,
        location: &HeaderValue,
    ) -> Result<Outcome<C::Output>, Error> {
        let max = ctx.options.max_redirects;
        if ctx.redirect_count >= max {
            debug!(max, "redirect limit reached");
            return Err(Error::MaxRedirects(max));
        }

        let (mut parts, destination) =
            redirect::next_request(&ctx.parts, &ctx.destination, status, location)?;
        if destination.is_websocket() != ctx.destination.is_websocket() {
            return Err(Error::InvalidDestination {
                destination,
                reason: "redirect changes protocol",
            });
        }

        let target = (destination.clone(), parts.uri.path().to_owned());
        if !self.visited.lock().insert(target) {
            debug!(uri = %parts.uri, "redirect loop detected");
            return Err(Error::MaxRedirects(max));
        }

        parts.prepare(
            &destination,
            &ctx.options,
            self.client.config.user_agent.as_deref(),
        )?;
        debug!(%status, uri = %parts.uri, "following redirect");
        Ok(Outcome::Redirect {
            parts,
            destination,
            options: ctx.options.clone(),
            redirect_count: ctx.redirect_count + 1,
        })
    }

    fn is_redirecting(&self) -> bool {
        matches!(*self.outcome.lock(), Some(Outcome::Redirect { .. }))
    }

    fn content_completed(&self, ctx: &RequestContext) {
        if ctx.events.is_terminated() {
            return;
        }

        if !self.is_redirecting() {
            match self.produce(ctx) {
                Ok(output) => *self.outcome.lock() = Some(Outcome::Output(output)),
                Err(error) => {
                    ctx.poison();
                    ctx.events
                        .trigger(Event::Error(ctx.destination.clone(), error));
                    return;
                }
            }
        }

        ctx.events
            .trigger(Event::Completed(ctx.destination.clone()));
    }

    fn produce(&self, ctx: &RequestContext) -> Result<C::Output, Error> {
        let mut consumer = self.consumer.lock();
        if ctx.is_upgrade() {
            let connection = ctx
                .detach()
                .ok_or(Error::InvalidState("upgraded connection is gone"))?;
            consumer.on_upgrade(connection).map_err(consumer_error)?;
        } else {
            consumer.on_completed_body().map_err(consumer_error)?;
        }
        consumer.body().map_err(consumer_error)
    }

    fn completed(self: &Arc<Self>) {
        let outcome = self.outcome.lock().take();
        match outcome {
            Some(Outcome::Output(output)) => self.finish(Ok(output)),
            Some(Outcome::Redirect {
                parts,
                destination,
                options,
                redirect_count,
            }) => self.start(parts, destination, options, redirect_count),
            None => self.finish(Err(Error::Protocol(
                "request completed without a response".into(),
            ))),
        }
    }

    /// Resolve the caller, once. The admission slot is released first.
    fn finish(&self, result: Result<C::Output, Error>) {
        let Some(resolver) = self.resolver.lock().take() else {
            return;
        };
        drop(self.slot.lock().take());
        self.current.lock().take();

        match &result {
            Ok(_) => trace!("request resolved"),
            Err(error) => debug!(%error, "request failed"),
        }
        resolver.resolve(result);
    }
}

impl<C: BodyConsumer> Cancel for Exchange<C> {
    fn cancel(&self) {
        let current = {
            let current = self.current.lock();
            self.cancelled.store(true, Ordering::Release);
            current.clone()
        };
        if let Some((events, destination)) = current {
            trace!(%destination, "cancelling request");
            events.trigger(Event::Error(destination, Error::Cancelled));
        }
    }
}
