//! A scripted in-memory transport, suitable for testing request behavior without a network.
//!
//! Every request is answered by a responder closure which returns a [`MockResponse`]. Responses
//! can be delayed, streamed in chunks, cut short, or switch protocols; upgraded connections become
//! a [`MockSocket`] which records outgoing frames and echoes them back.

use std::fmt;
use std::future::ready;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_core::future::BoxFuture;
use http::header::{
    CONNECTION, CONTENT_LENGTH, LOCATION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{Connection, ConnectionId, FrameHandler, FrameSink, Notifier, Transport};
use crate::destination::Destination;
use crate::ws::{accept_key, close_code, Frame, OpCode};
use crate::BoxError;

/// An error produced by the mock transport.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection error")]
pub struct MockConnectionError;

type Responder = Arc<dyn Fn(&http::Request<Bytes>) -> MockResponse + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportMode {
    Responding,
    ConnectionError,
}

#[derive(Debug, Default)]
struct Record {
    connections: AtomicUsize,
    requests: AtomicUsize,
    sockets: Mutex<Vec<MockSocket>>,
}

/// A mock transport that can be used to test request behavior.
#[derive(Clone)]
pub struct MockTransport {
    mode: TransportMode,
    responder: Responder,
    connect_delay: Option<Duration>,
    record: Arc<Record>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("mode", &self.mode)
            .field("connect_delay", &self.connect_delay)
            .field("connections", &self.connections())
            .field("requests", &self.requests())
            .finish()
    }
}

impl MockTransport {
    /// Answer every request with the response built by `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&http::Request<Bytes>) -> MockResponse + Send + Sync + 'static,
    {
        Self {
            mode: TransportMode::Responding,
            responder: Arc::new(responder),
            connect_delay: None,
            record: Arc::default(),
        }
    }

    /// Answer every request with `200 OK` and a short body.
    pub fn ok() -> Self {
        Self::new(|_| MockResponse::ok().body("hello"))
    }

    /// Transport which fails every connection attempt.
    pub fn connection_error() -> Self {
        Self {
            mode: TransportMode::ConnectionError,
            ..Self::ok()
        }
    }

    /// Wait this long before each connection is established.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Connections opened so far.
    pub fn connections(&self) -> usize {
        self.record.connections.load(Ordering::SeqCst)
    }

    /// Requests written so far.
    pub fn requests(&self) -> usize {
        self.record.requests.load(Ordering::SeqCst)
    }

    /// The `index`th upgraded connection.
    pub fn socket(&self, index: usize) -> Option<MockSocket> {
        self.record.sockets.lock().get(index).cloned()
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        destination: &Destination,
    ) -> BoxFuture<'static, Result<Box<dyn Connection>, BoxError>> {
        let mode = self.mode;
        let delay = self.connect_delay;
        let responder = self.responder.clone();
        let record = self.record.clone();
        let destination = destination.clone();

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if mode == TransportMode::ConnectionError {
                return Err(MockConnectionError.into());
            }

            record.connections.fetch_add(1, Ordering::SeqCst);
            let connection = MockConnection {
                id: ConnectionId::next(),
                destination,
                responder,
                record,
                open: Arc::new(AtomicBool::new(true)),
                upgrade: None,
            };
            tracing::trace!(id = %connection.id, "mock connection established");
            Ok(Box::new(connection) as Box<dyn Connection>)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Complete,
    Hang,
    CloseEarly,
    WriteError,
}

/// A scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: StatusCode,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    delay: Option<Duration>,
    chunk_delay: Option<Duration>,
    behavior: Behavior,
    frames: Vec<Frame>,
    echo: bool,
}

impl MockResponse {
    /// A response with this status and no body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            delay: None,
            chunk_delay: None,
            behavior: Behavior::Complete,
            frames: Vec::new(),
            echo: false,
        }
    }

    /// `200 OK`
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// A redirect to `location`.
    pub fn redirect(status: StatusCode, location: &str) -> Self {
        let response = Self::new(status);
        match HeaderValue::try_from(location) {
            Ok(value) => response.header(LOCATION, value),
            Err(_) => response,
        }
    }

    /// Accept a WebSocket upgrade request. Upgraded connections echo data frames by default.
    pub fn switching_protocols(request: &http::Request<Bytes>) -> Self {
        let mut response = Self::new(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, HeaderValue::from_static("websocket"))
            .header(CONNECTION, HeaderValue::from_static("Upgrade"));

        let accept = request
            .headers()
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|key| key.to_str().ok())
            .map(accept_key)
            .and_then(|accept| HeaderValue::try_from(accept).ok());
        if let Some(accept) = accept {
            response = response.header(SEC_WEBSOCKET_ACCEPT, accept);
        }
        response.echo = true;
        response
    }

    /// Select a sub-protocol in the upgrade response.
    pub fn protocol(self, protocol: &'static str) -> Self {
        self.header(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Respond with this body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.chunks = vec![body.into()];
        self
    }

    /// Respond with a body delivered in these chunks.
    pub fn chunks<I, B>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Wait before sending the response head.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Wait before each body chunk.
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Never respond.
    pub fn hang(mut self) -> Self {
        self.behavior = Behavior::Hang;
        self
    }

    /// Close the connection after the body, without completing the response.
    pub fn close_early(mut self) -> Self {
        self.behavior = Behavior::CloseEarly;
        self
    }

    /// Fail writing the request.
    pub fn write_error(mut self) -> Self {
        self.behavior = Behavior::WriteError;
        self
    }

    /// Frames the server sends as soon as the connection is upgraded.
    pub fn frames(mut self, frames: Vec<Frame>) -> Self {
        self.frames = frames;
        self
    }

    /// Do not echo frames on the upgraded connection.
    pub fn silent(mut self) -> Self {
        self.echo = false;
        self
    }

    fn finalize(mut self) -> Self {
        if self.status != StatusCode::SWITCHING_PROTOCOLS && !self.headers.contains_key(CONTENT_LENGTH) {
            let length: usize = self.chunks.iter().map(Bytes::len).sum();
            self.headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        self
    }

    fn closes_connection(&self) -> bool {
        self.headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.eq_ignore_ascii_case("close"))
    }
}

struct MockConnection {
    id: ConnectionId,
    destination: Destination,
    responder: Responder,
    record: Arc<Record>,
    open: Arc<AtomicBool>,
    upgrade: Option<(Vec<Frame>, bool)>,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("open", &self.open.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn write(
        &mut self,
        request: http::Request<Bytes>,
        notifier: Notifier,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        self.record.requests.fetch_add(1, Ordering::SeqCst);
        let response = (self.responder)(&request).finalize();

        if response.behavior == Behavior::WriteError {
            self.open.store(false, Ordering::SeqCst);
            return Box::pin(ready(Err(MockConnectionError.into())));
        }
        if response.status == StatusCode::SWITCHING_PROTOCOLS {
            self.upgrade = Some((response.frames.clone(), response.echo));
        }

        let open = self.open.clone();
        let written = request.body().len() as u64;
        tokio::spawn(async move {
            notifier.headers_written();
            notifier.content_written(written, Some(written));

            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }
            if response.behavior == Behavior::Hang || !open.load(Ordering::SeqCst) {
                return;
            }

            let closes = response.closes_connection();
            notifier.status(response.status);
            notifier.headers(response.headers);
            for chunk in response.chunks {
                if let Some(delay) = response.chunk_delay {
                    tokio::time::sleep(delay).await;
                }
                if !open.load(Ordering::SeqCst) {
                    return;
                }
                notifier.content(chunk);
            }

            if response.behavior == Behavior::CloseEarly {
                open.store(false, Ordering::SeqCst);
                notifier.closed();
                return;
            }
            if closes {
                open.store(false, Ordering::SeqCst);
            }
            notifier.complete();
        });

        Box::pin(ready(Ok(())))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn upgrade(
        mut self: Box<Self>,
        frames: Arc<dyn FrameHandler>,
    ) -> Result<Box<dyn FrameSink>, BoxError> {
        let (initial, echo) = self.upgrade.take().ok_or(MockConnectionError)?;
        self.open.store(false, Ordering::SeqCst);

        let socket = MockSocket::new(frames, echo);
        for frame in initial {
            socket.deliver(frame);
        }
        self.record.sockets.lock().push(socket.clone());
        Ok(Box::new(MockSink(socket)))
    }
}

struct SocketShared {
    handler: Mutex<Option<Arc<dyn FrameHandler>>>,
    sent: Mutex<Vec<Frame>>,
    closed: AtomicBool,
    outgoing: mpsc::UnboundedSender<Frame>,
    echo: bool,
}

/// The server side of an upgraded mock connection.
#[derive(Clone)]
pub struct MockSocket {
    shared: Arc<SocketShared>,
}

impl fmt::Debug for MockSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSocket")
            .field("sent", &self.shared.sent.lock().len())
            .field("closed", &self.is_closed())
            .field("echo", &self.shared.echo)
            .finish()
    }
}

impl MockSocket {
    fn new(handler: Arc<dyn FrameHandler>, echo: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let shared = Arc::new(SocketShared {
            handler: Mutex::new(Some(handler)),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            outgoing: tx,
            echo,
        });

        let weak: Weak<SocketShared> = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                MockSocket { shared }.reply(frame);
            }
        });

        Self { shared }
    }

    fn reply(&self, frame: Frame) {
        match frame.opcode {
            OpCode::Ping => self.deliver(Frame::pong(frame.payload)),
            OpCode::Pong => {}
            OpCode::Close => {
                let code = frame
                    .close_reason()
                    .map(|(code, _)| code)
                    .unwrap_or(close_code::PROTOCOL_ERROR);
                self.deliver(Frame::close(code, ""));
                self.close();
            }
            _ if self.shared.echo => self.deliver(frame),
            _ => {}
        }
    }

    /// Every frame the client sent, in order.
    pub fn sent(&self) -> Vec<Frame> {
        self.shared.sent.lock().clone()
    }

    /// Send a frame to the client.
    pub fn deliver(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        let handler = self.shared.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_frame(frame);
        }
    }

    /// Close the channel without a close frame.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = self.shared.handler.lock().take();
        if let Some(handler) = handler {
            handler.on_closed();
        }
    }

    /// Returns `true` once either side closed the channel.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct MockSink(MockSocket);

impl FrameSink for MockSink {
    fn send(&self, frame: Frame) -> BoxFuture<'static, Result<(), BoxError>> {
        if self.0.is_closed() {
            return Box::pin(ready(Err(MockConnectionError.into())));
        }
        self.0.shared.sent.lock().push(frame.clone());
        let result = self
            .0
            .shared
            .outgoing
            .send(frame)
            .map_err(|_| Box::new(MockConnectionError) as BoxError);
        Box::pin(ready(result))
    }

    fn close(&self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventChannel;

    #[tokio::test]
    async fn refuses_connections() {
        let transport = MockTransport::connection_error();
        let destination = Destination::from_uri(&"http://example.com".parse().unwrap()).unwrap();
        let error = transport.connect(&destination).await.unwrap_err();
        assert!(error.downcast_ref::<MockConnectionError>().is_some());
        assert_eq!(transport.connections(), 0);
    }

    #[tokio::test]
    async fn content_length_added() {
        let response = MockResponse::ok().chunks(["ab", "cde"]).finalize();
        assert_eq!(response.headers[CONTENT_LENGTH], "5");
    }

    #[tokio::test]
    async fn write_error_closes() {
        let transport = MockTransport::new(|_| MockResponse::ok().write_error());
        let destination = Destination::from_uri(&"http://example.com".parse().unwrap()).unwrap();
        let mut connection = transport.connect(&destination).await.unwrap();
        let notifier = Notifier::new(destination, EventChannel::root());
        let request = http::Request::new(Bytes::new());

        assert!(connection.write(request, notifier).await.is_err());
        assert!(!connection.is_open());
        assert_eq!(transport.requests(), 1);
    }
}
