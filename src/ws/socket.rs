//! An open WebSocket session.
//!
//! Incoming frames are processed under the session's receive lock, which yields the deliveries
//! and replies for that frame; listeners are called after the lock is released. Outgoing messages
//! are split and queued under the send lock, so the frames of one message are never interleaved
//! with another message's frames.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_core::future::BoxFuture;
use futures_util::FutureExt as _;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use super::frame::{close_code, Frame, OpCode, MAX_CONTROL_PAYLOAD};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::transport::{FrameHandler, FrameSink};
use crate::BoxError;

/// Receives the events of a WebSocket session.
///
/// Raw frame and aggregated message callbacks may be used together: every data frame is passed to
/// [`on_frame`](WebSocketListener::on_frame), and complete messages are additionally passed to
/// [`on_text_message`](WebSocketListener::on_text_message) or
/// [`on_binary_message`](WebSocketListener::on_binary_message).
pub trait WebSocketListener: Send + Sync + 'static {
    /// The session is open.
    fn on_open(&self, _socket: &WebSocket) {}

    /// The session closed. `1006` means the channel closed without a close frame.
    fn on_close(&self, _socket: &WebSocket, _code: u16, _reason: &str) {}

    /// The session failed.
    fn on_error(&self, _error: &Error) {}

    /// A data frame arrived.
    fn on_frame(&self, _frame: &Frame) {}

    /// A complete text message arrived.
    fn on_text_message(&self, _text: &str) {}

    /// A complete binary message arrived.
    fn on_binary_message(&self, _data: &Bytes) {}

    /// A ping arrived.
    fn on_ping(&self, _data: &Bytes) {}

    /// A pong arrived.
    fn on_pong(&self, _data: &Bytes) {}
}

/// The type of the fragmented message in progress, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Continuation {
    #[default]
    None,
    Text,
    Binary,
}

impl Continuation {
    fn opcode(self) -> OpCode {
        match self {
            Continuation::Text => OpCode::Text,
            Continuation::Binary => OpCode::Binary,
            Continuation::None => OpCode::Continuation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    /// We sent a close frame and wait for the peer's.
    Closing,
    /// The peer sent a close frame which has not been answered.
    PeerClosed,
    Closed,
}

#[derive(Debug, Default)]
struct Incoming {
    ready: bool,
    pending: Vec<Frame>,
    pending_closed: bool,
    expected: Continuation,
    buffer: BytesMut,
    close_notified: bool,
}

#[derive(Debug, Default)]
struct Outgoing {
    expected: Continuation,
    /// A multi-frame message is still being written.
    sending: bool,
}

/// Clears [`Outgoing::sending`] when a multi-frame send finishes or is abandoned.
struct SendingGuard<'a>(&'a SocketInner);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.outgoing.lock().sending = false;
    }
}

enum Delivery {
    Frame(Frame),
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(u16, String),
    Error(Error),
}

#[derive(Default)]
struct Reaction {
    deliveries: Vec<Delivery>,
    reply: Option<Frame>,
    close_sink: bool,
}

struct SocketInner {
    config: WebSocketConfig,
    subprotocol: Option<String>,
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
    listeners: Mutex<Vec<Arc<dyn WebSocketListener>>>,
    incoming: Mutex<Incoming>,
    outgoing: Mutex<Outgoing>,
    state: Mutex<SessionState>,
}

/// A WebSocket session.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("subprotocol", &self.inner.subprotocol)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl WebSocket {
    pub(crate) fn new(
        config: WebSocketConfig,
        subprotocol: Option<String>,
        listeners: Vec<Arc<dyn WebSocketListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                config,
                subprotocol,
                sink: Mutex::new(None),
                listeners: Mutex::new(listeners),
                incoming: Mutex::new(Incoming::default()),
                outgoing: Mutex::new(Outgoing::default()),
                state: Mutex::new(SessionState::Open),
            }),
        }
    }

    pub(crate) fn frame_handler(&self) -> Arc<dyn FrameHandler> {
        Arc::new(SocketFrames(self.clone()))
    }

    pub(crate) fn attach(&self, sink: Box<dyn FrameSink>) {
        *self.inner.sink.lock() = Some(Arc::from(sink));
    }

    /// Mark the session ready: notify listeners and replay frames which arrived early.
    pub(crate) fn open(&self) {
        for listener in self.listeners() {
            listener.on_open(self);
        }

        loop {
            let batch = {
                let mut incoming = self.inner.incoming.lock();
                if incoming.pending.is_empty() {
                    incoming.ready = true;
                    break;
                }
                std::mem::take(&mut incoming.pending)
            };
            trace!(frames = batch.len(), "replaying early frames");
            for frame in batch {
                let reaction = {
                    let mut incoming = self.inner.incoming.lock();
                    if incoming.close_notified {
                        continue;
                    }
                    self.process(&mut incoming, frame)
                };
                self.react(reaction);
            }
        }

        let closed = std::mem::take(&mut self.inner.incoming.lock().pending_closed);
        if closed {
            self.channel_closed();
        }
    }

    /// The sub-protocol selected by the server.
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    /// The session configuration.
    pub fn config(&self) -> &WebSocketConfig {
        &self.inner.config
    }

    /// Returns `true` until a close frame was sent or received, or the channel closed.
    ///
    /// With `auto_close_frame` disabled, a received close frame leaves the session open until a
    /// listener closes it.
    pub fn is_open(&self) -> bool {
        match *self.inner.state.lock() {
            SessionState::Open => true,
            SessionState::PeerClosed => !self.inner.config.auto_close_frame,
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// Register another listener.
    pub fn add_listener(&self, listener: impl WebSocketListener) {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    /// Send a text message, split into frames of at most `max_outgoing_frame_size` bytes.
    ///
    /// Multi-byte characters are never split across frames. While a multi-frame message is being
    /// written, other messages and fragments are refused with [`Error::InvalidState`].
    pub async fn send_text(&self, text: &str) -> Result<(), Error> {
        let payloads = split_text(text, self.inner.config.max_outgoing_frame_size)?;
        self.send_message(Continuation::Text, payloads).await
    }

    /// Send a binary message, split into frames of at most `max_outgoing_frame_size` bytes.
    ///
    /// While a multi-frame message is being written, other messages and fragments are refused
    /// with [`Error::InvalidState`].
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let payloads = split_binary(data.into(), self.inner.config.max_outgoing_frame_size);
        self.send_message(Continuation::Binary, payloads).await
    }

    /// Send one fragment of a text message. The last fragment must set `is_final`.
    pub async fn send_text_fragment(&self, text: &str, is_final: bool) -> Result<(), Error> {
        let payload = Bytes::copy_from_slice(text.as_bytes());
        self.send_fragment(Continuation::Text, payload, is_final)
            .await
    }

    /// Send one fragment of a binary message. The last fragment must set `is_final`.
    pub async fn send_binary_fragment(
        &self,
        data: impl Into<Bytes>,
        is_final: bool,
    ) -> Result<(), Error> {
        self.send_fragment(Continuation::Binary, data.into(), is_final)
            .await
    }

    /// Send a ping.
    pub async fn ping(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send_control(Frame::ping(data)).await
    }

    /// Send an unsolicited pong.
    pub async fn pong(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send_control(Frame::pong(data)).await
    }

    /// Start the close handshake, or answer the peer's close frame.
    ///
    /// Later data frames are refused. When we start the handshake, the session is closed once the
    /// peer's close frame arrives. When answering, the channel is closed after the reply is written.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), Error> {
        let size = 2 + reason.len();
        if size > MAX_CONTROL_PAYLOAD {
            return Err(Error::FrameTooLong {
                size,
                limit: MAX_CONTROL_PAYLOAD,
            });
        }

        let (write, answered) = {
            let _outgoing = self.inner.outgoing.lock();
            let sink = self.sink()?;
            let mut state = self.inner.state.lock();
            match *state {
                SessionState::Open => {
                    *state = SessionState::Closing;
                    debug!(code, "closing websocket");
                    (sink.send(Frame::close(code, reason)), None)
                }
                SessionState::PeerClosed => {
                    *state = SessionState::Closed;
                    self.inner.sink.lock().take();
                    debug!(code, "answering websocket close");
                    (sink.send(Frame::close(code, reason)), Some(sink))
                }
                SessionState::Closing | SessionState::Closed => {
                    return Err(Error::InvalidState("websocket is already closing"))
                }
            }
        };
        let result = write.await;
        if let Some(sink) = answered {
            sink.close();
        }
        result.map_err(Error::write)
    }

    fn listeners(&self) -> Vec<Arc<dyn WebSocketListener>> {
        self.inner.listeners.lock().clone()
    }

    fn sink(&self) -> Result<Arc<dyn FrameSink>, Error> {
        self.inner
            .sink
            .lock()
            .clone()
            .ok_or(Error::InvalidState("websocket is closed"))
    }

    fn ensure_open(&self) -> Result<(), Error> {
        match *self.inner.state.lock() {
            SessionState::Open => Ok(()),
            SessionState::PeerClosed if !self.inner.config.auto_close_frame => Ok(()),
            SessionState::Closing | SessionState::PeerClosed => {
                Err(Error::InvalidState("websocket is closing"))
            }
            SessionState::Closed => Err(Error::InvalidState("websocket is closed")),
        }
    }

    async fn send_message(&self, kind: Continuation, payloads: Vec<Bytes>) -> Result<(), Error> {
        let (writes, _guard) = {
            let mut outgoing = self.inner.outgoing.lock();
            self.ensure_open()?;
            if outgoing.expected != Continuation::None {
                return Err(Error::InvalidState("a fragmented message is being sent"));
            }
            if outgoing.sending {
                return Err(Error::InvalidState("a message is being sent"));
            }
            let sink = self.sink()?;
            let guard = if payloads.len() > 1 {
                outgoing.sending = true;
                Some(SendingGuard(&self.inner))
            } else {
                None
            };
            let last = payloads.len().saturating_sub(1);
            let writes = payloads
                .into_iter()
                .enumerate()
                .map(|(index, payload)| {
                    let opcode = if index == 0 {
                        kind.opcode()
                    } else {
                        OpCode::Continuation
                    };
                    sink.send(Frame::new(opcode, payload, index == last))
                })
                .collect::<Vec<_>>();
            (writes, guard)
        };

        for write in writes {
            write.await.map_err(Error::write)?;
        }
        Ok(())
    }

    async fn send_fragment(&self, kind: Continuation, payload: Bytes, fin: bool) -> Result<(), Error> {
        let limit = self.inner.config.max_outgoing_frame_size;
        if payload.len() > limit {
            return Err(Error::FrameTooLong {
                size: payload.len(),
                limit,
            });
        }

        let write = {
            let mut outgoing = self.inner.outgoing.lock();
            self.ensure_open()?;
            if outgoing.sending {
                return Err(Error::InvalidState("a message is being sent"));
            }
            let opcode = match outgoing.expected {
                Continuation::None => kind.opcode(),
                pending if pending == kind => OpCode::Continuation,
                _ => {
                    return Err(Error::InvalidState(
                        "a fragmented message of another type is being sent",
                    ))
                }
            };
            let sink = self.sink()?;
            outgoing.expected = if fin { Continuation::None } else { kind };
            sink.send(Frame::new(opcode, payload, fin))
        };
        write.await.map_err(Error::write)
    }

    async fn send_control(&self, frame: Frame) -> Result<(), Error> {
        if frame.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::FrameTooLong {
                size: frame.payload.len(),
                limit: MAX_CONTROL_PAYLOAD,
            });
        }
        let write = {
            self.ensure_open()?;
            self.sink()?.send(frame)
        };
        write.await.map_err(Error::write)
    }

    fn receive(&self, frame: Frame) {
        let reaction = {
            let mut incoming = self.inner.incoming.lock();
            if !incoming.ready {
                trace!(opcode = ?frame.opcode, "buffering frame until open");
                incoming.pending.push(frame);
                return;
            }
            if incoming.close_notified {
                trace!(opcode = ?frame.opcode, "ignoring frame after close");
                return;
            }
            self.process(&mut incoming, frame)
        };
        self.react(reaction);
    }

    fn process(&self, incoming: &mut Incoming, frame: Frame) -> Reaction {
        let config = &self.inner.config;
        let mut reaction = Reaction::default();

        let size = frame.payload.len();
        if size > config.max_incoming_frame_size {
            let error = Error::FrameTooLong {
                size,
                limit: config.max_incoming_frame_size,
            };
            return self.fail(incoming, reaction, error, close_code::MESSAGE_TOO_BIG);
        }

        match frame.opcode {
            OpCode::Ping => {
                if config.auto_pong {
                    reaction.reply = Some(Frame::pong(frame.payload.clone()));
                }
                reaction.deliveries.push(Delivery::Ping(frame.payload));
            }
            OpCode::Pong => reaction.deliveries.push(Delivery::Pong(frame.payload)),
            OpCode::Close => match frame.close_reason() {
                Ok((code, reason)) => {
                    incoming.close_notified = true;
                    let mut state = self.inner.state.lock();
                    if *state == SessionState::Closing {
                        *state = SessionState::Closed;
                        reaction.close_sink = true;
                    } else {
                        // The sink stays up so the close can be answered.
                        *state = SessionState::PeerClosed;
                    }
                    reaction.deliveries.push(Delivery::Close(code, reason));
                }
                Err(error) => {
                    return self.fail(incoming, reaction, error, close_code::PROTOCOL_ERROR);
                }
            },
            OpCode::Text | OpCode::Binary => {
                if incoming.expected != Continuation::None {
                    let error =
                        Error::Protocol("new message while a fragmented message is pending".into());
                    return self.fail(incoming, reaction, error, close_code::PROTOCOL_ERROR);
                }

                let kind = if frame.opcode == OpCode::Text {
                    Continuation::Text
                } else {
                    Continuation::Binary
                };
                reaction.deliveries.push(Delivery::Frame(frame.clone()));

                if frame.fin {
                    match message(kind, frame.payload) {
                        Ok(delivery) => reaction.deliveries.push(delivery),
                        Err(error) => {
                            return self.fail(incoming, reaction, error, close_code::INVALID_DATA)
                        }
                    }
                } else {
                    incoming.expected = kind;
                    if config.aggregate_frames {
                        incoming.buffer.clear();
                        incoming.buffer.extend_from_slice(&frame.payload);
                    }
                }
            }
            OpCode::Continuation => {
                let kind = incoming.expected;
                if kind == Continuation::None {
                    let error = Error::Protocol("unexpected continuation frame".into());
                    return self.fail(incoming, reaction, error, close_code::PROTOCOL_ERROR);
                }
                reaction.deliveries.push(Delivery::Frame(frame.clone()));

                if config.aggregate_frames {
                    let size = incoming.buffer.len() + frame.payload.len();
                    if size > config.max_aggregate_size {
                        let error = Error::FrameTooLong {
                            size,
                            limit: config.max_aggregate_size,
                        };
                        return self.fail(incoming, reaction, error, close_code::MESSAGE_TOO_BIG);
                    }
                    incoming.buffer.extend_from_slice(&frame.payload);
                }

                if frame.fin {
                    incoming.expected = Continuation::None;
                    if config.aggregate_frames {
                        let data = incoming.buffer.split().freeze();
                        match message(kind, data) {
                            Ok(delivery) => reaction.deliveries.push(delivery),
                            Err(error) => {
                                return self.fail(incoming, reaction, error, close_code::INVALID_DATA)
                            }
                        }
                    }
                }
            }
        }

        reaction
    }

    /// Abort the session after a protocol failure.
    fn fail(&self, incoming: &mut Incoming, mut reaction: Reaction, error: Error, code: u16) -> Reaction {
        debug!(%error, code, "websocket protocol failure");
        incoming.buffer.clear();
        incoming.expected = Continuation::None;
        incoming.close_notified = true;

        let reason = match code {
            close_code::MESSAGE_TOO_BIG => "message too big",
            close_code::INVALID_DATA => "invalid data",
            _ => "protocol error",
        };

        let mut state = self.inner.state.lock();
        if *state == SessionState::Open {
            reaction.reply = Some(Frame::close(code, reason));
        }
        *state = SessionState::Closed;
        reaction.close_sink = true;

        reaction.deliveries.push(Delivery::Error(error));
        reaction.deliveries.push(Delivery::Close(code, reason.to_owned()));
        reaction
    }

    fn react(&self, reaction: Reaction) {
        if let Some(reply) = reaction.reply {
            let sink = self.inner.sink.lock().clone();
            if let Some(sink) = sink {
                drive(sink.send(reply));
            }
        }
        if reaction.close_sink {
            let sink = self.inner.sink.lock().take();
            if let Some(sink) = sink {
                sink.close();
            }
        }
        if reaction.deliveries.is_empty() {
            return;
        }

        let listeners = self.listeners();
        for delivery in &reaction.deliveries {
            for listener in &listeners {
                match delivery {
                    Delivery::Frame(frame) => listener.on_frame(frame),
                    Delivery::Text(text) => listener.on_text_message(text),
                    Delivery::Binary(data) => listener.on_binary_message(data),
                    Delivery::Ping(data) => listener.on_ping(data),
                    Delivery::Pong(data) => listener.on_pong(data),
                    Delivery::Close(code, reason) => listener.on_close(self, *code, reason),
                    Delivery::Error(error) => listener.on_error(error),
                }
            }
        }
    }

    fn channel_closed(&self) {
        let notify = {
            let mut incoming = self.inner.incoming.lock();
            if !incoming.ready {
                incoming.pending_closed = true;
                return;
            }
            !std::mem::replace(&mut incoming.close_notified, true)
        };

        *self.inner.state.lock() = SessionState::Closed;
        self.inner.sink.lock().take();

        if notify {
            debug!("websocket channel closed without a close frame");
            for listener in self.listeners() {
                listener.on_close(self, close_code::ABNORMAL, "");
            }
        }
    }
}

struct SocketFrames(WebSocket);

impl FrameHandler for SocketFrames {
    fn on_frame(&self, frame: Frame) {
        self.0.receive(frame);
    }

    fn on_closed(&self) {
        self.0.channel_closed();
    }
}

fn message(kind: Continuation, data: Bytes) -> Result<Delivery, Error> {
    match kind {
        Continuation::Text => String::from_utf8(data.to_vec())
            .map(Delivery::Text)
            .map_err(|_| Error::Protocol("text message is not valid UTF-8".into())),
        _ => Ok(Delivery::Binary(data)),
    }
}

/// Complete a control frame write off the receive path.
fn drive(write: BoxFuture<'static, Result<(), BoxError>>) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(error) = write.await {
                    debug!(%error, "websocket reply failed");
                }
            });
        }
        Err(_) => {
            if let Some(Err(error)) = write.now_or_never() {
                debug!(%error, "websocket reply failed");
            }
        }
    }
}

fn split_binary(data: Bytes, max: usize) -> Vec<Bytes> {
    if data.len() <= max || max == 0 {
        return vec![data];
    }
    let mut payloads = Vec::with_capacity(data.len().div_ceil(max));
    let mut start = 0;
    while start < data.len() {
        let end = (start + max).min(data.len());
        payloads.push(data.slice(start..end));
        start = end;
    }
    payloads
}

fn split_text(text: &str, max: usize) -> Result<Vec<Bytes>, Error> {
    if text.len() <= max || max == 0 {
        return Ok(vec![Bytes::copy_from_slice(text.as_bytes())]);
    }
    let mut payloads = Vec::with_capacity(text.len().div_ceil(max));
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = max.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            return Err(Error::FrameTooLong {
                size: rest.chars().next().map_or(0, char::len_utf8),
                limit: max,
            });
        }
        let (head, tail) = rest.split_at(end);
        payloads.push(Bytes::copy_from_slice(head.as_bytes()));
        rest = tail;
    }
    Ok(payloads)
}
