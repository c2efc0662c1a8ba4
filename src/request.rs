//! Per-attempt request state.
//!
//! A [`RequestContext`] is the unit of work for one attempt: the initial send, or one redirect hop.
//! It owns the attempt's child event scope and, while the attempt runs, its connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::config::ClientConfig;
use crate::destination::Destination;
use crate::error::Error;
use crate::event::EventChannel;
use crate::transport::Connection;

/// Lifecycle of a request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// The attempt exists but has not started.
    Created,
    /// Acquiring a connection.
    Connecting,
    /// A connection is attached.
    Connected,
    /// The request is being written.
    Sending,
    /// The request was written and the response is outstanding.
    AwaitingResponse,
    /// The response was a redirect which will be followed by a new attempt.
    Redirecting,
    /// The attempt completed.
    Completed,
    /// The attempt failed.
    Error,
}

/// Per-request overrides of the client configuration.
///
/// Insert into the request extensions to override the client defaults for one request:
///
/// ```
/// # use tachyon::{ClientConfig, RequestOptions};
/// let mut options = RequestOptions::from(&ClientConfig::default());
/// options.follow_redirects = true;
///
/// let mut request = http::Request::new(bytes::Bytes::new());
/// request.extensions_mut().insert(options);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct RequestOptions {
    /// Idle timeout for each attempt.
    pub idle_timeout: Option<Duration>,
    /// Total timeout across all attempts.
    pub request_timeout: Option<Duration>,
    /// Follow redirect responses.
    pub follow_redirects: bool,
    /// Maximum redirects followed.
    pub max_redirects: usize,
    /// Request keep-alive and pool the connection afterwards.
    pub keep_alive: bool,
}

impl From<&ClientConfig> for RequestOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            request_timeout: config.request_timeout,
            follow_redirects: config.follow_redirects,
            max_redirects: config.max_redirects,
            keep_alive: config.keep_alive,
        }
    }
}

/// What the engine sends for one attempt.
#[derive(Debug, Clone)]
pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl RequestParts {
    /// Fill in the headers the engine owns: `Host`, `User-Agent`, `Content-Length` and, without
    /// keep-alive, `Connection: close`. Headers set by the caller are left alone.
    pub(crate) fn prepare(
        &mut self,
        destination: &Destination,
        options: &RequestOptions,
        user_agent: Option<&str>,
    ) -> Result<(), Error> {
        if !self.headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&destination.host_header())
                .map_err(|_| Error::InvalidUri(format!("invalid host: {destination}")))?;
            self.headers.insert(HOST, host);
        }

        if let Some(agent) = user_agent {
            if !self.headers.contains_key(USER_AGENT) {
                if let Ok(value) = HeaderValue::from_str(agent) {
                    self.headers.insert(USER_AGENT, value);
                }
            }
        }

        if !self.body.is_empty() && !self.headers.contains_key(CONTENT_LENGTH) {
            self.headers
                .insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        }

        if !options.keep_alive && !self.headers.contains_key(CONNECTION) {
            self.headers
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct ResponseHead {
    status: Option<StatusCode>,
    headers: HeaderMap,
}

/// Mutable state of one request attempt.
pub(crate) struct RequestContext {
    pub(crate) parts: RequestParts,
    pub(crate) destination: Destination,
    pub(crate) options: RequestOptions,
    pub(crate) redirect_count: usize,
    pub(crate) events: EventChannel,
    pub(crate) created: Instant,
    pub(crate) deadline: Option<Instant>,
    state: Mutex<RequestState>,
    connection: Mutex<Option<Box<dyn Connection>>>,
    response: Mutex<ResponseHead>,
    upgrade: AtomicBool,
    reusable: AtomicBool,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.parts.method)
            .field("uri", &self.parts.uri)
            .field("redirect_count", &self.redirect_count)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl RequestContext {
    pub(crate) fn new(
        parts: RequestParts,
        destination: Destination,
        options: RequestOptions,
        redirect_count: usize,
        events: EventChannel,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            parts,
            destination,
            options,
            redirect_count,
            events,
            created: Instant::now(),
            deadline,
            state: Mutex::new(RequestState::Created),
            connection: Mutex::new(None),
            response: Mutex::new(ResponseHead::default()),
            upgrade: AtomicBool::new(false),
            reusable: AtomicBool::new(true),
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        let mut current = self.state.lock();
        trace!(from = ?*current, to = ?state, "request state");
        *current = state;
    }

    /// Move to `to` only if the attempt is still in `from`.
    pub(crate) fn transition(&self, from: RequestState, to: RequestState) -> bool {
        let mut current = self.state.lock();
        if *current != from {
            return false;
        }
        trace!(?from, ?to, "request state");
        *current = to;
        true
    }

    /// Attach a connection, handing it back if one is already attached.
    pub(crate) fn attach(&self, connection: Box<dyn Connection>) -> Result<(), Box<dyn Connection>> {
        let mut slot = self.connection.lock();
        if slot.is_some() {
            return Err(connection);
        }
        *slot = Some(connection);
        Ok(())
    }

    /// Take the attached connection.
    pub(crate) fn detach(&self) -> Option<Box<dyn Connection>> {
        self.connection.lock().take()
    }

    pub(crate) fn with_connection<R>(&self, f: impl FnOnce(&mut dyn Connection) -> R) -> Option<R> {
        self.connection
            .lock()
            .as_mut()
            .map(|connection| f(connection.as_mut()))
    }

    /// The request to hand to the transport.
    pub(crate) fn build_request(&self) -> http::Request<Bytes> {
        let mut request = http::Request::new(self.parts.body.clone());
        *request.method_mut() = self.parts.method.clone();
        *request.uri_mut() = self.parts.uri.clone();
        *request.headers_mut() = self.parts.headers.clone();
        request
    }

    /// Time left before the total timeout. `None` when there is no total timeout.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn record_status(&self, status: StatusCode) {
        self.response.lock().status = Some(status);
    }

    pub(crate) fn record_headers(&self, headers: &HeaderMap) {
        self.response.lock().headers = headers.clone();
    }

    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.response.lock().status
    }

    /// The connection may be kept: keep-alive was requested, the server did not
    /// answer `Connection: close`, and nothing went wrong consuming the response.
    pub(crate) fn keep_alive(&self) -> bool {
        if !self.options.keep_alive || !self.reusable.load(Ordering::Acquire) {
            return false;
        }
        let response = self.response.lock();
        !response
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"))
    }

    /// Never pool this attempt's connection.
    pub(crate) fn poison(&self) {
        self.reusable.store(false, Ordering::Release);
    }

    pub(crate) fn mark_upgrade(&self) {
        self.upgrade.store(true, Ordering::Release);
    }

    pub(crate) fn is_upgrade(&self) -> bool {
        self.upgrade.load(Ordering::Acquire)
    }
}
