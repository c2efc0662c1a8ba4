//! Client configuration.
//!
//! [`ClientConfig`] holds the defaults every request starts from. Individual requests can
//! override the per-request parts with [`RequestOptions`](crate::request::RequestOptions).

use std::time::Duration;

use crate::admission::AdmissionPolicy;
use crate::pool::Config as PoolConfig;

/// Default ceiling on redirects followed for one request.
pub const DEFAULT_MAX_REDIRECTS: usize = 20;

/// Configuration consumed by the request engine.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Time allowed to establish a connection. `None` waits forever.
    pub connect_timeout: Option<Duration>,

    /// Time allowed without any I/O progress. `None` or zero disables it.
    pub idle_timeout: Option<Duration>,

    /// Time allowed for the whole request, redirects included. `None` or zero disables it.
    pub request_timeout: Option<Duration>,

    /// Follow redirect responses.
    pub follow_redirects: bool,

    /// Maximum redirects followed for one request.
    pub max_redirects: usize,

    /// Ask to keep connections alive and return them to the pool.
    pub keep_alive: bool,

    /// Value of the `User-Agent` header, unless the request sets one.
    pub user_agent: Option<String>,

    /// Connection pool configuration.
    pub pool: PoolConfig,

    /// Admission control policy.
    pub admission: AdmissionPolicy,

    /// WebSocket configuration.
    pub websocket: WebSocketConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(5)),
            idle_timeout: Some(Duration::from_secs(60)),
            request_timeout: Some(Duration::from_secs(60)),
            follow_redirects: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            keep_alive: true,
            user_agent: Some(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).into()),
            pool: PoolConfig::default(),
            admission: AdmissionPolicy::default(),
            websocket: WebSocketConfig::default(),
        }
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct WebSocketConfig {
    /// Messages larger than this are split into continuation frames.
    pub max_outgoing_frame_size: usize,

    /// Incoming frames larger than this are a protocol error.
    pub max_incoming_frame_size: usize,

    /// Aggregate fragmented messages before delivering them to listeners.
    pub aggregate_frames: bool,

    /// Ceiling on an aggregated message.
    pub max_aggregate_size: usize,

    /// Answer pings automatically.
    pub auto_pong: bool,

    /// Treat a received close frame as the end of the session: only the answering close may be
    /// sent afterwards. Either way the close is not answered automatically; listeners may answer
    /// it with [`WebSocket::close`](crate::ws::WebSocket::close).
    pub auto_close_frame: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_outgoing_frame_size: 10 * 1024,
            max_incoming_frame_size: 10 * 1024,
            aggregate_frames: true,
            max_aggregate_size: 10 * 1024 * 1024,
            auto_pong: true,
            auto_close_frame: true,
        }
    }
}
