//! Tachyon
//!
//! An asynchronous HTTP and WebSocket request engine.
//!
//! Requests are driven from admission through connect, write and response without blocking the
//! caller. Connections are pooled per [`Destination`], concurrency is gated by a pluggable
//! [admission policy](admission::AdmissionPolicy), and every request resolves exactly once, no
//! matter how timeouts, transport failures and cancellation race.
//!
//! The engine never touches raw bytes: a [`Transport`](transport::Transport) supplies connections
//! which report decoded progress. After a successful upgrade, the same connection carries a
//! [`WebSocket`](ws::WebSocket) session with fragmentation, aggregation and ping/pong/close
//! handling.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod admission;
pub mod client;
pub mod config;
pub mod destination;
pub mod error;
pub mod event;
pub mod handler;
mod manager;
pub mod pool;
pub mod request;
mod timeout;
pub mod transport;
pub mod ws;

pub use client::{Client, ClientStats, ResponseFuture};
pub use config::{ClientConfig, WebSocketConfig};
pub use destination::{Destination, Scheme};
pub use error::{Error, ErrorKind, TimeoutKind};
pub use handler::{AsyncCallback, BodyConsumer, BytesConsumer};
pub use request::RequestOptions;

/// A boxed error which is `Send` and `Sync`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
