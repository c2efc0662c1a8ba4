use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use super::{Client, ClientRef};
use crate::admission::AdmissionPolicy;
use crate::config::{ClientConfig, WebSocketConfig};
use crate::event::EventChannel;
use crate::manager::{ConnectionManager, SharedPool};
use crate::pool::{Config as PoolConfig, NoopPool, Pool};
use crate::transport::Transport;

/// A builder for a client.
#[derive(Debug)]
pub struct Builder<T> {
    transport: T,
    config: ClientConfig,
    runtime: Option<Handle>,
    callbacks: Option<Handle>,
}

impl Builder<()> {
    /// Create a new, empty builder
    pub fn new() -> Self {
        Self {
            transport: (),
            config: ClientConfig::default(),
            runtime: None,
            callbacks: None,
        }
    }
}

impl Default for Builder<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Builder<T> {
    /// Use the provided transport to open connections.
    pub fn transport<T2>(self, transport: T2) -> Builder<T2>
    where
        T2: Transport,
    {
        Builder {
            transport,
            config: self.config,
            runtime: self.runtime,
            callbacks: self.callbacks,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Access the configuration being built.
    pub fn config(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the default idle timeout.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the default total request timeout.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Follow redirects by default.
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Set the redirect limit.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Request keep-alive by default.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Set a user agent header for all requests.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Do not send a default user agent.
    pub fn without_user_agent(mut self) -> Self {
        self.config.user_agent = None;
        self
    }

    /// Configure the connection pool.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Disable connection pooling.
    pub fn without_pool(mut self) -> Self {
        self.config.pool.enabled = false;
        self
    }

    /// Set the admission control policy.
    pub fn with_admission(mut self, policy: AdmissionPolicy) -> Self {
        self.config.admission = policy;
        self
    }

    /// Configure WebSocket sessions.
    pub fn with_websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.config.websocket = websocket;
        self
    }

    /// Run request tasks on this runtime instead of the one current at submission.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Run completion callbacks on this runtime.
    pub fn with_callback_runtime(mut self, runtime: Handle) -> Self {
        self.callbacks = Some(runtime);
        self
    }
}

impl<T> Builder<T>
where
    T: Transport,
{
    /// Build the client.
    ///
    /// The pool's idle sweep runs on the configured runtime, or on the current one.
    pub fn build(self) -> Client {
        let _entered = self.runtime.as_ref().map(Handle::enter);

        let pool: SharedPool = if self.config.pool.enabled {
            Arc::new(Pool::new(self.config.pool.clone()))
        } else {
            Arc::new(NoopPool)
        };

        let manager = ConnectionManager::new(
            Arc::new(self.transport),
            pool,
            self.config.connect_timeout,
        );

        Client {
            inner: Arc::new(ClientRef {
                admission: self.config.admission.build(),
                manager,
                events: EventChannel::root(),
                runtime: self.runtime.clone(),
                callbacks: self.callbacks,
                closed: AtomicBool::new(false),
                config: self.config,
            }),
        }
    }
}
