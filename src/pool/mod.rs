//! Connection Pooling for Clients
//!
//! The pool caches idle, reusable connections per [`Destination`]. A connection handed out by
//! [`ConnectionPool::get`] is removed from the pool, so no two requests ever share one. Idle
//! connections older than the configured idle lifetime are closed by a periodic sweep, and also
//! skipped lazily on checkout.
//!
//! Pool configuration happens in the [`Config`] type, which allows for setting the maximum idle
//! duration of a connection, and the maximum number of idle connections per host. A [`NoopPool`]
//! stands in when pooling is disabled.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::destination::Destination;
use crate::transport::Connection;

mod idle;

use self::idle::IdleConnections;

/// A connection which can be kept in a pool.
pub trait PoolableConnection: Send + 'static {
    /// Returns `true` if the connection is open.
    fn is_open(&self) -> bool;

    /// Close the connection.
    fn close(&mut self);
}

impl PoolableConnection for Box<dyn Connection> {
    fn is_open(&self) -> bool {
        Connection::is_open(self.as_ref())
    }

    fn close(&mut self) {
        Connection::close(self.as_mut())
    }
}

/// The pool contract used by the connection manager.
pub trait ConnectionPool<C>: fmt::Debug + Send + Sync + 'static {
    /// Take an idle connection for this destination, if there is one.
    fn get(&self, destination: &Destination) -> Option<C>;

    /// Return a connection to the pool.
    ///
    /// Returns `false` if the pool refused it, in which case it has been closed.
    fn offer(&self, destination: &Destination, connection: C) -> bool;

    /// Close a connection which must not be reused.
    fn discard(&self, destination: &Destination, connection: C);

    /// Returns `false` for pools which never hold connections.
    fn is_active(&self) -> bool;

    /// Close every idle connection and refuse later offers.
    fn close(&self);

    /// Idle connection counts.
    fn stats(&self) -> PoolStats;
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Whether connections are pooled at all.
    pub enabled: bool,

    /// The maximum idle duration of a connection.
    pub idle_timeout: Option<Duration>,

    /// The maximum number of idle connections per host.
    pub max_idle_per_host: usize,

    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Some(Duration::from_secs(60)),
            max_idle_per_host: 32,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Snapshot of idle connections held by a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total idle connections.
    pub idle: usize,
    /// Idle connections per destination.
    pub per_destination: HashMap<Destination, usize>,
}

#[derive(Debug)]
struct PoolInner<C>
where
    C: PoolableConnection,
{
    config: Config,
    closed: bool,
    idle: HashMap<Destination, IdleConnections<C>>,
}

impl<C> PoolInner<C>
where
    C: PoolableConnection,
{
    fn new(config: Config) -> Self {
        Self {
            config,
            closed: false,
            idle: HashMap::new(),
        }
    }

    fn pop(&mut self, destination: &Destination, evicted: &mut Vec<C>) -> Option<C> {
        let idle = self.idle.get_mut(destination)?;
        let entry = idle.pop(self.config.idle_timeout, evicted);

        if idle.is_empty() {
            trace!(%destination, "removing empty idle list");
            self.idle.remove(destination);
        }

        entry
    }

    fn push(&mut self, destination: &Destination, connection: C) -> Result<(), C> {
        if self.closed {
            trace!(%destination, "pool closed, refusing connection");
            return Err(connection);
        }

        if !connection.is_open() {
            return Err(connection);
        }

        let idle = self.idle.entry(destination.clone()).or_default();
        if idle.len() >= self.config.max_idle_per_host {
            trace!(%destination, "idle limit reached, refusing connection");
            return Err(connection);
        }

        idle.push(connection);
        Ok(())
    }

    fn sweep(&mut self) -> Vec<C> {
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = Vec::new();
        self.idle.retain(|_, idle| {
            evicted.extend(idle.evict(idle_timeout));
            !idle.is_empty()
        });
        evicted
    }
}

/// A pool of idle connections to remote hosts.
///
/// Clones share the same underlying pool.
pub struct Pool<C: PoolableConnection> {
    inner: Arc<Mutex<PoolInner<C>>>,
}

impl<C: PoolableConnection> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pool")
            .field("config", &inner.config)
            .field("closed", &inner.closed)
            .field("hosts", &inner.idle.len())
            .finish()
    }
}

impl<C: PoolableConnection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: PoolableConnection> Pool<C> {
    /// Create a new pool.
    ///
    /// When called inside a tokio runtime and an idle timeout is configured, a
    /// background sweep closes expired connections every `sweep_interval`. The
    /// sweep stops once every clone of the pool is dropped or the pool is closed.
    pub fn new(config: Config) -> Self {
        let sweep = config
            .idle_timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|_| config.sweep_interval);

        let pool = Self {
            inner: Arc::new(Mutex::new(PoolInner::new(config))),
        };

        if let Some(interval) = sweep {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(sweeper(Arc::downgrade(&pool.inner), interval));
                }
                Err(_) => debug!("no runtime available, idle sweep disabled"),
            }
        }

        pool
    }

    /// Close expired and closed idle connections now.
    pub fn sweep(&self) -> usize {
        sweep_now(&self.inner)
    }

    /// The pool configuration.
    pub fn config(&self) -> Config {
        self.inner.lock().config.clone()
    }
}

fn sweep_now<C: PoolableConnection>(inner: &Mutex<PoolInner<C>>) -> usize {
    let evicted = inner.lock().sweep();
    let count = evicted.len();
    for mut connection in evicted {
        connection.close();
    }
    if count > 0 {
        debug!(count, "evicted idle connections");
    }
    count
}

async fn sweeper<C: PoolableConnection>(pool: Weak<Mutex<PoolInner<C>>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            trace!("pool dropped, stopping sweep");
            return;
        };
        if inner.lock().closed {
            trace!("pool closed, stopping sweep");
            return;
        }
        sweep_now(&inner);
    }
}

impl<C: PoolableConnection> Default for Pool<C> {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<C: PoolableConnection> ConnectionPool<C> for Pool<C> {
    fn get(&self, destination: &Destination) -> Option<C> {
        let mut evicted = Vec::new();
        let connection = self.inner.lock().pop(destination, &mut evicted);
        for mut stale in evicted {
            stale.close();
        }
        trace!(%destination, hit = connection.is_some(), "pool checkout");
        connection
    }

    fn offer(&self, destination: &Destination, connection: C) -> bool {
        let refused = self.inner.lock().push(destination, connection);
        match refused {
            Ok(()) => {
                trace!(%destination, "connection returned to pool");
                true
            }
            Err(mut connection) => {
                connection.close();
                false
            }
        }
    }

    fn discard(&self, destination: &Destination, mut connection: C) {
        trace!(%destination, "discarding connection");
        connection.close();
    }

    fn is_active(&self) -> bool {
        true
    }

    fn close(&self) {
        let drained: Vec<C> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner
                .idle
                .drain()
                .flat_map(|(_, mut idle)| idle.drain().collect::<Vec<_>>())
                .collect()
        };
        debug!(count = drained.len(), "closing pool");
        for mut connection in drained {
            connection.close();
        }
    }

    fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let per_destination: HashMap<Destination, usize> = inner
            .idle
            .iter()
            .map(|(destination, idle)| (destination.clone(), idle.len()))
            .collect();
        PoolStats {
            idle: per_destination.values().sum(),
            per_destination,
        }
    }
}

/// A pool which never keeps a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPool;

impl<C: PoolableConnection> ConnectionPool<C> for NoopPool {
    fn get(&self, _destination: &Destination) -> Option<C> {
        None
    }

    fn offer(&self, _destination: &Destination, mut connection: C) -> bool {
        connection.close();
        false
    }

    fn discard(&self, _destination: &Destination, mut connection: C) {
        connection.close();
    }

    fn is_active(&self) -> bool {
        false
    }

    fn close(&self) {}

    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }
}
