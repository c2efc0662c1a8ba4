use std::time::{Duration, Instant};

use tracing::trace;

use super::PoolableConnection;

#[derive(Debug)]
struct Idle<T> {
    at: Instant,
    inner: T,
}

impl<T> Idle<T> {
    fn new(inner: T) -> Self {
        Self {
            at: Instant::now(),
            inner,
        }
    }
}

/// Idle connections for one destination, most recently returned last.
#[derive(Debug)]
pub(super) struct IdleConnections<T> {
    inner: Vec<Idle<T>>,
}

impl<T> Default for IdleConnections<T> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<T> IdleConnections<T>
where
    T: PoolableConnection,
{
    pub(super) fn push(&mut self, inner: T) {
        self.inner.push(Idle::new(inner));
    }

    /// Take the freshest open connection which has not outlived `idle_timeout`.
    ///
    /// Expired and closed connections found on the way are returned in
    /// `evicted` so the caller can close them outside the pool lock.
    pub(super) fn pop(&mut self, idle_timeout: Option<Duration>, evicted: &mut Vec<T>) -> Option<T> {
        let expired = expiry(idle_timeout);

        trace!("checking {} idle connections", self.len());

        while let Some(entry) = self.inner.pop() {
            if expired.is_some_and(|expired| entry.at < expired) {
                trace!("found expired connection");
                // Entries are ordered by age, so everything below is expired too.
                evicted.push(entry.inner);
                evicted.extend(self.inner.drain(..).map(|idle| idle.inner));
                return None;
            }

            if entry.inner.is_open() {
                trace!("found idle connection");
                return Some(entry.inner);
            }

            trace!("found closed connection");
            evicted.push(entry.inner);
        }

        None
    }

    /// Remove every connection which is closed or has outlived `idle_timeout`.
    pub(super) fn evict(&mut self, idle_timeout: Option<Duration>) -> Vec<T> {
        let expired = expiry(idle_timeout);
        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(self.inner.len());

        for entry in self.inner.drain(..) {
            if expired.is_some_and(|expired| entry.at < expired) || !entry.inner.is_open() {
                evicted.push(entry.inner);
            } else {
                kept.push(entry);
            }
        }

        self.inner = kept;
        evicted
    }

    pub(super) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.inner.drain(..).map(|idle| idle.inner)
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn expiry(idle_timeout: Option<Duration>) -> Option<Instant> {
    idle_timeout
        .filter(|timeout| !timeout.is_zero())
        .and_then(|timeout| Instant::now().checked_sub(timeout))
}
