//! Connection management for request attempts.
//!
//! The manager acquires a connection for an attempt (pooled or new), schedules the attempt's
//! timeouts, writes the request, and on the terminal event hands the connection back to the pool
//! or closes it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{Error, TimeoutKind};
use crate::event::{Event, EventKind};
use crate::pool::ConnectionPool;
use crate::request::{RequestContext, RequestState};
use crate::timeout::{TimeoutPlan, Timeouts};
use crate::transport::{Connection, Notifier, Transport};

pub(crate) type SharedPool = Arc<dyn ConnectionPool<Box<dyn Connection>>>;

pub(crate) struct ConnectionManager {
    transport: Arc<dyn Transport>,
    pool: SharedPool,
    connect_timeout: Option<Duration>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("pool", &self.pool)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectionManager {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        pool: SharedPool,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            pool,
            connect_timeout,
        }
    }

    pub(crate) fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Wire connection hand-off to the attempt's terminal events.
    ///
    /// On completion the connection is pooled if keep-alive holds for it, and closed otherwise.
    /// On error it is always closed.
    pub(crate) fn register(&self, ctx: &Arc<RequestContext>) {
        let completed: Weak<RequestContext> = Arc::downgrade(ctx);
        let pool = self.pool.clone();
        ctx.events.subscribe(EventKind::Completed, move |_| {
            let Some(ctx) = completed.upgrade() else {
                return Ok(());
            };
            ctx.set_state(RequestState::Completed);
            trace!(elapsed = ?ctx.created.elapsed(), "request attempt completed");
            if ctx.is_upgrade() {
                trace!("connection handed to upgraded protocol");
                return Ok(());
            }
            if let Some(connection) = ctx.detach() {
                release(&pool, &ctx, connection);
            }
            Ok(())
        });

        let failed: Weak<RequestContext> = Arc::downgrade(ctx);
        let pool = self.pool.clone();
        ctx.events.subscribe(EventKind::Error, move |event| {
            let Some(ctx) = failed.upgrade() else {
                return Ok(());
            };
            ctx.set_state(RequestState::Error);
            if let Event::Error(_, error) = event {
                debug!(destination = %ctx.destination, %error, "request attempt failed");
            }
            if let Some(connection) = ctx.detach() {
                trace!(id = %connection.id(), "discarding connection after error");
                pool.discard(&ctx.destination, connection);
                ctx.events
                    .trigger(Event::ClosedConnection(ctx.destination.clone()));
            }
            Ok(())
        });
    }

    /// Acquire a connection, schedule timeouts and write the request.
    ///
    /// Every failure is reported as an `Error` event on the attempt's scope.
    pub(crate) async fn send(&self, ctx: Arc<RequestContext>) {
        let destination = ctx.destination.clone();
        let events = ctx.events.clone();

        ctx.set_state(RequestState::Connecting);
        events.trigger(Event::Connecting(destination.clone()));

        let connection = match self.checkout(&ctx) {
            Some(connection) => connection,
            None => match self.connect(&ctx).await {
                Ok(connection) => connection,
                Err(error) => {
                    events.trigger(Event::Error(destination, error));
                    return;
                }
            },
        };

        ctx.set_state(RequestState::Connected);
        events.trigger(Event::Connected(destination.clone()));

        if let Err(connection) = ctx.attach(connection) {
            warn!(id = %connection.id(), "attempt already has a connection");
            self.pool.discard(&destination, connection);
            return;
        }

        if events.is_terminated() {
            // Cancelled or timed out while connecting.
            if let Some(connection) = ctx.detach() {
                self.pool.discard(&destination, connection);
                events.trigger(Event::ClosedConnection(destination));
            }
            return;
        }

        let remaining = ctx.remaining();
        if remaining.is_some_and(|remaining| remaining.is_zero()) {
            events.trigger(Event::Error(
                destination,
                Error::Timeout(TimeoutKind::Request),
            ));
            return;
        }
        let _timeouts = Timeouts::schedule(
            &events,
            &destination,
            TimeoutPlan::new(ctx.options.idle_timeout, remaining),
        );

        ctx.set_state(RequestState::Sending);
        let request = ctx.build_request();
        // Notifications raised inside `write` must not run while the connection is locked.
        let notifier = Notifier::held(destination.clone(), events.clone());
        let pending = notifier.clone();
        let write = ctx.with_connection(|connection| connection.write(request, notifier));
        pending.release();
        let Some(write) = write else {
            trace!("connection detached before write");
            return;
        };

        match write.await {
            Ok(()) => {
                ctx.transition(RequestState::Sending, RequestState::AwaitingResponse);
            }
            Err(error) => {
                events.trigger(Event::Error(destination, Error::write(error)));
            }
        }
    }

    fn checkout(&self, ctx: &RequestContext) -> Option<Box<dyn Connection>> {
        if !ctx.options.keep_alive || !self.pool.is_active() {
            return None;
        }
        let connection = self.pool.get(&ctx.destination)?;
        trace!(id = %connection.id(), "reusing pooled connection");
        ctx.events
            .trigger(Event::ReusedConnection(ctx.destination.clone()));
        Some(connection)
    }

    async fn connect(&self, ctx: &RequestContext) -> Result<Box<dyn Connection>, Error> {
        let connect = self.transport.connect(&ctx.destination);
        let result = match self.connect_timeout.filter(|timeout| !timeout.is_zero()) {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::Timeout(TimeoutKind::Connect))?,
            None => connect.await,
        };

        let connection = result.map_err(Error::connect)?;
        trace!(id = %connection.id(), "created connection");
        ctx.events
            .trigger(Event::CreatedConnection(ctx.destination.clone()));
        Ok(connection)
    }
}

fn release(pool: &SharedPool, ctx: &RequestContext, connection: Box<dyn Connection>) {
    let destination = &ctx.destination;
    let pooled = if ctx.keep_alive() && pool.is_active() {
        // A refused offer closes the connection.
        pool.offer(destination, connection)
    } else {
        pool.discard(destination, connection);
        false
    };

    let event = if pooled {
        Event::PooledConnection(destination.clone())
    } else {
        Event::ClosedConnection(destination.clone())
    };
    ctx.events.trigger(event);
}
