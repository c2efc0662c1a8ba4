//! Idle and total timeouts for a request attempt.
//!
//! Both timers race the attempt's terminal event. The race is settled by the request scope's
//! terminal guard and a shared `done` flag: whichever of "timer fired" and "attempt finished"
//! happens first wins, and the loser becomes a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::destination::Destination;
use crate::error::{Error, TimeoutKind};
use crate::event::{Event, EventChannel, EventKind};

/// Effective timers after normalizing the configured values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutPlan {
    pub(crate) idle: Option<Duration>,
    pub(crate) total: Option<Duration>,
}

impl TimeoutPlan {
    /// Zero disables a timer, and an idle timeout no shorter than the total
    /// timeout is dropped since the total timeout alone covers it.
    pub(crate) fn new(idle: Option<Duration>, total: Option<Duration>) -> Self {
        let total = total.filter(|total| !total.is_zero());
        let idle = idle
            .filter(|idle| !idle.is_zero())
            .filter(|idle| total.map_or(true, |total| *idle < total));
        Self { idle, total }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.idle.is_none() && self.total.is_none()
    }
}

/// The timers scheduled for one request attempt.
pub(crate) struct Timeouts {
    done: AtomicBool,
    last_touch: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Timeouts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeouts")
            .field("done", &self.done.load(Ordering::Relaxed))
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

impl Timeouts {
    /// Schedule the timers of `plan` against a request scope.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn schedule(
        events: &EventChannel,
        destination: &Destination,
        plan: TimeoutPlan,
    ) -> Option<Arc<Self>> {
        if plan.is_empty() {
            return None;
        }

        let timeouts = Arc::new(Timeouts {
            done: AtomicBool::new(false),
            last_touch: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        {
            let timeouts = timeouts.clone();
            events.subscribe_first(&[EventKind::Completed, EventKind::Error], move |_| {
                timeouts.cancel();
                Ok(())
            });
        }

        if let Some(idle) = plan.idle {
            let touched = timeouts.clone();
            events.subscribe_permanently(EventKind::Touch, move |_| {
                touched.touch();
                Ok(())
            });

            let task = tokio::spawn(idle_timer(
                timeouts.clone(),
                events.clone(),
                destination.clone(),
                idle,
            ));
            timeouts.tasks.lock().push(task);
        }

        if let Some(total) = plan.total {
            let task = tokio::spawn(total_timer(
                timeouts.clone(),
                events.clone(),
                destination.clone(),
                total,
            ));
            timeouts.tasks.lock().push(task);
        }

        // The attempt may have finished while the tasks were being spawned.
        if timeouts.done.load(Ordering::Acquire) {
            timeouts.abort();
        }

        trace!(?plan, "timeouts scheduled");
        Some(timeouts)
    }

    fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    fn cancel(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            trace!("timeouts cancelled");
        }
        self.abort();
    }

    fn abort(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn fire(&self, events: &EventChannel, destination: &Destination, kind: TimeoutKind) {
        if self.done.swap(true, Ordering::AcqRel) {
            trace!(%kind, "timer fired after completion, ignoring");
            return;
        }
        debug!(%destination, %kind, "request timed out");
        events.trigger(Event::Error(destination.clone(), Error::Timeout(kind)));
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

async fn total_timer(
    timeouts: Arc<Timeouts>,
    events: EventChannel,
    destination: Destination,
    total: Duration,
) {
    tokio::time::sleep(total).await;
    timeouts.fire(&events, &destination, TimeoutKind::Request);
}

async fn idle_timer(
    timeouts: Arc<Timeouts>,
    events: EventChannel,
    destination: Destination,
    idle: Duration,
) {
    let mut wake = Instant::now() + idle;
    loop {
        tokio::time::sleep_until(wake).await;
        if timeouts.is_done() {
            return;
        }

        let last_touch = *timeouts.last_touch.lock();
        let elapsed = Instant::now().saturating_duration_since(last_touch);
        match idle.checked_sub(elapsed).filter(|remaining| !remaining.is_zero()) {
            None => {
                timeouts.fire(&events, &destination, TimeoutKind::Idle);
                return;
            }
            Some(remaining) => {
                trace!(?remaining, "idle timer re-armed");
                wake = Instant::now() + remaining;
            }
        }
    }
}
