//! Admission control: back-pressure on how many requests may be in flight.
//!
//! Every request must obtain a slot before any network activity, and holds it across redirects.
//! A slot is represented by a [`Slot`] guard which releases itself exactly once, so the release
//! pairing cannot be broken by the many ways a request can end. A refused acquisition never
//! produces a guard, and so never releases.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::destination::Destination;

/// A policy gating concurrent requests.
pub trait AdmissionControl: fmt::Debug + Send + Sync + 'static {
    /// Try to take a slot for a request to `destination`.
    fn acquire_slot(&self, destination: &Destination) -> bool;

    /// Give back a slot taken by a successful [`AdmissionControl::acquire_slot`].
    fn release_slot(&self, destination: &Destination);

    /// Slots currently held.
    fn in_flight(&self) -> usize;
}

/// How requests are admitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdmissionPolicy {
    /// Every request is admitted.
    #[default]
    Unlimited,

    /// Block the submitting thread until one of `max` slots is free.
    ///
    /// This must never be used from a runtime worker thread: it parks the
    /// calling thread.
    Blocking {
        /// Maximum concurrent requests. Zero is treated as one.
        max: usize,
    },

    /// Refuse requests beyond the configured ceilings, never blocking.
    Reject {
        /// Maximum concurrent requests overall.
        max_total: Option<usize>,
        /// Maximum concurrent requests per destination.
        max_per_host: Option<usize>,
    },
}

impl AdmissionPolicy {
    /// Build the controller for this policy.
    pub fn build(&self) -> Arc<dyn AdmissionControl> {
        match self {
            AdmissionPolicy::Unlimited => Arc::new(Unlimited::default()),
            AdmissionPolicy::Blocking { max } => Arc::new(Blocking::new(*max)),
            AdmissionPolicy::Reject {
                max_total,
                max_per_host,
            } => Arc::new(Reject::new(*max_total, *max_per_host)),
        }
    }
}

/// A held admission slot, released on drop.
pub struct Slot {
    controller: Arc<dyn AdmissionControl>,
    destination: Destination,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&self.destination).finish()
    }
}

impl Slot {
    /// Acquire a slot, or `None` if the controller refused.
    pub fn acquire(controller: &Arc<dyn AdmissionControl>, destination: &Destination) -> Option<Self> {
        controller.acquire_slot(destination).then(|| Slot {
            controller: controller.clone(),
            destination: destination.clone(),
        })
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        trace!(destination = %self.destination, "releasing admission slot");
        self.controller.release_slot(&self.destination);
    }
}

/// Admits everything, counting in-flight requests.
#[derive(Debug, Default)]
pub struct Unlimited {
    in_flight: AtomicUsize,
}

impl AdmissionControl for Unlimited {
    fn acquire_slot(&self, _destination: &Destination) -> bool {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn release_slot(&self, _destination: &Destination) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// A counting semaphore which parks the caller until capacity frees up.
#[derive(Debug)]
pub struct Blocking {
    max: usize,
    held: Mutex<usize>,
    available: Condvar,
}

impl Blocking {
    /// Create a semaphore with `max` slots, at least one.
    pub fn new(max: usize) -> Self {
        if max == 0 {
            warn!("blocking admission with no slots would never admit, allowing one");
        }
        Self {
            max: max.max(1),
            held: Mutex::new(0),
            available: Condvar::new(),
        }
    }
}

impl AdmissionControl for Blocking {
    fn acquire_slot(&self, destination: &Destination) -> bool {
        let mut held = self.held.lock();
        while *held >= self.max {
            trace!(%destination, "waiting for admission slot");
            self.available.wait(&mut held);
        }
        *held += 1;
        true
    }

    fn release_slot(&self, _destination: &Destination) {
        let mut held = self.held.lock();
        *held = held.saturating_sub(1);
        self.available.notify_one();
    }

    fn in_flight(&self) -> usize {
        *self.held.lock()
    }
}

/// Refuses requests once a total or per-host ceiling would be crossed.
#[derive(Debug)]
pub struct Reject {
    max_total: Option<usize>,
    max_per_host: Option<usize>,
    total: AtomicUsize,
    per_host: Mutex<HashMap<Destination, usize>>,
}

impl Reject {
    /// Create a controller with optional total and per-host ceilings.
    pub fn new(max_total: Option<usize>, max_per_host: Option<usize>) -> Self {
        Self {
            max_total,
            max_per_host,
            total: AtomicUsize::new(0),
            per_host: Mutex::new(HashMap::new()),
        }
    }

    fn acquire_total(&self) -> bool {
        match self.max_total {
            None => {
                self.total.fetch_add(1, Ordering::AcqRel);
                true
            }
            Some(max) => self
                .total
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                    (held < max).then_some(held + 1)
                })
                .is_ok(),
        }
    }

    fn acquire_host(&self, destination: &Destination) -> bool {
        let Some(max) = self.max_per_host else {
            return true;
        };
        let mut per_host = self.per_host.lock();
        let held = per_host.entry(destination.clone()).or_default();
        if *held >= max {
            return false;
        }
        *held += 1;
        true
    }
}

impl AdmissionControl for Reject {
    fn acquire_slot(&self, destination: &Destination) -> bool {
        if !self.acquire_total() {
            trace!(%destination, "total admission ceiling reached");
            return false;
        }
        if !self.acquire_host(destination) {
            trace!(%destination, "per-host admission ceiling reached");
            self.total.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn release_slot(&self, destination: &Destination) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        if self.max_per_host.is_some() {
            let mut per_host = self.per_host.lock();
            if let Some(held) = per_host.get_mut(destination) {
                *held = held.saturating_sub(1);
                if *held == 0 {
                    per_host.remove(destination);
                }
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Slot: Send, Sync);

    fn destination(s: &str) -> Destination {
        s.parse().unwrap()
    }

    #[test]
    fn unlimited_counts() {
        let controller = AdmissionPolicy::Unlimited.build();
        let d = destination("http://localhost");
        let a = Slot::acquire(&controller, &d).unwrap();
        let b = Slot::acquire(&controller, &d).unwrap();
        assert_eq!(controller.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(controller.in_flight(), 0);
    }

    #[test]
    fn blocking_without_slots_admits_one() {
        let controller = AdmissionPolicy::Blocking { max: 0 }.build();
        let d = destination("http://localhost");
        let slot = Slot::acquire(&controller, &d).unwrap();
        assert_eq!(controller.in_flight(), 1);
        drop(slot);
        assert_eq!(controller.in_flight(), 0);
    }

    #[test]
    fn reject_total() {
        let controller = AdmissionPolicy::Reject {
            max_total: Some(2),
            max_per_host: None,
        }
        .build();
        let d = destination("http://localhost");

        let a = Slot::acquire(&controller, &d).unwrap();
        let _b = Slot::acquire(&controller, &d).unwrap();
        assert!(Slot::acquire(&controller, &d).is_none());
        assert_eq!(controller.in_flight(), 2, "refusals hold nothing");

        drop(a);
        assert!(Slot::acquire(&controller, &d).is_some());
    }

    #[test]
    fn reject_per_host() {
        let controller = AdmissionPolicy::Reject {
            max_total: Some(10),
            max_per_host: Some(1),
        }
        .build();
        let a = destination("http://a.example");
        let b = destination("http://b.example");

        let _first = Slot::acquire(&controller, &a).unwrap();
        assert!(Slot::acquire(&controller, &a).is_none());
        let _other = Slot::acquire(&controller, &b).unwrap();
        assert_eq!(controller.in_flight(), 2);
    }

    #[test]
    fn blocking_waits_for_release() {
        let controller = AdmissionPolicy::Blocking { max: 1 }.build();
        let d = destination("http://localhost");

        let slot = Slot::acquire(&controller, &d).unwrap();

        let waiter = {
            let controller = controller.clone();
            let d = d.clone();
            std::thread::spawn(move || Slot::acquire(&controller, &d).is_some())
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished(), "second acquire should block");

        drop(slot);
        assert!(waiter.join().unwrap());
        assert_eq!(controller.in_flight(), 0);
    }
}
