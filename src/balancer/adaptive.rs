//! Adaptive load balancing: strategy selection by in-flight pressure.
//!
//! Below `low` in-flight requests the cheap cyclic pick suffices; between
//! `low` and `high` the randomised two-choice pick avoids herd effects; at
//! `high` and above the deterministic minimum is worth the scan.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::balancer::least_conn::LeastConn;
use crate::balancer::p2c::PowerOfTwo;
use crate::balancer::round_robin::RoundRobin;
use crate::balancer::{Backend, Balancer, ConnAware, Stoppable};

/// Supervisor over one instance of each child strategy.
///
/// The in-flight counter counts dispatches handed out by `next`; callers
/// that want completion-based pressure call `done` when a request finishes.
pub struct Adaptive {
    rr: RoundRobin,
    lc: LeastConn,
    p2c: PowerOfTwo,
    low: i64,
    high: i64,
    in_flight: AtomicI64,
}

impl Adaptive {
    pub fn new(rr: RoundRobin, lc: LeastConn, p2c: PowerOfTwo, low: i64, high: i64) -> Self {
        Self {
            rr,
            lc,
            p2c,
            low,
            high,
            in_flight: AtomicI64::new(0),
        }
    }

    /// Mark one dispatched request as complete.
    pub fn done(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn set_in_flight(&self, n: i64) {
        self.in_flight.store(n, Ordering::Relaxed);
    }
}

impl Balancer for Adaptive {
    fn next(&self) -> Option<Backend> {
        let current = self.in_flight.load(Ordering::Relaxed);
        let picked = if current < self.low {
            self.rr.next()
        } else if current < self.high {
            self.p2c.next()
        } else {
            self.lc.next()
        };
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        picked
    }

    fn conn_aware(&self) -> Option<&dyn ConnAware> {
        Some(self)
    }

    fn stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }
}

impl ConnAware for Adaptive {
    // Both counting children stay current so whichever strategy is active
    // next sees accurate load.
    fn increase(&self, backend: &Backend) {
        self.lc.increase(backend);
        self.p2c.increase(backend);
    }

    fn decrease(&self, backend: &Backend) {
        self.lc.decrease(backend);
        self.p2c.decrease(backend);
    }
}

impl Stoppable for Adaptive {
    fn stop(&self) {
        self.p2c.stop();
    }
}
