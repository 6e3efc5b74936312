//! Admission control for piece requests
//!
//! A connection asks its controller whether another request may be issued
//! and reports every outcome back so the window can adapt.

mod ledbat;

pub use ledbat::LedbatController;

use std::time::{Duration, Instant};

/// Call contract between a download connection and its congestion control
pub trait CongestionController: Send {
    /// Whether another request fits in the window
    fn can_send(&self) -> bool;

    /// A request of `mss` bytes was issued
    fn request(&mut self, now: Instant, mss: u32);

    /// A response arrived for an outstanding request
    fn success(&mut self, now: Instant, mss: u32, sample: Duration);

    /// A response arrived after its request had already timed out
    fn late(&mut self, now: Instant, mss: u32, sample: Duration);

    /// An outstanding request timed out
    fn timeout(&mut self, now: Instant, mss: u32);

    /// Current retransmission timeout
    fn rto(&self) -> Duration;

    /// Most recent queuing delay estimate
    fn queue_delay(&self) -> Duration;

    /// Current window, in the controller's own unit
    fn window(&self) -> u64;

    /// Outstanding amount, in the controller's own unit
    fn in_flight(&self) -> u64;

    /// Net window change since the previous call
    fn take_adjustment(&mut self) -> i64;
}

/// Constant number of outstanding requests
#[derive(Debug, Clone)]
pub struct FixedWindow {
    limit: u64,
    outstanding: u64,
    rto: Duration,
}

impl FixedWindow {
    pub fn new(limit: u64, rto: Duration) -> Self {
        Self {
            limit,
            outstanding: 0,
            rto,
        }
    }
}

impl CongestionController for FixedWindow {
    fn can_send(&self) -> bool {
        self.outstanding < self.limit
    }

    fn request(&mut self, _now: Instant, _mss: u32) {
        self.outstanding += 1;
    }

    fn success(&mut self, _now: Instant, _mss: u32, _sample: Duration) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn late(&mut self, _now: Instant, _mss: u32, _sample: Duration) {}

    fn timeout(&mut self, _now: Instant, _mss: u32) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn rto(&self) -> Duration {
        self.rto
    }

    fn queue_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn window(&self) -> u64 {
        self.limit
    }

    fn in_flight(&self) -> u64 {
        self.outstanding
    }

    fn take_adjustment(&mut self) -> i64 {
        0
    }
}
