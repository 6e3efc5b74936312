//! Delay-based window control in the spirit of LEDBAT
//!
//! The window grows while the measured queuing delay stays below the target
//! and shrinks once it rises above it, so piece traffic yields to other
//! flows sharing the path.

use super::CongestionController;
use crate::block::DEFAULT_PIECE_SIZE;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Target queuing delay
pub const TARGET_DELAY: Duration = Duration::from_millis(100);

/// Initial window (4 pieces)
pub const INITIAL_CWND: u64 = 4 * DEFAULT_PIECE_SIZE as u64;

/// Smallest window: one piece may always be outstanding
pub const MIN_CWND: u64 = DEFAULT_PIECE_SIZE as u64;

/// Largest window (16 MB)
pub const MAX_CWND: u64 = 1024 * DEFAULT_PIECE_SIZE as u64;

const INITIAL_RTO: Duration = Duration::from_secs(1);
const MIN_RTO: Duration = Duration::from_millis(200);
const MAX_RTO: Duration = Duration::from_secs(30);

/// How long base delay samples are remembered
const BASE_DELAY_WINDOW: Duration = Duration::from_secs(120);
const BASE_DELAY_SAMPLES: usize = 64;

const GAIN: f64 = 1.0;

/// Delay samples of a sliding time window
#[derive(Debug, Clone)]
struct DelayHistory {
    samples: VecDeque<(Instant, Duration)>,
}

impl DelayHistory {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(BASE_DELAY_SAMPLES),
        }
    }

    fn add_sample(&mut self, now: Instant, delay: Duration) {
        while let Some(&(ts, _)) = self.samples.front() {
            if now.saturating_duration_since(ts) > BASE_DELAY_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        if self.samples.len() >= BASE_DELAY_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((now, delay));
    }

    fn min(&self) -> Option<Duration> {
        self.samples.iter().map(|(_, d)| *d).min()
    }
}

/// Byte-window congestion controller driven by round-trip samples
#[derive(Debug)]
pub struct LedbatController {
    cwnd: u64,
    bytes_in_flight: u64,
    base_delay: DelayHistory,
    queue_delay: Duration,
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    in_slow_start: bool,
    last_decrease: Option<Instant>,
    adjustment: i64,
}

impl Default for LedbatController {
    fn default() -> Self {
        Self::new()
    }
}

impl LedbatController {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_CWND,
            bytes_in_flight: 0,
            base_delay: DelayHistory::new(),
            queue_delay: Duration::ZERO,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: INITIAL_RTO,
            in_slow_start: true,
            last_decrease: None,
            adjustment: 0,
        }
    }

    #[cfg(test)]
    pub fn in_slow_start(&self) -> bool {
        self.in_slow_start
    }

    fn observe(&mut self, now: Instant, sample: Duration) {
        self.update_rtt(sample);
        self.base_delay.add_sample(now, sample);
        let base = self.base_delay.min().unwrap_or(sample);
        self.queue_delay = sample.saturating_sub(base);
    }

    fn set_cwnd(&mut self, cwnd: u64) {
        let cwnd = cwnd.clamp(MIN_CWND, MAX_CWND);
        self.adjustment += cwnd as i64 - self.cwnd as i64;
        self.cwnd = cwnd;
    }

    fn adjust_window(&mut self, bytes_acked: u64) {
        if self.in_slow_start {
            if self.queue_delay < TARGET_DELAY {
                self.set_cwnd(self.cwnd + bytes_acked);
                return;
            }
            self.in_slow_start = false;
        }

        // off_target in [-inf, 1]; cwnd += GAIN * off_target * acked * mss / cwnd
        let target = TARGET_DELAY.as_secs_f64();
        let off_target = (target - self.queue_delay.as_secs_f64()) / target;
        let delta = GAIN * off_target * bytes_acked as f64 * MIN_CWND as f64 / self.cwnd as f64;

        let cwnd = (self.cwnd as f64 + delta).max(0.0) as u64;
        self.set_cwnd(cwnd);
    }

    /// Jacobson/Karels estimate
    fn update_rtt(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                self.rttvar = (self.rttvar * 3 + diff) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }

        if let Some(srtt) = self.srtt {
            self.rto = (srtt + self.rttvar * 4).clamp(MIN_RTO, MAX_RTO);
        }
    }
}

impl CongestionController for LedbatController {
    fn can_send(&self) -> bool {
        self.bytes_in_flight < self.cwnd
    }

    fn request(&mut self, _now: Instant, mss: u32) {
        self.bytes_in_flight += mss as u64;
    }

    fn success(&mut self, now: Instant, mss: u32, sample: Duration) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(mss as u64);
        self.observe(now, sample);
        self.adjust_window(mss as u64);
    }

    fn late(&mut self, now: Instant, _mss: u32, sample: Duration) {
        // The slot was already released by the timeout
        self.observe(now, sample);
    }

    fn timeout(&mut self, now: Instant, mss: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(mss as u64);

        // Shrink at most once per RTO, a burst of timeouts is one loss event
        let recently = self
            .last_decrease
            .is_some_and(|at| now.saturating_duration_since(at) < self.rto);
        if recently {
            return;
        }

        self.in_slow_start = false;
        self.set_cwnd(self.cwnd / 2);
        self.rto = (self.rto * 2).min(MAX_RTO);
        self.last_decrease = Some(now);
    }

    fn rto(&self) -> Duration {
        self.rto
    }

    fn queue_delay(&self) -> Duration {
        self.queue_delay
    }

    fn window(&self) -> u64 {
        self.cwnd
    }

    fn in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn take_adjustment(&mut self) -> i64 {
        std::mem::take(&mut self.adjustment)
    }
}
