//! Timely congestion control.
//!
//! Timely adjusts a per-session sending rate from the RTT gradient:
//! multiplicative decrease when RTT rises, additive increase otherwise,
//! clamped to `[MIN_RATE, link_rate]`. The rate is enforced by the pacing
//! wheel; when congestion control is disabled the engine sends at line
//! rate and the wheel is bypassed.
//!
//! Reference: Timely: RTT-based Congestion Control for the Datacenter
//! (SIGCOMM 2015).

use std::cell::Cell;

// Timely parameters.
const T_LOW_US: u64 = 50; // below this RTT, increase additively
const T_HIGH_US: u64 = 1000; // above this RTT, decrease multiplicatively
const EWMA_ALPHA: f64 = 0.875; // gradient smoothing
const BETA: f64 = 0.8; // multiplicative decrease factor
const ADD_STEP: f64 = 10e6; // additive increase, bytes/sec
const MIN_RTT_FLOOR_US: u64 = 2;

/// Rate floor: 1 MB/s keeps a stalled session able to probe.
pub const MIN_RATE: f64 = 1e6;

/// Per-session Timely state. Rates are bytes per second.
#[derive(Debug)]
pub struct Timely {
    rate: Cell<f64>,
    link_rate: f64,
    prev_rtt_us: Cell<u64>,
    avg_rtt_diff: Cell<f64>,
    min_rtt_us: Cell<u64>,
    last_update_us: Cell<u64>,
}

impl Timely {
    /// Start at line rate; the first congestion signal brings it down.
    pub fn new(link_rate_gbps: f64) -> Self {
        let link_rate = link_rate_gbps * 1e9 / 8.0;
        Self {
            rate: Cell::new(link_rate),
            link_rate,
            prev_rtt_us: Cell::new(0),
            avg_rtt_diff: Cell::new(0.0),
            min_rtt_us: Cell::new(u64::MAX),
            last_update_us: Cell::new(0),
        }
    }

    /// Current sending rate in bytes per second.
    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate.get()
    }

    /// Current sending rate in Gbit/s, for telemetry.
    #[inline]
    pub fn rate_gbps(&self) -> f64 {
        self.rate.get() * 8.0 / 1e9
    }

    /// Lowest RTT observed on this session.
    #[inline]
    pub fn min_rtt_us(&self) -> u64 {
        self.min_rtt_us.get()
    }

    /// Microseconds a packet of `bytes` occupies at the current rate.
    #[inline]
    pub fn pkt_spacing_us(&self, bytes: usize) -> f64 {
        bytes as f64 * 1e6 / self.rate.get()
    }

    /// Feed one RTT sample. Rate updates are gated to once per observed
    /// RTT; samples inside the gate only refresh the minimum.
    pub fn update(&self, rtt_us: u64, now_us: u64) -> bool {
        if rtt_us < self.min_rtt_us.get() {
            self.min_rtt_us.set(rtt_us);
        }

        let gate = self.prev_rtt_us.get().max(MIN_RTT_FLOOR_US);
        if now_us.saturating_sub(self.last_update_us.get()) < gate {
            return false;
        }
        self.last_update_us.set(now_us);

        let prev_rtt = self.prev_rtt_us.get();
        self.prev_rtt_us.set(rtt_us);
        if prev_rtt == 0 {
            return false;
        }

        let rtt_diff = rtt_us as f64 - prev_rtt as f64;
        let avg_diff = EWMA_ALPHA * self.avg_rtt_diff.get() + (1.0 - EWMA_ALPHA) * rtt_diff;
        self.avg_rtt_diff.set(avg_diff);

        let rate = self.rate.get();
        let new_rate = if rtt_us < T_LOW_US {
            rate + ADD_STEP
        } else if rtt_us > T_HIGH_US {
            rate * (1.0 - BETA * (1.0 - T_HIGH_US as f64 / rtt_us as f64))
        } else {
            let min_rtt = self.min_rtt_us.get().max(MIN_RTT_FLOOR_US);
            let norm_grad = avg_diff / min_rtt as f64;
            if norm_grad <= 0.0 {
                rate + ADD_STEP
            } else {
                rate * (1.0 - BETA * norm_grad.min(1.0))
            }
        };

        self.rate.set(new_rate.clamp(MIN_RATE, self.link_rate));
        true
    }

    /// Drop all learned state, keeping the configured link rate.
    pub fn reset(&self) {
        self.rate.set(self.link_rate);
        self.prev_rtt_us.set(0);
        self.avg_rtt_diff.set(0.0);
        self.min_rtt_us.set(u64::MAX);
        self.last_update_us.set(0);
    }
}
