//! Timestamps and the hashed timing wheel used for packet pacing.
//!
//! All engine timestamps are microseconds from a process-wide anchor,
//! read through minstant's calibrated TSC clock so a timestamp costs a
//! few cycles rather than a syscall.

use std::collections::VecDeque;
use std::sync::OnceLock;

use minstant::Instant;

/// Microseconds since the first call in this process.
#[inline]
pub fn now_us() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Hashed timing wheel.
///
/// Time is divided into fixed-width slots; an entry lands in the slot
/// covering its expiry and is handed back when the wheel advances past
/// it. Insertion and expiry are O(1) amortized. The engine parks paced
/// packets here until their departure time matures.
pub struct TimingWheel<T> {
    slots: Vec<VecDeque<(u64, T)>>,
    num_slots: usize,
    slot_width_us: u64,
    current_slot: usize,
    current_ts: u64,
    horizon_us: u64,
    len: usize,
}

impl<T> TimingWheel<T> {
    /// Create a wheel of `num_slots` slots, each `slot_width_us` wide.
    pub fn new(num_slots: usize, slot_width_us: u64) -> Self {
        Self {
            slots: (0..num_slots).map(|_| VecDeque::new()).collect(),
            num_slots,
            slot_width_us,
            current_slot: 0,
            current_ts: 0,
            horizon_us: num_slots as u64 * slot_width_us,
            len: 0,
        }
    }

    /// Wheel sized for packet pacing: 1024 slots of 8 us, ~8 ms horizon.
    pub fn for_pacing() -> Self {
        Self::new(1024, 8)
    }

    /// Set the wheel's epoch.
    pub fn init(&mut self, ts: u64) {
        self.current_ts = ts;
        self.current_slot = 0;
    }

    /// Insert an entry expiring at `expires_at`. Entries at or before the
    /// current time land in the current slot and come back on the next
    /// advance; entries past the horizon land in the last slot.
    pub fn insert(&mut self, expires_at: u64, value: T) {
        let delta = expires_at.saturating_sub(self.current_ts);
        let slots_ahead = ((delta / self.slot_width_us) as usize).min(self.num_slots - 1);
        let slot = (self.current_slot + slots_ahead) % self.num_slots;
        self.slots[slot].push_back((expires_at, value));
        self.len += 1;
    }

    /// Advance to `ts`, appending matured entries to `out`.
    pub fn advance_into(&mut self, ts: u64, out: &mut Vec<T>) {
        if ts <= self.current_ts {
            return;
        }
        let elapsed = ts - self.current_ts;
        let slots_to_advance = ((elapsed / self.slot_width_us) as usize + 1).min(self.num_slots);

        for _ in 0..slots_to_advance {
            let mut remaining = self.slots[self.current_slot].len();
            while remaining > 0 {
                remaining -= 1;
                let (expires_at, value) = self.slots[self.current_slot].pop_front().unwrap();
                if expires_at <= ts {
                    self.len -= 1;
                    out.push(value);
                } else {
                    // Lapped entry that has not matured yet.
                    self.slots[self.current_slot].push_back((expires_at, value));
                }
            }
            self.current_slot = (self.current_slot + 1) % self.num_slots;
        }

        self.current_ts = ts;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
