//! Device timestamp reconstruction.
//!
//! Devices only send a short tick counter. The [`TimestampAuthority`] expands
//! it into a 32-bit microsecond timestamp using a wrap-add accumulator, and
//! tracks how many times that 32-bit value itself overflowed (the overflow
//! epoch). It also holds the pending container commit deadline, since that
//! deadline is expressed in the same time base.

use crate::types::full_timestamp;
use tracing::warn;

/// How strictly successive timestamps are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonotonicCheck {
    /// Every update must move time forward. For devices that send one
    /// timestamp unit per tick.
    Strict,
    /// Equal timestamps are fine. For devices that stamp every event.
    NonDecreasing,
}

/// Result of applying a wrap marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapOutcome {
    /// The accumulator moved forward; carries the new current timestamp.
    Wrapped(i32),
    /// The 32-bit timestamp overflowed; carries the new current timestamp
    /// (the remainder after the overflow).
    BigWrap(i32),
}

impl WrapOutcome {
    /// The timestamp after the wrap was applied.
    pub fn timestamp(self) -> i32 {
        match self {
            WrapOutcome::Wrapped(ts) | WrapOutcome::BigWrap(ts) => ts,
        }
    }

    /// Returns `true` for a 32-bit overflow.
    pub fn is_big_wrap(self) -> bool {
        matches!(self, WrapOutcome::BigWrap(_))
    }
}

/// Tracks the running device time for one acquisition.
#[derive(Debug, Clone)]
pub struct TimestampAuthority {
    wrap_unit: i32,
    check: MonotonicCheck,
    device: String,

    current: i32,
    last: i32,
    wrap_add: i32,
    wrap_overflow: i32,

    commit_deadline: Option<i64>,
}

impl TimestampAuthority {
    /// Creates an authority for a device whose tick counter wraps every
    /// `wrap_unit` microseconds.
    pub fn new(wrap_unit: i32, check: MonotonicCheck, device: impl Into<String>) -> Self {
        Self {
            wrap_unit,
            check,
            device: device.into(),
            current: 0,
            last: 0,
            wrap_add: 0,
            wrap_overflow: 0,
            commit_deadline: None,
        }
    }

    /// Expands a raw device tick into the current 32-bit timestamp.
    pub fn observe(&mut self, tick: u32) -> i32 {
        let tick = i32::try_from(tick).unwrap_or(i32::MAX);

        self.last = self.current;
        self.current = self.wrap_add.saturating_add(tick);
        self.check_monotonic();

        self.current
    }

    /// Applies a wrap marker worth `multiplier` wrap units.
    ///
    /// If the accumulated value would pass `i32::MAX`, the overflow epoch is
    /// incremented and the accumulator restarts from the remainder.
    pub fn observe_wrap(&mut self, multiplier: u32) -> WrapOutcome {
        let jump = i64::from(self.wrap_unit) * i64::from(multiplier);
        let sum = i64::from(self.wrap_add) + jump;

        if sum > i64::from(i32::MAX) {
            // Jumps larger than one full 32-bit period only keep their remainder.
            let remainder = ((sum - i64::from(i32::MAX) - 1) % (1i64 << 31)) as i32;

            self.wrap_add = remainder;
            self.last = remainder;
            self.current = remainder;
            self.wrap_overflow += 1;

            return WrapOutcome::BigWrap(remainder);
        }

        self.wrap_add = sum as i32;
        self.last = self.current;
        self.current = self.wrap_add;
        self.check_monotonic();

        WrapOutcome::Wrapped(self.current)
    }

    /// Zeroes all time state, as requested by a device timestamp reset.
    ///
    /// The commit deadline is cleared too; the next deadline is armed from
    /// the new time origin.
    pub fn reset(&mut self) {
        self.current = 0;
        self.last = 0;
        self.wrap_add = 0;
        self.wrap_overflow = 0;
        self.commit_deadline = None;
    }

    /// Current 32-bit timestamp.
    #[inline]
    pub fn current(&self) -> i32 {
        self.current
    }

    /// Timestamp before the last update.
    #[inline]
    pub fn last(&self) -> i32 {
        self.last
    }

    /// Current wrap-add accumulator.
    #[inline]
    pub fn wrap_add(&self) -> i32 {
        self.wrap_add
    }

    /// Number of 32-bit overflows since start or the last reset.
    #[inline]
    pub fn wrap_overflow(&self) -> i32 {
        self.wrap_overflow
    }

    /// The 64-bit timestamp: overflow epoch combined with current timestamp.
    #[inline]
    pub fn full_timestamp(&self) -> i64 {
        full_timestamp(self.wrap_overflow, self.current)
    }

    /// Pending commit deadline, if armed.
    #[inline]
    pub fn commit_deadline(&self) -> Option<i64> {
        self.commit_deadline
    }

    /// Arms the commit deadline one interval after the current timestamp,
    /// unless it is already armed.
    pub fn init_commit_deadline(&mut self, interval: i32) {
        if self.commit_deadline.is_none() {
            self.commit_deadline =
                Some(i64::from(self.current) + i64::from(interval.max(1)) - 1);
        }
    }

    /// Disarms the commit deadline.
    pub fn clear_commit_deadline(&mut self) {
        self.commit_deadline = None;
    }

    /// Returns `true` if the full timestamp has passed the armed deadline.
    #[inline]
    pub fn commit_deadline_elapsed(&self) -> bool {
        self.commit_deadline
            .is_some_and(|deadline| self.full_timestamp() > deadline)
    }

    /// Moves an armed deadline forward by whole intervals until it is no
    /// longer behind the full timestamp.
    pub fn advance_commit_deadline(&mut self, interval: i32) {
        let interval = i64::from(interval.max(1));
        let now = self.full_timestamp();

        if let Some(deadline) = self.commit_deadline.as_mut() {
            if now > *deadline {
                let steps = (now - *deadline + interval - 1) / interval;
                *deadline += steps * interval;
            }
        }
    }

    fn check_monotonic(&self) {
        let violated = match self.check {
            MonotonicCheck::Strict => self.current <= self.last,
            MonotonicCheck::NonDecreasing => self.current < self.last,
        };

        if violated {
            warn!(
                device = %self.device,
                last = self.last,
                current = self.current,
                difference = i64::from(self.last) - i64::from(self.current),
                "Timestamps: non monotonic timestamp detected"
            );
        }
    }
}
