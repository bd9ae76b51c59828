//! Growable, append-only buffers of one event kind.
//!
//! A buffer tracks its own logical capacity and doubles it whenever an append
//! would not fit, so growth is deterministic and observable. Growth never
//! panics: a reservation that fails, or that would pass the configured
//! capacity limit, is reported as [`BufferError::Allocation`].

use crate::types::{Event, EventKind};
use thiserror::Error;

/// Largest capacity a buffer may grow to unless configured otherwise.
pub const DEFAULT_CAPACITY_LIMIT: usize = i32::MAX as usize;

/// Errors that can occur while growing an event buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("failed to grow {kind:?} buffer from {capacity} to {requested} events")]
    Allocation {
        kind: EventKind,
        capacity: usize,
        requested: usize,
    },
}

/// An append-only sequence of events of a single kind.
#[derive(Debug, Clone)]
pub struct EventBuffer<E: Event> {
    events: Vec<E>,
    capacity: usize,
    capacity_limit: usize,
    ts_overflow: i32,
}

impl<E: Event> EventBuffer<E> {
    /// Allocates a buffer able to hold `capacity` events without growing.
    ///
    /// `ts_overflow` is the timestamp overflow epoch all events in this buffer
    /// belong to.
    pub fn try_with_capacity(
        capacity: usize,
        capacity_limit: usize,
        ts_overflow: i32,
    ) -> Result<Self, BufferError> {
        let capacity = capacity.max(1);
        let error = BufferError::Allocation {
            kind: E::KIND,
            capacity: 0,
            requested: capacity,
        };

        if capacity > capacity_limit {
            return Err(error);
        }

        let mut events = Vec::new();
        events.try_reserve_exact(capacity).map_err(|_| error)?;

        Ok(Self {
            events,
            capacity,
            capacity_limit,
            ts_overflow,
        })
    }

    /// Allocates a buffer with the default capacity for its kind, clamped to
    /// the capacity limit.
    pub fn try_default(capacity_limit: usize, ts_overflow: i32) -> Result<Self, BufferError> {
        let capacity = E::KIND.default_capacity().min(capacity_limit);
        Self::try_with_capacity(capacity, capacity_limit, ts_overflow)
    }

    /// Makes room for `additional` more events, doubling capacity as needed.
    ///
    /// On failure the buffer and its contents are left untouched.
    pub fn ensure_capacity(&mut self, additional: usize) -> Result<(), BufferError> {
        let needed = self.events.len().saturating_add(additional);
        if needed <= self.capacity {
            return Ok(());
        }

        let mut grown = self.capacity;
        while grown < needed {
            grown = grown.saturating_mul(2);
        }

        let error = BufferError::Allocation {
            kind: E::KIND,
            capacity: self.capacity,
            requested: grown,
        };

        if grown > self.capacity_limit {
            return Err(error);
        }

        self.events
            .try_reserve_exact(grown - self.events.len())
            .map_err(|_| error)?;
        self.capacity = grown;

        Ok(())
    }

    /// Appends one event, growing the buffer first if it is full.
    #[inline]
    pub fn push(&mut self, event: E) -> Result<(), BufferError> {
        self.ensure_capacity(1)?;
        self.events.push(event);
        Ok(())
    }

    /// Number of events written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if no event has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events the buffer can hold before it has to grow.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Timestamp overflow epoch of the events in this buffer.
    #[inline]
    pub fn ts_overflow(&self) -> i32 {
        self.ts_overflow
    }

    /// Moves an empty buffer to a new overflow epoch. Ignored once events
    /// have been written, since those already belong to the old epoch.
    pub fn set_ts_overflow(&mut self, ts_overflow: i32) {
        if self.events.is_empty() {
            self.ts_overflow = ts_overflow;
        }
    }

    /// Returns the event at `index`, if written.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&E> {
        self.events.get(index)
    }

    /// All written events, in append order.
    #[inline]
    pub fn as_slice(&self) -> &[E] {
        &self.events
    }

    /// Iterates over the written events.
    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.events.iter()
    }

    /// Full timestamp of the first event.
    pub fn first_timestamp64(&self) -> Option<i64> {
        self.events
            .first()
            .map(|event| event.timestamp64(self.ts_overflow))
    }

    /// Full timestamp of the last event.
    pub fn last_timestamp64(&self) -> Option<i64> {
        self.events
            .last()
            .map(|event| event.timestamp64(self.ts_overflow))
    }
}

impl<'a, E: Event> IntoIterator for &'a EventBuffer<E> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PolarityEvent;

    fn event(i: u16) -> PolarityEvent {
        PolarityEvent::new(i, i + 1, i % 2 == 0, i as i32)
    }

    #[test]
    fn test_growth_doubles_and_preserves_contents() {
        let mut buffer = EventBuffer::<PolarityEvent>::try_with_capacity(4, 1024, 0).unwrap();
        assert_eq!(buffer.capacity(), 4);

        for i in 0..5 {
            buffer.push(event(i)).unwrap();
        }

        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.len(), 5);
        let expected: Vec<_> = (0..5).map(event).collect();
        assert_eq!(buffer.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_ensure_capacity_multiple_doublings() {
        let mut buffer = EventBuffer::<PolarityEvent>::try_with_capacity(2, 1024, 0).unwrap();
        buffer.ensure_capacity(9).unwrap();
        assert_eq!(buffer.capacity(), 16);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_growth_past_limit_fails_without_side_effects() {
        let mut buffer = EventBuffer::<PolarityEvent>::try_with_capacity(2, 3, 0).unwrap();
        buffer.push(event(0)).unwrap();
        buffer.push(event(1)).unwrap();

        let err = buffer.push(event(2)).unwrap_err();
        assert_eq!(
            err,
            BufferError::Allocation {
                kind: EventKind::Polarity,
                capacity: 2,
                requested: 4,
            }
        );
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.capacity(), 2);
    }

    #[test]
    fn test_initial_capacity_above_limit_is_rejected() {
        assert!(EventBuffer::<PolarityEvent>::try_with_capacity(16, 8, 0).is_err());
    }

    #[test]
    fn test_timestamps_use_overflow_epoch() {
        let mut buffer = EventBuffer::<PolarityEvent>::try_with_capacity(4, 16, 1).unwrap();
        assert_eq!(buffer.first_timestamp64(), None);
        buffer.push(event(3)).unwrap();
        buffer.push(event(7)).unwrap();
        assert_eq!(buffer.first_timestamp64(), Some((1i64 << 31) | 3));
        assert_eq!(buffer.last_timestamp64(), Some((1i64 << 31) | 7));
    }
}
