//! Container sealing ("commit") policy.
//!
//! The [`ContainerGenerator`] owns the in-progress buffer of every event kind.
//! After each wire unit it checks the commit triggers (size, time, forced)
//! and, when one fires, moves the non-empty buffers into a sealed
//! [`EventContainer`] and hands that to the exchange queue.
//!
//! Timestamp resets get special treatment: whatever accumulated before the
//! reset is sealed first, then the reset marker travels alone in its own
//! container, which is never dropped while acquisition is running.

use crate::buffer::{BufferError, EventBuffer};
use crate::composite::CompositeEvent;
use crate::config::PipelineConfig;
use crate::exchange::ExchangeQueue;
use crate::timestamp::TimestampAuthority;
use crate::types::{
    Event, EventKind, FrameEvent, Imu6Event, PolarityEvent, SpecialEvent, SpecialEventKind,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A sealed batch of event buffers, handed to the consumer as a unit.
///
/// Only non-empty buffers are present. All buffers are final: a container is
/// never visible to the consumer while still being filled.
#[derive(Debug, Clone)]
pub struct EventContainer {
    special: Option<EventBuffer<SpecialEvent>>,
    polarity: Option<EventBuffer<PolarityEvent>>,
    frame: Option<EventBuffer<FrameEvent>>,
    imu6: Option<EventBuffer<Imu6Event>>,
    ts_overflow: i32,
    highest_timestamp: i64,
}

impl EventContainer {
    /// Special events, if any were sealed in this container.
    pub fn special(&self) -> Option<&EventBuffer<SpecialEvent>> {
        self.special.as_ref()
    }

    /// Polarity events, if any were sealed in this container.
    pub fn polarity(&self) -> Option<&EventBuffer<PolarityEvent>> {
        self.polarity.as_ref()
    }

    /// Complete image frames, if any were sealed in this container.
    pub fn frame(&self) -> Option<&EventBuffer<FrameEvent>> {
        self.frame.as_ref()
    }

    /// IMU6 samples, if any were sealed in this container.
    pub fn imu6(&self) -> Option<&EventBuffer<Imu6Event>> {
        self.imu6.as_ref()
    }

    /// Number of events of `kind` in this container.
    pub fn len_of(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Special => self.special.as_ref().map_or(0, EventBuffer::len),
            EventKind::Polarity => self.polarity.as_ref().map_or(0, EventBuffer::len),
            EventKind::Frame => self.frame.as_ref().map_or(0, EventBuffer::len),
            EventKind::Imu6 => self.imu6.as_ref().map_or(0, EventBuffer::len),
        }
    }

    /// Kinds present in this container, in slot order.
    pub fn kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|&kind| self.len_of(kind) > 0)
            .collect()
    }

    /// Total number of events across all buffers.
    pub fn event_count(&self) -> usize {
        EventKind::ALL.into_iter().map(|kind| self.len_of(kind)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.event_count() == 0
    }

    /// Timestamp overflow epoch the sealed buffers were filled in.
    pub fn ts_overflow(&self) -> i32 {
        self.ts_overflow
    }

    /// The most advanced full timestamp seen when the container was sealed.
    pub fn highest_timestamp(&self) -> i64 {
        self.highest_timestamp
    }

    /// Smallest full timestamp among the first events of all buffers.
    pub fn lowest_event_timestamp(&self) -> Option<i64> {
        [
            self.special.as_ref().and_then(EventBuffer::first_timestamp64),
            self.polarity.as_ref().and_then(EventBuffer::first_timestamp64),
            self.frame.as_ref().and_then(EventBuffer::first_timestamp64),
            self.imu6.as_ref().and_then(EventBuffer::first_timestamp64),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Largest full timestamp among the last events of all buffers.
    pub fn highest_event_timestamp(&self) -> Option<i64> {
        [
            self.special.as_ref().and_then(EventBuffer::last_timestamp64),
            self.polarity.as_ref().and_then(EventBuffer::last_timestamp64),
            self.frame.as_ref().and_then(EventBuffer::last_timestamp64),
            self.imu6.as_ref().and_then(EventBuffer::last_timestamp64),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Returns `true` for the dedicated container carrying a timestamp reset.
    pub fn is_timestamp_reset(&self) -> bool {
        self.polarity.is_none()
            && self.frame.is_none()
            && self.imu6.is_none()
            && self.special.as_ref().is_some_and(|special| {
                special.len() == 1
                    && special.as_slice()[0].kind == SpecialEventKind::TimestampReset
            })
    }

    fn timestamp_reset(ts_overflow: i32, highest_timestamp: i64) -> Result<Self, BufferError> {
        let mut special = EventBuffer::try_with_capacity(1, 1, ts_overflow)?;
        special.push(SpecialEvent::timestamp_reset())?;

        Ok(Self {
            special: Some(special),
            polarity: None,
            frame: None,
            imu6: None,
            ts_overflow,
            highest_timestamp,
        })
    }
}

/// Commits that must happen regardless of size and time thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedCommit {
    /// The device reset its timestamp.
    Reset,
    /// The 32-bit timestamp overflowed.
    BigWrap,
}

/// What a commit evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// No trigger fired; buffers keep accumulating.
    Accumulating,
    /// A trigger fired but every buffer was empty, nothing was published.
    Empty,
    /// A container was handed to the queue.
    Published,
    /// The queue was full and the container was dropped.
    Dropped,
    /// Acquisition shut down while the reset container waited for space.
    ResetAbandoned,
}

/// Running totals of commit outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Containers handed to the exchange queue, reset containers included.
    pub published: u64,
    /// Containers dropped because the queue was full.
    pub dropped: u64,
    /// Reset containers lost to a shutdown.
    pub resets_abandoned: u64,
}

impl CommitStats {
    fn record(&mut self, outcome: CommitOutcome) {
        match outcome {
            CommitOutcome::Published => self.published += 1,
            CommitOutcome::Dropped => self.dropped += 1,
            CommitOutcome::ResetAbandoned => self.resets_abandoned += 1,
            CommitOutcome::Accumulating | CommitOutcome::Empty => {}
        }
    }
}

/// Owns the in-progress buffers and decides when to seal them.
#[derive(Debug)]
pub struct ContainerGenerator {
    special: EventBuffer<SpecialEvent>,
    polarity: EventBuffer<PolarityEvent>,
    frame: EventBuffer<FrameEvent>,
    imu6: EventBuffer<Imu6Event>,

    max_events_per_kind: usize,
    max_interval_us: i32,
    capacity_limit: usize,
    stats: CommitStats,

    queue: Arc<ExchangeQueue>,
    running: Arc<AtomicBool>,
    device: String,
}

impl ContainerGenerator {
    /// Creates a generator with fresh, empty buffers for every kind.
    pub fn new(
        config: &PipelineConfig,
        queue: Arc<ExchangeQueue>,
        running: Arc<AtomicBool>,
        device: impl Into<String>,
    ) -> Result<Self, BufferError> {
        let limit = config.buffer_capacity_limit;

        Ok(Self {
            special: EventBuffer::try_default(limit, 0)?,
            polarity: EventBuffer::try_default(limit, 0)?,
            frame: EventBuffer::try_default(limit, 0)?,
            imu6: EventBuffer::try_default(limit, 0)?,
            max_events_per_kind: config.max_events_per_kind,
            max_interval_us: config.max_interval_us,
            capacity_limit: limit,
            stats: CommitStats::default(),
            queue,
            running,
            device: device.into(),
        })
    }

    pub fn special_mut(&mut self) -> &mut EventBuffer<SpecialEvent> {
        &mut self.special
    }

    pub fn polarity_mut(&mut self) -> &mut EventBuffer<PolarityEvent> {
        &mut self.polarity
    }

    /// Appends a completed composite event to the buffer of its kind.
    pub fn push_composite(&mut self, event: CompositeEvent) -> Result<(), BufferError> {
        match event {
            CompositeEvent::Imu6(imu) => self.imu6.push(imu),
            CompositeEvent::Frame(frame) => self.frame.push(frame),
        }
    }

    /// Number of events waiting in the in-progress buffers.
    pub fn pending_events(&self) -> usize {
        EventKind::ALL.into_iter().map(|kind| self.len_of(kind)).sum()
    }

    fn len_of(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Special => self.special.len(),
            EventKind::Polarity => self.polarity.len(),
            EventKind::Frame => self.frame.len(),
            EventKind::Imu6 => self.imu6.len(),
        }
    }

    /// Commit outcomes since creation.
    pub fn stats(&self) -> CommitStats {
        self.stats
    }

    /// Configured interval for the time trigger.
    pub fn max_interval_us(&self) -> i32 {
        self.max_interval_us
    }

    /// Returns `true` if any buffer reached the per-kind event limit.
    pub fn size_trigger(&self) -> bool {
        let max = self.max_events_per_kind;
        max > 0 && EventKind::ALL.into_iter().any(|kind| self.len_of(kind) >= max)
    }

    /// Checks all commit triggers and commits if any fired.
    pub fn evaluate_and_maybe_commit(
        &mut self,
        forced: Option<ForcedCommit>,
        timestamps: &mut TimestampAuthority,
    ) -> Result<CommitOutcome, BufferError> {
        let size_commit = self.size_trigger();
        let time_commit = timestamps.commit_deadline_elapsed();

        if forced.is_none() && !size_commit && !time_commit {
            return Ok(CommitOutcome::Accumulating);
        }

        self.commit(forced, timestamps)
    }

    /// Seals every non-empty buffer into a container and publishes it.
    ///
    /// For a forced reset, the reset container follows the regular one.
    pub fn commit(
        &mut self,
        forced: Option<ForcedCommit>,
        timestamps: &mut TimestampAuthority,
    ) -> Result<CommitOutcome, BufferError> {
        let epoch = timestamps.wrap_overflow();

        // Allocate replacements first, so a failure leaves everything in place.
        let fresh_special = self.fresh_if_used::<SpecialEvent>(self.special.len(), epoch)?;
        let fresh_polarity = self.fresh_if_used::<PolarityEvent>(self.polarity.len(), epoch)?;
        let fresh_frame = self.fresh_if_used::<FrameEvent>(self.frame.len(), epoch)?;
        let fresh_imu6 = self.fresh_if_used::<Imu6Event>(self.imu6.len(), epoch)?;

        let ts_overflow = self.sealed_epoch();
        let container = EventContainer {
            special: fresh_special.map(|fresh| std::mem::replace(&mut self.special, fresh)),
            polarity: fresh_polarity.map(|fresh| std::mem::replace(&mut self.polarity, fresh)),
            frame: fresh_frame.map(|fresh| std::mem::replace(&mut self.frame, fresh)),
            imu6: fresh_imu6.map(|fresh| std::mem::replace(&mut self.imu6, fresh)),
            ts_overflow,
            highest_timestamp: timestamps.full_timestamp(),
        };

        // Buffers that stayed empty must still follow the current epoch.
        self.special.set_ts_overflow(epoch);
        self.polarity.set_ts_overflow(epoch);
        self.frame.set_ts_overflow(epoch);
        self.imu6.set_ts_overflow(epoch);

        timestamps.advance_commit_deadline(self.max_interval_us);

        let mut outcome = if container.is_empty() {
            CommitOutcome::Empty
        } else {
            self.publish(container)
        };
        self.stats.record(outcome);

        if forced == Some(ForcedCommit::Reset) {
            outcome = self.publish_reset(timestamps)?;
            self.stats.record(outcome);
        }

        Ok(outcome)
    }

    fn publish(&self, container: EventContainer) -> CommitOutcome {
        let events = container.event_count();

        match self.queue.try_push(container) {
            Ok(()) => {
                debug!(device = %self.device, events, "Committed event container");
                CommitOutcome::Published
            }
            Err(_dropped) => {
                info!(
                    device = %self.device,
                    events,
                    "Dropped event container because exchange queue is full"
                );
                CommitOutcome::Dropped
            }
        }
    }

    fn publish_reset(
        &self,
        timestamps: &TimestampAuthority,
    ) -> Result<CommitOutcome, BufferError> {
        let container =
            EventContainer::timestamp_reset(timestamps.wrap_overflow(), timestamps.full_timestamp())?;

        match self.queue.blocking_push(container, &self.running) {
            Ok(()) => {
                debug!(device = %self.device, "Committed timestamp reset container");
                Ok(CommitOutcome::Published)
            }
            Err(_abandoned) => {
                warn!(
                    device = %self.device,
                    "Acquisition stopped while waiting to commit timestamp reset, reset container lost"
                );
                Ok(CommitOutcome::ResetAbandoned)
            }
        }
    }

    fn fresh_if_used<E: Event>(
        &self,
        used: usize,
        epoch: i32,
    ) -> Result<Option<EventBuffer<E>>, BufferError> {
        if used == 0 {
            return Ok(None);
        }
        EventBuffer::try_default(self.capacity_limit, epoch).map(Some)
    }

    fn sealed_epoch(&self) -> i32 {
        [
            (self.special.len(), self.special.ts_overflow()),
            (self.polarity.len(), self.polarity.ts_overflow()),
            (self.frame.len(), self.frame.ts_overflow()),
            (self.imu6.len(), self.imu6.ts_overflow()),
        ]
        .into_iter()
        .find(|&(len, _)| len > 0)
        .map_or(self.special.ts_overflow(), |(_, epoch)| epoch)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exchange::QueueNotify;
    use crate::timestamp::MonotonicCheck;

    /// A container with `n` polarity events, used by queue tests.
    pub(crate) fn polarity_container(n: usize) -> EventContainer {
        let mut polarity = EventBuffer::try_with_capacity(n.max(1), 1 << 20, 0).unwrap();
        for i in 0..n {
            polarity
                .push(PolarityEvent::new(i as u16, 0, true, i as i32))
                .unwrap();
        }
        EventContainer {
            special: None,
            polarity: Some(polarity),
            frame: None,
            imu6: None,
            ts_overflow: 0,
            highest_timestamp: n as i64,
        }
    }

    fn generator(config: &PipelineConfig) -> (ContainerGenerator, Arc<ExchangeQueue>) {
        let queue = Arc::new(ExchangeQueue::new(config.queue_capacity, QueueNotify::default()));
        let running = Arc::new(AtomicBool::new(true));
        let generator = ContainerGenerator::new(config, queue.clone(), running, "test").unwrap();
        (generator, queue)
    }

    fn timestamps() -> TimestampAuthority {
        TimestampAuthority::new(0x8000, MonotonicCheck::NonDecreasing, "test")
    }

    #[test]
    fn test_size_trigger_commits_all_kinds() {
        let config = PipelineConfig::default().with_max_events_per_kind(2);
        let (mut generator, queue) = generator(&config);
        let mut ts = timestamps();

        generator
            .special_mut()
            .push(SpecialEvent::new(SpecialEventKind::ExternalInputPulse, 1))
            .unwrap();
        generator.polarity_mut().push(PolarityEvent::new(1, 1, true, 1)).unwrap();
        assert_eq!(
            generator.evaluate_and_maybe_commit(None, &mut ts).unwrap(),
            CommitOutcome::Accumulating
        );

        generator.polarity_mut().push(PolarityEvent::new(2, 2, false, 2)).unwrap();
        assert_eq!(
            generator.evaluate_and_maybe_commit(None, &mut ts).unwrap(),
            CommitOutcome::Published
        );

        let container = queue.pop(false).unwrap();
        assert_eq!(container.kinds(), vec![EventKind::Special, EventKind::Polarity]);
        assert_eq!(container.len_of(EventKind::Polarity), 2);
        assert_eq!(generator.pending_events(), 0);
    }

    #[test]
    fn test_time_trigger_rearms_deadline() {
        let config = PipelineConfig::default().with_max_interval_us(100);
        let (mut generator, queue) = generator(&config);
        let mut ts = timestamps();

        ts.observe(0);
        ts.init_commit_deadline(100);
        generator.polarity_mut().push(PolarityEvent::new(0, 0, true, 0)).unwrap();

        ts.observe(100);
        assert_eq!(
            generator.evaluate_and_maybe_commit(None, &mut ts).unwrap(),
            CommitOutcome::Published
        );
        assert_eq!(ts.commit_deadline(), Some(199));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_commit_is_not_published() {
        let config = PipelineConfig::default().with_max_interval_us(10);
        let (mut generator, queue) = generator(&config);
        let mut ts = timestamps();

        ts.observe(0);
        ts.init_commit_deadline(10);
        ts.observe(50);

        assert_eq!(
            generator.evaluate_and_maybe_commit(None, &mut ts).unwrap(),
            CommitOutcome::Empty
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reset_is_published_alone_after_pending_data() {
        let config = PipelineConfig::default();
        let (mut generator, queue) = generator(&config);
        let mut ts = timestamps();

        generator.polarity_mut().push(PolarityEvent::new(3, 4, true, 7)).unwrap();
        ts.reset();
        generator
            .evaluate_and_maybe_commit(Some(ForcedCommit::Reset), &mut ts)
            .unwrap();

        let data = queue.pop(false).unwrap();
        assert_eq!(data.kinds(), vec![EventKind::Polarity]);
        assert!(!data.is_timestamp_reset());

        let reset = queue.pop(false).unwrap();
        assert!(reset.is_timestamp_reset());
        assert_eq!(reset.kinds(), vec![EventKind::Special]);
        assert!(queue.pop(false).is_none());
    }

    #[test]
    fn test_full_queue_drops_regular_container() {
        let config = PipelineConfig::default()
            .with_queue_capacity(1)
            .with_max_events_per_kind(1);
        let (mut generator, queue) = generator(&config);
        let mut ts = timestamps();

        generator.polarity_mut().push(PolarityEvent::new(1, 1, true, 1)).unwrap();
        generator.evaluate_and_maybe_commit(None, &mut ts).unwrap();
        generator.polarity_mut().push(PolarityEvent::new(2, 2, true, 2)).unwrap();
        assert_eq!(
            generator.evaluate_and_maybe_commit(None, &mut ts).unwrap(),
            CommitOutcome::Dropped
        );

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(false).unwrap().polarity().unwrap().as_slice()[0].x, 1);
        assert_eq!(
            generator.stats(),
            CommitStats {
                published: 1,
                dropped: 1,
                resets_abandoned: 0,
            }
        );
    }

    #[test]
    fn test_empty_buffers_follow_new_epoch_after_big_wrap() {
        let config = PipelineConfig::default();
        let (mut generator, queue) = generator(&config);
        let mut ts = timestamps();

        ts.observe_wrap(0xFFFF);
        assert!(ts.observe_wrap(1).is_big_wrap());
        generator.special_mut().push(SpecialEvent::timestamp_wrap()).unwrap();
        generator
            .evaluate_and_maybe_commit(Some(ForcedCommit::BigWrap), &mut ts)
            .unwrap();

        let wrap = queue.pop(false).unwrap();
        assert_eq!(wrap.ts_overflow(), 0);
        assert_eq!(generator.polarity_mut().ts_overflow(), 1);
        assert_eq!(generator.special_mut().ts_overflow(), 1);
    }

    #[test]
    fn test_frame_is_sealed_in_its_own_buffer() {
        let config = PipelineConfig::default().with_max_events_per_kind(1);
        let (mut generator, queue) = generator(&config);
        let mut ts = timestamps();

        let frame = FrameEvent {
            width: 1,
            height: 1,
            pixels: vec![42],
            ts_start_of_exposure: 10,
            ts_end_of_exposure: 30,
            ..FrameEvent::default()
        };
        generator.push_composite(CompositeEvent::Frame(frame)).unwrap();
        assert_eq!(generator.pending_events(), 1);
        assert_eq!(
            generator.evaluate_and_maybe_commit(None, &mut ts).unwrap(),
            CommitOutcome::Published
        );

        let container = queue.pop(false).unwrap();
        assert_eq!(container.kinds(), vec![EventKind::Frame]);
        assert_eq!(container.frame().unwrap().as_slice()[0].pixels, vec![42]);
        assert_eq!(container.lowest_event_timestamp(), Some(20));
    }
}
