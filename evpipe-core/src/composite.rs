//! Private scratch state for events assembled from several wire units.
//!
//! A composite event is filled field by field into a private record and only
//! handed out once its end marker arrives with the expected number of fields.
//! Until a begin marker is seen, data units are ignored: this keeps a sample
//! that started before a reset or big wrap from being completed on the wrong
//! time basis.

use crate::types::{EventKind, FrameEvent, Imu6Event, SensorGeometry};

/// Composite event kinds a device can assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKind {
    /// Six-axis inertial sample.
    Imu6,
    /// Intensity image.
    Frame,
}

impl CompositeKind {
    /// The buffer kind completed events of this composite are stored in.
    pub fn event_kind(self) -> EventKind {
        match self {
            CompositeKind::Imu6 => EventKind::Imu6,
            CompositeKind::Frame => EventKind::Frame,
        }
    }
}

/// One step of a composite sequence, as classified from a wire unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeStep {
    /// Start a new record, clearing any previous scratch state.
    Begin,
    /// One byte of payload.
    Data(u8),
    /// Configuration that shapes how the following payload is read.
    Config(u16),
    /// One pixel sample of an image, in readout order.
    Sample(u16),
    /// The sensor started exposing the image being read out.
    ExposureStart,
    /// The sensor stopped exposing the image being read out.
    ExposureEnd,
    /// Close the record and publish it if complete.
    End,
}

/// A composite wire unit: which composite it belongs to and what it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeCode {
    pub kind: CompositeKind,
    pub step: CompositeStep,
}

impl CompositeCode {
    pub fn new(kind: CompositeKind, step: CompositeStep) -> Self {
        Self { kind, step }
    }
}

/// A completed composite event, ready to be appended to its buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositeEvent {
    Imu6(Imu6Event),
    Frame(FrameEvent),
}

/// What happened when a composite unit was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositeOutcome {
    /// The unit was absorbed into the scratch record.
    Pending,
    /// No begin marker was seen since the last invalidation; unit dropped.
    Ignored,
    /// The record was closed with all of its fields present.
    Complete(CompositeEvent),
    /// The record was closed with the wrong number of fields and discarded.
    Mismatch { count: u32, expected: u32 },
}

/// Implemented by records that can be stamped when they are completed.
pub trait Stamp {
    fn stamp(&mut self, timestamp: i32);
}

impl Stamp for Imu6Event {
    fn stamp(&mut self, timestamp: i32) {
        self.timestamp = timestamp;
    }
}

/// In-progress state for one composite kind.
#[derive(Debug, Clone)]
pub struct CompositeScratch<E> {
    event: E,
    count: u8,
    ignore: bool,
}

impl<E: Default + Clone + Stamp> Default for CompositeScratch<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Default + Clone + Stamp> CompositeScratch<E> {
    /// Creates scratch state that ignores data until the first begin marker.
    pub fn new() -> Self {
        Self {
            event: E::default(),
            count: 0,
            ignore: true,
        }
    }

    /// Starts a new record.
    pub fn begin(&mut self) {
        self.ignore = false;
        self.count = 0;
        self.event = E::default();
    }

    /// Drops the in-progress record and ignores data until the next begin.
    pub fn invalidate(&mut self) {
        self.ignore = true;
        self.count = 0;
        self.event = E::default();
    }

    #[inline]
    pub fn is_ignoring(&self) -> bool {
        self.ignore
    }

    /// Number of fields consumed so far.
    #[inline]
    pub fn count(&self) -> u8 {
        self.count
    }

    /// Jumps the field counter, used when the payload layout skips fields.
    #[inline]
    pub fn set_count(&mut self, count: u8) {
        self.count = count;
    }

    /// Advances the field counter by `fields`.
    #[inline]
    pub fn advance(&mut self, fields: u8) {
        self.count = self.count.saturating_add(fields);
    }

    #[inline]
    pub fn event_mut(&mut self) -> &mut E {
        &mut self.event
    }

    /// Closes the record. Returns a stamped copy if exactly `expected` fields
    /// were consumed.
    pub fn finish(&mut self, expected: u8, timestamp: i32) -> Result<E, u8> {
        if self.count != expected {
            return Err(self.count);
        }

        let mut event = self.event.clone();
        event.stamp(timestamp);
        Ok(event)
    }
}

/// In-progress state for an image frame.
///
/// Samples are collected between a begin and an end marker; the frame is
/// published only if exactly one sample per pixel arrived. After an end
/// marker, or an invalidation, samples are ignored until the next begin.
#[derive(Debug, Clone)]
pub struct FrameScratch {
    geometry: SensorGeometry,
    frame: FrameEvent,
    samples: u32,
    ignore: bool,
}

impl FrameScratch {
    pub fn new(geometry: SensorGeometry) -> Self {
        Self {
            geometry,
            frame: FrameEvent::default(),
            samples: 0,
            ignore: true,
        }
    }

    #[inline]
    pub fn is_ignoring(&self) -> bool {
        self.ignore
    }

    /// Number of pixels a complete frame has.
    pub fn expected_samples(&self) -> u32 {
        u32::from(self.geometry.width) * u32::from(self.geometry.height)
    }

    /// Drops the in-progress frame and ignores data until the next begin.
    pub fn invalidate(&mut self) {
        self.ignore = true;
        self.samples = 0;
        self.frame = FrameEvent::default();
    }

    /// Applies one step. `timestamp` is the current device time.
    pub fn apply(&mut self, step: CompositeStep, timestamp: i32) -> CompositeOutcome {
        if step == CompositeStep::Begin {
            self.begin(timestamp);
            return CompositeOutcome::Pending;
        }

        if self.ignore {
            return CompositeOutcome::Ignored;
        }

        match step {
            CompositeStep::Begin => CompositeOutcome::Pending,
            CompositeStep::ExposureStart => {
                self.frame.ts_start_of_exposure = timestamp;
                CompositeOutcome::Pending
            }
            CompositeStep::ExposureEnd => {
                self.frame.ts_end_of_exposure = timestamp;
                CompositeOutcome::Pending
            }
            CompositeStep::Sample(value) => {
                // Extra samples are only counted, so the end marker reports them.
                if self.samples < self.expected_samples() {
                    self.frame.pixels.push(value);
                }
                self.samples = self.samples.saturating_add(1);
                CompositeOutcome::Pending
            }
            CompositeStep::Data(_) | CompositeStep::Config(_) => CompositeOutcome::Ignored,
            CompositeStep::End => self.finish(timestamp),
        }
    }

    fn begin(&mut self, timestamp: i32) {
        let pixels = self.expected_samples() as usize;

        self.ignore = false;
        self.samples = 0;
        self.frame = FrameEvent {
            width: self.geometry.width,
            height: self.geometry.height,
            pixels: Vec::with_capacity(pixels),
            ts_start_of_frame: timestamp,
            ..FrameEvent::default()
        };
    }

    fn finish(&mut self, timestamp: i32) -> CompositeOutcome {
        let expected = self.expected_samples();
        let count = self.samples;
        let mut frame = std::mem::take(&mut self.frame);
        self.invalidate();

        if count != expected {
            return CompositeOutcome::Mismatch { count, expected };
        }

        frame.ts_end_of_frame = timestamp;
        CompositeOutcome::Complete(CompositeEvent::Frame(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(scratch: &mut FrameScratch, steps: &[CompositeStep], timestamp: i32) -> CompositeOutcome {
        let mut outcome = CompositeOutcome::Pending;
        for &step in steps {
            outcome = scratch.apply(step, timestamp);
        }
        outcome
    }

    #[test]
    fn test_scratch_starts_ignoring() {
        let scratch = CompositeScratch::<Imu6Event>::new();
        assert!(scratch.is_ignoring());
        assert_eq!(scratch.count(), 0);
    }

    #[test]
    fn test_finish_requires_expected_count() {
        let mut scratch = CompositeScratch::<Imu6Event>::new();
        scratch.begin();
        scratch.event_mut().accel_x = 1.5;
        scratch.advance(3);

        assert_eq!(scratch.finish(4, 10), Err(3));

        scratch.advance(1);
        let event = scratch.finish(4, 10).unwrap();
        assert_eq!(event.accel_x, 1.5);
        assert_eq!(event.timestamp, 10);
    }

    #[test]
    fn test_invalidate_clears_record() {
        let mut scratch = CompositeScratch::<Imu6Event>::new();
        scratch.begin();
        scratch.event_mut().gyro_z = 3.0;
        scratch.advance(5);
        scratch.invalidate();

        assert!(scratch.is_ignoring());
        assert_eq!(scratch.count(), 0);
        scratch.begin();
        assert_eq!(scratch.event_mut().gyro_z, 0.0);
    }

    #[test]
    fn test_frame_collects_all_pixels() {
        let mut scratch = FrameScratch::new(SensorGeometry::new(2, 2));

        feed(&mut scratch, &[CompositeStep::Begin], 10);
        feed(&mut scratch, &[CompositeStep::ExposureStart], 20);
        feed(&mut scratch, &[CompositeStep::ExposureEnd], 60);
        let samples: Vec<_> = (1..=4).map(CompositeStep::Sample).collect();
        feed(&mut scratch, &samples, 70);

        let CompositeOutcome::Complete(CompositeEvent::Frame(frame)) =
            scratch.apply(CompositeStep::End, 80)
        else {
            panic!("expected a complete frame");
        };
        assert_eq!(frame.pixels, vec![1, 2, 3, 4]);
        assert_eq!(frame.ts_start_of_frame, 10);
        assert_eq!(frame.ts_start_of_exposure, 20);
        assert_eq!(frame.ts_end_of_exposure, 60);
        assert_eq!(frame.ts_end_of_frame, 80);
        assert!(scratch.is_ignoring());
    }

    #[test]
    fn test_frame_with_wrong_pixel_count_is_dropped() {
        let mut scratch = FrameScratch::new(SensorGeometry::new(2, 2));

        let short = [
            CompositeStep::Begin,
            CompositeStep::Sample(1),
            CompositeStep::Sample(2),
            CompositeStep::End,
        ];
        assert_eq!(
            feed(&mut scratch, &short, 0),
            CompositeOutcome::Mismatch {
                count: 2,
                expected: 4
            }
        );

        let mut long = vec![CompositeStep::Begin];
        long.extend((0..5).map(CompositeStep::Sample));
        long.push(CompositeStep::End);
        assert_eq!(
            feed(&mut scratch, &long, 0),
            CompositeOutcome::Mismatch {
                count: 5,
                expected: 4
            }
        );
    }

    #[test]
    fn test_frame_samples_ignored_until_begin() {
        let mut scratch = FrameScratch::new(SensorGeometry::new(1, 1));
        assert!(scratch.is_ignoring());
        assert_eq!(
            scratch.apply(CompositeStep::Sample(9), 0),
            CompositeOutcome::Ignored
        );

        scratch.apply(CompositeStep::Begin, 0);
        scratch.apply(CompositeStep::Sample(9), 0);
        scratch.invalidate();
        assert_eq!(scratch.apply(CompositeStep::End, 0), CompositeOutcome::Ignored);
    }
}
