//! Device-independent stream decoder.
//!
//! A [`DeviceDecoder`] knows the bit layout of one device family and turns
//! each wire unit into a handful of [`SemanticCode`]s. The [`StreamDecoder`]
//! applies those codes to the shared machinery: it advances the
//! [`TimestampAuthority`], appends events to the in-progress buffers and asks
//! the [`ContainerGenerator`] whether to commit after every unit.

use crate::buffer::BufferError;
use crate::composite::{CompositeCode, CompositeOutcome};
use crate::config::PipelineConfig;
use crate::container::{CommitOutcome, CommitStats, ContainerGenerator, ForcedCommit};
use crate::exchange::ExchangeQueue;
use crate::timestamp::{MonotonicCheck, TimestampAuthority, WrapOutcome};
use crate::types::{PolarityEvent, SensorGeometry, SpecialEvent, SpecialEventKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that abort the decoding of one transport buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("event buffer allocation failed: {0}")]
    Allocation(#[from] BufferError),
}

/// The meaning of one wire unit, independent of its bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticCode {
    /// Raw device tick, expanded by the timestamp authority.
    Timestamp(u32),
    /// Timestamp wrap marker worth `multiplier` wrap units.
    TimestampWrap(u32),
    /// Device timestamp reset.
    TimestampReset,
    /// A single brightness change.
    Polarity { x: u16, y: u16, polarity: bool },
    /// Up to eight brightness changes in one column, one per set mask bit,
    /// at rows `y_base + bit`.
    PolarityGroup {
        x: u16,
        y_base: u16,
        mask: u8,
        polarity: bool,
    },
    /// A control event stamped with the current timestamp.
    Special { kind: SpecialEventKind, data: u32 },
    /// A step of a multi-unit event.
    Composite(CompositeCode),
}

/// Bit-layout knowledge for one device family.
///
/// Implementations hold whatever per-device state the layout needs (last
/// column address, composite scratch records) but never touch buffers,
/// timestamps or the exchange queue.
pub trait DeviceDecoder: Send + 'static {
    /// Device name used in log messages.
    fn name(&self) -> &str;

    /// Size of one wire unit in bytes.
    fn unit_width(&self) -> usize;

    /// Microseconds added to the timestamp per wrap marker unit.
    fn timestamp_wrap_unit(&self) -> i32;

    fn monotonic_check(&self) -> MonotonicCheck;

    /// Pixel array size used for address range checks.
    fn geometry(&self) -> SensorGeometry;

    /// Classifies one wire unit of exactly [`unit_width`](Self::unit_width)
    /// bytes, appending its codes in application order.
    fn classify_unit(&mut self, unit: &[u8], codes: &mut Vec<SemanticCode>);

    /// Applies a composite step. `timestamp` is the current device time,
    /// used to stamp completed events.
    fn decode_composite(&mut self, code: CompositeCode, timestamp: i32) -> CompositeOutcome {
        let _ = (code, timestamp);
        CompositeOutcome::Ignored
    }

    /// Drops every in-progress composite record and ignores composite data
    /// until the next begin marker.
    fn invalidate_composites(&mut self) {}
}

/// Turns raw transport buffers into sealed event containers.
pub struct StreamDecoder<D: DeviceDecoder> {
    device: D,
    timestamps: TimestampAuthority,
    generator: ContainerGenerator,
    running: Arc<AtomicBool>,
    codes: Vec<SemanticCode>,
}

impl<D: DeviceDecoder> StreamDecoder<D> {
    /// Creates a decoder publishing into `queue` while `running` is set.
    pub fn new(
        device: D,
        config: &PipelineConfig,
        queue: Arc<ExchangeQueue>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, DecodeError> {
        let timestamps = TimestampAuthority::new(
            device.timestamp_wrap_unit(),
            device.monotonic_check(),
            device.name(),
        );
        let generator = ContainerGenerator::new(config, queue, running.clone(), device.name())?;

        Ok(Self {
            device,
            timestamps,
            generator,
            running,
            codes: Vec::with_capacity(8),
        })
    }

    /// Decodes one transport buffer.
    ///
    /// Does nothing once acquisition stopped. A trailing partial unit is
    /// dropped with a warning. On allocation failure the rest of the buffer
    /// is abandoned; events appended before the failure stay in place.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let width = self.device.unit_width().max(1);
        let aligned = bytes.len() - bytes.len() % width;
        if aligned != bytes.len() {
            warn!(
                device = %self.device.name(),
                length = bytes.len(),
                unit_width = width,
                "Read length is not a multiple of the unit width, truncating to {} bytes",
                aligned
            );
        }

        let mut codes = std::mem::take(&mut self.codes);
        let result = self.decode_units(&bytes[..aligned], width, &mut codes);
        self.codes = codes;

        if let Err(DecodeError::Allocation(err)) = &result {
            error!(
                device = %self.device.name(),
                error = %err,
                "Failed to grow event buffer, abandoning transfer buffer"
            );
        }
        result
    }

    /// Seals whatever has accumulated, regardless of commit triggers.
    pub fn flush(&mut self) -> Result<CommitOutcome, DecodeError> {
        if self.generator.pending_events() == 0 {
            return Ok(CommitOutcome::Empty);
        }
        Ok(self.generator.commit(None, &mut self.timestamps)?)
    }

    pub fn timestamps(&self) -> &TimestampAuthority {
        &self.timestamps
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Commit outcomes so far.
    pub fn commit_stats(&self) -> CommitStats {
        self.generator.stats()
    }

    /// Number of events waiting for the next commit.
    pub fn pending_events(&self) -> usize {
        self.generator.pending_events()
    }

    fn decode_units(
        &mut self,
        bytes: &[u8],
        width: usize,
        codes: &mut Vec<SemanticCode>,
    ) -> Result<(), DecodeError> {
        for unit in bytes.chunks_exact(width) {
            codes.clear();
            self.device.classify_unit(unit, codes);

            let mut forced = None;
            for &code in codes.iter() {
                if let Some(commit) = self.apply(code)? {
                    // A reset outranks a big wrap seen in the same unit.
                    if forced != Some(ForcedCommit::Reset) {
                        forced = Some(commit);
                    }
                }
            }

            let outcome = self
                .generator
                .evaluate_and_maybe_commit(forced, &mut self.timestamps)?;

            if forced.is_some() {
                self.device.invalidate_composites();
            }

            if outcome == CommitOutcome::ResetAbandoned {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Applies one code. Returns the forced commit it requires, if any.
    fn apply(&mut self, code: SemanticCode) -> Result<Option<ForcedCommit>, DecodeError> {
        let interval = self.generator.max_interval_us();

        match code {
            SemanticCode::Timestamp(tick) => {
                self.timestamps.observe(tick);
                self.timestamps.init_commit_deadline(interval);
            }

            SemanticCode::TimestampWrap(multiplier) => match self.timestamps.observe_wrap(multiplier) {
                WrapOutcome::BigWrap(_) => {
                    debug!(
                        device = %self.device.name(),
                        overflow = self.timestamps.wrap_overflow(),
                        "Timestamp big wrap detected"
                    );
                    self.generator
                        .special_mut()
                        .push(SpecialEvent::timestamp_wrap())?;
                    return Ok(Some(ForcedCommit::BigWrap));
                }
                WrapOutcome::Wrapped(_) => {
                    self.timestamps.init_commit_deadline(interval);
                }
            },

            SemanticCode::TimestampReset => {
                info!(device = %self.device.name(), "Timestamp reset event received");
                self.timestamps.reset();
                self.timestamps.init_commit_deadline(interval);
                return Ok(Some(ForcedCommit::Reset));
            }

            SemanticCode::Polarity { x, y, polarity } => {
                if self.in_range(x, y) {
                    let timestamp = self.timestamps.current();
                    self.generator
                        .polarity_mut()
                        .push(PolarityEvent::new(x, y, polarity, timestamp))?;
                }
            }

            SemanticCode::PolarityGroup {
                x,
                y_base,
                mask,
                polarity,
            } => {
                self.generator.polarity_mut().ensure_capacity(8)?;
                let timestamp = self.timestamps.current();

                for bit in 0..8u16 {
                    if mask & (1 << bit) == 0 {
                        continue;
                    }
                    let y = y_base.saturating_add(bit);
                    if self.in_range(x, y) {
                        self.generator
                            .polarity_mut()
                            .push(PolarityEvent::new(x, y, polarity, timestamp))?;
                    }
                }
            }

            SemanticCode::Special { kind, data } => {
                debug!(device = %self.device.name(), kind = ?kind, "Special event received");
                let timestamp = self.timestamps.current();
                self.generator
                    .special_mut()
                    .push(SpecialEvent::with_data(kind, data, timestamp))?;
            }

            SemanticCode::Composite(composite) => {
                let timestamp = self.timestamps.current();
                match self.device.decode_composite(composite, timestamp) {
                    CompositeOutcome::Complete(event) => {
                        self.generator.push_composite(event)?;
                    }
                    CompositeOutcome::Mismatch { count, expected } => {
                        info!(
                            device = %self.device.name(),
                            count,
                            expected,
                            kind = composite.kind.event_kind().name(),
                            "Composite end: failed to validate sample count, discarding samples"
                        );
                    }
                    CompositeOutcome::Pending | CompositeOutcome::Ignored => {}
                }
            }
        }

        Ok(None)
    }

    fn in_range(&self, x: u16, y: u16) -> bool {
        let geometry = self.device.geometry();
        if geometry.contains(x, y) {
            return true;
        }

        warn!(
            device = %self.device.name(),
            x,
            y,
            width = geometry.width,
            height = geometry.height,
            "DVS: address out of range, skipping event"
        );
        false
    }
}

impl<D: DeviceDecoder + std::fmt::Debug> std::fmt::Debug for StreamDecoder<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("device", &self.device)
            .field("timestamps", &self.timestamps)
            .field("pending_events", &self.generator.pending_events())
            .finish()
    }
}
