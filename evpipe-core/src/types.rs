//! Core event types produced by the acquisition pipeline.
//!
//! Every event carries a 32-bit device timestamp in microseconds. The 64-bit
//! "full" timestamp is obtained by combining it with the overflow epoch of the
//! buffer that holds it, see [`full_timestamp`].

/// Bit position of the overflow epoch inside a 64-bit full timestamp.
pub const TS_OVERFLOW_SHIFT: u32 = 31;

/// Combines an overflow epoch and a 32-bit timestamp into a 64-bit timestamp.
#[inline]
pub fn full_timestamp(ts_overflow: i32, timestamp: i32) -> i64 {
    (((ts_overflow as u64) << TS_OVERFLOW_SHIFT) | (timestamp as u32 as u64)) as i64
}

/// The kinds of typed event buffers a container can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Control and marker events (resets, wraps, external inputs).
    Special,
    /// Brightness change events.
    Polarity,
    /// Intensity images.
    Frame,
    /// Six-axis inertial samples.
    Imu6,
}

impl EventKind {
    /// All kinds, in container slot order.
    pub const ALL: [EventKind; 4] = [
        EventKind::Special,
        EventKind::Polarity,
        EventKind::Frame,
        EventKind::Imu6,
    ];

    /// Number of events a fresh buffer of this kind is sized for.
    pub fn default_capacity(self) -> usize {
        match self {
            EventKind::Special => 128,
            EventKind::Polarity => 8192,
            EventKind::Frame => 4,
            EventKind::Imu6 => 64,
        }
    }

    /// Short lowercase name, used in log messages.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Special => "special",
            EventKind::Polarity => "polarity",
            EventKind::Frame => "frame",
            EventKind::Imu6 => "imu6",
        }
    }
}

/// Implemented by every fixed-layout event record.
pub trait Event: Clone + std::fmt::Debug + Send + 'static {
    /// The buffer kind this event is stored in.
    const KIND: EventKind;

    /// Device timestamp in microseconds.
    fn timestamp(&self) -> i32;

    /// Full 64-bit timestamp, given the overflow epoch of the owning buffer.
    #[inline]
    fn timestamp64(&self, ts_overflow: i32) -> i64 {
        full_timestamp(ts_overflow, self.timestamp())
    }
}

/// A brightness change ("polarity") event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PolarityEvent {
    /// X coordinate of the pixel
    pub x: u16,
    /// Y coordinate of the pixel
    pub y: u16,
    /// `true` for an increase in brightness (ON), `false` for a decrease (OFF)
    pub polarity: bool,
    /// Timestamp in microseconds
    pub timestamp: i32,
}

impl PolarityEvent {
    /// Creates a new polarity event.
    #[inline]
    pub fn new(x: u16, y: u16, polarity: bool, timestamp: i32) -> Self {
        Self {
            x,
            y,
            polarity,
            timestamp,
        }
    }
}

impl Event for PolarityEvent {
    const KIND: EventKind = EventKind::Polarity;

    #[inline]
    fn timestamp(&self) -> i32 {
        self.timestamp
    }
}

/// Sub-types of special events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpecialEventKind {
    /// The 32-bit timestamp itself rolled over; the overflow epoch increased.
    TimestampWrap = 0,
    /// The device reset its timestamp counter to zero.
    TimestampReset = 1,
    /// Rising edge on the external input.
    ExternalInputRisingEdge = 2,
    /// Falling edge on the external input.
    ExternalInputFallingEdge = 3,
    /// Pulse on the external input.
    ExternalInputPulse = 4,
    /// Start of a sensor readout cycle.
    EventReadoutStart = 5,
    /// Rising edge on the external generator output.
    ExternalGeneratorRisingEdge = 6,
    /// Falling edge on the external generator output.
    ExternalGeneratorFallingEdge = 7,
}

/// A special (control/marker) event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SpecialEvent {
    /// Which control event this is
    pub kind: SpecialEventKind,
    /// Optional 32-bit payload, zero when unused
    pub data: u32,
    /// Timestamp in microseconds
    pub timestamp: i32,
}

impl SpecialEvent {
    /// Creates a new special event without payload.
    #[inline]
    pub fn new(kind: SpecialEventKind, timestamp: i32) -> Self {
        Self {
            kind,
            data: 0,
            timestamp,
        }
    }

    /// Creates a new special event carrying a payload.
    #[inline]
    pub fn with_data(kind: SpecialEventKind, data: u32, timestamp: i32) -> Self {
        Self {
            kind,
            data,
            timestamp,
        }
    }

    /// Timestamp reset marker. Carries `i32::MAX` so it sorts after
    /// everything that came before it.
    pub fn timestamp_reset() -> Self {
        Self::new(SpecialEventKind::TimestampReset, i32::MAX)
    }

    /// Timestamp big-wrap marker, stamped with `i32::MAX` in the old epoch.
    pub fn timestamp_wrap() -> Self {
        Self::new(SpecialEventKind::TimestampWrap, i32::MAX)
    }
}

impl Event for SpecialEvent {
    const KIND: EventKind = EventKind::Special;

    #[inline]
    fn timestamp(&self) -> i32 {
        self.timestamp
    }
}

/// A six-axis inertial measurement sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Imu6Event {
    /// Acceleration along X in g
    pub accel_x: f32,
    /// Acceleration along Y in g
    pub accel_y: f32,
    /// Acceleration along Z in g
    pub accel_z: f32,
    /// Angular velocity around X in °/s
    pub gyro_x: f32,
    /// Angular velocity around Y in °/s
    pub gyro_y: f32,
    /// Angular velocity around Z in °/s
    pub gyro_z: f32,
    /// IMU die temperature in °C
    pub temperature: f32,
    /// Timestamp in microseconds, set when the sample is completed
    pub timestamp: i32,
}

impl Event for Imu6Event {
    const KIND: EventKind = EventKind::Imu6;

    #[inline]
    fn timestamp(&self) -> i32 {
        self.timestamp
    }
}

/// One intensity image, read out row by row.
///
/// Four timestamps bracket the readout and the exposure. The event timestamp
/// is the middle of the exposure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameEvent {
    pub width: u16,
    pub height: u16,
    /// Row-major pixel intensities, `width * height` values.
    pub pixels: Vec<u16>,
    pub ts_start_of_frame: i32,
    pub ts_start_of_exposure: i32,
    pub ts_end_of_exposure: i32,
    pub ts_end_of_frame: i32,
}

impl FrameEvent {
    /// Exposure time in microseconds.
    #[inline]
    pub fn exposure_length(&self) -> i32 {
        self.ts_end_of_exposure - self.ts_start_of_exposure
    }

    /// Pixel value at the given position, if inside the frame.
    pub fn pixel(&self, x: u16, y: u16) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(usize::from(y) * usize::from(self.width) + usize::from(x))
            .copied()
    }
}

impl Event for FrameEvent {
    const KIND: EventKind = EventKind::Frame;

    #[inline]
    fn timestamp(&self) -> i32 {
        self.ts_start_of_exposure + self.exposure_length() / 2
    }
}

/// Sensor array geometry used for address range checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorGeometry {
    /// Sensor width in pixels
    pub width: u16,
    /// Sensor height in pixels
    pub height: u16,
}

impl SensorGeometry {
    /// Creates a new geometry.
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Returns `true` if the address lies inside the pixel array.
    #[inline]
    pub fn contains(&self, x: u16, y: u16) -> bool {
        x < self.width && y < self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_timestamp_combines_epoch() {
        assert_eq!(full_timestamp(0, 1234), 1234);
        assert_eq!(full_timestamp(1, 0), 1i64 << 31);
        assert_eq!(full_timestamp(2, 5), (2i64 << 31) | 5);
        // Markers in the old epoch still sort before the first event of the next one.
        assert!(full_timestamp(0, i32::MAX) < full_timestamp(1, 0));
    }

    #[test]
    fn test_frame_timestamp_is_exposure_middle() {
        let frame = FrameEvent {
            width: 2,
            height: 2,
            pixels: vec![1, 2, 3, 4],
            ts_start_of_frame: 90,
            ts_start_of_exposure: 100,
            ts_end_of_exposure: 300,
            ts_end_of_frame: 400,
        };
        assert_eq!(frame.exposure_length(), 200);
        assert_eq!(frame.timestamp(), 200);
        assert_eq!(frame.pixel(0, 1), Some(3));
        assert_eq!(frame.pixel(2, 0), None);
    }

    #[test]
    fn test_geometry_contains() {
        let geometry = SensorGeometry::new(128, 128);
        assert!(geometry.contains(0, 0));
        assert!(geometry.contains(127, 127));
        assert!(!geometry.contains(128, 0));
        assert!(!geometry.contains(0, 128));
    }
}
