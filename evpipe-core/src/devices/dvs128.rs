//! DVS128 wire format.
//!
//! Every unit is four bytes: a little-endian address word followed by a
//! little-endian timestamp word. The two top bits of the last byte mark
//! timestamp wraps and resets instead of events.

use crate::decoder::{DeviceDecoder, SemanticCode};
use crate::timestamp::MonotonicCheck;
use crate::types::{SensorGeometry, SpecialEventKind};
use byteorder::{ByteOrder, LittleEndian};

/// Bytes per wire unit.
pub const UNIT_WIDTH: usize = 4;

/// Microseconds added per timestamp wrap (14-bit tick counter).
pub const TS_WRAP_ADD: i32 = 0x4000;

/// Pixel array side length.
pub const ARRAY_SIZE: u16 = 128;

const TIMESTAMP_WRAP_MASK: u8 = 0x80;
const TIMESTAMP_RESET_MASK: u8 = 0x40;
const SYNC_EVENT_MASK: u16 = 0x8000;
const POLARITY_MASK: u16 = 0x0001;
const X_ADDR_SHIFT: u16 = 1;
const X_ADDR_MASK: u16 = 0x007F;
const Y_ADDR_SHIFT: u16 = 8;
const Y_ADDR_MASK: u16 = 0x007F;

/// Decoder for the DVS128 event stream.
#[derive(Debug, Clone, Default)]
pub struct Dvs128Decoder;

impl Dvs128Decoder {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDecoder for Dvs128Decoder {
    fn name(&self) -> &str {
        "DVS128"
    }

    fn unit_width(&self) -> usize {
        UNIT_WIDTH
    }

    fn timestamp_wrap_unit(&self) -> i32 {
        TS_WRAP_ADD
    }

    fn monotonic_check(&self) -> MonotonicCheck {
        // Several events can share one timestamp.
        MonotonicCheck::NonDecreasing
    }

    fn geometry(&self) -> SensorGeometry {
        SensorGeometry::new(ARRAY_SIZE, ARRAY_SIZE)
    }

    fn classify_unit(&mut self, unit: &[u8], codes: &mut Vec<SemanticCode>) {
        let flags = unit[3];

        if flags & TIMESTAMP_WRAP_MASK == TIMESTAMP_WRAP_MASK {
            codes.push(SemanticCode::TimestampWrap(1));
            return;
        }

        if flags & TIMESTAMP_RESET_MASK == TIMESTAMP_RESET_MASK {
            codes.push(SemanticCode::TimestampReset);
            return;
        }

        let address = LittleEndian::read_u16(&unit[0..2]);
        let tick = LittleEndian::read_u16(&unit[2..4]);
        codes.push(SemanticCode::Timestamp(u32::from(tick)));

        if address & SYNC_EVENT_MASK != 0 {
            codes.push(SemanticCode::Special {
                kind: SpecialEventKind::ExternalInputRisingEdge,
                data: 0,
            });
            return;
        }

        // The sensor is mounted upside down, and reports inverted polarity.
        let x = (ARRAY_SIZE - 1) - ((address >> X_ADDR_SHIFT) & X_ADDR_MASK);
        let y = (ARRAY_SIZE - 1) - ((address >> Y_ADDR_SHIFT) & Y_ADDR_MASK);
        let polarity = address & POLARITY_MASK == 0;

        codes.push(SemanticCode::Polarity { x, y, polarity });
    }
}

/// Encodes one DVS128 unit. Used to build synthetic streams.
pub fn encode_unit(address: u16, timestamp: u16, flags: u8) -> [u8; UNIT_WIDTH] {
    let mut unit = [0u8; UNIT_WIDTH];
    LittleEndian::write_u16(&mut unit[0..2], address);
    LittleEndian::write_u16(&mut unit[2..4], timestamp & 0x3FFF);
    unit[3] |= flags & (TIMESTAMP_WRAP_MASK | TIMESTAMP_RESET_MASK);
    unit
}

/// Address word of a polarity event at the given output coordinates.
pub fn polarity_address(x: u16, y: u16, polarity: bool) -> u16 {
    let raw_x = (ARRAY_SIZE - 1 - x) & X_ADDR_MASK;
    let raw_y = (ARRAY_SIZE - 1 - y) & Y_ADDR_MASK;
    (raw_y << Y_ADDR_SHIFT) | (raw_x << X_ADDR_SHIFT) | u16::from(!polarity)
}

/// Wrap marker unit.
pub fn wrap_unit() -> [u8; UNIT_WIDTH] {
    encode_unit(0, 0, TIMESTAMP_WRAP_MASK)
}

/// Timestamp reset unit.
pub fn reset_unit() -> [u8; UNIT_WIDTH] {
    encode_unit(0, 0, TIMESTAMP_RESET_MASK)
}
