//! DVXplorer wire format.
//!
//! Units are little-endian 16-bit words. Bit 15 set means a 15-bit
//! timestamp tick. Otherwise bits 14-12 hold a code and bits 11-0 its data:
//!
//! | Code | Meaning                                              |
//! |------|------------------------------------------------------|
//! | 0    | Special event, selected by data                      |
//! | 1    | Column address, bit 11 marks start of frame          |
//! | 2, 3 | Eight-pixel group presence mask and polarity         |
//! | 4    | Row addresses of both pixel groups                   |
//! | 5    | Misc 8-bit data (IMU bytes and IMU configuration)    |
//! | 7    | Timestamp wrap, data is the multiplier               |

use crate::composite::{
    CompositeCode, CompositeEvent, CompositeKind, CompositeOutcome, CompositeScratch,
    CompositeStep,
};
use crate::decoder::{DeviceDecoder, SemanticCode};
use crate::timestamp::MonotonicCheck;
use crate::types::{Imu6Event, SensorGeometry, SpecialEventKind};
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, error, warn};

const NAME: &str = "DVXplorer";

/// Bytes per wire unit.
pub const UNIT_WIDTH: usize = 2;

/// Microseconds added per wrap multiplier unit (15-bit tick counter).
pub const TS_WRAP_ADD: i32 = 0x8000;

/// Default pixel array size.
pub const DEFAULT_WIDTH: u16 = 640;
pub const DEFAULT_HEIGHT: u16 = 480;

/// Payload bytes in a complete IMU6 sample.
pub const IMU_TOTAL_COUNT: u8 = 14;

pub const IMU_TYPE_TEMP: u8 = 0x01;
pub const IMU_TYPE_GYRO: u8 = 0x02;
pub const IMU_TYPE_ACCEL: u8 = 0x04;

const TIMESTAMP_MARKER: u16 = 0x8000;
const TIMESTAMP_MASK: u16 = 0x7FFF;
const CODE_SHIFT: u16 = 12;
const CODE_MASK: u16 = 0x0007;
const DATA_MASK: u16 = 0x0FFF;

const COLUMN_ADDR_MASK: u16 = 0x03FF;
const START_OF_FRAME: u16 = 0x0800;
const GROUP_OFF_POLARITY: u16 = 0x0100;
const GROUP1_ADDR_MASK: u16 = 0x003F;
const GROUP2_OFFSET_SHIFT: u16 = 6;
const GROUP2_OFFSET_MASK: u16 = 0x001F;
const GROUP2_NEGATIVE: u16 = 0x0800;
const GROUP_SIZE: u16 = 8;

const MISC8_IMU_DATA: u8 = 0;
const MISC8_IMU_SCALE_CONFIG: u8 = 3;

/// Accelerometer LSB per g for a 2-bit full-scale setting.
fn accel_scale(setting: u16) -> f32 {
    65536.0 / (4 * (1u32 << (setting & 0x03))) as f32
}

/// Gyroscope LSB per °/s for a 3-bit full-scale setting (0 = ±2000 °/s).
fn gyro_scale(setting: u16) -> f32 {
    let ascending = 4 - (setting & 0x07).min(4);
    65536.0 / (250 * (1u32 << ascending)) as f32
}

fn imu_code(step: CompositeStep) -> SemanticCode {
    SemanticCode::Composite(CompositeCode::new(CompositeKind::Imu6, step))
}

/// IMU parser state.
#[derive(Debug, Clone)]
struct ImuState {
    scratch: CompositeScratch<Imu6Event>,
    sensors: u8,
    accel_scale: f32,
    gyro_scale: f32,
    high_byte: u8,
}

impl Default for ImuState {
    fn default() -> Self {
        Self {
            scratch: CompositeScratch::new(),
            sensors: 0,
            accel_scale: accel_scale(0),
            gyro_scale: gyro_scale(0),
            high_byte: 0,
        }
    }
}

/// Decoder for the DVXplorer event stream.
#[derive(Debug, Clone)]
pub struct DvXplorerDecoder {
    geometry: SensorGeometry,
    last_x: u16,
    last_y_group1: u16,
    last_y_group2: u16,
    imu: ImuState,
}

impl Default for DvXplorerDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DvXplorerDecoder {
    /// Creates a decoder for the full 640x480 array.
    pub fn new() -> Self {
        Self::with_geometry(SensorGeometry::new(DEFAULT_WIDTH, DEFAULT_HEIGHT))
    }

    /// Creates a decoder for a sensor (or region) of the given size.
    pub fn with_geometry(geometry: SensorGeometry) -> Self {
        Self {
            geometry,
            last_x: 0,
            last_y_group1: 0,
            last_y_group2: 0,
            imu: ImuState::default(),
        }
    }

    fn classify_special(&self, data: u16, codes: &mut Vec<SemanticCode>) {
        let special = |kind| SemanticCode::Special { kind, data: 0 };

        match data {
            0 => error!(device = NAME, "Caught special reserved event"),
            1 => codes.push(SemanticCode::TimestampReset),
            2 => codes.push(special(SpecialEventKind::ExternalInputFallingEdge)),
            3 => codes.push(special(SpecialEventKind::ExternalInputRisingEdge)),
            4 => codes.push(special(SpecialEventKind::ExternalInputPulse)),
            5 => codes.push(imu_code(CompositeStep::Begin)),
            7 => codes.push(imu_code(CompositeStep::End)),
            16 => codes.push(special(SpecialEventKind::ExternalGeneratorFallingEdge)),
            17 => codes.push(special(SpecialEventKind::ExternalGeneratorRisingEdge)),
            _ => error!(
                device = NAME,
                data,
                "Caught special event that can't be handled"
            ),
        }
    }

    fn classify_column(&mut self, data: u16, codes: &mut Vec<SemanticCode>) {
        let column = data & COLUMN_ADDR_MASK;

        if data & START_OF_FRAME != 0 {
            codes.push(SemanticCode::Special {
                kind: SpecialEventKind::EventReadoutStart,
                data: 0,
            });
        }

        if column >= self.geometry.width {
            warn!(
                device = NAME,
                column,
                width = self.geometry.width,
                "DVS: X address out of range, due to USB communication issue"
            );
            return;
        }

        self.last_x = column;
    }

    fn classify_group_rows(&mut self, data: u16) {
        let group1 = data & GROUP1_ADDR_MASK;
        let offset = (data >> GROUP2_OFFSET_SHIFT) & GROUP2_OFFSET_MASK;
        let group2 = if data & GROUP2_NEGATIVE != 0 {
            group1.wrapping_sub(offset)
        } else {
            group1 + offset
        };

        let group1 = group1.wrapping_mul(GROUP_SIZE);
        let group2 = group2.wrapping_mul(GROUP_SIZE);

        for (group, row) in [(1, group1), (2, group2)] {
            if row >= self.geometry.height {
                warn!(
                    device = NAME,
                    group,
                    row,
                    height = self.geometry.height,
                    "DVS: group Y address out of range, due to USB communication issue"
                );
                return;
            }
        }

        self.last_y_group1 = group1;
        self.last_y_group2 = group2;
    }

    fn classify_misc8(&self, data: u16, codes: &mut Vec<SemanticCode>) {
        let misc_code = ((data >> 8) & 0x0F) as u8;
        let misc_data = (data & 0xFF) as u8;

        match misc_code {
            MISC8_IMU_DATA => codes.push(imu_code(CompositeStep::Data(misc_data))),
            MISC8_IMU_SCALE_CONFIG => codes.push(imu_code(CompositeStep::Config(data))),
            _ => error!(
                device = NAME,
                misc_code,
                "Caught misc8 event that can't be handled"
            ),
        }
    }

    fn imu_data(&mut self, byte: u8) {
        let imu = &mut self.imu;
        let count = imu.scratch.count();
        let value = f32::from(i16::from_be_bytes([imu.high_byte, byte]));

        match count {
            0 | 2 | 4 | 6 | 8 | 10 | 12 => imu.high_byte = byte,
            // X and Y axes are swapped due to the IMU chip rotation.
            1 => imu.scratch.event_mut().accel_y = value / imu.accel_scale,
            3 => imu.scratch.event_mut().accel_x = value / imu.accel_scale,
            5 => {
                imu.scratch.event_mut().accel_z = value / imu.accel_scale;

                if imu.sensors & IMU_TYPE_TEMP == 0 {
                    let skip = if imu.sensors & IMU_TYPE_GYRO != 0 { 2 } else { 8 };
                    imu.scratch.advance(skip);
                }
            }
            7 => {
                imu.scratch.event_mut().temperature = value / 512.0 + 23.0;

                if imu.sensors & IMU_TYPE_GYRO == 0 {
                    imu.scratch.advance(6);
                }
            }
            9 => imu.scratch.event_mut().gyro_y = value / imu.gyro_scale,
            11 => imu.scratch.event_mut().gyro_x = value / imu.gyro_scale,
            13 => imu.scratch.event_mut().gyro_z = value / imu.gyro_scale,
            _ => error!(device = NAME, count, "Got invalid IMU update sequence"),
        }

        imu.scratch.advance(1);
    }

    fn imu_config(&mut self, data: u16) {
        let imu = &mut self.imu;
        imu.accel_scale = accel_scale(data >> 3);
        imu.gyro_scale = gyro_scale(data);
        imu.sensors = ((data >> 5) & 0x07) as u8;

        let start = if imu.sensors & IMU_TYPE_ACCEL != 0 {
            0
        } else if imu.sensors & IMU_TYPE_TEMP != 0 {
            6
        } else if imu.sensors & IMU_TYPE_GYRO != 0 {
            8
        } else {
            error!(device = NAME, "IMU scale config: no IMU sensors enabled");
            IMU_TOTAL_COUNT
        };
        imu.scratch.set_count(start);
    }
}

impl DeviceDecoder for DvXplorerDecoder {
    fn name(&self) -> &str {
        NAME
    }

    fn unit_width(&self) -> usize {
        UNIT_WIDTH
    }

    fn timestamp_wrap_unit(&self) -> i32 {
        TS_WRAP_ADD
    }

    fn monotonic_check(&self) -> MonotonicCheck {
        MonotonicCheck::Strict
    }

    fn geometry(&self) -> SensorGeometry {
        self.geometry
    }

    fn classify_unit(&mut self, unit: &[u8], codes: &mut Vec<SemanticCode>) {
        let word = LittleEndian::read_u16(unit);

        if word & TIMESTAMP_MARKER != 0 {
            codes.push(SemanticCode::Timestamp(u32::from(word & TIMESTAMP_MASK)));
            return;
        }

        let code = (word >> CODE_SHIFT) & CODE_MASK;
        let data = word & DATA_MASK;

        match code {
            0 => self.classify_special(data, codes),
            1 => self.classify_column(data, codes),
            // Code 3 is pixel group 1, code 2 is pixel group 2.
            2 | 3 => codes.push(SemanticCode::PolarityGroup {
                x: self.last_x,
                y_base: if code == 3 {
                    self.last_y_group1
                } else {
                    self.last_y_group2
                },
                mask: (data & 0xFF) as u8,
                polarity: data & GROUP_OFF_POLARITY == 0,
            }),
            4 => self.classify_group_rows(data),
            5 => self.classify_misc8(data, codes),
            7 => codes.push(SemanticCode::TimestampWrap(u32::from(data))),
            _ => error!(device = NAME, code, "Caught event that can't be handled"),
        }
    }

    fn decode_composite(&mut self, code: CompositeCode, timestamp: i32) -> CompositeOutcome {
        if code.step == CompositeStep::Begin {
            debug!(device = NAME, "IMU6 start event received");
            self.imu.scratch.begin();
            self.imu.sensors = 0;
            return CompositeOutcome::Pending;
        }

        if self.imu.scratch.is_ignoring() {
            return CompositeOutcome::Ignored;
        }

        match code.step {
            CompositeStep::Begin => CompositeOutcome::Pending,
            CompositeStep::Data(byte) => {
                self.imu_data(byte);
                CompositeOutcome::Pending
            }
            CompositeStep::Config(data) => {
                self.imu_config(data);
                CompositeOutcome::Pending
            }
            CompositeStep::End => match self.imu.scratch.finish(IMU_TOTAL_COUNT, timestamp) {
                Ok(event) => CompositeOutcome::Complete(CompositeEvent::Imu6(event)),
                Err(count) => CompositeOutcome::Mismatch {
                    count: u32::from(count),
                    expected: u32::from(IMU_TOTAL_COUNT),
                },
            },
            // Image steps never reach the IMU path.
            CompositeStep::Sample(_) | CompositeStep::ExposureStart | CompositeStep::ExposureEnd => {
                CompositeOutcome::Ignored
            }
        }
    }

    fn invalidate_composites(&mut self) {
        self.imu.scratch.invalidate();
    }
}

/// Builders for synthetic DVXplorer streams.
pub mod encode {
    use byteorder::{ByteOrder, LittleEndian};

    fn word(code: u16, data: u16) -> [u8; 2] {
        let mut unit = [0u8; 2];
        LittleEndian::write_u16(&mut unit, ((code & 0x07) << 12) | (data & 0x0FFF));
        unit
    }

    pub fn timestamp(tick: u16) -> [u8; 2] {
        let mut unit = [0u8; 2];
        LittleEndian::write_u16(&mut unit, 0x8000 | (tick & 0x7FFF));
        unit
    }

    pub fn special(data: u16) -> [u8; 2] {
        word(0, data)
    }

    pub fn reset() -> [u8; 2] {
        special(1)
    }

    pub fn column(x: u16, start_of_frame: bool) -> [u8; 2] {
        word(1, (x & 0x03FF) | if start_of_frame { 0x0800 } else { 0 })
    }

    /// Row addresses given in groups of eight rows.
    pub fn group_rows(group1: u16, group2: u16) -> [u8; 2] {
        let (offset, negative) = if group2 >= group1 {
            (group2 - group1, 0)
        } else {
            (group1 - group2, 0x0800)
        };
        word(4, (group1 & 0x3F) | ((offset & 0x1F) << 6) | negative)
    }

    /// Presence mask for pixel group 1 (`first`) or 2.
    pub fn group(first: bool, mask: u8, polarity: bool) -> [u8; 2] {
        let code = if first { 3 } else { 2 };
        word(code, u16::from(mask) | if polarity { 0 } else { 0x0100 })
    }

    pub fn imu_start() -> [u8; 2] {
        special(5)
    }

    pub fn imu_end() -> [u8; 2] {
        special(7)
    }

    pub fn imu_byte(byte: u8) -> [u8; 2] {
        word(5, u16::from(byte))
    }

    /// IMU configuration: sensor type bits and full-scale settings.
    pub fn imu_config(sensors: u8, accel_setting: u16, gyro_setting: u16) -> [u8; 2] {
        let data = (u16::from(sensors & 0x07) << 5)
            | ((accel_setting & 0x03) << 3)
            | (gyro_setting & 0x07);
        word(5, (3 << 8) | data)
    }

    pub fn wrap(multiplier: u16) -> [u8; 2] {
        word(7, multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(decoder: &mut DvXplorerDecoder, unit: [u8; 2]) -> Vec<SemanticCode> {
        let mut codes = Vec::new();
        decoder.classify_unit(&unit, &mut codes);
        codes
    }

    fn feed_composite(decoder: &mut DvXplorerDecoder, unit: [u8; 2], ts: i32) -> CompositeOutcome {
        let codes = classify(decoder, unit);
        match codes.as_slice() {
            [SemanticCode::Composite(code)] => decoder.decode_composite(*code, ts),
            other => panic!("expected one composite code, got {:?}", other),
        }
    }

    #[test]
    fn test_timestamp_and_wrap_units() {
        let mut decoder = DvXplorerDecoder::new();
        assert_eq!(
            classify(&mut decoder, encode::timestamp(0x7FFF)),
            vec![SemanticCode::Timestamp(0x7FFF)]
        );
        assert_eq!(
            classify(&mut decoder, encode::wrap(2)),
            vec![SemanticCode::TimestampWrap(2)]
        );
        assert_eq!(
            classify(&mut decoder, encode::reset()),
            vec![SemanticCode::TimestampReset]
        );
    }

    #[test]
    fn test_special_events() {
        let mut decoder = DvXplorerDecoder::new();
        let kinds = [
            (2, SpecialEventKind::ExternalInputFallingEdge),
            (3, SpecialEventKind::ExternalInputRisingEdge),
            (4, SpecialEventKind::ExternalInputPulse),
            (16, SpecialEventKind::ExternalGeneratorFallingEdge),
            (17, SpecialEventKind::ExternalGeneratorRisingEdge),
        ];
        for (data, kind) in kinds {
            assert_eq!(
                classify(&mut decoder, encode::special(data)),
                vec![SemanticCode::Special { kind, data: 0 }]
            );
        }
        assert!(classify(&mut decoder, encode::special(0)).is_empty());
        assert!(classify(&mut decoder, encode::special(9)).is_empty());
    }

    #[test]
    fn test_pixel_groups_use_last_addresses() {
        let mut decoder = DvXplorerDecoder::new();
        assert!(classify(&mut decoder, encode::column(17, false)).is_empty());
        assert!(classify(&mut decoder, encode::group_rows(3, 1)).is_empty());

        assert_eq!(
            classify(&mut decoder, encode::group(true, 0b0000_0011, true)),
            vec![SemanticCode::PolarityGroup {
                x: 17,
                y_base: 24,
                mask: 0b0000_0011,
                polarity: true,
            }]
        );
        assert_eq!(
            classify(&mut decoder, encode::group(false, 0x80, false)),
            vec![SemanticCode::PolarityGroup {
                x: 17,
                y_base: 8,
                mask: 0x80,
                polarity: false,
            }]
        );
    }

    #[test]
    fn test_start_of_frame_and_out_of_range_column() {
        let mut decoder = DvXplorerDecoder::with_geometry(SensorGeometry::new(32, 32));
        classify(&mut decoder, encode::column(5, false));

        assert_eq!(
            classify(&mut decoder, encode::column(40, true)),
            vec![SemanticCode::Special {
                kind: SpecialEventKind::EventReadoutStart,
                data: 0,
            }]
        );
        // Out of range column keeps the previous address.
        assert_eq!(decoder.last_x, 5);
    }

    #[test]
    fn test_out_of_range_rows_are_ignored() {
        let mut decoder = DvXplorerDecoder::with_geometry(SensorGeometry::new(32, 32));
        classify(&mut decoder, encode::group_rows(1, 2));
        classify(&mut decoder, encode::group_rows(1, 9));
        assert_eq!((decoder.last_y_group1, decoder.last_y_group2), (8, 16));
    }

    fn imu_sample(decoder: &mut DvXplorerDecoder, sensors: u8, values: &[i16]) -> CompositeOutcome {
        assert_eq!(feed_composite(decoder, encode::imu_start(), 0), CompositeOutcome::Pending);
        feed_composite(decoder, encode::imu_config(sensors, 0, 4), 0);
        for value in values {
            let [high, low] = value.to_be_bytes();
            feed_composite(decoder, encode::imu_byte(high), 0);
            feed_composite(decoder, encode::imu_byte(low), 0);
        }
        feed_composite(decoder, encode::imu_end(), 99)
    }

    #[test]
    fn test_full_imu_sample() {
        let mut decoder = DvXplorerDecoder::new();
        let all = IMU_TYPE_ACCEL | IMU_TYPE_TEMP | IMU_TYPE_GYRO;
        // accel y, x, z; temperature; gyro y, x, z.
        let outcome = imu_sample(&mut decoder, all, &[16384, -8192, 0, 512, 2621, 0, -5243]);

        let CompositeOutcome::Complete(CompositeEvent::Imu6(event)) = outcome else {
            panic!("expected a complete sample, got {:?}", outcome);
        };
        assert_eq!(event.accel_y, 1.0);
        assert_eq!(event.accel_x, -0.5);
        assert_eq!(event.temperature, 24.0);
        assert_eq!(event.gyro_y, 2621.0 / gyro_scale(4));
        assert_eq!(event.gyro_z, -5243.0 / gyro_scale(4));
        assert_eq!(event.timestamp, 99);
    }

    #[test]
    fn test_accel_only_sample_skips_missing_fields() {
        let mut decoder = DvXplorerDecoder::new();
        let outcome = imu_sample(&mut decoder, IMU_TYPE_ACCEL, &[0, 0, 16384]);

        let CompositeOutcome::Complete(CompositeEvent::Imu6(event)) = outcome else {
            panic!("expected a complete sample, got {:?}", outcome);
        };
        assert_eq!(event.accel_z, 1.0);
        assert_eq!(event.gyro_x, 0.0);
    }

    #[test]
    fn test_gyro_only_sample_starts_late() {
        let mut decoder = DvXplorerDecoder::new();
        let outcome = imu_sample(&mut decoder, IMU_TYPE_GYRO, &[0, 0, 164]);
        assert!(matches!(outcome, CompositeOutcome::Complete(_)));
    }

    #[test]
    fn test_short_sample_is_a_mismatch() {
        let mut decoder = DvXplorerDecoder::new();
        let all = IMU_TYPE_ACCEL | IMU_TYPE_TEMP | IMU_TYPE_GYRO;
        assert_eq!(
            imu_sample(&mut decoder, all, &[1, 2, 3]),
            CompositeOutcome::Mismatch {
                count: 6,
                expected: u32::from(IMU_TOTAL_COUNT),
            }
        );
    }

    #[test]
    fn test_imu_data_is_ignored_until_start() {
        let mut decoder = DvXplorerDecoder::new();
        assert_eq!(
            feed_composite(&mut decoder, encode::imu_byte(1), 0),
            CompositeOutcome::Ignored
        );
        assert_eq!(
            feed_composite(&mut decoder, encode::imu_end(), 0),
            CompositeOutcome::Ignored
        );

        feed_composite(&mut decoder, encode::imu_start(), 0);
        decoder.invalidate_composites();
        assert_eq!(
            feed_composite(&mut decoder, encode::imu_end(), 0),
            CompositeOutcome::Ignored
        );
    }

    #[test]
    fn test_scales() {
        assert_eq!(accel_scale(0), 16384.0);
        assert_eq!(accel_scale(3), 2048.0);
        assert_eq!(gyro_scale(4), 65536.0 / 250.0);
        assert_eq!(gyro_scale(0), 65536.0 / 4000.0);
    }
}
