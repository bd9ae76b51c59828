//! CSV writers for sealed event containers.
//!
//! Every row carries the full 64-bit timestamp, so rows from containers on
//! either side of a big wrap still sort correctly.

use crate::buffer::EventBuffer;
use crate::container::EventContainer;
use crate::types::{Event, Imu6Event, PolarityEvent, SensorGeometry, SpecialEvent};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// CSV output writer for polarity events.
pub struct PolarityCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> PolarityCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Writes the column header, preceded by a geometry comment if known.
    pub fn write_header(&mut self, geometry: Option<&SensorGeometry>) -> Result<(), OutputError> {
        if let Some(geometry) = geometry {
            writeln!(self.writer, "%geometry:{},{}", geometry.width, geometry.height)?;
        }
        writeln!(self.writer, "x,y,polarity,timestamp")?;
        Ok(())
    }

    /// Writes all events of one buffer.
    pub fn write_events(&mut self, events: &EventBuffer<PolarityEvent>) -> Result<(), OutputError> {
        let overflow = events.ts_overflow();
        for event in events {
            writeln!(
                self.writer,
                "{},{},{},{}",
                event.x,
                event.y,
                u8::from(event.polarity),
                event.timestamp64(overflow)
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// CSV writer for special events. The type column holds the numeric kind.
pub struct SpecialCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> SpecialCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(self.writer, "type,data,timestamp")?;
        Ok(())
    }

    pub fn write_events(&mut self, events: &EventBuffer<SpecialEvent>) -> Result<(), OutputError> {
        let overflow = events.ts_overflow();
        for event in events {
            writeln!(
                self.writer,
                "{},{},{}",
                event.kind as u8,
                event.data,
                event.timestamp64(overflow)
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// CSV writer for IMU6 samples.
pub struct Imu6CsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> Imu6CsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(
            self.writer,
            "accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,temperature,timestamp"
        )?;
        Ok(())
    }

    pub fn write_events(&mut self, events: &EventBuffer<Imu6Event>) -> Result<(), OutputError> {
        let overflow = events.ts_overflow();
        for event in events {
            writeln!(
                self.writer,
                "{},{},{},{},{},{},{},{}",
                event.accel_x,
                event.accel_y,
                event.accel_z,
                event.gyro_x,
                event.gyro_y,
                event.gyro_z,
                event.temperature,
                event.timestamp64(overflow)
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Row counts written so far, per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WrittenCounts {
    pub polarity: u64,
    pub special: u64,
    pub imu6: u64,
}

/// Routes each buffer of a container to its writer. Kinds without a writer
/// are skipped.
pub struct ContainerCsvWriter<W: Write> {
    polarity: PolarityCsvWriter<W>,
    special: Option<SpecialCsvWriter<W>>,
    imu6: Option<Imu6CsvWriter<W>>,
    counts: WrittenCounts,
}

impl<W: Write> ContainerCsvWriter<W> {
    /// Creates the writer set and writes all headers.
    pub fn new(
        polarity: W,
        special: Option<W>,
        imu6: Option<W>,
        geometry: Option<&SensorGeometry>,
    ) -> Result<Self, OutputError> {
        let mut polarity = PolarityCsvWriter::new(polarity);
        polarity.write_header(geometry)?;

        let special = special
            .map(|writer| {
                let mut writer = SpecialCsvWriter::new(writer);
                writer.write_header().map(|()| writer)
            })
            .transpose()?;

        let imu6 = imu6
            .map(|writer| {
                let mut writer = Imu6CsvWriter::new(writer);
                writer.write_header().map(|()| writer)
            })
            .transpose()?;

        Ok(Self {
            polarity,
            special,
            imu6,
            counts: WrittenCounts::default(),
        })
    }

    /// Appends every event of `container` to its CSV file. Image frames have
    /// no CSV form and are skipped.
    pub fn write_container(&mut self, container: &EventContainer) -> Result<(), OutputError> {
        if let Some(events) = container.polarity() {
            self.polarity.write_events(events)?;
            self.counts.polarity += events.len() as u64;
        }

        if let (Some(writer), Some(events)) = (self.special.as_mut(), container.special()) {
            writer.write_events(events)?;
            self.counts.special += events.len() as u64;
        }

        if let (Some(writer), Some(events)) = (self.imu6.as_mut(), container.imu6()) {
            writer.write_events(events)?;
            self.counts.imu6 += events.len() as u64;
        }

        Ok(())
    }

    pub fn counts(&self) -> WrittenCounts {
        self.counts
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.polarity.flush()?;
        if let Some(writer) = self.special.as_mut() {
            writer.flush()?;
        }
        if let Some(writer) = self.imu6.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl ContainerCsvWriter<File> {
    /// Creates CSV files at the given paths.
    pub fn create<P: AsRef<Path>>(
        polarity: P,
        special: Option<P>,
        imu6: Option<P>,
        geometry: Option<&SensorGeometry>,
    ) -> Result<Self, OutputError> {
        let polarity = File::create(polarity)?;
        let special = special.map(File::create).transpose()?;
        let imu6 = imu6.map(File::create).transpose()?;
        Self::new(polarity, special, imu6, geometry)
    }
}
