//! Event-camera acquisition pipeline.
//!
//! This crate turns the raw byte stream of a neuromorphic (event) camera into
//! sealed, time-ordered batches of typed events. A device-specific decoder
//! classifies each wire unit; shared machinery reconstructs 64-bit
//! timestamps, accumulates events into per-kind buffers, seals them into
//! containers when a size, time or forced trigger fires, and hands the
//! containers to a consumer through a bounded queue.
//!
//! # Example
//!
//! ```no_run
//! use evpipe_core::acquisition::{Acquisition, Notifications, ReaderTransport};
//! use evpipe_core::config::PipelineConfig;
//! use evpipe_core::devices::DvXplorerDecoder;
//!
//! let transport = ReaderTransport::open("capture.raw").unwrap();
//! let mut acquisition = Acquisition::start(
//!     PipelineConfig::default(),
//!     DvXplorerDecoder::new(),
//!     transport,
//!     Notifications::default(),
//! )
//! .unwrap();
//!
//! while let Some(container) = acquisition.get_next_container(true) {
//!     println!("{} events", container.event_count());
//! }
//! acquisition.stop().unwrap();
//! ```
//!
//! # Features
//!
//! - DVS128 and DVXplorer wire formats, including IMU6 samples
//! - Image frames assembled from begin, pixel and end markers
//! - Timestamp wrap and big-wrap (32-bit overflow) handling
//! - Timestamp resets delivered in their own container
//! - Bounded exchange queue with drop-on-full and shutdown-aware blocking
//! - CSV output with full 64-bit timestamps

pub mod acquisition;
pub mod buffer;
pub mod composite;
pub mod config;
pub mod container;
pub mod decoder;
pub mod devices;
pub mod exchange;
pub mod output;
pub mod timestamp;
pub mod types;

// Re-export commonly used types
pub use acquisition::{Acquisition, AcquisitionError, AcquisitionStats, Notifications, Transport};
pub use buffer::{BufferError, EventBuffer};
pub use config::{ConfigError, PipelineConfig};
pub use container::{CommitOutcome, EventContainer};
pub use decoder::{DecodeError, DeviceDecoder, SemanticCode, StreamDecoder};
pub use output::OutputError;
pub use types::{
    EventKind, FrameEvent, Imu6Event, PolarityEvent, SensorGeometry, SpecialEvent, SpecialEventKind,
};
