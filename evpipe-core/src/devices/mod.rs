//! Wire formats of the supported devices.
//!
//! Each device implements [`DeviceDecoder`](crate::decoder::DeviceDecoder)
//! and only classifies units; buffering, timestamps and commits are shared.

pub mod dvs128;
pub mod dvxplorer;

pub use dvs128::Dvs128Decoder;
pub use dvxplorer::DvXplorerDecoder;
