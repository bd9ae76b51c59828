//! Acquisition pipeline configuration.
//!
//! All settings are passed explicitly at construction time; nothing in the
//! pipeline reads process-wide state.

use crate::buffer::DEFAULT_CAPACITY_LIMIT;
use thiserror::Error;

/// Errors reported by [`PipelineConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("exchange queue capacity must be at least 1")]
    ZeroQueueCapacity,

    #[error("maximum container interval must be positive, got {0}us")]
    InvalidInterval(i32),

    #[error("transfer buffer size must be at least 1 byte")]
    ZeroTransferSize,

    #[error("buffer capacity limit must be at least 1 event")]
    ZeroCapacityLimit,

    #[error("transfer buffer size {size} is not a multiple of the {unit_width}-byte unit width")]
    UnalignedTransferSize { size: usize, unit_width: usize },
}

/// Settings for one data acquisition run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Commit once any buffer holds this many events. 0 disables the trigger.
    pub max_events_per_kind: usize,
    /// Commit once device time advanced this many microseconds past the
    /// last commit deadline.
    pub max_interval_us: i32,
    /// Number of sealed containers the exchange queue can hold.
    pub queue_capacity: usize,
    /// Whether the default consumer call waits for data.
    pub blocking_pop: bool,
    /// Size of each buffer requested from the transport, in bytes.
    pub transfer_buffer_size: usize,
    /// Largest number of events a single buffer may grow to.
    pub buffer_capacity_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_events_per_kind: 8192,
            max_interval_us: 10_000,
            queue_capacity: 64,
            blocking_pop: false,
            transfer_buffer_size: 8192,
            buffer_capacity_limit: DEFAULT_CAPACITY_LIMIT,
        }
    }
}

impl PipelineConfig {
    pub fn with_max_events_per_kind(mut self, max_events: usize) -> Self {
        self.max_events_per_kind = max_events;
        self
    }

    pub fn with_max_interval_us(mut self, interval: i32) -> Self {
        self.max_interval_us = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_blocking_pop(mut self, blocking: bool) -> Self {
        self.blocking_pop = blocking;
        self
    }

    pub fn with_transfer_buffer_size(mut self, size: usize) -> Self {
        self.transfer_buffer_size = size;
        self
    }

    pub fn with_buffer_capacity_limit(mut self, limit: usize) -> Self {
        self.buffer_capacity_limit = limit;
        self
    }

    /// Checks that the settings describe a usable pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.max_interval_us <= 0 {
            return Err(ConfigError::InvalidInterval(self.max_interval_us));
        }
        if self.transfer_buffer_size == 0 {
            return Err(ConfigError::ZeroTransferSize);
        }
        if self.buffer_capacity_limit == 0 {
            return Err(ConfigError::ZeroCapacityLimit);
        }
        Ok(())
    }

    /// Checks that transfer buffers hold whole units of the device format.
    pub fn validate_unit_width(&self, unit_width: usize) -> Result<(), ConfigError> {
        if unit_width == 0 || self.transfer_buffer_size % unit_width != 0 {
            return Err(ConfigError::UnalignedTransferSize {
                size: self.transfer_buffer_size,
                unit_width,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        assert_eq!(
            PipelineConfig::default().with_queue_capacity(0).validate(),
            Err(ConfigError::ZeroQueueCapacity)
        );
        assert_eq!(
            PipelineConfig::default().with_max_interval_us(0).validate(),
            Err(ConfigError::InvalidInterval(0))
        );
        assert_eq!(
            PipelineConfig::default()
                .with_transfer_buffer_size(0)
                .validate(),
            Err(ConfigError::ZeroTransferSize)
        );
    }

    #[test]
    fn test_transfer_size_must_hold_whole_units() {
        let config = PipelineConfig::default().with_transfer_buffer_size(10);
        assert!(config.validate_unit_width(2).is_ok());
        assert_eq!(
            config.validate_unit_width(4),
            Err(ConfigError::UnalignedTransferSize {
                size: 10,
                unit_width: 4
            })
        );
    }

    #[test]
    fn test_zero_max_events_disables_size_trigger() {
        let config = PipelineConfig::default().with_max_events_per_kind(0);
        assert!(config.validate().is_ok());
    }
}
