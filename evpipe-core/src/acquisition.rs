//! Data acquisition lifecycle.
//!
//! [`Acquisition::start`] spawns one named acquisition thread that owns the
//! transport and the [`StreamDecoder`]. The caller keeps the consumer side:
//! it pops sealed containers with [`Acquisition::get_next_container`] and
//! ends the run with [`Acquisition::stop`].

use crate::config::{ConfigError, PipelineConfig};
use crate::container::{CommitStats, EventContainer};
use crate::decoder::{DecodeError, DeviceDecoder, StreamDecoder};
use crate::exchange::{ExchangeQueue, Notify, QueueNotify};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors raised while starting or stopping acquisition.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to set up decoder: {0}")]
    Setup(#[from] DecodeError),

    #[error("failed to spawn acquisition thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("acquisition thread panicked")]
    ThreadPanicked,
}

/// Source of raw device bytes.
///
/// `read_buffer` fills a prefix of `buffer` and returns its length. `Ok(0)`
/// means the link is gone and no more data will arrive. `WouldBlock` and
/// `TimedOut` errors mean no data yet; any other error ends acquisition.
/// Reads should return periodically so that a stop request is noticed.
pub trait Transport: Send + 'static {
    fn read_buffer(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
}

/// Transport replaying bytes from any reader, such as a recorded capture or
/// a serial port. Short reads are fine: the acquisition thread carries an
/// incomplete unit over to the next read.
#[derive(Debug)]
pub struct ReaderTransport<R> {
    reader: R,
}

impl<R: Read> ReaderTransport<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl ReaderTransport<BufReader<File>> {
    /// Opens a recorded capture file.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read + Send + 'static> Transport for ReaderTransport<R> {
    fn read_buffer(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.reader.read(buffer) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }
}

/// Callbacks injected at start time.
#[derive(Clone, Default)]
pub struct Notifications {
    /// A container was added to the exchange queue.
    pub data_available: Option<Notify>,
    /// A container was removed from the exchange queue.
    pub data_consumed: Option<Notify>,
    /// The transport was lost and acquisition ended on its own. Fired once.
    pub shutdown: Option<Notify>,
}

impl Notifications {
    pub fn on_data_available(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.data_available = Some(Arc::new(callback));
        self
    }

    pub fn on_data_consumed(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.data_consumed = Some(Arc::new(callback));
        self
    }

    pub fn on_shutdown(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.shutdown = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications")
            .field("data_available", &self.data_available.is_some())
            .field("data_consumed", &self.data_consumed.is_some())
            .field("shutdown", &self.shutdown.is_some())
            .finish()
    }
}

/// Totals reported by the acquisition thread when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Transport buffers handed to the decoder.
    pub buffers: u64,
    /// Bytes read from the transport.
    pub bytes: u64,
    /// Buffers abandoned because event buffers could not grow.
    pub decode_errors: u64,
    /// Container commit outcomes.
    pub commits: CommitStats,
    /// `true` if the transport ended the run rather than [`Acquisition::stop`].
    pub transport_ended: bool,
}

/// A running data acquisition.
#[derive(Debug)]
pub struct Acquisition {
    device: String,
    queue: Arc<ExchangeQueue>,
    running: Arc<AtomicBool>,
    blocking_pop: bool,
    thread: Option<thread::JoinHandle<AcquisitionStats>>,
    stats: AcquisitionStats,
}

impl Acquisition {
    /// Validates `config`, builds the exchange queue and decoder, and spawns
    /// the acquisition thread.
    pub fn start<D, T>(
        config: PipelineConfig,
        device: D,
        transport: T,
        notifications: Notifications,
    ) -> Result<Self, AcquisitionError>
    where
        D: DeviceDecoder,
        T: Transport,
    {
        config.validate()?;
        config.validate_unit_width(device.unit_width())?;

        let name = device.name().to_string();
        let queue = Arc::new(ExchangeQueue::new(
            config.queue_capacity,
            QueueNotify {
                on_increase: notifications.data_available.clone(),
                on_decrease: notifications.data_consumed.clone(),
            },
        ));
        let running = Arc::new(AtomicBool::new(true));
        let decoder = StreamDecoder::new(device, &config, queue.clone(), running.clone())?;

        let worker = AcquisitionWorker {
            decoder,
            transport,
            buffer: vec![0u8; config.transfer_buffer_size],
            carried: 0,
            queue: queue.clone(),
            running: running.clone(),
            shutdown: notifications.shutdown,
        };

        let thread = thread::Builder::new()
            .name(format!("{} acquisition", name))
            .spawn(move || worker.run())
            .map_err(AcquisitionError::ThreadSpawn)?;

        info!(
            device = %name,
            queue_capacity = config.queue_capacity,
            max_events_per_kind = config.max_events_per_kind,
            max_interval_us = config.max_interval_us,
            "Data acquisition started"
        );

        Ok(Self {
            device: name,
            queue,
            running,
            blocking_pop: config.blocking_pop,
            thread: Some(thread),
            stats: AcquisitionStats::default(),
        })
    }

    /// Takes the oldest sealed container.
    ///
    /// In blocking mode waits until one is available, or returns `None` once
    /// acquisition has ended and the queue is empty.
    pub fn get_next_container(&self, blocking: bool) -> Option<EventContainer> {
        self.queue.pop(blocking)
    }

    /// Like [`get_next_container`](Self::get_next_container), using the
    /// configured blocking mode.
    pub fn next_container(&self) -> Option<EventContainer> {
        self.get_next_container(self.blocking_pop)
    }

    /// Returns `false` once stopped or once the transport ended.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of containers waiting in the exchange queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Stops acquisition, waits for the acquisition thread and discards any
    /// containers the consumer has not taken.
    ///
    /// Calling `stop` again returns the totals of the first call.
    pub fn stop(&mut self) -> Result<AcquisitionStats, AcquisitionError> {
        let Some(thread) = self.thread.take() else {
            return Ok(self.stats);
        };

        self.running.store(false, Ordering::Release);
        self.queue.close();

        let stats = thread.join().map_err(|_| {
            error!(device = %self.device, "Acquisition thread panicked");
            AcquisitionError::ThreadPanicked
        })?;

        let drained = self.queue.drain();
        if drained > 0 {
            debug!(device = %self.device, drained, "Discarded unconsumed containers");
        }

        info!(
            device = %self.device,
            buffers = stats.buffers,
            bytes = stats.bytes,
            published = stats.commits.published,
            dropped = stats.commits.dropped,
            "Data acquisition stopped"
        );

        self.stats = stats;
        Ok(stats)
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(err) = self.stop() {
                warn!(device = %self.device, error = %err, "Failed to stop acquisition cleanly");
            }
        }
    }
}

/// State moved onto the acquisition thread.
struct AcquisitionWorker<D: DeviceDecoder, T: Transport> {
    decoder: StreamDecoder<D>,
    transport: T,
    buffer: Vec<u8>,
    /// Bytes of an incomplete unit kept at the start of `buffer`.
    carried: usize,
    queue: Arc<ExchangeQueue>,
    running: Arc<AtomicBool>,
    shutdown: Option<Notify>,
}

impl<D: DeviceDecoder, T: Transport> AcquisitionWorker<D, T> {
    fn run(mut self) -> AcquisitionStats {
        let mut stats = AcquisitionStats::default();
        let device = self.decoder.device().name().to_string();

        while self.running.load(Ordering::Acquire) {
            match self.transport.read_buffer(&mut self.buffer[self.carried..]) {
                Ok(0) => {
                    info!(device = %device, "Transport ended, shutting down acquisition");
                    stats.transport_ended = true;
                    break;
                }
                Ok(length) => {
                    stats.bytes += length as u64;
                    self.decode_whole_units(self.carried + length, &mut stats);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(err) => {
                    error!(
                        device = %device,
                        error = %err,
                        "Transport read failed, shutting down acquisition"
                    );
                    stats.transport_ended = true;
                    break;
                }
            }
        }

        if stats.transport_ended {
            if self.carried > 0 {
                warn!(
                    device = %device,
                    bytes = self.carried,
                    "Transport ended inside a unit, discarding trailing bytes"
                );
            }

            // Keep the tail of the stream, then let the consumer drain what
            // is left in the queue.
            if let Err(err) = self.decoder.flush() {
                error!(device = %device, error = %err, "Failed to commit remaining events");
            }
            self.running.store(false, Ordering::Release);

            if let Some(shutdown) = &self.shutdown {
                shutdown();
            }
            self.queue.close();
        }

        stats.commits = self.decoder.commit_stats();
        stats
    }

    /// Decodes the whole units among the first `filled` bytes of the buffer
    /// and moves the incomplete rest to its front for the next read.
    ///
    /// Transports may return any number of bytes, such as a short read from
    /// a serial port, so unit boundaries are restored here.
    fn decode_whole_units(&mut self, filled: usize, stats: &mut AcquisitionStats) {
        let aligned = filled - filled % self.decoder.device().unit_width();

        if aligned > 0 {
            stats.buffers += 1;
            if self.decoder.decode(&self.buffer[..aligned]).is_err() {
                stats.decode_errors += 1;
            }
        }

        self.buffer.copy_within(aligned..filled, 0);
        self.carried = filled - aligned;
    }
}
