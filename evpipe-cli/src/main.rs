//! Event sensor capture replay CLI.
//!
//! Replays a raw capture through the acquisition pipeline and writes the
//! decoded events to CSV.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use evpipe_core::acquisition::{Acquisition, AcquisitionStats, Notifications, ReaderTransport, Transport};
use evpipe_core::devices::{Dvs128Decoder, DvXplorerDecoder};
use evpipe_core::output::{ContainerCsvWriter, WrittenCounts};
use evpipe_core::{DeviceDecoder, PipelineConfig, SensorGeometry};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Device {
    /// 128x128 sensor, 4-byte units
    Dvs128,
    /// 640x480 sensor with IMU, 2-byte units
    Dvxplorer,
}

/// Replays raw event sensor captures.
///
/// The capture is fed through the same decoder, commit and queue machinery
/// used for live acquisition. Containers are written out as they arrive.
#[derive(Parser, Debug)]
#[command(name = "evpipe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw capture file
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Polarity events CSV output path
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Wire format of the capture
    #[arg(short, long, value_enum, default_value = "dvxplorer")]
    device: Device,

    /// Output file for special events (resets, wraps, external inputs)
    #[arg(short, long, value_name = "PATH")]
    special: Option<PathBuf>,

    /// Output file for IMU6 samples
    #[arg(long, value_name = "PATH")]
    imu: Option<PathBuf>,

    /// Commit a container once any kind holds this many events (0 disables)
    #[arg(long, default_value_t = 8192)]
    max_events: usize,

    /// Commit a container once this many microseconds have passed
    #[arg(long, default_value_t = 10_000)]
    max_interval: i32,

    /// Number of containers the exchange queue can hold
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,

    /// Bytes requested per transport read, a multiple of the unit width
    #[arg(long, default_value_t = 8192)]
    chunk_size: usize,

    /// Override the DVXplorer sensor width
    #[arg(long, requires = "height")]
    width: Option<u16>,

    /// Override the DVXplorer sensor height
    #[arg(long, requires = "width")]
    height: Option<u16>,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

/// Reads the capture only while the consumer has caught up, so replaying
/// a file faster than real time does not overrun the exchange queue.
struct PacedTransport {
    inner: ReaderTransport<BufReader<File>>,
    queued: Arc<AtomicUsize>,
}

impl Transport for PacedTransport {
    fn read_buffer(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        if self.queued.load(Ordering::Acquire) > 0 {
            // Hand control back so a stop request is still noticed.
            thread::sleep(Duration::from_millis(1));
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.inner.read_buffer(buffer)
    }
}

struct Summary {
    stats: AcquisitionStats,
    counts: WrittenCounts,
    containers: u64,
    geometry: SensorGeometry,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn replay<D: DeviceDecoder>(args: &Args, decoder: D, progress: &ProgressBar) -> Result<Summary> {
    let config = PipelineConfig::default()
        .with_max_events_per_kind(args.max_events)
        .with_max_interval_us(args.max_interval)
        .with_queue_capacity(args.queue_capacity)
        .with_transfer_buffer_size(args.chunk_size);

    let geometry = decoder.geometry();

    let queued = Arc::new(AtomicUsize::new(0));
    let notifications = {
        let increase = queued.clone();
        let decrease = queued.clone();
        Notifications::default()
            .on_data_available(move || {
                increase.fetch_add(1, Ordering::AcqRel);
            })
            .on_data_consumed(move || {
                decrease.fetch_sub(1, Ordering::AcqRel);
            })
    };

    let transport = PacedTransport {
        inner: ReaderTransport::open(&args.input)
            .with_context(|| format!("Failed to open capture {:?}", args.input))?,
        queued,
    };

    let mut writer = ContainerCsvWriter::create(
        &args.output,
        args.special.as_ref(),
        args.imu.as_ref(),
        Some(&geometry),
    )
    .context("Failed to create CSV output")?;

    let mut acquisition = Acquisition::start(config, decoder, transport, notifications)
        .context("Failed to start acquisition")?;

    let mut containers = 0u64;
    while let Some(container) = acquisition.get_next_container(true) {
        writer
            .write_container(&container)
            .context("Failed to write CSV output")?;
        containers += 1;

        if containers % 64 == 0 {
            let counts = writer.counts();
            progress.set_message(format!(
                "{} containers, {} polarity events",
                containers, counts.polarity
            ));
        }
    }

    let stats = acquisition.stop().context("Acquisition failed")?;
    writer.flush().context("Failed to flush CSV output")?;

    Ok(Summary {
        stats,
        counts: writer.counts(),
        containers,
        geometry,
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .context("Invalid progress template")?,
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(format!(
            "Replaying {:?}...",
            args.input.file_name().unwrap_or_default()
        ));
        pb
    };

    let start_time = Instant::now();

    let summary = match args.device {
        Device::Dvs128 => replay(&args, Dvs128Decoder::new(), &progress)?,
        Device::Dvxplorer => {
            let decoder = match (args.width, args.height) {
                (Some(width), Some(height)) => {
                    DvXplorerDecoder::with_geometry(SensorGeometry::new(width, height))
                }
                _ => DvXplorerDecoder::new(),
            };
            replay(&args, decoder, &progress)?
        }
    };

    let total_duration = start_time.elapsed();
    let counts = summary.counts;

    progress.finish_with_message(format!(
        "Done! Wrote {} events in {:.2}s (sensor: {}x{})",
        counts.polarity + counts.special + counts.imu6,
        total_duration.as_secs_f64(),
        summary.geometry.width,
        summary.geometry.height
    ));

    if !args.quiet {
        let stats = summary.stats;
        let events_per_sec = counts.polarity as f64 / total_duration.as_secs_f64();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Bytes:        {}", stats.bytes);
        eprintln!("  Containers:   {}", summary.containers);
        eprintln!("  Dropped:      {}", stats.commits.dropped);
        eprintln!("  Polarity:     {}", counts.polarity);
        if args.special.is_some() {
            eprintln!("  Special:      {}", counts.special);
        }
        if args.imu.is_some() {
            eprintln!("  IMU6:         {}", counts.imu6);
        }
        if stats.decode_errors > 0 {
            eprintln!("  Decode errors: {}", stats.decode_errors);
        }
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
        eprintln!("  Throughput:   {:.0} events/s", events_per_sec);
    }

    Ok(())
}
