//! Augmentation Pipeline Prefetch Soak Driver
//!
//! This binary runs a synthetic producer and consumer through a prefetch
//! ring for a number of batches and epochs, verifies that every batch
//! arrives intact and in order, and logs throughput and wait statistics.
//!
//! # Usage
//!
//! ```bash
//! # Host ring with default settings
//! augpipe-soak
//!
//! # Emulated device backend, slow consumer
//! augpipe-soak --backend device --consume-delay-us 500
//!
//! # Start with configuration file
//! augpipe-soak --config pipeline.toml --epochs 3
//! ```

use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use augpipe_core::{
    AnnotationBatch, AsyncBatchReader, BackendKind, BatchProducer, BoundingBox, DeviceContext,
    EmulatedDevice, MetadataField, MetadataRecord, PipelineConfig, Prefetcher, ProducedBatch,
    ReadSlot, RingBuffer, SampleAnnotation, WriteSlot,
};

/// Bytes at the start of each sub-buffer that carry the batch sequence.
const TAG_LEN: usize = 8;

/// Prefetch ring soak driver
#[derive(Parser, Debug)]
#[command(name = "augpipe-soak")]
#[command(about = "Runs a synthetic producer and consumer through the prefetch ring")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Ring depth (overrides config)
    #[arg(short, long)]
    depth: Option<usize>,

    /// Memory backend: host, pinned or device (overrides config)
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Size of each sub-buffer in bytes (overrides config)
    #[arg(long)]
    sub_buffer_size: Option<usize>,

    /// Sub-buffers per slot (overrides config)
    #[arg(long)]
    sub_buffers: Option<usize>,

    /// Memory limit of the emulated device in bytes
    #[arg(long)]
    device_capacity: Option<usize>,

    /// Batches per epoch
    #[arg(short = 'n', long, default_value = "1000")]
    batches: u64,

    /// Samples per batch
    #[arg(long, default_value = "4")]
    batch_size: usize,

    /// Number of epochs; the ring is reset between epochs
    #[arg(long, default_value = "1")]
    epochs: u32,

    /// Simulated augmentation time per batch in microseconds
    #[arg(long, default_value = "0")]
    produce_delay_us: u64,

    /// Simulated training step time per batch in microseconds
    #[arg(long, default_value = "0")]
    consume_delay_us: u64,

    /// Consume through the async reader on a tokio runtime
    #[arg(long)]
    async_reader: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;

    tracing::info!("Starting prefetch soak");
    tracing::info!("  Depth: {}", config.buffer.depth);
    tracing::info!("  Backend: {}", config.buffer.backend.as_str());
    tracing::info!("  Sub-buffers: {:?}", config.buffer.resolved_sub_buffer_sizes()?);
    tracing::info!("  Batches per epoch: {}", args.batches);
    tracing::info!("  Epochs: {}", args.epochs);

    let device: Option<Arc<dyn DeviceContext>> = if config.buffer.backend.requires_device() {
        let device = match args.device_capacity {
            Some(bytes) => EmulatedDevice::with_capacity(config.buffer.device_id, bytes),
            None => EmulatedDevice::new(config.buffer.device_id),
        };
        Some(Arc::new(device))
    } else {
        None
    };

    let ring = Arc::new(RingBuffer::from_config(&config, device)?);
    let runtime = if args.async_reader {
        Some(
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?,
        )
    } else {
        None
    };

    let started = Instant::now();
    let mut total_batches = 0u64;
    let mut total_bytes = 0u64;

    for epoch in 0..args.epochs {
        let epoch_start = Instant::now();
        let producer = SyntheticProducer::new(epoch, &args);
        let prefetcher = Prefetcher::spawn(ring.clone(), producer)?;
        let mut verifier = Verifier::new(epoch, Duration::from_micros(args.consume_delay_us));

        match &runtime {
            Some(runtime) => {
                let mut reader = AsyncBatchReader::new(prefetcher);
                runtime.block_on(async {
                    while reader
                        .next_batch(|slot, record| verifier.check(slot, record))
                        .await?
                        .transpose()?
                        .is_some()
                    {}
                    Ok::<_, Box<dyn Error>>(())
                })?;
            }
            None => {
                let mut prefetcher = prefetcher;
                while prefetcher
                    .next_batch(|slot, record| verifier.check(slot, record))?
                    .transpose()?
                    .is_some()
                {}
            }
        }

        if verifier.batches != args.batches {
            return Err(format!(
                "epoch {} delivered {} of {} batches",
                epoch, verifier.batches, args.batches
            )
            .into());
        }

        let elapsed = epoch_start.elapsed();
        tracing::info!(
            epoch,
            batches = verifier.batches,
            elapsed_ms = elapsed.as_millis() as u64,
            batches_per_sec = format!("{:.1}", verifier.batches as f64 / elapsed.as_secs_f64()),
            "epoch complete"
        );
        total_batches += verifier.batches;
        total_bytes += verifier.bytes;

        ring.reset();
    }

    let elapsed = started.elapsed().as_secs_f64();
    let stats = ring.stats();
    tracing::info!("Soak complete");
    tracing::info!("  Batches: {}", total_batches);
    tracing::info!(
        "  Throughput: {:.1} batches/s, {:.1} MiB/s",
        total_batches as f64 / elapsed,
        total_bytes as f64 / (1024.0 * 1024.0) / elapsed
    );
    tracing::info!("  Commits/releases: {}/{}", stats.commits, stats.releases);
    tracing::info!("  Producer waits (ring full): {}", stats.producer_waits);
    tracing::info!("  Consumer waits (ring empty): {}", stats.consumer_waits);
    if ring.has_metadata() {
        tracing::info!(
            "  Box field capacity: {} bytes",
            ring.metadata().field_capacity(MetadataField::Boxes)
        );
    }

    ring.release_memory()?;
    Ok(())
}

fn load_config(args: &Args) -> Result<PipelineConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();

    if let Some(depth) = args.depth {
        config.buffer.depth = depth;
    }
    if let Some(backend) = args.backend {
        config.buffer.backend = backend;
    }
    if let Some(count) = args.sub_buffers {
        config.buffer.sub_buffer_count = count;
    }
    if let Some(size) = args.sub_buffer_size {
        config.buffer.sub_buffer_sizes = vec![size];
    }
    config.validate()?;
    Ok(config)
}

/// Writes a tagged, patterned batch into every sub-buffer.
struct SyntheticProducer {
    epoch: u32,
    next: u64,
    batches: u64,
    batch_size: usize,
    delay: Duration,
}

impl SyntheticProducer {
    fn new(epoch: u32, args: &Args) -> Self {
        Self {
            epoch,
            next: 0,
            batches: args.batches,
            batch_size: args.batch_size,
            delay: Duration::from_micros(args.produce_delay_us),
        }
    }

    fn annotations(&self) -> AnnotationBatch {
        // Box counts vary per batch; small configured capacities grow on attach.
        let boxes = (self.next % 7) as usize * 8;
        let samples = (0..self.batch_size)
            .map(|i| SampleAnnotation {
                labels: vec![(self.next as i32 + i as i32) % 10],
                boxes: (0..boxes)
                    .map(|b| BoundingBox::new(b as f32, b as f32, b as f32 + 1.0, b as f32 + 1.0))
                    .collect(),
                mask: Vec::new(),
            })
            .collect();
        AnnotationBatch::from_samples(samples)
    }
}

impl BatchProducer for SyntheticProducer {
    fn fill(&mut self, slot: &mut WriteSlot<'_>) -> augpipe_core::Result<Option<ProducedBatch>> {
        if self.next == self.batches {
            return Ok(None);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        for sub in 0..slot.sub_buffer_count() {
            let buf = slot.sub_buffer_mut(sub);
            let pattern = (self.next as u8).wrapping_add(sub as u8);
            buf.fill(pattern);
            if buf.len() >= TAG_LEN {
                buf[..TAG_LEN].copy_from_slice(&self.next.to_le_bytes());
            }
            slot.upload(sub)?;
        }

        let names = (0..self.batch_size)
            .map(|i| format!("e{}-b{}-s{}", self.epoch, self.next, i))
            .collect();
        let batch = ProducedBatch::new(names, self.annotations());
        self.next += 1;
        Ok(Some(batch))
    }
}

/// Checks batch order and payload integrity on the consumer side.
struct Verifier {
    epoch: u32,
    batches: u64,
    bytes: u64,
    delay: Duration,
}

impl Verifier {
    fn new(epoch: u32, delay: Duration) -> Self {
        Self {
            epoch,
            batches: 0,
            bytes: 0,
            delay,
        }
    }

    fn check(
        &mut self,
        slot: &mut ReadSlot<'_>,
        record: Option<&MetadataRecord>,
    ) -> Result<(), String> {
        slot.download_all().map_err(|e| e.to_string())?;

        let expected = self.batches;
        for sub in 0..slot.sub_buffer_count() {
            let buf = slot.sub_buffer(sub);
            let pattern = (expected as u8).wrapping_add(sub as u8);
            let (tag, body) = if buf.len() >= TAG_LEN {
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(&buf[..TAG_LEN]);
                (Some(u64::from_le_bytes(tag)), &buf[TAG_LEN..])
            } else {
                (None, buf)
            };
            if let Some(tag) = tag {
                if tag != expected {
                    return Err(format!(
                        "epoch {}: expected batch {} in sub-buffer {}, found {}",
                        self.epoch, expected, sub, tag
                    ));
                }
            }
            if body.iter().any(|&b| b != pattern) {
                return Err(format!(
                    "epoch {}: batch {} sub-buffer {} is corrupt",
                    self.epoch, expected, sub
                ));
            }
            self.bytes += buf.len() as u64;
        }

        if let Some(record) = record {
            let first = format!("e{}-b{}-s0", self.epoch, expected);
            if record.sample_names.first() != Some(&first) {
                return Err(format!(
                    "epoch {}: batch {} paired with metadata {:?}",
                    self.epoch,
                    expected,
                    record.sample_names.first()
                ));
            }
        }

        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.batches += 1;
        Ok(())
    }
}
