//! Soak harness: every primitive in the crate wired into one running pipeline.
//!
//! ```text
//!  ramp @ rate·ratio ─► DriftingRingBuffer ─► DoubleBuffer::process ─► output (latency probe)
//!                                                    │  ▲
//!                                      supply_input  ▼  │ deliver_output
//!                                              inner thread: gain stage
//!                                                    ▲
//!   control thread ── ConfigHandoffQueue::push ──────┘ poll once per block
//!   monitor thread ◄─ crossbeam bounded channel ◄──── XrunStats per outer block
//! ```
//!
//! The outer loop runs on the calling thread. Shutdown provokes an inner-stage
//! cancellation so the inner thread is released even when blocked in a FIFO.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dblbuf::{DoubleBuffer, DoubleBufferConfig};
use crate::error::{FifoError, Result};
use crate::fifo::{DriftConfig, DriftingRingBuffer, Side, XrunStats};
use crate::handoff::{self, ConfigConsumer, ConfigProducer};

/// Everything a soak run needs. Drift sizes are in frames of the input channel count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SoakConfig {
    pub double_buffer: DoubleBufferConfig,
    pub drift: DriftConfig,
    /// Outer blocks to process.
    pub blocks: usize,
    /// Producer rate divided by consumer rate at the drifting stage.
    pub producer_rate_ratio: f64,
    /// Outer blocks between two published gain configurations.
    pub config_interval_blocks: usize,
    pub stats_channel_capacity: usize,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            double_buffer: DoubleBufferConfig::default(),
            drift: DriftConfig::default(),
            blocks: 2000,
            producer_rate_ratio: 1.0005,
            config_interval_blocks: 100,
            stats_channel_capacity: 64,
        }
    }
}

impl SoakConfig {
    /// Reject settings the harness cannot run to completion.
    ///
    /// Unlike a bare [`DoubleBuffer`], the harness refuses a delay below the
    /// minimum because the stalled pipeline would never finish.
    pub fn validate(&self) -> Result<()> {
        self.double_buffer.validate()?;
        let minimum = self.double_buffer.minimum_delay();
        if self.double_buffer.delay < minimum {
            return Err(FifoError::Config(format!(
                "delay {} is below the stall-free minimum {minimum}",
                self.double_buffer.delay
            )));
        }
        self.drift.validate()?;
        self.drift_in_samples()?;
        if !self.producer_rate_ratio.is_finite() || self.producer_rate_ratio <= 0.0 {
            return Err(FifoError::Config(format!(
                "producer rate ratio must be positive, got {}",
                self.producer_rate_ratio
            )));
        }
        if self.config_interval_blocks == 0 || self.stats_channel_capacity == 0 {
            return Err(FifoError::Config(
                "config interval and stats channel capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The drift stage's sizes in interleaved samples rather than frames.
    fn drift_in_samples(&self) -> Result<DriftConfig> {
        let channels = self.double_buffer.input_channels;
        let scale = |frames: usize| {
            frames.checked_mul(channels).ok_or_else(|| {
                FifoError::Config(format!(
                    "drift size of {frames} frames overflows with {channels} channels"
                ))
            })
        };
        Ok(DriftConfig {
            min_fill_count: scale(self.drift.min_fill_count)?,
            desired_fill_count: scale(self.drift.desired_fill_count)?,
            max_fill_count: scale(self.drift.max_fill_count)?,
            ..self.drift
        })
    }
}

/// Load a soak configuration; missing or unparsable files yield the defaults.
pub fn load_config(path: &Path) -> SoakConfig {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<SoakConfig>(&raw).ok())
        .unwrap_or_default()
}

pub fn save_config(path: &Path, config: &SoakConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    fs::write(path, json)?;
    Ok(())
}

/// Gain applied by the inner stage; published through the handoff queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainConfig {
    pub version: u64,
    pub gain: f32,
}

impl GainConfig {
    fn for_version(version: u64) -> Self {
        // Always positive so non-zero input stays non-zero for the latency probe.
        Self {
            version,
            gain: 0.5 + (version % 4) as f32 * 0.25,
        }
    }
}

/// Result of a soak run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoakReport {
    pub blocks_processed: usize,
    pub inner_blocks_processed: usize,
    pub configs_published: u64,
    pub configs_observed: u64,
    pub config_nodes_live_at_end: usize,
    /// Frames between the first non-silent input and output frame.
    pub measured_latency_frames: Option<usize>,
    pub expected_latency_frames: usize,
    pub drift: XrunStats,
    pub drift_stops: u64,
    pub stats_snapshots_received: u64,
    pub stats_snapshots_dropped: u64,
    pub peak_writer_xruns_in_succession: u32,
    pub peak_reader_xruns_in_succession: u32,
    pub elapsed_ms: f64,
}

#[derive(Debug, Default)]
struct InnerSummary {
    blocks: usize,
    configs_observed: u64,
}

#[derive(Debug, Default)]
struct MonitorSummary {
    received: u64,
    stops: u64,
    peak_writer: u32,
    peak_reader: u32,
}

#[derive(Debug, Default)]
struct OuterSummary {
    blocks: usize,
    latency: Option<usize>,
    drift: XrunStats,
    dropped: u64,
}

/// Run the full pipeline for `config.blocks` outer blocks.
pub fn run_soak(config: &SoakConfig) -> Result<SoakReport> {
    config.validate()?;
    let started = Instant::now();
    let db_config = config.double_buffer;
    info!(
        blocks = config.blocks,
        outer = db_config.outer_size,
        inner = db_config.inner_size,
        delay = db_config.delay,
        ratio = config.producer_rate_ratio,
        "starting soak run"
    );

    let db = Arc::new(DoubleBuffer::<f32>::new(db_config, 0.0)?);
    let mut drift = DriftingRingBuffer::from_config(&config.drift_in_samples()?, 0.0f32)?;
    let (mut producer, consumer) = handoff::channel();
    producer.push(GainConfig::for_version(0));

    let inner = {
        let db = Arc::clone(&db);
        thread::Builder::new()
            .name("soak-inner".into())
            .spawn(move || inner_stage(&db, consumer))?
    };
    let (tick_tx, tick_rx) = bounded::<()>(16);
    let control = thread::Builder::new()
        .name("soak-control".into())
        .spawn(move || control_stage(producer, tick_rx))?;
    let (stats_tx, stats_rx) = bounded::<XrunStats>(config.stats_channel_capacity);
    let monitor = thread::Builder::new()
        .name("soak-monitor".into())
        .spawn(move || monitor_stage(stats_rx))?;

    let outer = outer_stage(config, &db, &mut drift, &tick_tx, &stats_tx);

    db.provoke_inner_error(FifoError::cancelled(Side::Reader, "soak run finished"));
    drop(tick_tx);
    drop(stats_tx);

    let inner = join(inner, "inner")?;
    let (configs_published, live_nodes) = join(control, "control")?;
    let monitor = join(monitor, "monitor")?;
    let outer = outer?;
    let inner = inner?;

    let report = SoakReport {
        blocks_processed: outer.blocks,
        inner_blocks_processed: inner.blocks,
        configs_published,
        configs_observed: inner.configs_observed,
        config_nodes_live_at_end: live_nodes,
        measured_latency_frames: outer.latency,
        expected_latency_frames: db_config.delay,
        drift: outer.drift,
        drift_stops: monitor.stops,
        stats_snapshots_received: monitor.received,
        stats_snapshots_dropped: outer.dropped,
        peak_writer_xruns_in_succession: monitor.peak_writer,
        peak_reader_xruns_in_succession: monitor.peak_reader,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    };
    if report.measured_latency_frames != Some(report.expected_latency_frames) {
        warn!(
            measured = ?report.measured_latency_frames,
            expected = report.expected_latency_frames,
            "measured latency differs from configured delay"
        );
    }
    info!(
        blocks = report.blocks_processed,
        configs_observed = report.configs_observed,
        writer_xruns = report.drift.writer_xruns_total,
        reader_xruns = report.drift.reader_xruns_total,
        "soak run finished"
    );
    Ok(report)
}

fn join<R>(handle: thread::JoinHandle<R>, name: &str) -> Result<R> {
    handle
        .join()
        .map_err(|_| FifoError::Other(anyhow::anyhow!("soak {name} thread panicked")))
}

fn outer_stage(
    config: &SoakConfig,
    db: &DoubleBuffer<f32>,
    drift: &mut DriftingRingBuffer<f32>,
    ticks: &Sender<()>,
    stats: &Sender<XrunStats>,
) -> Result<OuterSummary> {
    let db_config = &config.double_buffer;
    let in_ch = db_config.input_channels;
    let out_ch = db_config.output_channels;
    let frames = db_config.outer_size;

    let mut ramp = 0u32;
    let mut owed = 0.0f64;
    let mut produced: Vec<f32> = Vec::new();
    let mut input = vec![0.0f32; frames * in_ch];
    let mut output = vec![0.0f32; frames * out_ch];
    let mut first_in = None;
    let mut first_out = None;
    let mut summary = OuterSummary::default();

    for block in 0..config.blocks {
        owed += frames as f64 * config.producer_rate_ratio;
        let burst = owed.floor() as usize;
        owed -= burst as f64;
        produced.clear();
        for _ in 0..burst {
            // Ramp values start at 1 so silence and signal are distinguishable.
            ramp = ramp % 1_000_000 + 1;
            produced.extend(std::iter::repeat(ramp as f32).take(in_ch));
        }
        drift.write(&produced);
        drift.read(&mut input);

        db.process(&input, &mut output, frames)?;

        let base = block * frames;
        if first_in.is_none() {
            first_in = first_signal_frame(&input, in_ch).map(|f| base + f);
        }
        if first_out.is_none() {
            first_out = first_signal_frame(&output, out_ch).map(|f| base + f);
        }

        if let Err(TrySendError::Full(_)) = stats.try_send(drift.stats()) {
            summary.dropped += 1;
        }
        if (block + 1) % config.config_interval_blocks == 0 {
            let _ = ticks.try_send(());
        }
        summary.blocks += 1;
    }

    summary.latency = first_in
        .zip(first_out)
        .and_then(|(i, o)| o.checked_sub(i));
    summary.drift = drift.stats();
    Ok(summary)
}

fn first_signal_frame(block: &[f32], channels: usize) -> Option<usize> {
    block.chunks(channels).position(|frame| frame[0] != 0.0)
}

fn inner_stage(
    db: &DoubleBuffer<f32>,
    mut configs: ConfigConsumer<GainConfig>,
) -> Result<InnerSummary> {
    let in_ch = db.input_channels();
    let out_ch = db.output_channels();
    let mut input = vec![0.0f32; db.inner_size() * in_ch];
    let mut output = vec![0.0f32; db.inner_size() * out_ch];
    let mut summary = InnerSummary::default();
    let mut last_version = None;

    loop {
        match db.supply_input(&mut input) {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => return Ok(summary),
            Err(e) => return Err(e),
        }

        let config = configs
            .poll()
            .copied()
            .unwrap_or(GainConfig::for_version(0));
        if last_version != Some(config.version) {
            last_version = Some(config.version);
            summary.configs_observed += 1;
        }

        for (src, dst) in input.chunks(in_ch).zip(output.chunks_mut(out_ch)) {
            for (c, sample) in dst.iter_mut().enumerate() {
                *sample = src[c.min(in_ch - 1)] * config.gain;
            }
        }

        match db.deliver_output(&output) {
            Ok(()) => summary.blocks += 1,
            Err(e) if e.is_cancellation() => return Ok(summary),
            Err(e) => return Err(e),
        }
    }
}

fn control_stage(mut producer: ConfigProducer<GainConfig>, ticks: Receiver<()>) -> (u64, usize) {
    let mut version = 0;
    for () in ticks.iter() {
        version += 1;
        producer.push(GainConfig::for_version(version));
    }
    (version, producer.live_nodes())
}

fn monitor_stage(stats: Receiver<XrunStats>) -> MonitorSummary {
    let mut summary = MonitorSummary::default();
    let mut was_running = false;
    for snapshot in stats.iter() {
        summary.received += 1;
        summary.peak_writer = summary.peak_writer.max(snapshot.writer_xruns_in_succession);
        summary.peak_reader = summary.peak_reader.max(snapshot.reader_xruns_in_succession);
        if was_running && !snapshot.running {
            summary.stops += 1;
            info!(
                writer_xruns_total = snapshot.writer_xruns_total,
                reader_xruns_total = snapshot.reader_xruns_total,
                "drifting stage stopped"
            );
        }
        was_running = snapshot.running;
    }
    summary
}
