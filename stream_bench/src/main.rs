use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};

use avqueue::reader::{BipReader, SegmentedReader};
use avqueue::writer::{BipWriter, SegmentedWriter};
use avqueue::{BipQueue, QueueConfig, SegmentedBipQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "avqueue-stream.toml")]
    config: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct BenchConfig {
    /// Bytes pushed through every lane before the run stops.
    total_bytes: u64,
    /// Largest region the producer asks for at once.
    chunk_size: usize,
    // Tables go last in TOML.
    queue: QueueConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            total_bytes: 1 << 30,
            chunk_size: 4096,
            queue: QueueConfig::default(),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct Report {
    bytes: u64,
    mismatches: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    info!(?cfg, "stream bench starting");

    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    {
        let closing = closing.clone();
        thread::spawn(move || {
            if signals.forever().next().is_some() {
                closing.store(true, Ordering::SeqCst);
            }
        });
    }

    let start = Instant::now();
    let report = run(&cfg, &closing)?;
    let duration = start.elapsed();
    let rate = (report.bytes as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}MB/s per lane. Total {} bytes in {:#?}",
        (rate / 1_000_000f64) as u64,
        report.bytes,
        duration
    );
    if report.mismatches > 0 {
        return Err(format!("{} bytes arrived out of order", report.mismatches).into());
    }
    Ok(())
}

#[inline]
fn pattern(position: u64, lane: usize) -> u8 {
    ((position + lane as u64) % 251) as u8
}

fn run(cfg: &BenchConfig, closing: &Arc<AtomicBool>) -> Result<Report, Box<dyn Error>> {
    if cfg.queue.segments > 1 {
        let (writer, reader) = SegmentedBipQueue::from_config(&cfg.queue)?.split();
        Ok(pump_segmented(writer, reader, cfg, closing))
    } else {
        let (writer, reader) = BipQueue::from_config(&cfg.queue)?.split();
        Ok(pump(writer, reader, cfg, closing))
    }
}

fn pump(mut writer: BipWriter, mut reader: BipReader, cfg: &BenchConfig, closing: &Arc<AtomicBool>) -> Report {
    let total = cfg.total_bytes;
    let chunk_size = cfg.chunk_size.max(1);
    let producer_closing = closing.clone();
    let producer = thread::spawn(move || {
        let mut sent = 0u64;
        while sent < total && !producer_closing.load(Ordering::Relaxed) {
            let want = chunk_size.min((total - sent) as usize);
            let mut region = writer.request_write(want);
            if region.is_empty() {
                thread::yield_now();
                continue;
            }
            for (i, byte) in region.iter_mut().enumerate() {
                *byte = pattern(sent + i as u64, 0);
            }
            let n = region.len();
            writer.commit_write(n);
            sent += n as u64;
        }
        sent
    });

    let mut report = Report::default();
    let mut last_progress = Instant::now();
    loop {
        let region = reader.request_read();
        if region.is_empty() {
            if producer.is_finished() && reader.available() == 0 {
                break;
            }
            thread::yield_now();
            continue;
        }
        for (i, &byte) in region.iter().enumerate() {
            if byte != pattern(report.bytes + i as u64, 0) {
                report.mismatches += 1;
            }
        }
        let n = region.len();
        reader.commit_read(n);
        report.bytes += n as u64;
        if last_progress.elapsed() > Duration::from_secs(1) {
            eprint!("\rTotal {} bytes", report.bytes);
            last_progress = Instant::now();
        }
    }

    match producer.join() {
        Ok(sent) if sent != report.bytes => {
            warn!(sent, received = report.bytes, "producer and consumer disagree")
        }
        Ok(_) => {}
        Err(_) => warn!("producer thread panicked"),
    }
    report
}

fn pump_segmented(
    mut writer: SegmentedWriter,
    mut reader: SegmentedReader,
    cfg: &BenchConfig,
    closing: &Arc<AtomicBool>,
) -> Report {
    let total = cfg.total_bytes;
    let chunk_size = cfg.chunk_size.max(1);
    let producer_closing = closing.clone();
    let producer = thread::spawn(move || {
        let mut sent = 0u64;
        while sent < total && !producer_closing.load(Ordering::Relaxed) {
            let want = chunk_size.min((total - sent) as usize);
            let mut region = writer.request_write(want);
            if region.is_empty() {
                thread::yield_now();
                continue;
            }
            for lane in 0..region.lane_count() {
                for (i, byte) in region.lane_mut(lane).iter_mut().enumerate() {
                    *byte = pattern(sent + i as u64, lane);
                }
            }
            let n = region.len();
            writer.commit_write(n);
            sent += n as u64;
        }
        sent
    });

    let mut report = Report::default();
    loop {
        let region = reader.request_read();
        if region.is_empty() {
            if producer.is_finished() && reader.available() == 0 {
                break;
            }
            thread::yield_now();
            continue;
        }
        for (lane, bytes) in region.lanes().enumerate() {
            for (i, &byte) in bytes.iter().enumerate() {
                if byte != pattern(report.bytes + i as u64, lane) {
                    report.mismatches += 1;
                }
            }
        }
        let n = region.len();
        reader.commit_read(n);
        report.bytes += n as u64;
    }

    if producer.join().is_err() {
        warn!("producer thread panicked");
    }
    report
}
