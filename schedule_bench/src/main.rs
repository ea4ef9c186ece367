use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::info;

use avqueue::{Priority, SchedulerConfig, WorkItemQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "avqueue-schedule.toml")]
    config: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct BenchConfig {
    /// Child queues under the root.
    children: usize,
    /// Ceiling argument of every child queue.
    child_max_concurrent: i32,
    /// Items added to each child.
    items_per_child: usize,
    /// Simulated work per item.
    work_micros: u64,
    scheduler: SchedulerConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            children: 4,
            child_max_concurrent: 2,
            items_per_child: 10_000,
            work_micros: 10,
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug)]
struct Report {
    completed: usize,
    workers: usize,
    root_limit: usize,
    root_peak: usize,
    child_limit: usize,
    child_peak: usize,
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
    info!(?cfg, "schedule bench starting");

    let start = Instant::now();
    let report = run(&cfg);
    let duration = start.elapsed();
    let ops = (report.completed as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K items/s on {} workers. Total time: {:#?}",
        (ops / 1000f64) as u64,
        report.workers,
        duration
    );
    if report.root_peak > report.root_limit || report.child_peak > report.child_limit {
        return Err(format!("ceiling exceeded: {:?}", report).into());
    }
    Ok(())
}

struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn new() -> Arc<Gauge> {
        Arc::new(Gauge {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run(cfg: &BenchConfig) -> Report {
    let root = WorkItemQueue::from_config(&cfg.scheduler);
    let root_gauge = Gauge::new();
    let completed = Arc::new(AtomicUsize::new(0));
    let work = Duration::from_micros(cfg.work_micros);

    let children: Vec<(WorkItemQueue, Arc<Gauge>)> = (0..cfg.children)
        .map(|_| (WorkItemQueue::with_target(&root, cfg.child_max_concurrent), Gauge::new()))
        .collect();

    for i in 0..cfg.items_per_child {
        for (queue, gauge) in &children {
            let gauge = gauge.clone();
            let root_gauge = root_gauge.clone();
            let completed = completed.clone();
            let priority = if i % 10 == 0 { Priority::HIGH } else { Priority::NORMAL };
            queue.add_fn(priority, move |_| {
                root_gauge.enter();
                gauge.enter();
                if !work.is_zero() {
                    thread::sleep(work);
                }
                gauge.leave();
                root_gauge.leave();
                completed.fetch_add(1, Ordering::Relaxed);
            });
        }
    }

    for (queue, _) in &children {
        queue.wait();
    }

    Report {
        completed: completed.load(Ordering::Relaxed),
        workers: root.worker_count(),
        root_limit: root.max_concurrent(),
        root_peak: root_gauge.peak.load(Ordering::SeqCst),
        child_limit: children.first().map_or(0, |(queue, _)| queue.max_concurrent()),
        child_peak: children
            .iter()
            .map(|(_, gauge)| gauge.peak.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0),
    }
}
