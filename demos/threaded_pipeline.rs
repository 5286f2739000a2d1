//! Demo: thread-per-block execution with a timed stop
//!
//! Runs source -> decimate -> sink with one worker thread per block, lets it
//! stream for a while, then stops cooperatively and reports the throughput.
//!
//! Usage:
//!   cargo run --release --example threaded_pipeline -- --millis 500 --decimation 4

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use clap::Parser;
use sigflow::blocks::{KeepOneInN, NullSink, NullSource};
use sigflow::runtime::{Flowgraph, ThreadedScheduler};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// How long to let the graph run
    #[arg(long, default_value = "500")]
    millis: u64,

    /// Keep one sample out of every N
    #[arg(long, default_value = "4")]
    decimation: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut fg = Flowgraph::new();
    let src = fg.add_block(NullSource::<f32>::new());
    let decim = fg.add_block(KeepOneInN::<f32>::new(args.decimation));
    let sink = NullSink::<f32>::new();
    let received = sink.received();
    let snk = fg.add_block(sink);
    fg.connect(src, 0, decim, 0)?;
    fg.connect(decim, 0, snk, 0)?;

    let scheduler = ThreadedScheduler::start(fg)?;
    info!("{} worker threads running", scheduler.num_threads());

    let started = Instant::now();
    std::thread::sleep(Duration::from_millis(args.millis));
    scheduler.stop();
    if let Err(errors) = scheduler.wait() {
        for e in &errors {
            eprintln!("worker failed: {}", e);
        }
        return Err("flowgraph failed".into());
    }

    let elapsed = started.elapsed();
    let items = received.load(Ordering::Relaxed);
    println!(
        "consumed {} items in {:?} ({:.1} M items/s after 1:{} decimation)",
        items,
        elapsed,
        items as f64 / elapsed.as_secs_f64() / 1e6,
        args.decimation,
    );
    Ok(())
}
