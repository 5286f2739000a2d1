//! Demo: a small stream pipeline on the cooperative scheduler
//!
//! Builds ramp -> gain -> head -> sink, runs it to completion on the calling
//! thread, and prints a summary.
//!
//! Usage:
//!   cargo run --release --example stream_pipeline -- --items 100000 --gain 0.5 --take 1000

use clap::Parser;
use sigflow::blocks::{Apply, Head, VectorSink, VectorSource};
use sigflow::runtime::{CooperativeScheduler, Flowgraph};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of ramp items to generate
    #[arg(long, default_value = "100000")]
    items: u32,

    /// Gain applied to every sample
    #[arg(long, default_value = "0.5")]
    gain: f32,

    /// Number of items the head block lets through
    #[arg(long, default_value = "1000")]
    take: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let ramp: Vec<f32> = (0..args.items).map(|i| i as f32).collect();
    let gain = args.gain;

    let mut fg = Flowgraph::new();
    let src = fg.add_block(VectorSource::new(ramp));
    let scale = fg.add_block(Apply::new(move |x: &f32| x * gain));
    let head = fg.add_block(Head::<f32>::new(args.take));
    let sink = VectorSink::<f32>::new();
    let data = sink.data();
    let snk = fg.add_block(sink);
    fg.connect(src, 0, scale, 0)?;
    fg.connect(scale, 0, head, 0)?;
    fg.connect(head, 0, snk, 0)?;

    let mut scheduler = CooperativeScheduler::new(fg)?;
    scheduler.run()?;

    let data = data.lock().unwrap();
    info!("received {} items", data.len());
    let preview: Vec<f32> = data.iter().take(8).copied().collect();
    println!("first items: {:?}", preview);
    println!("total: {}", data.len());
    Ok(())
}
