//! Streaming dataflow runtime for signal-processing pipelines
//!
//! This library executes graphs of processing blocks connected by typed
//! sample streams and an asynchronous message side channel. A scheduler
//! repeatedly invokes each block's work routine as buffer space and data
//! permit, commits the consumed/produced counts against the shared circular
//! buffers, and propagates stream tags and messages.
//!
//! # Architecture
//!
//! - **Buffer**: mirrored ring with one writer and N independent readers;
//!   wrap handling never reaches block code
//! - **Flowgraph**: builds and validates the topology, sizes and allocates
//!   the buffers
//! - **CooperativeScheduler**: deterministic single-threaded execution
//! - **ThreadedScheduler**: one worker thread per block with
//!   condition-variable wakeups
//! - **Blocks**: utility sources, sinks, and rate changers under [`blocks`]
//!
//! # Example
//!
//! ```
//! use sigflow::blocks::{Head, VectorSink, VectorSource};
//! use sigflow::runtime::{CooperativeScheduler, Flowgraph};
//!
//! let mut fg = Flowgraph::new();
//! let src = fg.add_block(VectorSource::new((0u32..100).collect()));
//! let head = fg.add_block(Head::<u32>::new(10));
//! let sink = VectorSink::<u32>::new();
//! let data = sink.data();
//! let snk = fg.add_block(sink);
//! fg.connect(src, 0, head, 0)?;
//! fg.connect(head, 0, snk, 0)?;
//!
//! let mut scheduler = CooperativeScheduler::new(fg)?;
//! scheduler.run()?;
//! assert_eq!(data.lock().unwrap().len(), 10);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod blocks;
pub mod runtime;

// Re-export the runtime surface block authors and graph builders touch most.
pub use runtime::{
    BlockRet, BlockState, CooperativeScheduler, Flowgraph, Message, MessagePorts, MessageQueue,
    RateContract, RuntimeConfig, Signature, StopHandle, StreamBlock, StreamInput, StreamOutput,
    Tag, TagPropagation, ThreadedScheduler, TopologyError, WorkError, WorkResult,
};
