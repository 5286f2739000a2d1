//! Core streaming runtime: buffers, blocks, flowgraph, schedulers
//!
//! The runtime is built leaves-first: [`Buffer`] connects one writer to N
//! readers over a mirrored ring; [`StreamBlock`] is the execution contract
//! every block implements; [`Flowgraph`] validates the topology and
//! allocates the buffers; [`CooperativeScheduler`] drives everything on one
//! thread while [`ThreadedScheduler`] runs one worker per block; tags and
//! message queues ride alongside the sample streams.

pub mod block;
pub mod buffer;
pub mod circular_file;
pub mod config;
pub mod errors;
pub mod flowgraph;
pub mod message;
pub mod scheduler;
pub mod tag;
pub mod threaded;
pub mod watchdog;

pub use block::{BlockRet, MessagePorts, RateContract, Signature, StreamBlock};
pub use buffer::{Buffer, ReaderId, StreamInput, StreamOutput, round_capacity};
pub use circular_file::CircularFile;
pub use config::RuntimeConfig;
pub use errors::{
    BlockRunError, BufferError, CircularFileError, TopologyError, WorkError, WorkResult,
};
pub use flowgraph::{BlockId, Flowgraph, MessageEdge, StreamEdge};
pub use message::{Message, MessageQueue, OverflowPolicy};
pub use scheduler::{BlockState, CooperativeScheduler, StopHandle};
pub use tag::{RescaleWindow, Tag, TagMapFn, TagPropagation};
pub use threaded::ThreadedScheduler;
pub use watchdog::{Watchdog, WatchdogHandle};
