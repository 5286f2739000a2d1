//! Error types for the runtime system

use thiserror::Error;

/// Error type for flowgraph construction and validation
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("block {0} not found in flowgraph")]
    BlockNotFound(usize),

    #[error("output port {port} out of range for block '{block}'")]
    OutputPortOutOfRange { block: String, port: usize },

    #[error("input port {port} out of range for block '{block}'")]
    InputPortOutOfRange { block: String, port: usize },

    #[error(
        "item size mismatch: '{src_block}' output {src_port} produces {src_size}-byte items \
         but '{dst_block}' input {dst_port} expects {dst_size}-byte items"
    )]
    ItemSizeMismatch {
        src_block: String,
        src_port: usize,
        src_size: usize,
        dst_block: String,
        dst_port: usize,
        dst_size: usize,
    },

    #[error("input port {port} on block '{block}' is already connected")]
    DuplicateInput { block: String, port: usize },

    #[error("connecting '{src}' to '{dst}' would create a cycle among stream edges")]
    StreamCycle { src: String, dst: String },

    #[error(
        "block '{block}' requires {min}..={max} connected {side} stream ports, found {connected}"
    )]
    CardinalityViolation {
        block: String,
        side: &'static str,
        min: usize,
        max: usize,
        connected: usize,
    },

    #[error("input port {port} on block '{block}' is not connected")]
    UnconnectedInput { block: String, port: usize },

    #[error("stream ports on block '{block}' must be connected contiguously from port 0")]
    NonContiguousPorts { block: String },

    #[error("message port '{port}' not found on block '{block}'")]
    MessagePortNotFound { block: String, port: String },

    #[error(
        "one-to-one tag propagation on block '{block}' requires matching input/output \
         port counts ({inputs} inputs, {outputs} outputs)"
    )]
    TagPortMismatch {
        block: String,
        inputs: usize,
        outputs: usize,
    },
}

/// Error type for buffer contract violations
///
/// Overflow/underflow are programming errors in a block implementation
/// (claiming to produce or consume more than was granted), not back-pressure.
/// Back-pressure is signaled with `BlockRet::InsufficientInput`/`InsufficientOutput`.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("overflow: committed {requested} items but only {available} were writable")]
    Overflow { requested: usize, available: usize },

    #[error("underflow: consumed {requested} items but only {available} were readable")]
    Underflow { requested: usize, available: usize },

    #[error("reader added after the writer committed data; history is fixed at reader creation")]
    LateReader,

    #[error("history must be at least 1 (got {0})")]
    InvalidHistory(usize),
}

/// Error type for work invocations
#[derive(Debug, Error)]
pub enum WorkError {
    /// Buffer contract violation surfaced while committing a work result.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Block-internal failure (malformed parameter, unrecoverable state).
    /// Halts the block's partition cleanly.
    #[error("{0}")]
    Block(String),

    /// The block's work routine panicked. Fatal for its partition only.
    #[error("work routine panicked: {0}")]
    Panicked(String),
}

/// Result type for work functions and message handlers
pub type WorkResult<T = ()> = Result<T, WorkError>;

/// A work error attributed to the block that raised it
#[derive(Debug, Error)]
#[error("block '{block}' failed: {error}")]
pub struct BlockRunError {
    pub block: String,
    #[source]
    pub error: WorkError,
}

/// Error type for the persistent circular file format
#[derive(Debug, Error)]
pub enum CircularFileError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bad magic number: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("unsupported header size {0} (expected 4096)")]
    BadHeaderSize(u32),

    #[error("header declares a zero-size buffer")]
    EmptyBuffer,

    #[error("header buffer size {header} does not match file length {file}")]
    SizeMismatch { header: u64, file: u64 },
}
