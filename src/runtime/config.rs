//! Runtime configuration
//!
//! One explicit value threaded through `Flowgraph` construction. There is no
//! global preferences object; every knob travels with the graph that uses it.

use std::time::Duration;

use super::message::OverflowPolicy;

/// Configuration for flowgraph construction and scheduling
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Target byte size for stream buffers. Actual capacity is rounded up to
    /// the allocation granularity and to the minimum each edge requires.
    pub default_buffer_bytes: usize,
    /// Allocation granularity: every buffer's byte size is a whole multiple
    /// of this (the host page size on the platforms this targets).
    pub granularity_bytes: usize,
    /// Sleep applied by the cooperative scheduler after a full scan with no
    /// progress, so blocks awaiting asynchronous external input don't spin.
    pub idle_sleep: Duration,
    /// Threshold after which the stall watchdog reports a block parked in a
    /// buffer wait.
    pub stall_warning: Duration,
    /// Capacity for message queues. 0 means unbounded.
    pub message_queue_capacity: usize,
    /// What `post` does when a bounded message queue is full.
    pub message_overflow: OverflowPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_buffer_bytes: 32 * 1024,
            granularity_bytes: 4096,
            idle_sleep: Duration::from_micros(100),
            stall_warning: Duration::from_secs(5),
            message_queue_capacity: 0,
            message_overflow: OverflowPolicy::Block,
        }
    }
}

impl RuntimeConfig {
    /// Override the target buffer size in bytes.
    pub fn with_buffer_bytes(mut self, bytes: usize) -> Self {
        self.default_buffer_bytes = bytes;
        self
    }

    /// Override the cooperative scheduler's idle sleep.
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    /// Override the message queue capacity (0 = unbounded).
    pub fn with_message_queue_capacity(mut self, capacity: usize) -> Self {
        self.message_queue_capacity = capacity;
        self
    }
}
