//! Sink discarding everything it receives

use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::{
    BlockRet, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, WorkResult,
};

/// Consumes and discards items, counting how many passed through
pub struct NullSink<T> {
    received: Arc<AtomicU64>,
    _type: PhantomData<fn() -> T>,
}

impl<T: Copy + Send + 'static> NullSink<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            received: Arc::new(AtomicU64::new(0)),
            _type: PhantomData,
        }
    }

    /// Shared counter of items consumed so far.
    pub fn received(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.received)
    }
}

impl<T: Copy + Send + 'static> StreamBlock for NullSink<T> {
    fn name(&self) -> &str {
        "null_sink"
    }

    fn input_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn output_signature(&self) -> Signature {
        Signature::none()
    }

    fn work(
        &mut self,
        inputs: &[StreamInput],
        _outputs: &mut [StreamOutput],
        _msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        let n = inputs[0].available();
        if n == 0 {
            return Ok(BlockRet::InsufficientInput);
        }
        inputs[0].consume(n);
        self.received.fetch_add(n as u64, Ordering::Relaxed);
        Ok(BlockRet::Ok)
    }
}
