//! Sink collecting received items (and their tags) for inspection

use std::mem::size_of;
use std::sync::{Arc, Mutex};

use crate::runtime::{
    BlockRet, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, Tag, WorkResult,
};

/// Sink appending every received item to a shared vector
///
/// Keep the handles from [`data`](VectorSink::data) and
/// [`tags`](VectorSink::tags) before moving the block into the flowgraph.
pub struct VectorSink<T> {
    data: Arc<Mutex<Vec<T>>>,
    tags: Arc<Mutex<Vec<Tag>>>,
}

impl<T: Copy + Send + 'static> VectorSink<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
            tags: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected items.
    pub fn data(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.data)
    }

    /// Shared handle to the tags observed in the consumed windows.
    pub fn tags(&self) -> Arc<Mutex<Vec<Tag>>> {
        Arc::clone(&self.tags)
    }
}

impl<T: Copy + Send + 'static> StreamBlock for VectorSink<T> {
    fn name(&self) -> &str {
        "vector_sink"
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
        let input = &inputs[0];
        let n = input.available();
        if n == 0 {
            return Ok(BlockRet::InsufficientInput);
        }
        let skip = input.history() - 1;
        self.data
            .lock()
            .unwrap()
            .extend_from_slice(&input.slice::<T>()[skip..skip + n]);
        self.tags
            .lock()
            .unwrap()
            .extend(input.tags().iter().cloned());
        input.consume(n);
        Ok(BlockRet::Ok)
    }
}
