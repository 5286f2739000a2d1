//! Finite source feeding a vector of items into the graph

use std::mem::size_of;

use crate::runtime::{
    BlockRet, Message, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, WorkResult,
};

/// Source producing the items of a vector, optionally repeating forever
///
/// Without repeat the block returns `Done` together with its final chunk.
/// Tags registered with [`with_tag`](VectorSource::with_tag) are attached at
/// their absolute stream offsets as the matching items are produced.
pub struct VectorSource<T> {
    data: Vec<T>,
    pos: usize,
    repeat: bool,
    tags: Vec<(u64, String, Message)>,
}

impl<T: Copy + Send + 'static> VectorSource<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self {
            data,
            pos: 0,
            repeat: false,
            tags: Vec::new(),
        }
    }

    pub fn repeat(mut self) -> Self {
        self.repeat = true;
        self
    }

    pub fn with_tag(mut self, offset: u64, key: impl Into<String>, value: Message) -> Self {
        self.tags.push((offset, key.into(), value));
        self
    }
}

impl<T: Copy + Send + 'static> StreamBlock for VectorSource<T> {
    fn name(&self) -> &str {
        "vector_source"
    }

    fn input_signature(&self) -> Signature {
        Signature::none()
    }

    fn output_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn work(
        &mut self,
        _inputs: &[StreamInput],
        outputs: &mut [StreamOutput],
        _msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        if self.data.is_empty() {
            return Ok(BlockRet::Done);
        }
        let out = &mut outputs[0];
        let cap = out.capacity();
        if cap == 0 {
            return Ok(BlockRet::InsufficientOutput);
        }
        let base = out.offset();

        let mut written = 0;
        {
            let slice = out.slice_mut::<T>();
            while written < cap {
                if self.pos == self.data.len() {
                    if !self.repeat {
                        break;
                    }
                    self.pos = 0;
                }
                let n = (cap - written).min(self.data.len() - self.pos);
                slice[written..written + n]
                    .copy_from_slice(&self.data[self.pos..self.pos + n]);
                written += n;
                self.pos += n;
            }
        }

        for (offset, key, value) in &self.tags {
            if *offset >= base && *offset < base + written as u64 {
                out.add_tag((*offset - base) as usize, key.clone(), value.clone());
            }
        }
        out.produce(written);

        if !self.repeat && self.pos == self.data.len() {
            Ok(BlockRet::Done)
        } else {
            Ok(BlockRet::Ok)
        }
    }
}
