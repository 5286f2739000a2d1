//! Pass through the first N items, then finish

use std::marker::PhantomData;
use std::mem::size_of;

use crate::runtime::{
    BlockRet, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, TagPropagation,
    WorkResult,
};

/// Copies exactly `n` items from input to output, then returns `Done`
pub struct Head<T> {
    remaining: u64,
    _type: PhantomData<fn() -> T>,
}

impl<T: Copy + Send + 'static> Head<T> {
    pub fn new(n: u64) -> Self {
        Self {
            remaining: n,
            _type: PhantomData,
        }
    }
}

impl<T: Copy + Send + 'static> StreamBlock for Head<T> {
    fn name(&self) -> &str {
        "head"
    }

    fn input_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn output_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn tag_propagation(&self) -> TagPropagation {
        TagPropagation::OneToOne
    }

    fn work(
        &mut self,
        inputs: &[StreamInput],
        outputs: &mut [StreamOutput],
        _msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        if self.remaining == 0 {
            return Ok(BlockRet::Done);
        }
        let input = &inputs[0];
        let out = &mut outputs[0];
        let n = input
            .available()
            .min(out.capacity())
            .min(self.remaining as usize);
        if n == 0 {
            return Ok(if input.available() == 0 {
                BlockRet::InsufficientInput
            } else {
                BlockRet::InsufficientOutput
            });
        }
        let skip = input.history() - 1;
        out.slice_mut::<T>()[..n].copy_from_slice(&input.slice::<T>()[skip..skip + n]);
        input.consume(n);
        out.produce(n);
        self.remaining -= n as u64;

        if self.remaining == 0 {
            Ok(BlockRet::Done)
        } else {
            Ok(BlockRet::Ok)
        }
    }
}
