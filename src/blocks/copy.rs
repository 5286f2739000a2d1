//! 1:1 passthrough

use std::marker::PhantomData;
use std::mem::size_of;

use crate::runtime::{
    BlockRet, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, TagPropagation,
    WorkResult,
};

/// Copies items from input to output unchanged
pub struct Copy<T> {
    _type: PhantomData<fn() -> T>,
}

impl<T: std::marker::Copy + Send + 'static> Copy<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<T: std::marker::Copy + Send + 'static> StreamBlock for Copy<T> {
    fn name(&self) -> &str {
        "copy"
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
        let input = &inputs[0];
        let out = &mut outputs[0];
        let n = input.available().min(out.capacity());
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
        Ok(BlockRet::Ok)
    }
}
