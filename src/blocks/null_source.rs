//! Source producing default-valued items forever

use std::marker::PhantomData;
use std::mem::size_of;

use crate::runtime::{
    BlockRet, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, WorkResult,
};

/// Fills its output with `T::default()` as fast as space allows
pub struct NullSource<T> {
    _type: PhantomData<fn() -> T>,
}

impl<T: Default + Copy + Send + 'static> NullSource<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<T: Default + Copy + Send + 'static> StreamBlock for NullSource<T> {
    fn name(&self) -> &str {
        "null_source"
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
        let out = &mut outputs[0];
        let cap = out.capacity();
        if cap == 0 {
            return Ok(BlockRet::InsufficientOutput);
        }
        out.slice_mut::<T>()[..cap].fill(T::default());
        out.produce(cap);
        Ok(BlockRet::Ok)
    }
}
