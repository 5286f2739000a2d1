//! Unpack vector items into a scalar stream

use std::marker::PhantomData;
use std::mem::size_of;

use crate::runtime::{
    BlockRet, MessagePorts, RateContract, Signature, StreamBlock, StreamInput, StreamOutput,
    WorkResult,
};

/// Unpacks `k`-element vector items into `k` scalar items each
///
/// This is the size adapter between differently-sized ports: an 8-byte
/// vector item feeding a 4-byte scalar stream is `VectorToStream::<f32>::new(2)`.
pub struct VectorToStream<T> {
    k: usize,
    _type: PhantomData<fn() -> T>,
}

impl<T: Copy + Send + 'static> VectorToStream<T> {
    pub fn new(items_per_vector: usize) -> Self {
        assert!(items_per_vector >= 1, "vector length must be at least 1");
        Self {
            k: items_per_vector,
            _type: PhantomData,
        }
    }
}

impl<T: Copy + Send + 'static> StreamBlock for VectorToStream<T> {
    fn name(&self) -> &str {
        "vector_to_stream"
    }

    fn input_signature(&self) -> Signature {
        Signature::fixed(1, self.k * size_of::<T>())
    }

    fn output_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn contract(&self) -> RateContract {
        RateContract::default()
            .with_relative_rate(self.k as f64)
            .with_output_multiple(self.k)
    }

    fn work(
        &mut self,
        inputs: &[StreamInput],
        outputs: &mut [StreamOutput],
        _msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        let input = &inputs[0];
        let out = &mut outputs[0];
        let vectors = input.available().min(out.capacity() / self.k);
        if vectors == 0 {
            return Ok(if input.available() == 0 {
                BlockRet::InsufficientInput
            } else {
                BlockRet::InsufficientOutput
            });
        }
        let skip = (input.history() - 1) * self.k;
        let n = vectors * self.k;
        out.slice_mut::<T>()[..n].copy_from_slice(&input.slice::<T>()[skip..skip + n]);
        input.consume(vectors);
        out.produce(n);
        Ok(BlockRet::Ok)
    }
}
