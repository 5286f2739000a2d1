//! Decimator keeping the last item of every group of n

use std::marker::PhantomData;
use std::mem::size_of;

use crate::runtime::{
    BlockRet, MessagePorts, RateContract, Signature, StreamBlock, StreamInput, StreamOutput,
    WorkResult,
};

/// Consumes groups of `n` items and produces the last item of each group
pub struct KeepOneInN<T> {
    n: usize,
    _type: PhantomData<fn() -> T>,
}

impl<T: Copy + Send + 'static> KeepOneInN<T> {
    pub fn new(n: usize) -> Self {
        assert!(n >= 1, "decimation must be at least 1");
        Self {
            n,
            _type: PhantomData,
        }
    }
}

impl<T: Copy + Send + 'static> StreamBlock for KeepOneInN<T> {
    fn name(&self) -> &str {
        "keep_one_in_n"
    }

    fn input_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn output_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn contract(&self) -> RateContract {
        RateContract::default().with_relative_rate(1.0 / self.n as f64)
    }

    fn work(
        &mut self,
        inputs: &[StreamInput],
        outputs: &mut [StreamOutput],
        _msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        let input = &inputs[0];
        let out = &mut outputs[0];
        let groups = (input.available() / self.n).min(out.capacity());
        if groups == 0 {
            return Ok(if input.available() < self.n {
                BlockRet::InsufficientInput
            } else {
                BlockRet::InsufficientOutput
            });
        }
        let skip = input.history() - 1;
        let src = input.slice::<T>();
        let dst = out.slice_mut::<T>();
        for g in 0..groups {
            dst[g] = src[skip + g * self.n + self.n - 1];
        }
        input.consume(groups * self.n);
        out.produce(groups);
        Ok(BlockRet::Ok)
    }
}
