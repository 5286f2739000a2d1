//! Deinterleave one stream into N parallel streams

use std::marker::PhantomData;
use std::mem::size_of;

use crate::runtime::{
    BlockRet, MessagePorts, RateContract, Signature, StreamBlock, StreamInput, StreamOutput,
    WorkResult,
};

/// Splits an interleaved stream round-robin across its output ports:
/// input items `0, 1, .., N-1` land on outputs `0, 1, .., N-1`, and so on
pub struct StreamToStreams<T> {
    ports: usize,
    _type: PhantomData<fn() -> T>,
}

impl<T: Copy + Send + 'static> StreamToStreams<T> {
    pub fn new(ports: usize) -> Self {
        assert!(ports >= 1, "need at least one output stream");
        Self {
            ports,
            _type: PhantomData,
        }
    }
}

impl<T: Copy + Send + 'static> StreamBlock for StreamToStreams<T> {
    fn name(&self) -> &str {
        "stream_to_streams"
    }

    fn input_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn output_signature(&self) -> Signature {
        Signature::fixed(self.ports, size_of::<T>())
    }

    fn contract(&self) -> RateContract {
        RateContract::default().with_relative_rate(1.0 / self.ports as f64)
    }

    fn work(
        &mut self,
        inputs: &[StreamInput],
        outputs: &mut [StreamOutput],
        _msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        let input = &inputs[0];
        let out_cap = outputs.iter().map(|o| o.capacity()).min().unwrap_or(0);
        let rounds = (input.available() / self.ports).min(out_cap);
        if rounds == 0 {
            return Ok(if input.available() < self.ports {
                BlockRet::InsufficientInput
            } else {
                BlockRet::InsufficientOutput
            });
        }
        let skip = input.history() - 1;
        let src = input.slice::<T>();
        for (p, out) in outputs.iter_mut().enumerate() {
            let dst = out.slice_mut::<T>();
            for r in 0..rounds {
                dst[r] = src[skip + r * self.ports + p];
            }
            out.produce(rounds);
        }
        input.consume(rounds * self.ports);
        Ok(BlockRet::Ok)
    }
}
