//! Pack a scalar stream into vector items

use std::marker::PhantomData;
use std::mem::size_of;

use crate::runtime::{
    BlockRet, MessagePorts, RateContract, Signature, StreamBlock, StreamInput, StreamOutput,
    WorkResult,
};

/// Packs groups of `k` scalar items into one `k`-element vector item
pub struct StreamToVector<T> {
    k: usize,
    _type: PhantomData<fn() -> T>,
}

impl<T: Copy + Send + 'static> StreamToVector<T> {
    pub fn new(items_per_vector: usize) -> Self {
        assert!(items_per_vector >= 1, "vector length must be at least 1");
        Self {
            k: items_per_vector,
            _type: PhantomData,
        }
    }
}

impl<T: Copy + Send + 'static> StreamBlock for StreamToVector<T> {
    fn name(&self) -> &str {
        "stream_to_vector"
    }

    fn input_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<T>())
    }

    fn output_signature(&self) -> Signature {
        Signature::fixed(1, self.k * size_of::<T>())
    }

    fn contract(&self) -> RateContract {
        RateContract::default().with_relative_rate(1.0 / self.k as f64)
    }

    fn work(
        &mut self,
        inputs: &[StreamInput],
        outputs: &mut [StreamOutput],
        _msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet> {
        let input = &inputs[0];
        let out = &mut outputs[0];
        let vectors = (input.available() / self.k).min(out.capacity());
        if vectors == 0 {
            return Ok(if input.available() < self.k {
                BlockRet::InsufficientInput
            } else {
                BlockRet::InsufficientOutput
            });
        }
        let skip = input.history() - 1;
        let n = vectors * self.k;
        out.slice_mut::<T>()[..n].copy_from_slice(&input.slice::<T>()[skip..skip + n]);
        input.consume(n);
        out.produce(vectors);
        Ok(BlockRet::Ok)
    }
}

#[cfg(test)]
mod tests {
    use crate::blocks::{StreamToVector, VectorSink, VectorSource, VectorToStream};
    use crate::runtime::{CooperativeScheduler, Flowgraph};

    #[test]
    fn test_pack_then_unpack_restores_the_stream() {
        // Scalars packed into 4-element vectors and unpacked again; the two
        // rate changers must agree on item sizes through the middle edge.
        let mut fg = Flowgraph::new();
        let src = fg.add_block(VectorSource::new((0u32..40).collect()));
        let pack = fg.add_block(StreamToVector::<u32>::new(4));
        let unpack = fg.add_block(VectorToStream::<u32>::new(4));
        let sink = VectorSink::<u32>::new();
        let data = sink.data();
        let snk = fg.add_block(sink);
        fg.connect(src, 0, pack, 0).unwrap();
        fg.connect(pack, 0, unpack, 0).unwrap();
        fg.connect(unpack, 0, snk, 0).unwrap();

        CooperativeScheduler::new(fg).unwrap().run().unwrap();
        assert_eq!(*data.lock().unwrap(), (0u32..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_leftover_smaller_than_a_vector_is_dropped_at_drain() {
        // 10 scalars into 4-element vectors: 2 full vectors, 2 leftovers
        // discarded when the upstream finishes.
        let mut fg = Flowgraph::new();
        let src = fg.add_block(VectorSource::new((0u32..10).collect()));
        let pack = fg.add_block(StreamToVector::<u32>::new(4));
        let sink = VectorSink::<[u32; 4]>::new();
        let data = sink.data();
        let snk = fg.add_block(sink);
        fg.connect(src, 0, pack, 0).unwrap();
        fg.connect(pack, 0, snk, 0).unwrap();

        CooperativeScheduler::new(fg).unwrap().run().unwrap();
        let got = data.lock().unwrap();
        assert_eq!(*got, vec![[0, 1, 2, 3], [4, 5, 6, 7]]);
    }
}
