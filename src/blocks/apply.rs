//! Item-wise map block

use std::marker::PhantomData;
use std::mem::size_of;

use crate::runtime::{
    BlockRet, MessagePorts, Signature, StreamBlock, StreamInput, StreamOutput, TagPropagation,
    WorkResult,
};

/// Applies a function to every input item
///
/// The element types may differ; the closure runs once per item and the
/// block stays 1:1 in item counts.
pub struct Apply<F, A, B>
where
    F: FnMut(&A) -> B + Send,
{
    f: F,
    _types: PhantomData<fn(A) -> B>,
}

impl<F, A, B> Apply<F, A, B>
where
    F: FnMut(&A) -> B + Send,
    A: Copy + Send + 'static,
    B: Copy + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

impl<F, A, B> StreamBlock for Apply<F, A, B>
where
    F: FnMut(&A) -> B + Send,
    A: Copy + Send + 'static,
    B: Copy + Send + 'static,
{
    fn name(&self) -> &str {
        "apply"
    }

    fn input_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<A>())
    }

    fn output_signature(&self) -> Signature {
        Signature::fixed(1, size_of::<B>())
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
        let src = input.slice::<A>();
        let dst = out.slice_mut::<B>();
        for i in 0..n {
            dst[i] = (self.f)(&src[skip + i]);
        }
        input.consume(n);
        out.produce(n);
        Ok(BlockRet::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{VectorSink, VectorSource};
    use crate::runtime::{CooperativeScheduler, Flowgraph};
    use num_complex::Complex;

    #[test]
    fn test_apply_maps_every_item() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block(VectorSource::new(vec![1.0f32, 2.0, 3.0]));
        let double = fg.add_block(Apply::new(|x: &f32| x * 2.0));
        let sink = VectorSink::<f32>::new();
        let data = sink.data();
        let snk = fg.add_block(sink);
        fg.connect(src, 0, double, 0).unwrap();
        fg.connect(double, 0, snk, 0).unwrap();

        CooperativeScheduler::new(fg).unwrap().run().unwrap();
        assert_eq!(*data.lock().unwrap(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_apply_changes_element_type() {
        // Complex 8-byte items in, real 4-byte items out.
        let samples: Vec<Complex<f32>> =
            (0..64).map(|i| Complex::new(i as f32, -(i as f32))).collect();
        let mut fg = Flowgraph::new();
        let src = fg.add_block(VectorSource::new(samples.clone()));
        let mag = fg.add_block(Apply::new(|x: &Complex<f32>| x.norm_sqr()));
        let sink = VectorSink::<f32>::new();
        let data = sink.data();
        let snk = fg.add_block(sink);
        fg.connect(src, 0, mag, 0).unwrap();
        fg.connect(mag, 0, snk, 0).unwrap();

        CooperativeScheduler::new(fg).unwrap().run().unwrap();
        let got = data.lock().unwrap();
        assert_eq!(got.len(), 64);
        assert_eq!(got[3], samples[3].norm_sqr());
    }
}
