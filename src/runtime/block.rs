//! Block execution contract
//!
//! Defines the [`StreamBlock`] trait every node in the flowgraph implements.
//! A block never owns buffers; the scheduler hands it read-only input views
//! and writable output views for one invocation, the block records consumed
//! and produced counts on the views, and returns a [`BlockRet`] describing
//! what happened. Back-pressure (`InsufficientInput`/`InsufficientOutput`)
//! and completion (`Done`) are ordinary return values, never errors.

use super::buffer::{StreamInput, StreamOutput};
use super::errors::WorkResult;
use super::message::Message;
use super::tag::TagPropagation;

/// Outcome of one work invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRet {
    /// Normal progress; the consumed/produced counts recorded on the views
    /// are committed by the scheduler.
    Ok,
    /// The block needs more input before it can produce anything. Retried
    /// once upstream posts more items.
    InsufficientInput,
    /// Not enough free output space for one atomic unit of production.
    /// Retried once downstream consumes.
    InsufficientOutput,
    /// The block has permanently finished. Any counts recorded in this final
    /// invocation are still committed, then the block is never called again.
    Done,
}

/// Scheduling constraints a block declares alongside its work routine
///
/// Composed as a value rather than inherited: a decimator is an ordinary
/// block whose contract says `relative_rate = 1.0 / n`.
#[derive(Debug, Clone, Copy)]
pub struct RateContract {
    /// The block always sees its current input item plus the previous
    /// `history - 1` items as valid look-back (pre-zeroed at stream start).
    pub history: usize,
    /// Output item counts are granted in whole multiples of this value.
    pub output_multiple: usize,
    /// Ratio of output items to input items, used to size invocation
    /// requests and to rescale tag offsets.
    pub relative_rate: f64,
}

impl Default for RateContract {
    fn default() -> Self {
        Self {
            history: 1,
            output_multiple: 1,
            relative_rate: 1.0,
        }
    }
}

impl RateContract {
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    pub fn with_output_multiple(mut self, multiple: usize) -> Self {
        self.output_multiple = multiple.max(1);
        self
    }

    pub fn with_relative_rate(mut self, rate: f64) -> Self {
        self.relative_rate = rate;
        self
    }

    /// Default forecast: input items (look-back included) required to
    /// produce `noutput` items.
    pub fn forecast(&self, noutput: usize) -> usize {
        let items = (noutput as f64 / self.relative_rate).ceil() as usize;
        items + self.history - 1
    }
}

/// Stream-port signature for one side of a block
///
/// `min..=max` bounds how many ports may be connected; `sizes` gives the
/// item size per port, with the last entry repeating for any further ports.
#[derive(Debug, Clone)]
pub struct Signature {
    min: usize,
    max: usize,
    sizes: Vec<usize>,
}

impl Signature {
    /// A fixed number of ports sharing one item size.
    pub fn fixed(count: usize, item_size: usize) -> Self {
        Self {
            min: count,
            max: count,
            sizes: vec![item_size],
        }
    }

    /// Between `min` and `max` ports sharing one item size.
    pub fn ranged(min: usize, max: usize, item_size: usize) -> Self {
        Self {
            min,
            max,
            sizes: vec![item_size],
        }
    }

    /// Explicit per-port item sizes; the last size repeats for further ports.
    pub fn per_port(min: usize, max: usize, sizes: Vec<usize>) -> Self {
        assert!(!sizes.is_empty() || max == 0, "per-port signature needs at least one size");
        Self { min, max, sizes }
    }

    /// No ports on this side.
    pub fn none() -> Self {
        Self {
            min: 0,
            max: 0,
            sizes: Vec::new(),
        }
    }

    pub fn min_ports(&self) -> usize {
        self.min
    }

    pub fn max_ports(&self) -> usize {
        self.max
    }

    pub fn item_size(&self, port: usize) -> usize {
        let idx = port.min(self.sizes.len().saturating_sub(1));
        self.sizes[idx]
    }

    pub fn accepts_count(&self, connected: usize) -> bool {
        connected >= self.min && connected <= self.max
    }
}

/// Per-invocation surface for emitting messages from `work` or a handler
///
/// Posts are collected here and routed to the destination queues by the
/// scheduler once the invocation returns, so a handler that posts back
/// toward its own source only enqueues and never re-enters scheduling.
#[derive(Debug, Default)]
pub struct MessagePorts {
    pending: Vec<(usize, Message)>,
}

impl MessagePorts {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Post `msg` on the block's output message port `port` (an index into
    /// [`StreamBlock::message_outputs`]).
    pub fn post(&mut self, port: usize, msg: Message) {
        self.pending.push((port, msg));
    }

    pub(crate) fn drain(&mut self) -> Vec<(usize, Message)> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A processing block in the flowgraph
/// - Sources have 0 inputs and N outputs
/// - Sinks have N inputs and 0 outputs
/// - Processors have N inputs and M outputs
/// - Message-only blocks may have no stream ports at all
pub trait StreamBlock: Send {
    /// Debug name for this block.
    fn name(&self) -> &str;

    /// Input stream-port signature.
    fn input_signature(&self) -> Signature;

    /// Output stream-port signature.
    fn output_signature(&self) -> Signature;

    /// Scheduling constraints; the default is a 1:1 block with no history.
    fn contract(&self) -> RateContract {
        RateContract::default()
    }

    /// How tags cross this block.
    fn tag_propagation(&self) -> TagPropagation {
        TagPropagation::AllToAll
    }

    /// Input items (look-back included) required to produce `noutput` output
    /// items. The scheduler uses this to size the invocation request.
    fn forecast(&self, noutput: usize) -> usize {
        self.contract().forecast(noutput)
    }

    /// Names of this block's input message ports.
    fn message_inputs(&self) -> &[&str] {
        &[]
    }

    /// Names of this block's output message ports.
    fn message_outputs(&self) -> &[&str] {
        &[]
    }

    /// Handle one message delivered to input message port `port`.
    ///
    /// Runs on the scheduler's execution contour between work invocations,
    /// never concurrently with this block's own `work`. State changed here
    /// takes effect at the next work-invocation boundary.
    fn handle_message(&mut self, port: usize, msg: Message, msgs: &mut MessagePorts) -> WorkResult {
        let _ = (port, msg, msgs);
        Ok(())
    }

    /// Do one unit of work: read from the input views, write to the output
    /// views, record progress with `consume`/`produce`, and report the
    /// outcome. Runs to completion without suspending; the scheduler commits
    /// the recorded counts afterwards.
    fn work(
        &mut self,
        inputs: &[StreamInput],
        outputs: &mut [StreamOutput],
        msgs: &mut MessagePorts,
    ) -> WorkResult<BlockRet>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_forecast_identity_rate() {
        let c = RateContract::default();
        assert_eq!(c.forecast(100), 100);
    }

    #[test]
    fn test_forecast_decimator_with_history() {
        let c = RateContract::default()
            .with_relative_rate(0.25)
            .with_history(4);
        // 10 outputs need 40 inputs plus 3 look-back items.
        assert_eq!(c.forecast(10), 43);
    }

    #[test]
    fn test_forecast_interpolator_rounds_up() {
        let c = RateContract::default().with_relative_rate(2.0);
        assert_eq!(c.forecast(5), 3);
    }

    #[test]
    fn test_signature_size_repeats_last() {
        let sig = Signature::per_port(1, 3, vec![8, 4]);
        assert_eq!(sig.item_size(0), 8);
        assert_eq!(sig.item_size(1), 4);
        assert_eq!(sig.item_size(2), 4);
    }

    #[test]
    fn test_signature_cardinality() {
        let sig = Signature::ranged(1, 2, 4);
        assert!(!sig.accepts_count(0));
        assert!(sig.accepts_count(1));
        assert!(sig.accepts_count(2));
        assert!(!sig.accepts_count(3));
    }
}
