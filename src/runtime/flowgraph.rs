//! Flowgraph construction and validation
//!
//! A flowgraph is the DAG of blocks plus stream and message edges. Stream
//! edges must connect ports of matching item size and may not form cycles;
//! message edges may cycle because delivery is queued and asynchronous.
//! `validate` performs the full topological and sizing pass before anything
//! runs — no partial graph ever executes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::block::{RateContract, StreamBlock};
use super::buffer::{Buffer, ReaderId, round_capacity};
use super::config::RuntimeConfig;
use super::errors::TopologyError;
use super::message::MessageQueue;
use super::tag::TagPropagation;

/// Unique identifier for a block in a flowgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// A directed stream connection between two blocks
#[derive(Debug, Clone, Copy)]
pub struct StreamEdge {
    pub src: BlockId,
    pub src_port: usize,
    pub dst: BlockId,
    pub dst_port: usize,
}

/// A directed message connection between two blocks (port indices into the
/// blocks' declared message port lists)
#[derive(Debug, Clone, Copy)]
pub struct MessageEdge {
    pub src: BlockId,
    pub src_port: usize,
    pub dst: BlockId,
    pub dst_port: usize,
}

/// The graph of blocks and edges, built once and validated before execution
pub struct Flowgraph {
    config: RuntimeConfig,
    blocks: Vec<Box<dyn StreamBlock>>,
    stream_edges: Vec<StreamEdge>,
    message_edges: Vec<MessageEdge>,
}

impl Flowgraph {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            config,
            blocks: Vec::new(),
            stream_edges: Vec::new(),
            message_edges: Vec::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Add a block and return its handle.
    pub fn add_block(&mut self, block: impl StreamBlock + 'static) -> BlockId {
        let id = BlockId(self.blocks.len());
        debug!("adding block {}: {}", id.0, block.name());
        self.blocks.push(Box::new(block));
        id
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn label(&self, id: BlockId) -> String {
        format!("{}#{}", self.blocks[id.0].name(), id.0)
    }

    fn check_block(&self, id: BlockId) -> Result<(), TopologyError> {
        if id.0 >= self.blocks.len() {
            return Err(TopologyError::BlockNotFound(id.0));
        }
        Ok(())
    }

    /// Connect a stream edge. Fails fast on item-size mismatch, out-of-range
    /// ports, a second connection into the same input port, or a cycle among
    /// stream edges.
    pub fn connect(
        &mut self,
        src: BlockId,
        src_port: usize,
        dst: BlockId,
        dst_port: usize,
    ) -> Result<(), TopologyError> {
        self.check_block(src)?;
        self.check_block(dst)?;

        let out_sig = self.blocks[src.0].output_signature();
        if src_port >= out_sig.max_ports() {
            return Err(TopologyError::OutputPortOutOfRange {
                block: self.label(src),
                port: src_port,
            });
        }
        let in_sig = self.blocks[dst.0].input_signature();
        if dst_port >= in_sig.max_ports() {
            return Err(TopologyError::InputPortOutOfRange {
                block: self.label(dst),
                port: dst_port,
            });
        }

        let src_size = out_sig.item_size(src_port);
        let dst_size = in_sig.item_size(dst_port);
        if src_size != dst_size {
            return Err(TopologyError::ItemSizeMismatch {
                src_block: self.label(src),
                src_port,
                src_size,
                dst_block: self.label(dst),
                dst_port,
                dst_size,
            });
        }

        if self
            .stream_edges
            .iter()
            .any(|e| e.dst == dst && e.dst_port == dst_port)
        {
            return Err(TopologyError::DuplicateInput {
                block: self.label(dst),
                port: dst_port,
            });
        }

        if self.reaches(dst, src) {
            return Err(TopologyError::StreamCycle {
                src: self.label(src),
                dst: self.label(dst),
            });
        }

        self.stream_edges.push(StreamEdge {
            src,
            src_port,
            dst,
            dst_port,
        });
        Ok(())
    }

    /// Connect a message edge by port name. Message edges may form cycles.
    pub fn connect_message(
        &mut self,
        src: BlockId,
        src_port: &str,
        dst: BlockId,
        dst_port: &str,
    ) -> Result<(), TopologyError> {
        self.check_block(src)?;
        self.check_block(dst)?;

        let src_idx = self.blocks[src.0]
            .message_outputs()
            .iter()
            .position(|p| *p == src_port)
            .ok_or_else(|| TopologyError::MessagePortNotFound {
                block: self.label(src),
                port: src_port.to_string(),
            })?;
        let dst_idx = self.blocks[dst.0]
            .message_inputs()
            .iter()
            .position(|p| *p == dst_port)
            .ok_or_else(|| TopologyError::MessagePortNotFound {
                block: self.label(dst),
                port: dst_port.to_string(),
            })?;

        self.message_edges.push(MessageEdge {
            src,
            src_port: src_idx,
            dst,
            dst_port: dst_idx,
        });
        Ok(())
    }

    /// True if `to` is reachable from `from` along stream edges.
    fn reaches(&self, from: BlockId, to: BlockId) -> bool {
        if from == to {
            return true;
        }
        let mut stack = vec![from];
        let mut seen = vec![false; self.blocks.len()];
        seen[from.0] = true;
        while let Some(node) = stack.pop() {
            for edge in self.stream_edges.iter().filter(|e| e.src == node) {
                if edge.dst == to {
                    return true;
                }
                if !seen[edge.dst.0] {
                    seen[edge.dst.0] = true;
                    stack.push(edge.dst);
                }
            }
        }
        false
    }

    fn connected_counts(&self, id: BlockId) -> (Vec<bool>, Vec<bool>) {
        let in_max = self.blocks[id.0].input_signature().max_ports();
        let out_max = self.blocks[id.0].output_signature().max_ports();
        let mut ins = vec![false; in_max];
        let mut outs = vec![false; out_max];
        for edge in &self.stream_edges {
            if edge.dst == id {
                ins[edge.dst_port] = true;
            }
            if edge.src == id {
                outs[edge.src_port] = true;
            }
        }
        (ins, outs)
    }

    /// Full topological check and buffer-sizing pass. Nothing runs on a
    /// graph that fails here.
    pub fn validate(&self) -> Result<(), TopologyError> {
        for i in 0..self.blocks.len() {
            let id = BlockId(i);
            let (ins, outs) = self.connected_counts(id);
            let n_in = ins.iter().filter(|c| **c).count();
            let n_out = outs.iter().filter(|c| **c).count();

            // Connected ports must be dense from port 0.
            if ins[..n_in].iter().any(|c| !*c) {
                return Err(TopologyError::NonContiguousPorts { block: self.label(id) });
            }
            if outs[..n_out].iter().any(|c| !*c) {
                return Err(TopologyError::NonContiguousPorts { block: self.label(id) });
            }

            let in_sig = self.blocks[i].input_signature();
            if !in_sig.accepts_count(n_in) {
                return Err(TopologyError::CardinalityViolation {
                    block: self.label(id),
                    side: "input",
                    min: in_sig.min_ports(),
                    max: in_sig.max_ports(),
                    connected: n_in,
                });
            }
            let out_sig = self.blocks[i].output_signature();
            if !out_sig.accepts_count(n_out) {
                return Err(TopologyError::CardinalityViolation {
                    block: self.label(id),
                    side: "output",
                    min: out_sig.min_ports(),
                    max: out_sig.max_ports(),
                    connected: n_out,
                });
            }

            if n_in > 0
                && n_out > 0
                && matches!(self.blocks[i].tag_propagation(), TagPropagation::OneToOne)
                && n_in != n_out
            {
                return Err(TopologyError::TagPortMismatch {
                    block: self.label(id),
                    inputs: n_in,
                    outputs: n_out,
                });
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Topologically-consistent block order over the stream edges (Kahn).
    pub fn topological_order(&self) -> Result<Vec<BlockId>, TopologyError> {
        let n = self.blocks.len();
        let mut indegree = vec![0usize; n];
        for edge in &self.stream_edges {
            indegree[edge.dst.0] += 1;
        }
        let mut queue: Vec<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = queue.pop() {
            order.push(BlockId(node));
            for edge in self.stream_edges.iter().filter(|e| e.src.0 == node) {
                indegree[edge.dst.0] -= 1;
                if indegree[edge.dst.0] == 0 {
                    queue.push(edge.dst.0);
                }
            }
        }
        if order.len() != n {
            // Some edge inside the residue witnesses the cycle.
            let edge = self
                .stream_edges
                .iter()
                .find(|e| indegree[e.dst.0] > 0)
                .expect("cycle without residual edge");
            return Err(TopologyError::StreamCycle {
                src: self.label(edge.src),
                dst: self.label(edge.dst),
            });
        }
        Ok(order)
    }

    /// Validate, allocate buffers and message queues, and wire everything
    /// into the form the schedulers execute.
    pub(crate) fn into_runnable(self) -> Result<Runnable, TopologyError> {
        self.validate()?;
        let order: Vec<usize> = self.topological_order()?.iter().map(|b| b.0).collect();

        let n = self.blocks.len();
        let labels: Vec<String> = (0..n).map(|i| self.label(BlockId(i))).collect();
        let contracts: Vec<RateContract> = self.blocks.iter().map(|b| b.contract()).collect();
        let policies: Vec<TagPropagation> =
            self.blocks.iter().map(|b| b.tag_propagation()).collect();

        info!(
            "wiring flowgraph: {} blocks, {} stream edges, {} message edges",
            n,
            self.stream_edges.len(),
            self.message_edges.len()
        );

        // One buffer per producing (block, port); readers attach per edge.
        let mut buffers: Vec<Buffer> = Vec::new();
        let mut buffer_writer: Vec<usize> = Vec::new();
        let mut buffer_readers: Vec<Vec<usize>> = Vec::new();
        let mut by_source: HashMap<(usize, usize), usize> = HashMap::new();

        let mut in_ports: Vec<Vec<(usize, ReaderId)>> = vec![Vec::new(); n];

        for edge in &self.stream_edges {
            by_source
                .entry((edge.src.0, edge.src_port))
                .or_insert_with(|| {
                    let item_size = self.blocks[edge.src.0]
                        .output_signature()
                        .item_size(edge.src_port);
                    let multiple = contracts[edge.src.0].output_multiple;
                    let max_history = self
                        .stream_edges
                        .iter()
                        .filter(|e| e.src == edge.src && e.src_port == edge.src_port)
                        .map(|e| contracts[e.dst.0].history)
                        .max()
                        .unwrap_or(1);
                    let min_items =
                        (2 * multiple + max_history - 1).max(self.config.default_buffer_bytes / item_size);
                    let capacity =
                        round_capacity(min_items, item_size, self.config.granularity_bytes);
                    debug!(
                        "buffer for {}.{}: {} items x {} bytes",
                        labels[edge.src.0], edge.src_port, capacity, item_size
                    );
                    buffers.push(Buffer::new(capacity, item_size));
                    buffer_writer.push(edge.src.0);
                    buffer_readers.push(Vec::new());
                    buffers.len() - 1
                });
        }

        // Connected output ports are dense (validated), so sorting the
        // (port, buffer) pairs lines buffer indices up with port order.
        let mut out_ports: Vec<Vec<usize>> = vec![Vec::new(); n];
        for block in 0..n {
            let mut ports: Vec<(usize, usize)> = by_source
                .iter()
                .filter(|(key, _)| key.0 == block)
                .map(|(key, idx)| (key.1, *idx))
                .collect();
            ports.sort_by_key(|(port, _)| *port);
            out_ports[block] = ports.into_iter().map(|(_, idx)| idx).collect();
        }

        // Attach one reader per stream edge, ordered by destination port.
        let mut edges = self.stream_edges.clone();
        edges.sort_by_key(|e| (e.dst.0, e.dst_port));
        for edge in &edges {
            let buf_idx = by_source[&(edge.src.0, edge.src_port)];
            let reader = buffers[buf_idx]
                .add_reader(contracts[edge.dst.0].history)
                .expect("readers attach before any write");
            buffer_readers[buf_idx].push(edge.dst.0);
            in_ports[edge.dst.0].push((buf_idx, reader));
        }
        for buffer in &mut buffers {
            buffer.prime();
        }

        // Message wiring: one queue per declared input port, plus routes and
        // per-block source lists for drain-to-done tracking.
        let mut msg_in_queues: Vec<Vec<Arc<MessageQueue>>> = Vec::with_capacity(n);
        for block in &self.blocks {
            msg_in_queues.push(
                block
                    .message_inputs()
                    .iter()
                    .map(|_| {
                        Arc::new(MessageQueue::new(
                            self.config.message_queue_capacity,
                            self.config.message_overflow,
                        ))
                    })
                    .collect(),
            );
        }
        let mut msg_out_routes: Vec<Vec<Vec<(usize, usize)>>> = self
            .blocks
            .iter()
            .map(|b| vec![Vec::new(); b.message_outputs().len()])
            .collect();
        let mut msg_in_sources: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in &self.message_edges {
            msg_out_routes[edge.src.0][edge.src_port].push((edge.dst.0, edge.dst_port));
            msg_in_sources[edge.dst.0].push(edge.src.0);
        }

        Ok(Runnable {
            config: self.config,
            blocks: self.blocks,
            labels,
            order,
            buffers,
            buffer_writer,
            buffer_readers,
            out_ports,
            in_ports,
            msg_in_queues,
            msg_out_routes,
            msg_in_sources,
            contracts,
            policies,
        })
    }
}

impl Default for Flowgraph {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated flowgraph wired to its buffers and queues, ready to execute
pub(crate) struct Runnable {
    pub(crate) config: RuntimeConfig,
    pub(crate) blocks: Vec<Box<dyn StreamBlock>>,
    pub(crate) labels: Vec<String>,
    /// Block indices in topologically-consistent order.
    pub(crate) order: Vec<usize>,
    pub(crate) buffers: Vec<Buffer>,
    /// Buffer index -> writing block index.
    pub(crate) buffer_writer: Vec<usize>,
    /// Buffer index -> reading block index per attached reader.
    pub(crate) buffer_readers: Vec<Vec<usize>>,
    /// Block index -> connected output port -> buffer index.
    pub(crate) out_ports: Vec<Vec<usize>>,
    /// Block index -> connected input port -> (buffer index, reader id).
    pub(crate) in_ports: Vec<Vec<(usize, ReaderId)>>,
    /// Block index -> message input port -> queue.
    pub(crate) msg_in_queues: Vec<Vec<Arc<MessageQueue>>>,
    /// Block index -> message output port -> destinations.
    pub(crate) msg_out_routes: Vec<Vec<Vec<(usize, usize)>>>,
    /// Block index -> blocks posting into any of its message inputs.
    pub(crate) msg_in_sources: Vec<Vec<usize>>,
    pub(crate) contracts: Vec<RateContract>,
    pub(crate) policies: Vec<TagPropagation>,
}

impl Runnable {
    /// Queue handle for a block's named message input port, usable from any
    /// thread (including external callback threads).
    pub(crate) fn message_queue(&self, block: usize, port: &str) -> Option<Arc<MessageQueue>> {
        let idx = self.blocks[block]
            .message_inputs()
            .iter()
            .position(|p| *p == port)?;
        Some(Arc::clone(&self.msg_in_queues[block][idx]))
    }

    pub(crate) fn close_queues(&self) {
        for queues in &self.msg_in_queues {
            for queue in queues {
                queue.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block::{BlockRet, MessagePorts, Signature};
    use crate::runtime::buffer::{StreamInput, StreamOutput};
    use crate::runtime::errors::WorkResult;

    struct Stub {
        name: &'static str,
        inputs: Signature,
        outputs: Signature,
    }

    impl Stub {
        fn new(name: &'static str, inputs: Signature, outputs: Signature) -> Self {
            Self {
                name,
                inputs,
                outputs,
            }
        }
    }

    impl StreamBlock for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn input_signature(&self) -> Signature {
            self.inputs.clone()
        }
        fn output_signature(&self) -> Signature {
            self.outputs.clone()
        }
        fn work(
            &mut self,
            _inputs: &[StreamInput],
            _outputs: &mut [StreamOutput],
            _msgs: &mut MessagePorts,
        ) -> WorkResult<BlockRet> {
            Ok(BlockRet::Ok)
        }
    }

    fn src4() -> Stub {
        Stub::new("src", Signature::none(), Signature::fixed(1, 4))
    }

    fn sink4() -> Stub {
        Stub::new("sink", Signature::fixed(1, 4), Signature::none())
    }

    fn pass4() -> Stub {
        Stub::new("pass", Signature::fixed(1, 4), Signature::fixed(1, 4))
    }

    #[test]
    fn test_simple_chain_validates() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(src4());
        let b = fg.add_block(pass4());
        let c = fg.add_block(sink4());
        fg.connect(a, 0, b, 0).unwrap();
        fg.connect(b, 0, c, 0).unwrap();
        assert!(fg.validate().is_ok());
    }

    #[test]
    fn test_item_size_mismatch_rejected() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(src4());
        let b = fg.add_block(Stub::new("sink8", Signature::fixed(1, 8), Signature::none()));
        let err = fg.connect(a, 0, b, 0).unwrap_err();
        assert!(matches!(err, TopologyError::ItemSizeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_input_rejected() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(src4());
        let b = fg.add_block(src4());
        let c = fg.add_block(sink4());
        fg.connect(a, 0, c, 0).unwrap();
        let err = fg.connect(b, 0, c, 0).unwrap_err();
        assert!(matches!(err, TopologyError::DuplicateInput { .. }));
    }

    #[test]
    fn test_fanout_from_one_output_allowed() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(src4());
        let b = fg.add_block(sink4());
        let c = fg.add_block(sink4());
        fg.connect(a, 0, b, 0).unwrap();
        fg.connect(a, 0, c, 0).unwrap();
        assert!(fg.validate().is_ok());
    }

    #[test]
    fn test_stream_cycle_rejected() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(pass4());
        let b = fg.add_block(pass4());
        fg.connect(a, 0, b, 0).unwrap();
        let err = fg.connect(b, 0, a, 0).unwrap_err();
        assert!(matches!(err, TopologyError::StreamCycle { .. }));
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(pass4());
        let err = fg.connect(a, 0, a, 0).unwrap_err();
        assert!(matches!(err, TopologyError::StreamCycle { .. }));
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(src4());
        let b = fg.add_block(sink4());
        let err = fg.connect(a, 1, b, 0).unwrap_err();
        assert!(matches!(err, TopologyError::OutputPortOutOfRange { .. }));
    }

    #[test]
    fn test_unconnected_required_input_rejected() {
        let mut fg = Flowgraph::new();
        let _a = fg.add_block(src4());
        let _b = fg.add_block(sink4());
        let err = fg.validate().unwrap_err();
        assert!(matches!(err, TopologyError::CardinalityViolation { .. }));
    }

    #[test]
    fn test_message_cycle_allowed() {
        struct Chatty;
        impl StreamBlock for Chatty {
            fn name(&self) -> &str {
                "chatty"
            }
            fn input_signature(&self) -> Signature {
                Signature::none()
            }
            fn output_signature(&self) -> Signature {
                Signature::none()
            }
            fn message_inputs(&self) -> &[&str] {
                &["in"]
            }
            fn message_outputs(&self) -> &[&str] {
                &["out"]
            }
            fn work(
                &mut self,
                _inputs: &[StreamInput],
                _outputs: &mut [StreamOutput],
                _msgs: &mut MessagePorts,
            ) -> WorkResult<BlockRet> {
                Ok(BlockRet::Done)
            }
        }

        let mut fg = Flowgraph::new();
        let a = fg.add_block(Chatty);
        let b = fg.add_block(Chatty);
        fg.connect_message(a, "out", b, "in").unwrap();
        fg.connect_message(b, "out", a, "in").unwrap();
        assert!(fg.validate().is_ok(), "message edges are exempt from acyclicity");
    }

    #[test]
    fn test_unknown_message_port_rejected() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(src4());
        let b = fg.add_block(sink4());
        let err = fg.connect_message(a, "nope", b, "in").unwrap_err();
        assert!(matches!(err, TopologyError::MessagePortNotFound { .. }));
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let mut fg = Flowgraph::new();
        let sink = fg.add_block(sink4());
        let src = fg.add_block(src4());
        let mid = fg.add_block(pass4());
        fg.connect(src, 0, mid, 0).unwrap();
        fg.connect(mid, 0, sink, 0).unwrap();

        let order = fg.topological_order().unwrap();
        let pos = |id: BlockId| order.iter().position(|b| *b == id).unwrap();
        assert!(pos(src) < pos(mid));
        assert!(pos(mid) < pos(sink));
    }

    #[test]
    fn test_wiring_shares_buffer_on_fanout() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block(src4());
        let b = fg.add_block(sink4());
        let c = fg.add_block(sink4());
        fg.connect(a, 0, b, 0).unwrap();
        fg.connect(a, 0, c, 0).unwrap();

        let runnable = fg.into_runnable().unwrap();
        assert_eq!(runnable.buffers.len(), 1, "fan-out shares one buffer");
        assert_eq!(runnable.buffer_readers[0].len(), 2);
        assert_eq!(runnable.in_ports[b.0][0].0, runnable.in_ports[c.0][0].0);
    }
}
