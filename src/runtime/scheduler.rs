//! Single-threaded cooperative scheduler
//!
//! Scans the blocks in a topologically-consistent order; for each ready
//! block it drains pending messages into the block's handlers, computes
//! available input items and free output space, invokes the work routine,
//! commits the recorded consume/produce counts, propagates tags, and routes
//! emitted messages. A full scan with no progress and no stop request is not
//! an error — the scheduler yields briefly and retries, so blocks awaiting
//! asynchronous external input (hardware, network) are simply polled again.
//!
//! Everything runs on the caller's thread: buffer metadata needs no locks
//! because this scheduler is the single actor. Message queues stay
//! mutex-protected so external threads can post into the graph; to keep the
//! single thread deadlock-free, deliveries out of a handler or work call use
//! the non-blocking post and drop (with a warning) when a bounded
//! destination queue is full.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, error, info, warn};

use super::block::{BlockRet, MessagePorts};
use super::buffer::{StreamInput, StreamOutput};
use super::errors::{BlockRunError, TopologyError, WorkError};
use super::flowgraph::{BlockId, Flowgraph, Runnable};
use super::message::MessageQueue;
use super::tag::{consumed_tag_windows, propagate_tags};
use super::threaded::BlockNotifier;

/// Execution state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Ready,
    BlockedOnInput,
    BlockedOnOutput,
    Done,
}

/// Cooperative cancellation handle, usable from any thread
///
/// `stop()` sets the shared flag the schedulers observe at invocation
/// boundaries, wakes any parked worker threads, and closes the message
/// queues so blocked posts and takes return instead of hanging.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    wakers: Vec<Arc<BlockNotifier>>,
    queues: Vec<Arc<MessageQueue>>,
}

impl StopHandle {
    pub(crate) fn new(
        flag: Arc<AtomicBool>,
        wakers: Vec<Arc<BlockNotifier>>,
        queues: Vec<Arc<MessageQueue>>,
    ) -> Self {
        Self {
            flag,
            wakers,
            queues,
        }
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
        for waker in &self.wakers {
            waker.notify();
        }
        for queue in &self.queues {
            queue.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Runtime scheduler driving every block on the calling thread
pub struct CooperativeScheduler {
    runnable: Runnable,
    states: Vec<BlockState>,
    stop: Arc<AtomicBool>,
}

impl CooperativeScheduler {
    /// Validate and wire the flowgraph. Nothing runs if this fails.
    pub fn new(flowgraph: Flowgraph) -> Result<Self, TopologyError> {
        let runnable = flowgraph.into_runnable()?;
        let states = vec![BlockState::Ready; runnable.blocks.len()];
        Ok(Self {
            runnable,
            states,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for requesting a cooperative stop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        let queues = self
            .runnable
            .msg_in_queues
            .iter()
            .flatten()
            .cloned()
            .collect();
        StopHandle::new(Arc::clone(&self.stop), Vec::new(), queues)
    }

    /// Queue handle for a block's named message input port. Posts may come
    /// from any thread, including external callback threads.
    pub fn message_input(&self, block: BlockId, port: &str) -> Option<Arc<MessageQueue>> {
        self.runnable.message_queue(block.0, port)
    }

    pub fn state(&self, block: BlockId) -> BlockState {
        self.states[block.0]
    }

    /// Run until every block is done or a stop is observed. A work error
    /// halts the run cleanly and is surfaced to the caller.
    pub fn run(&mut self) -> Result<(), BlockRunError> {
        info!(
            "cooperative scheduler: running {} blocks",
            self.runnable.blocks.len()
        );
        let result = loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("cooperative scheduler: stop requested");
                break Ok(());
            }
            if self.all_done() {
                info!("cooperative scheduler: all blocks done");
                break Ok(());
            }
            match self.step() {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.runnable.config.idle_sleep),
                Err(e) => {
                    error!("halting run: {}", e);
                    break Err(e);
                }
            }
        };
        self.runnable.close_queues();
        result
    }

    pub fn all_done(&self) -> bool {
        self.states.iter().all(|s| *s == BlockState::Done)
    }

    /// One full scan over all blocks. Returns whether any block made
    /// progress (consumed, produced, or exchanged messages).
    pub fn step(&mut self) -> Result<bool, BlockRunError> {
        let mut progress = false;
        for idx in 0..self.runnable.order.len() {
            let b = self.runnable.order[idx];
            progress |= self.tick_block(b)?;
        }
        Ok(progress)
    }

    fn err(&self, b: usize, error: WorkError) -> BlockRunError {
        BlockRunError {
            block: self.runnable.labels[b].clone(),
            error,
        }
    }

    fn mark_done(&mut self, b: usize) {
        debug!("block {} done", self.runnable.labels[b]);
        self.states[b] = BlockState::Done;
        for buf in self.runnable.out_ports[b].clone() {
            self.runnable.buffers[buf].set_done();
        }
    }

    /// Deliver pending messages to the block's handlers on this thread; a
    /// handler never interleaves with the block's own stream work.
    fn drain_messages(&mut self, b: usize) -> Result<bool, BlockRunError> {
        let n_ports = self.runnable.msg_in_queues[b].len();
        let mut progress = false;
        for port in 0..n_ports {
            loop {
                let msg = self.runnable.msg_in_queues[b][port].try_take();
                let Some(msg) = msg else { break };
                let mut ports = MessagePorts::new();
                if let Err(e) = self.runnable.blocks[b].handle_message(port, msg, &mut ports) {
                    return Err(self.err(b, e));
                }
                self.route_messages(b, &mut ports);
                progress = true;
            }
        }
        Ok(progress)
    }

    fn route_messages(&self, b: usize, ports: &mut MessagePorts) {
        for (port, msg) in ports.drain() {
            let Some(routes) = self.runnable.msg_out_routes[b].get(port) else {
                warn!(
                    "block {} posted on undeclared message port {}",
                    self.runnable.labels[b], port
                );
                continue;
            };
            for (dst, dst_port) in routes {
                let queue = &self.runnable.msg_in_queues[*dst][*dst_port];
                if queue.try_post(msg.clone()).is_err() {
                    warn!(
                        "message queue full: dropping message for {}",
                        self.runnable.labels[*dst]
                    );
                }
            }
        }
    }

    fn tick_block(&mut self, b: usize) -> Result<bool, BlockRunError> {
        if self.states[b] == BlockState::Done {
            return Ok(false);
        }

        let mut progress = self.drain_messages(b)?;

        let ins = self.runnable.in_ports[b].clone();
        let outs = self.runnable.out_ports[b].clone();

        // Message-only block: invoke work so it can emit or finish, then
        // check whether its message sources have drained to done.
        if ins.is_empty() && outs.is_empty() {
            let mut ports = MessagePorts::new();
            let ret = self.runnable.blocks[b].work(&[], &mut [], &mut ports);
            let ret = match ret {
                Ok(ret) => ret,
                Err(e) => return Err(self.err(b, e)),
            };
            progress |= !ports.is_empty();
            self.route_messages(b, &mut ports);
            if ret == BlockRet::Done {
                self.mark_done(b);
                return Ok(true);
            }
            let sources = &self.runnable.msg_in_sources[b];
            if !sources.is_empty()
                && sources.iter().all(|&s| self.states[s] == BlockState::Done)
                && self.runnable.msg_in_queues[b].iter().all(|q| q.is_empty())
            {
                self.mark_done(b);
                return Ok(true);
            }
            return Ok(progress);
        }

        // Free output space, floored to whole output multiples.
        let multiple = self.runnable.contracts[b].output_multiple;
        let mut target = usize::MAX;
        for &buf in &outs {
            let space = self.runnable.buffers[buf].space_available();
            target = target.min(space / multiple * multiple);
        }
        if !outs.is_empty() && target == 0 {
            // Production can never be observed once every downstream block
            // has finished; drain this block to done instead of parking it
            // forever.
            let downstream_done = outs.iter().all(|&buf| {
                self.runnable.buffer_readers[buf]
                    .iter()
                    .all(|&rb| self.states[rb] == BlockState::Done)
            });
            if downstream_done {
                self.mark_done(b);
                return Ok(true);
            }
            self.states[b] = BlockState::BlockedOnOutput;
            return Ok(progress);
        }

        // Input availability against the forecast for one atomic production.
        let upstream_done = ins
            .iter()
            .all(|&(buf, _)| self.runnable.buffers[buf].is_done());
        if !ins.is_empty() && !upstream_done {
            let history = self.runnable.contracts[b].history;
            let visible_min = ins
                .iter()
                .map(|&(buf, rd)| self.runnable.buffers[buf].items_available(rd))
                .min()
                .unwrap_or(0)
                + history
                - 1;
            let request = if outs.is_empty() { 1 } else { multiple };
            if visible_min < self.runnable.blocks[b].forecast(request) {
                self.states[b] = BlockState::BlockedOnInput;
                return Ok(progress);
            }
        }

        // Build the invocation views and run the block.
        let inputs: Vec<StreamInput> = ins
            .iter()
            .map(|&(buf, rd)| self.runnable.buffers[buf].input_view(rd))
            .collect();
        let mut outputs: Vec<StreamOutput> = Vec::with_capacity(outs.len());
        for &buf in &outs {
            outputs.push(self.runnable.buffers[buf].output_view(target, BlockId(b)));
        }
        let mut ports = MessagePorts::new();
        let ret = self.runnable.blocks[b].work(&inputs, &mut outputs, &mut ports);
        let ret = match ret {
            Ok(ret) => ret,
            Err(e) => return Err(self.err(b, e)),
        };
        progress |= !ports.is_empty();
        self.route_messages(b, &mut ports);

        // Commit recorded counts against the buffers; contract violations
        // (overflow/underflow) surface here as fatal block bugs.
        let consumed: Vec<usize> = inputs.iter().map(|v| v.consumed()).collect();
        let per_input = consumed_tag_windows(&inputs);
        let out_bases: Vec<u64> = outputs.iter().map(|o| o.offset()).collect();

        for (i, &(buf, rd)) in ins.iter().enumerate() {
            if let Err(e) = self.runnable.buffers[buf].post_read(rd, consumed[i]) {
                return Err(self.err(b, e.into()));
            }
        }
        for (o, &buf) in outs.iter().enumerate() {
            let pending = outputs[o].take_pending_tags();
            let produced = outputs[o].produced();
            self.runnable.buffers[buf].add_tags(pending);
            if let Err(e) = self.runnable.buffers[buf].post_write(produced) {
                return Err(self.err(b, e.into()));
            }
        }
        let routed = propagate_tags(
            self.runnable.policies[b],
            self.runnable.contracts[b].relative_rate,
            &per_input,
            &out_bases,
            BlockId(b),
        );
        for (o, tags) in routed.into_iter().enumerate() {
            if !tags.is_empty() {
                self.runnable.buffers[outs[o]].add_tags(tags);
            }
        }

        progress |= consumed.iter().any(|c| *c > 0) || outputs.iter().any(|o| o.produced() > 0);

        match ret {
            BlockRet::Ok => self.states[b] = BlockState::Ready,
            BlockRet::InsufficientInput => {
                if !ins.is_empty() && upstream_done {
                    // No more input will ever arrive; the block has drained.
                    self.mark_done(b);
                    progress = true;
                } else if !ins.is_empty() {
                    self.states[b] = BlockState::BlockedOnInput;
                } else {
                    // A source awaiting asynchronous external input stays
                    // ready and is polled again after the idle yield.
                    self.states[b] = BlockState::Ready;
                }
            }
            BlockRet::InsufficientOutput => self.states[b] = BlockState::BlockedOnOutput,
            BlockRet::Done => {
                self.mark_done(b);
                progress = true;
            }
        }
        Ok(progress)
    }
}
