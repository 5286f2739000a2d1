//! Thread-per-block scheduler
//!
//! Spawns a dedicated worker thread for each block. Cross-thread buffers are
//! the same [`Buffer`] abstraction, with cursor updates published under a
//! mutex; each block owns a condition-variable notifier, and the classic
//! bounded-buffer signaling runs through them: committing a write wakes every
//! reader's block, committing a read wakes the writer's block.
//!
//! `stop()` sets a shared atomic flag observed cooperatively at the top of
//! each worker's loop and additionally wakes every condition variable (block
//! notifiers and message queues) so parked threads observe the flag and exit
//! rather than hang. `wait()` joins all workers through a completion channel
//! and returns the errors of any halted partitions.
//!
//! A work error — or a panic caught at the invocation boundary — halts
//! exactly that block's partition: the worker marks its buffers done, wakes
//! its neighbors, and exits; downstream blocks drain to done normally.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, warn};

use super::block::{BlockRet, MessagePorts, RateContract, StreamBlock};
use super::buffer::{Buffer, ReaderId, StreamInput, StreamOutput};
use super::errors::{BlockRunError, TopologyError, WorkError, WorkResult};
use super::flowgraph::{BlockId, Flowgraph, Runnable};
use super::message::MessageQueue;
use super::scheduler::StopHandle;
use super::tag::{TagPropagation, consumed_tag_windows, propagate_tags};
use super::watchdog::{WaitGuard, Watchdog, WatchdogHandle};

/// Safety-net timeout for parked workers; wakeups normally arrive through
/// the notifier well before this.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-block wakeup latch: `notify` records a pending wakeup, `wait` consumes
/// it or parks until one arrives (or the timeout elapses)
pub(crate) struct BlockNotifier {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl BlockNotifier {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            let (next, _) = self.cv.wait_timeout(pending, timeout).unwrap();
            pending = next;
        }
        *pending = false;
    }
}

struct InPort {
    buf: Arc<Mutex<Buffer>>,
    reader: ReaderId,
    writer_notifier: Arc<BlockNotifier>,
}

struct OutPort {
    buf: Arc<Mutex<Buffer>>,
    reader_notifiers: Vec<Arc<BlockNotifier>>,
    reader_blocks: Vec<usize>,
}

enum Tick {
    Progress,
    Idle,
    Done,
}

struct Worker {
    b: usize,
    label: String,
    block: Box<dyn StreamBlock>,
    contract: RateContract,
    policy: TagPropagation,
    ins: Vec<InPort>,
    outs: Vec<OutPort>,
    msg_in: Vec<Arc<MessageQueue>>,
    msg_routes: Vec<Vec<(Arc<MessageQueue>, Arc<BlockNotifier>)>>,
    msg_sources: Vec<usize>,
    notifier: Arc<BlockNotifier>,
    done_flags: Arc<Vec<AtomicBool>>,
    stop: Arc<AtomicBool>,
    errors: Arc<Mutex<Vec<BlockRunError>>>,
    completion_tx: Sender<String>,
    watchdog: WatchdogHandle,
}

/// Run a block routine with panics converted into `WorkError::Panicked`, so
/// a panicking block takes down its own partition and nothing else.
fn run_caught<T>(f: impl FnOnce() -> WorkResult<T>) -> WorkResult<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(WorkError::Panicked(msg))
        }
    }
}

impl Worker {
    fn run(mut self) {
        debug!("[{}] worker started", self.label);
        let mut items_produced = 0usize;
        let reason = loop {
            if self.stop.load(Ordering::Relaxed) {
                break "stop requested";
            }
            match self.tick(&mut items_produced) {
                Ok(Tick::Progress) => {}
                Ok(Tick::Idle) => {
                    let _guard = WaitGuard::new(&self.watchdog);
                    self.notifier.wait(PARK_TIMEOUT);
                }
                Ok(Tick::Done) => break "done",
                Err(e) => {
                    error!("[{}] work error: {}", self.label, e.error);
                    self.errors.lock().unwrap().push(e);
                    break "failed";
                }
            }
        };
        self.finish();
        info!(
            "[{}] shutdown ({}). Produced {} items.",
            self.label, reason, items_produced
        );
    }

    /// Publish this block's termination: mark downstream buffers done and
    /// wake every neighbor so drains and space checks re-run.
    fn finish(&mut self) {
        self.done_flags[self.b].store(true, Ordering::Relaxed);
        for out in &self.outs {
            out.buf.lock().unwrap().set_done();
            for notifier in &out.reader_notifiers {
                notifier.notify();
            }
        }
        for input in &self.ins {
            input.writer_notifier.notify();
        }
        for routes in &self.msg_routes {
            for (_, notifier) in routes {
                notifier.notify();
            }
        }
        let _ = self.completion_tx.send(self.label.clone());
    }

    fn fail(&self, error: WorkError) -> BlockRunError {
        BlockRunError {
            block: self.label.clone(),
            error,
        }
    }

    /// Route messages emitted by this block. Posts use the blocking path —
    /// back-pressure on a bounded destination queue is real back-pressure
    /// here, and `stop()` closes the queues so a blocked post never hangs a
    /// shutdown.
    fn route(&self, ports: &mut MessagePorts) {
        for (port, msg) in ports.drain() {
            let Some(routes) = self.msg_routes.get(port) else {
                warn!(
                    "[{}] posted on undeclared message port {}",
                    self.label, port
                );
                continue;
            };
            for (queue, notifier) in routes {
                queue.post(msg.clone());
                notifier.notify();
            }
        }
    }

    fn deliver_messages(&mut self) -> Result<bool, BlockRunError> {
        let mut progress = false;
        for port in 0..self.msg_in.len() {
            while let Some(msg) = self.msg_in[port].try_take() {
                let mut ports = MessagePorts::new();
                let block = &mut self.block;
                let result = run_caught(|| block.handle_message(port, msg, &mut ports));
                if let Err(e) = result {
                    return Err(self.fail(e));
                }
                self.route(&mut ports);
                progress = true;
            }
        }
        Ok(progress)
    }

    fn tick(&mut self, items_produced: &mut usize) -> Result<Tick, BlockRunError> {
        let mut progress = self.deliver_messages()?;

        // Message-only block: no stream scheduling, just work and drain
        // tracking against its message sources.
        if self.ins.is_empty() && self.outs.is_empty() {
            let mut ports = MessagePorts::new();
            let block = &mut self.block;
            let ret = match run_caught(|| block.work(&[], &mut [], &mut ports)) {
                Ok(ret) => ret,
                Err(e) => return Err(self.fail(e)),
            };
            progress |= !ports.is_empty();
            self.route(&mut ports);
            if ret == BlockRet::Done {
                return Ok(Tick::Done);
            }
            if !self.msg_sources.is_empty()
                && self
                    .msg_sources
                    .iter()
                    .all(|&s| self.done_flags[s].load(Ordering::Relaxed))
                && self.msg_in.iter().all(|q| q.is_empty())
            {
                return Ok(Tick::Done);
            }
            return Ok(if progress { Tick::Progress } else { Tick::Idle });
        }

        // Output space, floored to whole output multiples.
        let multiple = self.contract.output_multiple;
        let mut target = usize::MAX;
        for out in &self.outs {
            let space = out.buf.lock().unwrap().space_available();
            target = target.min(space / multiple * multiple);
        }
        if !self.outs.is_empty() && target == 0 {
            let downstream_done = self.outs.iter().all(|out| {
                out.reader_blocks
                    .iter()
                    .all(|&rb| self.done_flags[rb].load(Ordering::Relaxed))
            });
            if downstream_done {
                return Ok(Tick::Done);
            }
            return Ok(if progress { Tick::Progress } else { Tick::Idle });
        }

        // Input availability against the forecast for one atomic production.
        let mut upstream_done = true;
        let mut avail_min = usize::MAX;
        for input in &self.ins {
            let buf = input.buf.lock().unwrap();
            upstream_done &= buf.is_done();
            avail_min = avail_min.min(buf.items_available(input.reader));
        }
        if !self.ins.is_empty() && !upstream_done {
            let visible = avail_min + self.contract.history - 1;
            let request = if self.outs.is_empty() { 1 } else { multiple };
            if visible < self.block.forecast(request) {
                return Ok(if progress { Tick::Progress } else { Tick::Idle });
            }
        }

        // Snapshot views, then invoke without holding any buffer lock: the
        // cursor protocol keeps the writer's and readers' data regions
        // disjoint, so work needs no synchronization.
        let inputs: Vec<StreamInput> = self
            .ins
            .iter()
            .map(|input| input.buf.lock().unwrap().input_view(input.reader))
            .collect();
        let mut outputs: Vec<StreamOutput> = self
            .outs
            .iter()
            .map(|out| out.buf.lock().unwrap().output_view(target, BlockId(self.b)))
            .collect();
        let mut ports = MessagePorts::new();
        let block = &mut self.block;
        let ret = match run_caught(|| block.work(&inputs, &mut outputs, &mut ports)) {
            Ok(ret) => ret,
            Err(e) => return Err(self.fail(e)),
        };
        progress |= !ports.is_empty();
        self.route(&mut ports);

        // Commit cursor movements under the buffer mutexes and wake the
        // blocks whose view of the world changed.
        let consumed: Vec<usize> = inputs.iter().map(|v| v.consumed()).collect();
        let per_input = consumed_tag_windows(&inputs);
        let out_bases: Vec<u64> = outputs.iter().map(|o| o.offset()).collect();

        for (i, input) in self.ins.iter().enumerate() {
            if consumed[i] == 0 {
                continue;
            }
            input
                .buf
                .lock()
                .unwrap()
                .post_read(input.reader, consumed[i])
                .map_err(|e| self.fail(e.into()))?;
            input.writer_notifier.notify();
            progress = true;
        }

        let routed = propagate_tags(
            self.policy,
            self.contract.relative_rate,
            &per_input,
            &out_bases,
            BlockId(self.b),
        );
        for ((out, view), tags) in self.outs.iter().zip(outputs.iter_mut()).zip(routed) {
            let produced = view.produced();
            let pending = view.take_pending_tags();
            if produced == 0 && pending.is_empty() && tags.is_empty() {
                continue;
            }
            {
                let mut buf = out.buf.lock().unwrap();
                buf.add_tags(pending);
                buf.add_tags(tags);
                buf.post_write(produced).map_err(|e| self.fail(e.into()))?;
            }
            if produced > 0 {
                *items_produced += produced;
                for notifier in &out.reader_notifiers {
                    notifier.notify();
                }
                progress = true;
            }
        }

        match ret {
            BlockRet::Ok => {}
            BlockRet::InsufficientInput => {
                if !self.ins.is_empty() && upstream_done {
                    // Upstream finished and what remains can never satisfy
                    // the block: it has drained.
                    return Ok(Tick::Done);
                }
            }
            BlockRet::InsufficientOutput => {}
            BlockRet::Done => return Ok(Tick::Done),
        }
        Ok(if progress { Tick::Progress } else { Tick::Idle })
    }
}

/// Runtime scheduler executing one worker thread per block
pub struct ThreadedScheduler {
    threads: Vec<(String, JoinHandle<()>)>,
    stop: Arc<AtomicBool>,
    notifiers: Vec<Arc<BlockNotifier>>,
    msg_in_queues: Vec<Vec<Arc<MessageQueue>>>,
    msg_port_names: Vec<Vec<String>>,
    errors: Arc<Mutex<Vec<BlockRunError>>>,
    completion_tx: Sender<String>,
    completion_rx: Option<Receiver<String>>,
    watchdog: Watchdog,
    watchdog_handle: JoinHandle<()>,
}

impl ThreadedScheduler {
    /// Validate and wire the flowgraph, then start every worker thread.
    pub fn start(flowgraph: Flowgraph) -> Result<Self, TopologyError> {
        let runnable = flowgraph.into_runnable()?;
        let Runnable {
            config,
            blocks,
            labels,
            order: _,
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
        } = runnable;

        let n = blocks.len();
        let stop = Arc::new(AtomicBool::new(false));
        let done_flags: Arc<Vec<AtomicBool>> =
            Arc::new((0..n).map(|_| AtomicBool::new(false)).collect());
        let notifiers: Vec<Arc<BlockNotifier>> = (0..n).map(|_| BlockNotifier::new()).collect();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (completion_tx, completion_rx) = unbounded::<String>();
        let watchdog = Watchdog::new(config.stall_warning);
        let watchdog_handle = watchdog.start_monitoring_thread();

        let msg_port_names: Vec<Vec<String>> = blocks
            .iter()
            .map(|b| b.message_inputs().iter().map(|s| s.to_string()).collect())
            .collect();

        let buffers: Vec<Arc<Mutex<Buffer>>> = buffers
            .into_iter()
            .map(|b| Arc::new(Mutex::new(b)))
            .collect();

        info!("thread-per-block scheduler: starting {} workers", n);
        let mut threads = Vec::with_capacity(n);
        for (b, block) in blocks.into_iter().enumerate() {
            let ins: Vec<InPort> = in_ports[b]
                .iter()
                .map(|&(buf, reader)| InPort {
                    buf: Arc::clone(&buffers[buf]),
                    reader,
                    writer_notifier: Arc::clone(&notifiers[buffer_writer[buf]]),
                })
                .collect();
            let outs: Vec<OutPort> = out_ports[b]
                .iter()
                .map(|&buf| OutPort {
                    buf: Arc::clone(&buffers[buf]),
                    reader_notifiers: buffer_readers[buf]
                        .iter()
                        .map(|&rb| Arc::clone(&notifiers[rb]))
                        .collect(),
                    reader_blocks: buffer_readers[buf].clone(),
                })
                .collect();
            let msg_routes: Vec<Vec<(Arc<MessageQueue>, Arc<BlockNotifier>)>> = msg_out_routes
                [b]
                .iter()
                .map(|routes| {
                    routes
                        .iter()
                        .map(|&(dst, port)| {
                            (
                                Arc::clone(&msg_in_queues[dst][port]),
                                Arc::clone(&notifiers[dst]),
                            )
                        })
                        .collect()
                })
                .collect();

            let worker = Worker {
                b,
                label: labels[b].clone(),
                block,
                contract: contracts[b],
                policy: policies[b],
                ins,
                outs,
                msg_in: msg_in_queues[b].clone(),
                msg_routes,
                msg_sources: msg_in_sources[b].clone(),
                notifier: Arc::clone(&notifiers[b]),
                done_flags: Arc::clone(&done_flags),
                stop: Arc::clone(&stop),
                errors: Arc::clone(&errors),
                completion_tx: completion_tx.clone(),
                watchdog: watchdog.register(&labels[b], "scheduler wait"),
            };
            let label = labels[b].clone();
            let handle = thread::spawn(move || worker.run());
            threads.push((label, handle));
        }

        Ok(Self {
            threads,
            stop,
            notifiers,
            msg_in_queues,
            msg_port_names,
            errors,
            completion_tx,
            completion_rx: Some(completion_rx),
            watchdog,
            watchdog_handle,
        })
    }

    /// Handle for requesting a cooperative stop from any thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(
            Arc::clone(&self.stop),
            self.notifiers.clone(),
            self.msg_in_queues.iter().flatten().cloned().collect(),
        )
    }

    /// Signal every worker to stop and wake anything parked.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Queue handle for a block's named message input port, usable from any
    /// thread (including external callback threads). A parked worker picks
    /// up externally posted messages at its next timeout wakeup.
    pub fn message_input(&self, block: BlockId, port: &str) -> Option<Arc<MessageQueue>> {
        let idx = self.msg_port_names[block.0].iter().position(|p| p == port)?;
        Some(Arc::clone(&self.msg_in_queues[block.0][idx]))
    }

    /// Join every worker thread, then report the errors of any halted
    /// partitions.
    pub fn wait(mut self) -> Result<(), Vec<BlockRunError>> {
        let completion_rx = self
            .completion_rx
            .take()
            .expect("completion_rx already taken");

        // Drop the scheduler's sender so the channel closes once every
        // worker has reported in.
        drop(self.completion_tx);

        let total = self.threads.len();
        let mut completed = 0;
        info!("waiting for {} workers to complete...", total);

        let mut by_name: HashMap<String, JoinHandle<()>> = self.threads.into_iter().collect();
        while completed < total {
            match completion_rx.recv() {
                Ok(name) => {
                    completed += 1;
                    if let Some(handle) = by_name.remove(&name)
                        && handle.join().is_err()
                    {
                        // Work panics are caught at the invocation boundary;
                        // reaching this means the worker loop itself died.
                        error!("[{}] worker thread panicked", name);
                    }
                    debug!("[{}] worker joined ({}/{})", name, completed, total);
                }
                Err(_) => break, // Channel closed: every sender is gone.
            }
        }
        info!("all {} workers completed", total);

        self.watchdog.stop();
        let _ = self.watchdog_handle.join();

        let errors = std::mem::take(&mut *self.errors.lock().unwrap());
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{
        Copy, Head, MessageBurst, MessageSink, NullSink, NullSource, VectorSink, VectorSource,
    };
    use crate::runtime::block::Signature;
    use crate::runtime::message::Message;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_pipeline_across_threads() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block(VectorSource::new((0u32..5000).collect()));
        let copy = fg.add_block(Copy::<u32>::new());
        let sink = VectorSink::<u32>::new();
        let data = sink.data();
        let snk = fg.add_block(sink);
        fg.connect(src, 0, copy, 0).unwrap();
        fg.connect(copy, 0, snk, 0).unwrap();

        let sched = ThreadedScheduler::start(fg).unwrap();
        assert_eq!(sched.num_threads(), 3);
        sched.wait().unwrap();

        assert_eq!(*data.lock().unwrap(), (0u32..5000).collect::<Vec<_>>());
    }

    #[test]
    fn test_head_scenario_across_threads() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block(VectorSource::new(vec![0.5f32; 2000]));
        let head = fg.add_block(Head::<f32>::new(1000));
        let sink = VectorSink::<f32>::new();
        let data = sink.data();
        let snk = fg.add_block(sink);
        fg.connect(src, 0, head, 0).unwrap();
        fg.connect(head, 0, snk, 0).unwrap();

        let sched = ThreadedScheduler::start(fg).unwrap();
        sched.wait().unwrap();
        assert_eq!(data.lock().unwrap().len(), 1000);
    }

    #[test]
    fn test_stop_wakes_blocked_workers() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block(NullSource::<f32>::new());
        let sink = NullSink::<f32>::new();
        let received = sink.received();
        let snk = fg.add_block(sink);
        fg.connect(src, 0, snk, 0).unwrap();

        let sched = ThreadedScheduler::start(fg).unwrap();
        thread::sleep(Duration::from_millis(100));
        let start = std::time::Instant::now();
        sched.stop();
        sched.wait().unwrap();

        assert!(
            start.elapsed() < Duration::from_secs(2),
            "stop must wake parked workers promptly"
        );
        assert!(received.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_work_error_halts_only_its_partition() {
        struct Failing;
        impl StreamBlock for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            fn input_signature(&self) -> Signature {
                Signature::fixed(1, 4)
            }
            fn output_signature(&self) -> Signature {
                Signature::fixed(1, 4)
            }
            fn work(
                &mut self,
                _inputs: &[StreamInput],
                _outputs: &mut [StreamOutput],
                _msgs: &mut MessagePorts,
            ) -> WorkResult<BlockRet> {
                Err(WorkError::Block("broken state".into()))
            }
        }

        let mut fg = Flowgraph::new();
        let src = fg.add_block(VectorSource::new((0u32..100).collect()));
        let bad = fg.add_block(Failing);
        let snk = fg.add_block(NullSink::<u32>::new());
        fg.connect(src, 0, bad, 0).unwrap();
        fg.connect(bad, 0, snk, 0).unwrap();

        let sched = ThreadedScheduler::start(fg).unwrap();
        let errors = sched.wait().unwrap_err();
        assert_eq!(errors.len(), 1, "only the failing partition reports an error");
        assert!(errors[0].block.contains("failing"));
    }

    #[test]
    fn test_panic_is_confined_to_its_partition() {
        struct Panicking;
        impl StreamBlock for Panicking {
            fn name(&self) -> &str {
                "panicking"
            }
            fn input_signature(&self) -> Signature {
                Signature::fixed(1, 4)
            }
            fn output_signature(&self) -> Signature {
                Signature::none()
            }
            fn work(
                &mut self,
                _inputs: &[StreamInput],
                _outputs: &mut [StreamOutput],
                _msgs: &mut MessagePorts,
            ) -> WorkResult<BlockRet> {
                panic!("divide by zero, effectively");
            }
        }

        let mut fg = Flowgraph::new();
        let src = fg.add_block(VectorSource::new((0u32..10).collect()));
        let bad = fg.add_block(Panicking);
        fg.connect(src, 0, bad, 0).unwrap();

        let sched = ThreadedScheduler::start(fg).unwrap();
        let errors = sched.wait().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].error, WorkError::Panicked(_)));
    }

    #[test]
    fn test_messages_cross_threads_in_order() {
        let mut fg = Flowgraph::new();
        let burst = fg.add_block(MessageBurst::new(Message::Long(7), 20));
        let sink = MessageSink::new();
        let received = sink.received();
        let snk = fg.add_block(sink);
        fg.connect_message(burst, "out", snk, "in").unwrap();

        let sched = ThreadedScheduler::start(fg).unwrap();
        sched.wait().unwrap();
        assert_eq!(received.lock().unwrap().len(), 20);
    }

    #[test]
    fn test_external_post_reaches_handler() {
        let mut fg = Flowgraph::new();
        let sink = MessageSink::new();
        let received = sink.received();
        let snk = fg.add_block(sink);

        let sched = ThreadedScheduler::start(fg).unwrap();
        let queue = sched.message_input(snk, "in").unwrap();
        for i in 0..10 {
            queue.post(Message::Long(i));
        }
        // External posters have no notifier handle; the worker picks the
        // messages up on its park-timeout wakeup.
        thread::sleep(PARK_TIMEOUT * 4);
        sched.stop();
        sched.wait().unwrap();

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 10);
        assert!(got.iter().enumerate().all(|(i, m)| *m == Message::Long(i as i64)));
    }
}
