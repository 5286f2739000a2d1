//! Message values and the per-port message queue
//!
//! Messages are the asynchronous side channel next to the sample streams:
//! immutable tagged values posted atomically to a destination port's FIFO.
//! Queues are always protected by a mutex plus two condition variables
//! (not-empty / not-full), regardless of which scheduler drives the graph,
//! because posts may originate from any thread, including external callback
//! threads.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// An immutable message value
///
/// Pairs and dictionaries nest arbitrary messages, so any structured payload
/// (including a message wrapping another message) can travel through a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(String),
    Blob(Vec<u8>),
    Dict(BTreeMap<String, Message>),
    Pair(Box<Message>, Box<Message>),
}

impl Message {
    pub fn is_null(&self) -> bool {
        matches!(self, Message::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Message::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Message::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Message::Double(v) => Some(*v),
            Message::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Message::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convenience constructor for a key/value pair.
    pub fn pair(car: Message, cdr: Message) -> Self {
        Message::Pair(Box::new(car), Box::new(cdr))
    }
}

/// What `post` does when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Block the caller until space frees (default).
    #[default]
    Block,
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Drop the message being posted.
    DropNewest,
}

struct QueueState {
    items: VecDeque<Message>,
    closed: bool,
}

/// Bounded or unbounded FIFO bound to one input message port
///
/// `close()` wakes every blocked `post`/`take` so a stop request is never
/// waited out; after close, `post` drops its message and `take` drains the
/// remaining items before returning `None`.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize, // 0 = unbounded
    policy: OverflowPolicy,
}

impl MessageQueue {
    /// Create a queue. Capacity 0 means unbounded.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
        }
    }

    /// Create an unbounded queue with the default policy.
    pub fn unbounded() -> Self {
        Self::new(0, OverflowPolicy::Block)
    }

    fn is_full(&self, state: &QueueState) -> bool {
        self.capacity != 0 && state.items.len() >= self.capacity
    }

    /// Post a message, honoring the overflow policy when the queue is bounded
    /// and full. With `OverflowPolicy::Block` this blocks the caller until
    /// space frees or the queue is closed.
    pub fn post(&self, msg: Message) {
        let mut state = self.state.lock().unwrap();
        if self.is_full(&state) {
            match self.policy {
                OverflowPolicy::Block => {
                    while self.is_full(&state) && !state.closed {
                        state = self.not_full.wait(state).unwrap();
                    }
                }
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                }
                OverflowPolicy::DropNewest => return,
            }
        }
        if state.closed {
            return;
        }
        state.items.push_back(msg);
        self.not_empty.notify_one();
    }

    /// Post without blocking. Returns the message back if the queue is full
    /// under `OverflowPolicy::Block` (the policies that drop never fail).
    pub fn try_post(&self, msg: Message) -> Result<(), Message> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        if self.is_full(&state) {
            match self.policy {
                OverflowPolicy::Block => return Err(msg),
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                }
                OverflowPolicy::DropNewest => return Ok(()),
            }
        }
        state.items.push_back(msg);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocking take. Returns `None` once the queue is closed and drained.
    pub fn take(&self) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(msg) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(msg);
            }
            if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        let msg = state.items.pop_front();
        if msg.is_some() {
            self.not_full.notify_one();
        }
        msg
    }

    /// Take with a timeout. Returns `None` on timeout or once closed and drained.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(msg) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(msg);
            }
            if state.closed {
                return None;
            }
            let (next, result) = self.not_empty.wait_timeout(state, timeout).unwrap();
            state = next;
            if result.timed_out() {
                let msg = state.items.pop_front();
                if msg.is_some() {
                    self.not_full.notify_one();
                }
                return msg;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue, waking every blocked `post` and `take`.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::unbounded();
        for i in 0..100 {
            queue.post(Message::Long(i));
        }
        for i in 0..100 {
            assert_eq!(
                queue.take(),
                Some(Message::Long(i)),
                "messages must come out in post order"
            );
        }
    }

    #[test]
    fn test_take_blocks_until_post() {
        let queue = Arc::new(MessageQueue::unbounded());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.post(Message::Str("late".into()));
        });
        let msg = queue.take();
        assert_eq!(msg, Some(Message::Str("late".into())));
        handle.join().unwrap();
    }

    #[test]
    fn test_bounded_post_blocks_then_unblocks() {
        let queue = Arc::new(MessageQueue::new(2, OverflowPolicy::Block));
        queue.post(Message::Long(1));
        queue.post(Message::Long(2));

        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            // Full: this post must block until the consumer takes one.
            producer.post(Message::Long(3));
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.take(), Some(Message::Long(1)));
        handle.join().unwrap();
        assert_eq!(queue.take(), Some(Message::Long(2)));
        assert_eq!(queue.take(), Some(Message::Long(3)));
    }

    #[test]
    fn test_drop_oldest_policy() {
        let queue = MessageQueue::new(2, OverflowPolicy::DropOldest);
        queue.post(Message::Long(1));
        queue.post(Message::Long(2));
        queue.post(Message::Long(3));
        assert_eq!(queue.take(), Some(Message::Long(2)));
        assert_eq!(queue.take(), Some(Message::Long(3)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_newest_policy() {
        let queue = MessageQueue::new(2, OverflowPolicy::DropNewest);
        queue.post(Message::Long(1));
        queue.post(Message::Long(2));
        queue.post(Message::Long(3));
        assert_eq!(queue.take(), Some(Message::Long(1)));
        assert_eq!(queue.take(), Some(Message::Long(2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_wakes_blocked_take() {
        let queue = Arc::new(MessageQueue::unbounded());
        let waiter = Arc::clone(&queue);
        let handle = thread::spawn(move || waiter.take());
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(handle.join().unwrap(), None, "close must wake a blocked take");
    }

    #[test]
    fn test_close_drains_remaining_items() {
        let queue = MessageQueue::unbounded();
        queue.post(Message::Long(7));
        queue.close();
        assert_eq!(queue.take(), Some(Message::Long(7)));
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_capacity_zero_is_unbounded() {
        let queue = MessageQueue::new(0, OverflowPolicy::Block);
        for i in 0..10_000 {
            queue.post(Message::Long(i));
        }
        assert_eq!(queue.len(), 10_000);
    }
}
