//! Circular stream buffers: one writer, N independent readers
//!
//! A buffer owns a contiguous region logically addressed as a ring of
//! fixed-size items. The storage is allocated at twice the ring capacity and
//! every committed byte is kept identical at `index ± capacity` (the software
//! equivalent of mapping the same pages twice), so any window of up to
//! `capacity` items is one contiguous slice and wrap handling never leaks
//! into block implementations.
//!
//! Cursors are absolute item counts, never ring-relative. The writer may not
//! overtake any reader by more than the capacity (each reader's history
//! look-back included); a reader may not overtake the writer. Cursor updates
//! happen under `&mut self` — the cooperative scheduler is the single actor,
//! and the thread-per-block scheduler wraps the buffer in a mutex and only
//! publishes cursor movements while holding it. The data region itself is
//! accessed lock-free through [`StreamInput`]/[`StreamOutput`] views whose
//! ranges the cursor protocol keeps disjoint.

use std::cell::{Cell, UnsafeCell};
use std::sync::Arc;

use super::errors::BufferError;
use super::flowgraph::BlockId;
use super::message::Message;
use super::tag::Tag;

/// Identifier of a reader attached to one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(pub(crate) usize);

impl ReaderId {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Shared ring storage. Holds `2 * capacity_bytes`, 8-byte aligned so typed
/// views over the common sample types are always aligned.
pub(crate) struct Ring {
    words: Box<[UnsafeCell<u64>]>,
}

// SAFETY: all access to the bytes goes through raw pointers handed out by
// `Buffer`, whose cursor protocol guarantees the writer's span and every
// reader's span are disjoint byte ranges at any point in time.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    fn alloc(capacity_bytes: usize) -> Arc<Self> {
        let words = capacity_bytes.div_ceil(8) * 2;
        Arc::new(Self {
            words: (0..words).map(|_| UnsafeCell::new(0)).collect(),
        })
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }
}

struct ReaderState {
    /// Absolute count of items this reader has consumed.
    cursor: u64,
    /// Look-back guarantee: the reader always sees its current item plus the
    /// previous `history - 1` items. At least 1.
    history: usize,
}

/// Circular buffer connecting one writer block to N reader blocks
pub struct Buffer {
    ring: Arc<Ring>,
    capacity: usize,
    item_size: usize,
    /// Physical item offset of logical item 0. Equals the largest reader
    /// look-back, so the pre-zeroed region before the stream start is valid
    /// history for every reader. Fixed when the buffer is primed.
    reserve: usize,
    primed: bool,
    write_cursor: u64,
    readers: Vec<ReaderState>,
    tags: Vec<Tag>,
    done: bool,
}

impl Buffer {
    /// Allocate a buffer holding `capacity_items` items of `item_size` bytes.
    ///
    /// Callers size the capacity so it holds at least one maximal atomic
    /// production from the writer plus the largest consumer's history (see
    /// [`round_capacity`]).
    pub fn new(capacity_items: usize, item_size: usize) -> Self {
        assert!(capacity_items > 0, "buffer capacity must be non-zero");
        assert!(item_size > 0, "item size must be non-zero");
        Self {
            ring: Ring::alloc(capacity_items * item_size),
            capacity: capacity_items,
            item_size,
            reserve: 0,
            primed: false,
            write_cursor: 0,
            readers: Vec::new(),
            tags: Vec::new(),
            done: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn write_cursor(&self) -> u64 {
        self.write_cursor
    }

    /// Attach a reader with the given history requirement (`>= 1`).
    ///
    /// Fails once the buffer is primed: the pre-zeroed look-back region is
    /// fixed at that point, so a later reader's history could not be honored.
    pub fn add_reader(&mut self, history: usize) -> Result<ReaderId, BufferError> {
        if history == 0 {
            return Err(BufferError::InvalidHistory(history));
        }
        if self.primed {
            return Err(BufferError::LateReader);
        }
        self.readers.push(ReaderState { cursor: 0, history });
        Ok(ReaderId(self.readers.len() - 1))
    }

    /// Fix the history reserve and mark the buffer ready for writing. The
    /// storage is allocated zeroed, so the look-back region needs no fill.
    pub(crate) fn prime(&mut self) {
        if !self.primed {
            self.reserve = self
                .readers
                .iter()
                .map(|r| r.history - 1)
                .max()
                .unwrap_or(0);
            debug_assert!(self.reserve < self.capacity);
            self.primed = true;
        }
    }

    fn phys_item(&self, logical: u64) -> usize {
        ((logical + self.reserve as u64) % self.capacity as u64) as usize
    }

    /// Items the writer may commit, bounded by the slowest reader's effective
    /// base (its cursor minus its history look-back).
    pub fn space_available(&self) -> usize {
        let min_base = self
            .readers
            .iter()
            .map(|r| r.cursor as i64 - (r.history - 1) as i64)
            .min();
        match min_base {
            Some(base) => (self.capacity as i64 - (self.write_cursor as i64 - base)) as usize,
            None => self.capacity,
        }
    }

    /// Commit `n` items as written, advancing the write cursor and keeping
    /// the mirror half of the storage identical.
    pub fn post_write(&mut self, n: usize) -> Result<(), BufferError> {
        self.prime();
        let space = self.space_available();
        if n > space {
            return Err(BufferError::Overflow {
                requested: n,
                available: space,
            });
        }
        if n > 0 {
            self.mirror(self.phys_item(self.write_cursor) * self.item_size, n * self.item_size);
            self.write_cursor += n as u64;
        }
        Ok(())
    }

    /// Duplicate `[start, start + len)` into the opposite half of the storage
    /// so both images of every committed item stay identical.
    fn mirror(&self, start: usize, len: usize) {
        let cap_bytes = self.capacity * self.item_size;
        let ptr = self.ring.base_ptr();
        let first = len.min(cap_bytes.saturating_sub(start));
        // SAFETY: source and destination are the two images of the writer's
        // granted span. The span is at most `capacity` items, so each copy
        // stays inside the allocation and never overlaps its source; readers
        // cannot hold views over either image of these items (cursor
        // protocol).
        unsafe {
            if first > 0 {
                std::ptr::copy_nonoverlapping(ptr.add(start), ptr.add(start + cap_bytes), first);
            }
            if len > first {
                let wrapped = start + first;
                std::ptr::copy_nonoverlapping(
                    ptr.add(wrapped),
                    ptr.add(wrapped - cap_bytes),
                    len - first,
                );
            }
        }
    }

    /// Items available to a reader (history look-back not counted).
    pub fn items_available(&self, reader: ReaderId) -> usize {
        (self.write_cursor - self.readers[reader.0].cursor) as usize
    }

    /// Advance a reader's cursor by `n` consumed items and discard tags every
    /// reader has passed.
    pub fn post_read(&mut self, reader: ReaderId, n: usize) -> Result<(), BufferError> {
        let available = self.items_available(reader);
        if n > available {
            return Err(BufferError::Underflow {
                requested: n,
                available,
            });
        }
        self.readers[reader.0].cursor += n as u64;
        let min_cursor = self.readers.iter().map(|r| r.cursor).min().unwrap_or(0);
        self.tags.retain(|t| t.offset >= min_cursor);
        Ok(())
    }

    pub fn reader_cursor(&self, reader: ReaderId) -> u64 {
        self.readers[reader.0].cursor
    }

    pub fn add_tags(&mut self, tags: impl IntoIterator<Item = Tag>) {
        self.tags.extend(tags);
    }

    /// Tags with offsets in `[start, end)`.
    pub fn tags_in(&self, start: u64, end: u64) -> Vec<Tag> {
        self.tags
            .iter()
            .filter(|t| t.offset >= start && t.offset < end)
            .cloned()
            .collect()
    }

    /// Mark the writer as permanently finished. Readers drain what remains.
    pub fn set_done(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Build the writer-side view for one work invocation, granting at most
    /// `max_items` of the free space.
    pub(crate) fn output_view(&mut self, max_items: usize, src: BlockId) -> StreamOutput {
        self.prime();
        let granted = self.space_available().min(max_items);
        StreamOutput {
            ring: Arc::clone(&self.ring),
            byte_off: self.phys_item(self.write_cursor) * self.item_size,
            capacity: granted,
            item_size: self.item_size,
            base: self.write_cursor,
            src,
            produced: 0,
            pending_tags: Vec::new(),
        }
    }

    /// Build the reader-side view for one work invocation: the history
    /// look-back followed by every available item, plus the tags in the
    /// window.
    pub(crate) fn input_view(&self, reader: ReaderId) -> StreamInput {
        debug_assert!(self.primed, "input_view on an unprimed buffer");
        let state = &self.readers[reader.0];
        let look = (state.history - 1) as u64;
        let avail = self.items_available(reader);
        let phys = ((state.cursor + self.reserve as u64 - look) % self.capacity as u64) as usize;
        StreamInput {
            ring: Arc::clone(&self.ring),
            byte_off: phys * self.item_size,
            total_items: avail + state.history - 1,
            avail,
            history: state.history,
            item_size: self.item_size,
            tags: self.tags_in(state.cursor, state.cursor + avail as u64),
            upstream_done: self.done,
            abs_base: state.cursor,
            consumed: Cell::new(0),
        }
    }
}

/// Round a buffer capacity up so the byte size is a whole multiple of the
/// allocation granularity.
pub fn round_capacity(min_items: usize, item_size: usize, granularity: usize) -> usize {
    let step = granularity / gcd(item_size, granularity);
    min_items.div_ceil(step) * step
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

// ────────────────────────────────────────────────────────────────────────────
// Work-invocation views
// ────────────────────────────────────────────────────────────────────────────

/// Read-only window over one input port for the current work invocation
///
/// The slice starts with the `history - 1` look-back items; the current item
/// is at index `history - 1` and `available()` items follow it. A block
/// records progress with [`consume`](StreamInput::consume); the scheduler
/// validates and commits the count after `work` returns.
pub struct StreamInput {
    ring: Arc<Ring>,
    byte_off: usize,
    total_items: usize,
    avail: usize,
    history: usize,
    item_size: usize,
    tags: Vec<Tag>,
    upstream_done: bool,
    abs_base: u64,
    consumed: Cell<usize>,
}

impl StreamInput {
    /// The whole window as raw bytes (history included).
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the window covers items granted to this reader only; the
        // writer's span is disjoint by the cursor protocol, and the ring
        // outlives the view through the Arc.
        unsafe {
            std::slice::from_raw_parts(
                self.ring.base_ptr().add(self.byte_off),
                self.total_items * self.item_size,
            )
        }
    }

    /// The window as typed elements. `T` must evenly divide the item size;
    /// vector items expose `item_size / size_of::<T>()` elements per item.
    pub fn slice<T: Copy + 'static>(&self) -> &[T] {
        let elem = std::mem::size_of::<T>();
        assert!(
            elem > 0 && self.item_size % elem == 0,
            "element size {} does not divide item size {}",
            elem,
            self.item_size,
        );
        let bytes = self.bytes();
        assert!(
            bytes.as_ptr() as usize % std::mem::align_of::<T>() == 0,
            "stream storage is not aligned for the requested element type"
        );
        // SAFETY: length and alignment checked above; T: Copy rules out drop
        // obligations and the byte images are always initialized.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, bytes.len() / elem) }
    }

    /// Items available for consumption (history look-back not counted).
    pub fn available(&self) -> usize {
        self.avail
    }

    pub fn history(&self) -> usize {
        self.history
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Absolute stream offset of the first available item.
    pub fn offset(&self) -> u64 {
        self.abs_base
    }

    /// Tags anchored inside the available window.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Record `n` items as consumed. Counts accumulate across calls within
    /// one invocation and must not exceed `available()`.
    pub fn consume(&self, n: usize) {
        self.consumed.set(self.consumed.get() + n);
    }

    pub fn consumed(&self) -> usize {
        self.consumed.get()
    }

    /// True once the upstream writer is done and every item has been drained.
    pub fn finished(&self) -> bool {
        self.upstream_done && self.avail == 0
    }
}

/// Writable window over one output port for the current work invocation
pub struct StreamOutput {
    ring: Arc<Ring>,
    byte_off: usize,
    capacity: usize,
    item_size: usize,
    base: u64,
    src: BlockId,
    produced: usize,
    pending_tags: Vec<Tag>,
}

impl StreamOutput {
    /// The granted window as raw bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the window covers the writer's granted span only; reader
        // spans are disjoint by the cursor protocol, `&mut self` makes this
        // the unique view over the span, and the ring outlives the view.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ring.base_ptr().add(self.byte_off),
                self.capacity * self.item_size,
            )
        }
    }

    /// The granted window as typed elements; see [`StreamInput::slice`].
    pub fn slice_mut<T: Copy + 'static>(&mut self) -> &mut [T] {
        let elem = std::mem::size_of::<T>();
        assert!(
            elem > 0 && self.item_size % elem == 0,
            "element size {} does not divide item size {}",
            elem,
            self.item_size,
        );
        let bytes = self.bytes_mut();
        assert!(
            bytes.as_ptr() as usize % std::mem::align_of::<T>() == 0,
            "stream storage is not aligned for the requested element type"
        );
        let len = bytes.len() / elem;
        // SAFETY: as in `bytes_mut`, plus length/alignment checked above.
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, len) }
    }

    /// Items the block may produce in this invocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Absolute stream offset the first produced item will have.
    pub fn offset(&self) -> u64 {
        self.base
    }

    /// Record `n` items as produced. Counts accumulate across calls within
    /// one invocation and must not exceed `capacity()`.
    pub fn produce(&mut self, n: usize) {
        self.produced += n;
    }

    pub fn produced(&self) -> usize {
        self.produced
    }

    /// Attach a tag to the item `rel_offset` items into this invocation's
    /// production.
    pub fn add_tag(&mut self, rel_offset: usize, key: impl Into<String>, value: Message) {
        self.pending_tags
            .push(Tag::new(self.base + rel_offset as u64, key, value, self.src));
    }

    pub(crate) fn take_pending_tags(&mut self) -> Vec<Tag> {
        std::mem::take(&mut self.pending_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_items(buf: &mut Buffer, items: &[u8]) {
        let mut view = buf.output_view(items.len(), BlockId(0));
        assert!(view.capacity() >= items.len(), "not enough space to write");
        view.bytes_mut()[..items.len()].copy_from_slice(items);
        buf.post_write(items.len()).unwrap();
    }

    fn read_items(buf: &mut Buffer, reader: ReaderId, n: usize) -> Vec<u8> {
        let view = buf.input_view(reader);
        assert!(view.available() >= n);
        let skip = view.history() - 1;
        let out = view.bytes()[skip..skip + n].to_vec();
        buf.post_read(reader, n).unwrap();
        out
    }

    #[test]
    fn test_round_trip_across_wrap() {
        let mut buf = Buffer::new(16, 1);
        let reader = buf.add_reader(1).unwrap();
        buf.prime();

        // Uneven chunk sizes force several wrap crossings.
        let mut written = Vec::new();
        let mut read_back = Vec::new();
        let mut next = 0u8;
        for chunk in [5usize, 11, 7, 13, 3, 9, 16, 1, 14] {
            let data: Vec<u8> = (0..chunk).map(|_| {
                next = next.wrapping_add(1);
                next
            }).collect();
            write_items(&mut buf, &data);
            written.extend_from_slice(&data);
            read_back.extend(read_items(&mut buf, reader, chunk));
        }
        assert_eq!(read_back, written, "bytes must survive wrap boundaries bit-identically");
    }

    #[test]
    fn test_writer_never_overtakes_slowest_reader() {
        let mut buf = Buffer::new(32, 4);
        let fast = buf.add_reader(1).unwrap();
        let slow = buf.add_reader(1).unwrap();
        buf.prime();

        let mut out = buf.output_view(20, BlockId(0));
        out.slice_mut::<u32>()[..20].fill(0xABABABAB);
        buf.post_write(20).unwrap();
        // Fast reader consumes everything, slow reader lags by 20 items.
        buf.post_read(fast, 20).unwrap();
        assert_eq!(
            buf.space_available(),
            12,
            "free space must reflect the slowest reader, not the fastest"
        );
        buf.post_read(slow, 15).unwrap();
        assert_eq!(buf.space_available(), 27);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut buf = Buffer::new(8, 1);
        let _reader = buf.add_reader(1).unwrap();
        buf.prime();
        let err = buf.post_write(9).unwrap_err();
        assert!(matches!(err, BufferError::Overflow { requested: 9, available: 8 }));
        // The failed commit must not have moved the cursor.
        assert_eq!(buf.write_cursor(), 0);
    }

    #[test]
    fn test_underflow_is_rejected() {
        let mut buf = Buffer::new(8, 1);
        let reader = buf.add_reader(1).unwrap();
        buf.prime();
        write_items(&mut buf, &[1, 2, 3]);
        let err = buf.post_read(reader, 4).unwrap_err();
        assert!(matches!(err, BufferError::Underflow { requested: 4, available: 3 }));
        assert_eq!(buf.reader_cursor(reader), 0);
    }

    #[test]
    fn test_history_lookback_starts_zeroed() {
        let mut buf = Buffer::new(16, 1);
        let reader = buf.add_reader(4).unwrap();
        buf.prime();
        write_items(&mut buf, &[10, 20]);

        let view = buf.input_view(reader);
        assert_eq!(view.available(), 2);
        // 3 look-back items (pre-zeroed) then the 2 written items.
        assert_eq!(view.bytes(), &[0, 0, 0, 10, 20]);
    }

    #[test]
    fn test_history_lookback_shows_previous_items() {
        let mut buf = Buffer::new(16, 1);
        let reader = buf.add_reader(3).unwrap();
        buf.prime();
        write_items(&mut buf, &[1, 2, 3, 4, 5]);
        buf.post_read(reader, 5).unwrap();
        write_items(&mut buf, &[6, 7]);

        let view = buf.input_view(reader);
        assert_eq!(view.bytes(), &[4, 5, 6, 7], "look-back must expose the last consumed items");
    }

    #[test]
    fn test_history_reserve_limits_space() {
        let mut buf = Buffer::new(16, 1);
        let _reader = buf.add_reader(5).unwrap();
        buf.prime();
        // 4 items are permanently reserved for the reader's look-back.
        assert_eq!(buf.space_available(), 12);
    }

    #[test]
    fn test_reader_after_prime_is_rejected() {
        let mut buf = Buffer::new(16, 1);
        let _reader = buf.add_reader(1).unwrap();
        write_items(&mut buf, &[1]);
        assert!(matches!(buf.add_reader(1), Err(BufferError::LateReader)));
    }

    #[test]
    fn test_zero_history_is_rejected() {
        let mut buf = Buffer::new(16, 1);
        assert!(matches!(buf.add_reader(0), Err(BufferError::InvalidHistory(0))));
    }

    #[test]
    fn test_independent_readers_see_identical_data() {
        let mut buf = Buffer::new(8, 1);
        let a = buf.add_reader(1).unwrap();
        let b = buf.add_reader(1).unwrap();
        buf.prime();

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        let mut next = 0u8;
        for _ in 0..6 {
            let space = buf.space_available().min(3);
            let data: Vec<u8> = (0..space).map(|_| {
                next = next.wrapping_add(1);
                next
            }).collect();
            write_items(&mut buf, &data);
            // Reader a drains immediately, reader b trails by one round.
            let avail_a = buf.items_available(a);
            seen_a.extend(read_items(&mut buf, a, avail_a));
            let lagged = buf.items_available(b).saturating_sub(1);
            seen_b.extend(read_items(&mut buf, b, lagged));
        }
        let rest = buf.items_available(b);
        seen_b.extend(read_items(&mut buf, b, rest));
        assert_eq!(seen_a, seen_b, "all readers must observe the same ordered bytes");
    }

    #[test]
    fn test_tags_pruned_once_all_readers_pass() {
        let mut buf = Buffer::new(16, 1);
        let a = buf.add_reader(1).unwrap();
        let b = buf.add_reader(1).unwrap();
        buf.prime();
        write_items(&mut buf, &[0; 10]);
        buf.add_tags([Tag::new(2, "k", Message::Null, BlockId(0))]);

        buf.post_read(a, 5).unwrap();
        assert_eq!(buf.tags_in(0, 10).len(), 1, "tag must survive while reader b is behind");
        buf.post_read(b, 5).unwrap();
        assert!(buf.tags_in(0, 10).is_empty(), "tag must be discarded once every reader passed");
    }

    #[test]
    fn test_input_view_window_tags() {
        let mut buf = Buffer::new(16, 1);
        let reader = buf.add_reader(1).unwrap();
        buf.prime();
        write_items(&mut buf, &[0; 8]);
        buf.add_tags([
            Tag::new(1, "in", Message::Null, BlockId(0)),
            Tag::new(12, "out-of-window", Message::Null, BlockId(0)),
        ]);
        let view = buf.input_view(reader);
        assert_eq!(view.tags().len(), 1);
        assert_eq!(view.tags()[0].key, "in");
    }

    #[test]
    fn test_typed_views() {
        let mut buf = Buffer::new(8, 4);
        let reader = buf.add_reader(1).unwrap();
        buf.prime();

        let mut out = buf.output_view(4, BlockId(0));
        out.slice_mut::<f32>()[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        buf.post_write(4).unwrap();

        let view = buf.input_view(reader);
        assert_eq!(view.slice::<f32>(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_round_capacity() {
        assert_eq!(round_capacity(100, 4, 4096), 1024);
        assert_eq!(round_capacity(1025, 4, 4096), 2048);
        assert_eq!(round_capacity(1, 4096, 4096), 1);
        // 3-byte items need 4096 items per granularity step.
        assert_eq!(round_capacity(10, 3, 4096), 4096);
    }
}
