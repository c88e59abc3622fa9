//! Lock-free multi-producer multi-consumer queue over a fixed ring.

use crate::invariants::{debug_assert_grant, debug_assert_occupancy, debug_assert_slot_index};
use crate::transaction::{Hard, Strictness};
use crate::Backoff;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// SYNCHRONIZATION PROTOCOL
// =============================================================================
//
// ## Sequence numbers (ABA prevention)
//
// The four indices are unbounded u64 sequence numbers; a ring position is
// computed as `seq % (N+1)` only when touching storage. A CAS on an index
// stored modulo the slot count could be fooled by the ring cycling exactly
// `N+1` slots between a thread's snapshot and its CAS; with 64-bit counters
// every reservation start is unique for the queue's lifetime, so no such
// window exists.
//
// ## Index roles
//
//   head.committed   oldest readable sequence; advanced by read commits
//   head.reserved    leading edge of outstanding read claims; read prepares
//   tail.committed   one past newest published sequence; write commits
//   tail.reserved    leading edge of outstanding write claims; write prepares
//
// A prepare claims a contiguous range with a CAS on its side's `reserved`
// index; a commit publishes it with a strict-equality CAS on `committed`
// (`committed == start`), which retires reservations in the order their
// prepares won. Payload copies happen between the two, outside any
// shared-state update.
//
// ## Snapshot rules
//
// * Write prepares measure free space from `head.committed`: the oldest
//   uncommitted reader still owns its slots, and only its commit (a Release
//   store observed by our Acquire load) hands them over for overwriting.
// * Read prepares measure readable data against `tail.committed`: only a
//   write commit's Release store publishes slot contents.
//
// Each loop loads the opposite side's gate so that staleness under-reports
// the available range (the gate only ever advances), and the CAS on
// `reserved` validates the claim itself; `saturating_sub` absorbs the
// transiently absurd spans a stale gate can produce.
//
// ## Commit ordering
//
// Commit CASes are Release stores; reservation CASes are AcqRel RMWs, so
// slot traffic cannot drift outside the reservation window. RMWs continue a
// release sequence, so a prepare that acquires the newest committed value
// synchronizes with every earlier commit on that side, not just the last.
//
// =============================================================================

/// Committed/reserved sequence pair for one side of the queue.
struct IndexPair {
    committed: AtomicU64,
    reserved: AtomicU64,
}

impl IndexPair {
    fn new() -> Self {
        Self {
            committed: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
        }
    }
}

/// A bounded MPMC queue over a ring of `N + 1` slots.
///
/// Any number of producer and consumer threads may operate on the queue
/// concurrently through shared references. Single items move through
/// [`enqueue`](SyncQueue::enqueue) and [`dequeue`](SyncQueue::dequeue);
/// batches move through [`Transaction`](crate::Transaction)s, which claim a
/// contiguous slot range up front and publish it when done.
///
/// All operations are non-blocking: they succeed, report a short or zero
/// grant, or (for commits) report that an earlier reservation has not
/// retired yet. Any waiting is the caller's, typically a yielded spin via
/// [`Backoff`].
pub struct SyncQueue<T, const N: usize> {
    /// Consumer-side indices, on their own cache line.
    head: CachePadded<IndexPair>,
    /// Producer-side indices, on their own cache line.
    tail: CachePadded<IndexPair>,
    /// Ring storage, `N + 1` slots. A slot is exclusively owned by the
    /// reservation covering it from prepare success until the matching
    /// commit hands it to the opposite side.
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: slot access is gated by the reservation protocol above; the
// atomics establish the necessary happens-before edges. Consumers move
// values out, so `T: Send` is all that is required.
unsafe impl<T: Send, const N: usize> Send for SyncQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for SyncQueue<T, N> {}

impl<T, const N: usize> SyncQueue<T, N> {
    /// Number of slots in the ring: capacity plus the vacancy slot.
    const SLOTS: usize = N + 1;

    /// Creates an empty queue.
    pub fn new() -> Self {
        const { assert!(N > 0, "queue capacity must be greater than 0") };

        let mut buffer = Vec::with_capacity(Self::SLOTS);
        buffer.resize_with(Self::SLOTS, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            head: CachePadded::new(IndexPair::new()),
            tail: CachePadded::new(IndexPair::new()),
            buffer: buffer.into_boxed_slice(),
        }
    }

    /// Returns the queue capacity.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Ring position of a sequence number.
    #[inline]
    fn position(seq: u64) -> usize {
        (seq % Self::SLOTS as u64) as usize
    }

    /// Returns the number of committed, unread elements.
    ///
    /// Exact at quiescent points; a snapshot while producers or consumers
    /// are mid-flight is momentarily stale.
    pub fn size(&self) -> usize {
        let committed_head = self.head.committed.load(Ordering::Relaxed);
        let committed_tail = self.tail.committed.load(Ordering::Relaxed);
        committed_tail.wrapping_sub(committed_head) as usize
    }

    /// Returns true if no committed element is waiting to be read.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns true if the committed occupancy is at capacity.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.size() >= N
    }

    // ---------------------------------------------------------------------
    // SINGLE-ITEM OPERATIONS
    // ---------------------------------------------------------------------

    /// Appends `item`, or hands it back when the queue is full at the moment
    /// of reservation.
    ///
    /// A successful reservation always publishes: the commit is retried with
    /// an internal backoff until every earlier writer has retired, which is
    /// bounded by those writers finishing their own single-slot work.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let Some((start, _)) = self.reserve_write::<Hard>(1) else {
            return Err(item);
        };

        // SAFETY: the reservation grants exclusive ownership of `start`.
        unsafe { self.write_slot(start, item) };

        let mut backoff = Backoff::new();
        while !self.commit_write(start, 1) {
            backoff.snooze();
        }
        Ok(())
    }

    /// Removes and returns the oldest element, or `None` when the queue is
    /// empty at the moment of reservation.
    pub fn dequeue(&self) -> Option<T> {
        let (start, _) = self.reserve_read::<Hard>(1)?;

        // SAFETY: the reservation grants exclusive ownership of `start`,
        // and the slot was published by a write commit.
        let item = unsafe { self.take_slot(start) };

        let mut backoff = Backoff::new();
        while !self.commit_read(start, 1) {
            backoff.snooze();
        }
        Some(item)
    }

    // ---------------------------------------------------------------------
    // RESERVATIONS
    // ---------------------------------------------------------------------

    /// Claims up to `want` slots for writing.
    ///
    /// Returns the start sequence and granted length, or `None` when the
    /// strictness policy grants nothing.
    pub(crate) fn reserve_write<S: Strictness>(&self, want: usize) -> Option<(u64, usize)> {
        if want == 0 {
            return None;
        }
        let mut backoff = Backoff::new();
        loop {
            // Gate first: a stale committed head under-reports free space,
            // never the reverse.
            let committed = self.head.committed.load(Ordering::Acquire);
            let reserved = self.tail.reserved.load(Ordering::Relaxed);
            let used = reserved.wrapping_sub(committed) as usize;
            let avail = N.saturating_sub(used);

            let granted = S::grant(avail, want);
            debug_assert_grant!(granted, avail);
            if granted == 0 {
                return None;
            }

            match self.tail.reserved.compare_exchange_weak(
                reserved,
                reserved.wrapping_add(granted as u64),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((reserved, granted)),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Claims up to `want` committed elements for reading.
    pub(crate) fn reserve_read<S: Strictness>(&self, want: usize) -> Option<(u64, usize)> {
        if want == 0 {
            return None;
        }
        let mut backoff = Backoff::new();
        loop {
            // Claim edge first: the committed tail read after it can only
            // be newer, and committed data never retracts.
            let reserved = self.head.reserved.load(Ordering::Relaxed);
            let committed = self.tail.committed.load(Ordering::Acquire);
            let readable = committed.wrapping_sub(reserved) as usize;

            let granted = S::grant(readable, want);
            debug_assert_grant!(granted, readable);
            if granted == 0 {
                return None;
            }

            match self.head.reserved.compare_exchange_weak(
                reserved,
                reserved.wrapping_add(granted as u64),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((reserved, granted)),
                Err(_) => backoff.spin(),
            }
        }
    }

    // ---------------------------------------------------------------------
    // COMMITS & ROLLBACK
    // ---------------------------------------------------------------------

    /// Publishes a write reservation.
    ///
    /// Fails (returns false) until every earlier write reservation has been
    /// published; succeeds exactly once per reservation.
    pub(crate) fn commit_write(&self, start: u64, len: usize) -> bool {
        self.tail
            .committed
            .compare_exchange(
                start,
                start.wrapping_add(len as u64),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Retires a read reservation, freeing its slots for writers.
    pub(crate) fn commit_read(&self, start: u64, len: usize) -> bool {
        self.head
            .committed
            .compare_exchange(
                start,
                start.wrapping_add(len as u64),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Rolls back a write reservation. Succeeds only while it is the newest
    /// one on the producer side.
    pub(crate) fn cancel_write(&self, start: u64, len: usize) -> bool {
        self.tail
            .reserved
            .compare_exchange(
                start.wrapping_add(len as u64),
                start,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Rolls back a read reservation. Succeeds only while it is the newest
    /// one on the consumer side.
    pub(crate) fn cancel_read(&self, start: u64, len: usize) -> bool {
        self.head
            .reserved
            .compare_exchange(
                start.wrapping_add(len as u64),
                start,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    // ---------------------------------------------------------------------
    // SLOT ACCESS
    // ---------------------------------------------------------------------

    /// Writes `value` into the slot at sequence `seq`.
    ///
    /// # Safety
    ///
    /// The caller must hold an unpublished write reservation covering `seq`.
    /// The slot is vacant (never initialized, or moved out by a retired
    /// reader), so no old value is dropped.
    pub(crate) unsafe fn write_slot(&self, seq: u64, value: T) {
        let idx = Self::position(seq);
        debug_assert_slot_index!(idx, Self::SLOTS);
        (*self.buffer[idx].get()).write(value);
    }

    /// Moves the value out of the slot at sequence `seq`.
    ///
    /// # Safety
    ///
    /// The caller must hold an unretired read reservation covering `seq`;
    /// the slot was published by a write commit and is read at most once.
    pub(crate) unsafe fn take_slot(&self, seq: u64) -> T {
        let idx = Self::position(seq);
        debug_assert_slot_index!(idx, Self::SLOTS);
        (*self.buffer[idx].get()).assume_init_read()
    }
}

impl<T, const N: usize> Default for SyncQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for SyncQueue<T, N> {
    fn drop(&mut self) {
        // Committed but unread slots still own their payload. Slots inside
        // abandoned reservations are the caller's contract violation and are
        // not tracked here.
        let mut seq = *self.head.committed.get_mut();
        let end = *self.tail.committed.get_mut();
        debug_assert_occupancy!(end.wrapping_sub(seq) as usize, N);
        while seq != end {
            // SAFETY: the committed unread range holds initialized values.
            unsafe { self.buffer[Self::position(seq)].get_mut().assume_init_drop() };
            seq = seq.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_item_fifo() {
        let q: SyncQueue<i32, 63> = SyncQueue::new();
        for i in 0..10 {
            assert!(q.enqueue(i).is_ok());
        }
        for i in 0..10 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_fill_to_capacity() {
        let q: SyncQueue<i32, 63> = SyncQueue::new();
        for i in 0..63 {
            assert!(q.enqueue(i).is_ok());
        }
        assert_eq!(q.enqueue(63), Err(63));
        assert_eq!(q.size(), 63);
        assert!(q.is_full());

        for i in 0..63 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.size(), 0);
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let q: SyncQueue<u64, 4> = SyncQueue::new();
        let mut expected = 0;
        for round in 0..6u64 {
            for i in 0..4 {
                assert!(q.enqueue(round * 4 + i).is_ok());
            }
            for _ in 0..4 {
                assert_eq!(q.dequeue(), Some(expected));
                expected += 1;
            }
        }
    }

    #[test]
    fn test_drop_releases_unread_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropTracker(#[allow(dead_code)] u64);

        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROP_COUNT.store(0, Ordering::SeqCst);

        {
            let q: SyncQueue<DropTracker, 8> = SyncQueue::new();
            for i in 0..6 {
                assert!(q.enqueue(DropTracker(i)).is_ok());
            }
            drop(q.dequeue());
            drop(q.dequeue());
            assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 2);
            // Queue drops with 4 unread items.
        }

        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_non_copy_payload() {
        let q: SyncQueue<String, 4> = SyncQueue::new();
        assert!(q.enqueue("alpha".to_owned()).is_ok());
        assert!(q.enqueue("beta".to_owned()).is_ok());
        assert_eq!(q.dequeue().as_deref(), Some("alpha"));
        assert_eq!(q.dequeue().as_deref(), Some("beta"));
        assert_eq!(q.dequeue(), None);
    }
}
