//! Single-producer single-consumer ring queue with a fixed capacity.
//!
//! This is the storage model the synchronized queue builds on: a ring of
//! `N + 1` slots where one slot is kept vacant so that `next(tail) == head`
//! means full and `head == tail` means empty, with no separate count.
//!
//! The queue has no concurrency guarantees; it is a plain `&mut self`
//! container for one writer and one reader on the same thread (or externally
//! synchronized).

use crate::invariants::{debug_assert_occupancy, debug_assert_slot_index};
use std::mem::MaybeUninit;

/// A bounded FIFO queue over a fixed ring of `N + 1` slots.
///
/// `N` is the capacity; the extra slot disambiguates full from empty.
/// Slots hold `MaybeUninit<T>`, so `T` needs no `Default` and vacated slots
/// are never dropped twice.
///
/// # Example
///
/// ```
/// use ringtx_rs::RingQueue;
///
/// let mut q: RingQueue<u32, 2> = RingQueue::new();
/// assert!(q.enqueue(1).is_ok());
/// assert!(q.enqueue(2).is_ok());
/// assert_eq!(q.enqueue(3), Err(3)); // full
/// assert_eq!(q.dequeue(), Some(1));
/// ```
pub struct RingQueue<T, const N: usize> {
    /// Ring storage, `N + 1` slots. Fixed size for the queue's lifetime.
    buffer: Box<[MaybeUninit<T>]>,
    /// Index of the oldest element; equal to `tail` when empty.
    head: usize,
    /// Index one past the newest element.
    tail: usize,
}

impl<T, const N: usize> RingQueue<T, N> {
    /// Number of slots in the ring: capacity plus the vacancy slot.
    const SLOTS: usize = N + 1;

    /// Creates an empty queue.
    pub fn new() -> Self {
        const { assert!(N > 0, "queue capacity must be greater than 0") };

        let mut buffer = Vec::with_capacity(Self::SLOTS);
        buffer.resize_with(Self::SLOTS, MaybeUninit::uninit);

        Self {
            buffer: buffer.into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Returns the queue capacity.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    fn next(idx: usize) -> usize {
        (idx + 1) % Self::SLOTS
    }

    /// Appends `item`, or hands it back when the queue is full.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        let next_tail = Self::next(self.tail);
        if next_tail == self.head {
            return Err(item);
        }

        debug_assert_slot_index!(self.tail, Self::SLOTS);
        self.buffer[self.tail].write(item);
        self.tail = next_tail;
        Ok(())
    }

    /// Removes and returns the oldest element, or `None` when empty.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.head == self.tail {
            return None;
        }

        debug_assert_slot_index!(self.head, Self::SLOTS);
        // SAFETY: slots in [head, tail) hold initialized values; head is
        // advanced past the slot immediately, so it is never read again.
        let item = unsafe { self.buffer[self.head].assume_init_read() };
        self.head = Self::next(self.head);
        Some(item)
    }

    /// Returns the number of elements currently stored.
    #[inline]
    pub fn size(&self) -> usize {
        let used = (self.tail + Self::SLOTS - self.head) % Self::SLOTS;
        debug_assert_occupancy!(used, N);
        used
    }

    /// Returns true if the queue holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Returns true if the queue is at capacity.
    #[inline]
    pub fn is_full(&self) -> bool {
        Self::next(self.tail) == self.head
    }

    /// Peeks at the oldest element.
    pub fn front(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: non-empty, so buffer[head] is initialized.
        Some(unsafe { self.buffer[self.head].assume_init_ref() })
    }

    /// Peeks at the newest element.
    pub fn back(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.tail + N) % Self::SLOTS;
        // SAFETY: non-empty, so the slot just behind tail is initialized.
        Some(unsafe { self.buffer[idx].assume_init_ref() })
    }
}

impl<T, const N: usize> Default for RingQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for RingQueue<T, N> {
    fn drop(&mut self) {
        // Drop whatever was enqueued but never dequeued.
        let mut idx = self.head;
        while idx != self.tail {
            // SAFETY: slots in [head, tail) hold initialized values.
            unsafe { self.buffer[idx].assume_init_drop() };
            idx = Self::next(idx);
        }
    }
}
