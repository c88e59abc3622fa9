//! Batch transactions: reserve a contiguous slot range, copy the payload,
//! publish the range.
//!
//! A transaction is parameterized by direction ([`In`] writes into the
//! queue, [`Out`] reads out of it) and strictness ([`Hard`] grants the full
//! request or nothing, [`Soft`] grants any positive partial amount). The
//! four combinations share the reservation and commit core on
//! [`SyncQueue`]; only the payload copy differs by direction.

use crate::sync_queue::SyncQueue;
use std::marker::PhantomData;
use thiserror::Error;

mod sealed {
    pub trait Sealed {}
}

/// Transfer direction of a [`Transaction`].
pub trait Direction: sealed::Sealed {}

/// Strictness policy of a [`Transaction`]: how much of a requested range a
/// prepare may grant.
pub trait Strictness: sealed::Sealed {
    /// Decides the granted length from the available space and the request.
    fn grant(avail: usize, want: usize) -> usize;
}

/// Producer-side tag: the transaction writes into the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct In;

/// Consumer-side tag: the transaction reads out of the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct Out;

/// All-or-nothing: `prepare` grants the full request or refuses outright.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hard;

/// Best-effort: `prepare` grants whatever positive amount is available, up
/// to the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Soft;

impl sealed::Sealed for In {}
impl sealed::Sealed for Out {}
impl sealed::Sealed for Hard {}
impl sealed::Sealed for Soft {}

impl Direction for In {}
impl Direction for Out {}

impl Strictness for Hard {
    #[inline]
    fn grant(avail: usize, want: usize) -> usize {
        if avail >= want {
            want
        } else {
            0
        }
    }
}

impl Strictness for Soft {
    #[inline]
    fn grant(avail: usize, want: usize) -> usize {
        avail.min(want)
    }
}

/// Why [`Transaction::abort`] refused to roll a reservation back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbortError {
    /// A newer reservation on the same side is outstanding; rolling back
    /// would leave a hole in the reserved range.
    #[error("a newer reservation on the same side is outstanding")]
    NotNewest,
    /// Payload already moved through the reserved slots; the transaction
    /// can only go forward to `commit`.
    #[error("the reservation has already been executed")]
    AlreadyExecuted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Prepared,
    Executed,
    Committed,
}

/// A batch claim on a contiguous range of ring slots.
///
/// Lifecycle: [`prepare`](Transaction::prepare) claims the range and binds
/// the queue, [`execute`](Transaction::execute) copies the payload (no
/// shared-state traffic), [`commit`](Transaction::commit) publishes the
/// range once every earlier same-side reservation has retired. A committed
/// transaction may be prepared again.
///
/// `commit` returning `false` is transient: retry, yielding between
/// attempts (see [`Backoff`](crate::Backoff)). It turns `true` as soon as
/// the predecessor retires.
///
/// **Dropping a prepared or executed transaction without committing leaks
/// the reservation permanently** and stalls every later commit on the same
/// side. There is no silent release on drop; a reservation that should not
/// be published can sometimes be rolled back explicitly with
/// [`abort`](Transaction::abort).
///
/// # Example
///
/// ```
/// use ringtx_rs::{Hard, In, Out, SyncQueue, Transaction};
///
/// let queue = SyncQueue::<u64, 31>::new();
///
/// let mut write = Transaction::<In, Hard, u64, 31>::new();
/// assert_eq!(write.prepare(&queue, 4), 4);
/// write.execute(&[1, 2, 3, 4]);
/// assert!(write.commit());
///
/// let mut read = Transaction::<Out, Hard, u64, 31>::new();
/// assert_eq!(read.prepare(&queue, 4), 4);
/// let mut out = [0u64; 4];
/// read.execute(&mut out);
/// assert!(read.commit());
/// assert_eq!(out, [1, 2, 3, 4]);
/// ```
pub struct Transaction<'q, D, S, T, const N: usize> {
    queue: Option<&'q SyncQueue<T, N>>,
    start: u64,
    len: usize,
    /// Slots already copied through by `execute`, from `start`.
    filled: usize,
    state: State,
    _tags: PhantomData<(D, S)>,
}

impl<'q, D: Direction, S: Strictness, T, const N: usize> Transaction<'q, D, S, T, N> {
    /// Creates a fresh transaction, bound to no queue.
    pub fn new() -> Self {
        Self {
            queue: None,
            start: 0,
            len: 0,
            filled: 0,
            state: State::Fresh,
            _tags: PhantomData,
        }
    }

    /// Length of the current reservation; zero when nothing is reserved.
    #[inline]
    pub fn reserved(&self) -> usize {
        self.len
    }

    fn reset(&mut self) {
        self.queue = None;
        self.start = 0;
        self.len = 0;
        self.filled = 0;
        self.state = State::Fresh;
    }

    fn record(&mut self, queue: &'q SyncQueue<T, N>, claim: Option<(u64, usize)>) -> usize {
        match claim {
            Some((start, granted)) => {
                self.queue = Some(queue);
                self.start = start;
                self.len = granted;
                self.filled = 0;
                self.state = State::Prepared;
                granted
            }
            None => {
                self.reset();
                0
            }
        }
    }

    fn bound_queue(&self) -> &'q SyncQueue<T, N> {
        self.queue
            .expect("a live transaction is bound to a queue")
    }

    fn assert_reusable(&self) {
        assert!(
            matches!(self.state, State::Fresh | State::Committed),
            "prepare while a reservation is outstanding"
        );
    }

    fn assert_live(&self, len: usize) {
        assert!(
            self.state == State::Prepared,
            "execute on a transaction without a live reservation"
        );
        assert!(
            len <= self.len - self.filled,
            "execute extends past the reserved range"
        );
    }

    /// Sequence of the next slot to copy through, `offset` items ahead.
    #[inline]
    fn slot(&self, offset: usize) -> u64 {
        self.start.wrapping_add((self.filled + offset) as u64)
    }

    fn finish_fill(&mut self, count: usize) -> usize {
        self.filled += count;
        if self.filled == self.len {
            self.state = State::Executed;
        }
        count
    }

    fn commit_with(&mut self, publish: impl FnOnce(&SyncQueue<T, N>) -> bool) -> bool {
        match self.state {
            // Nothing reserved (fresh, or a refused prepare): no-op success.
            State::Fresh => true,
            State::Committed => true,
            State::Executed => {
                if publish(self.bound_queue()) {
                    self.state = State::Committed;
                    true
                } else {
                    false
                }
            }
            State::Prepared => panic!("commit before the reservation was fully executed"),
        }
    }

    fn abort_with(&mut self, rollback: impl FnOnce(&SyncQueue<T, N>) -> bool) -> Result<(), AbortError> {
        match self.state {
            State::Fresh => Ok(()),
            State::Prepared if self.filled == 0 => {
                if rollback(self.bound_queue()) {
                    self.reset();
                    Ok(())
                } else {
                    Err(AbortError::NotNewest)
                }
            }
            State::Prepared | State::Executed => Err(AbortError::AlreadyExecuted),
            State::Committed => panic!("abort on a committed transaction"),
        }
    }
}

impl<'q, S: Strictness, T, const N: usize> Transaction<'q, In, S, T, N> {
    /// Claims up to `want` contiguous slots for writing into `queue`.
    ///
    /// Returns the granted length: `want` when enough space is free, a
    /// positive partial amount under [`Soft`], or 0, in which case the
    /// transaction stays fresh and nothing was claimed. The grant is based
    /// on the space free of committed data and outstanding reservations at
    /// snapshot time.
    ///
    /// # Panics
    ///
    /// Panics if a prior reservation on this transaction is still
    /// outstanding (neither committed nor aborted).
    pub fn prepare(&mut self, queue: &'q SyncQueue<T, N>, want: usize) -> usize {
        self.assert_reusable();
        let claim = queue.reserve_write::<S>(want);
        self.record(queue, claim)
    }

    /// Clones `src` into the reserved slots, continuing where the previous
    /// call stopped. Returns the number of items copied.
    ///
    /// The reservation must be fully filled before `commit`; chained
    /// partial fills are fine as long as they add up to the reserved
    /// length.
    ///
    /// # Panics
    ///
    /// Panics without a live reservation, or if `src` extends past it.
    pub fn execute(&mut self, src: &[T]) -> usize
    where
        T: Clone,
    {
        self.assert_live(src.len());
        let queue = self.bound_queue();
        for (i, item) in src.iter().enumerate() {
            // SAFETY: the slot lies inside this transaction's write
            // reservation, which is exclusive until commit.
            unsafe { queue.write_slot(self.slot(i), item.clone()) };
        }
        self.finish_fill(src.len())
    }

    /// Publishes the reservation, making its elements readable.
    ///
    /// Returns `false` while an earlier write reservation is unretired;
    /// retry until `true`. Committing with nothing reserved is a no-op
    /// `true`, as is re-committing an already committed transaction.
    ///
    /// # Panics
    ///
    /// Panics if the reservation was only partially filled.
    pub fn commit(&mut self) -> bool {
        let (start, len) = (self.start, self.len);
        self.commit_with(|queue| queue.commit_write(start, len))
    }

    /// Rolls the reservation back instead of publishing it.
    ///
    /// Only the newest producer-side reservation can roll back, and only
    /// before any `execute` call copied payload into it. On success the
    /// transaction is fresh again and the slots are immediately claimable
    /// by other writers.
    pub fn abort(&mut self) -> Result<(), AbortError> {
        let (start, len) = (self.start, self.len);
        self.abort_with(|queue| queue.cancel_write(start, len))
    }
}

impl<'q, S: Strictness, T, const N: usize> Transaction<'q, Out, S, T, N> {
    /// Claims up to `want` committed elements for reading from `queue`.
    ///
    /// Returns the granted length: `want` when enough committed data is
    /// unclaimed, a positive partial amount under [`Soft`], or 0, in which
    /// case the transaction stays fresh. Only data published by write
    /// commits is ever granted.
    ///
    /// # Panics
    ///
    /// Panics if a prior reservation on this transaction is still
    /// outstanding (neither committed nor aborted).
    pub fn prepare(&mut self, queue: &'q SyncQueue<T, N>, want: usize) -> usize {
        self.assert_reusable();
        let claim = queue.reserve_read::<S>(want);
        self.record(queue, claim)
    }

    /// Moves elements out of the reserved slots into `dst`, continuing
    /// where the previous call stopped. Returns the number of items moved.
    ///
    /// The reservation must be fully drained before `commit`.
    ///
    /// # Panics
    ///
    /// Panics without a live reservation, or if `dst` extends past it.
    pub fn execute(&mut self, dst: &mut [T]) -> usize {
        self.assert_live(dst.len());
        let queue = self.bound_queue();
        for (i, out) in dst.iter_mut().enumerate() {
            // SAFETY: the slot lies inside this transaction's read
            // reservation and was published by a write commit; each slot is
            // moved out exactly once.
            *out = unsafe { queue.take_slot(self.slot(i)) };
        }
        self.finish_fill(dst.len())
    }

    /// Retires the reservation, freeing its slots for writers.
    ///
    /// Returns `false` while an earlier read reservation is unretired;
    /// retry until `true`. Committing with nothing reserved is a no-op
    /// `true`, as is re-committing an already committed transaction.
    ///
    /// # Panics
    ///
    /// Panics if the reservation was only partially drained.
    pub fn commit(&mut self) -> bool {
        let (start, len) = (self.start, self.len);
        self.commit_with(|queue| queue.commit_read(start, len))
    }

    /// Rolls the reservation back, leaving the claimed elements unread.
    ///
    /// Only the newest consumer-side reservation can roll back, and only
    /// before any `execute` call moved payload out of it.
    pub fn abort(&mut self) -> Result<(), AbortError> {
        let (start, len) = (self.start, self.len);
        self.abort_with(|queue| queue.cancel_read(start, len))
    }
}

impl<'q, D: Direction, S: Strictness, T, const N: usize> Default for Transaction<'q, D, S, T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_in_fills_exactly() {
        let q: SyncQueue<i32, 31> = SyncQueue::new();

        for k in 0..5 {
            let mut tr = Transaction::<In, Hard, i32, 31>::new();
            assert_eq!(tr.prepare(&q, 6), 6);
            let v = [k; 6];
            assert_eq!(tr.execute(&v), 6);
            assert!(tr.commit());
        }
        assert_eq!(q.size(), 30);

        // One free slot left: an all-or-nothing claim of 2 is refused.
        let mut tr = Transaction::<In, Hard, i32, 31>::new();
        assert_eq!(tr.prepare(&q, 2), 0);

        let mut tr2 = Transaction::<Out, Hard, i32, 31>::new();
        assert_eq!(tr2.prepare(&q, 6), 6);
        let mut v = [-1i32; 6];
        assert_eq!(tr2.execute(&mut v), 6);
        assert!(tr2.commit());
        assert_eq!(v, [0; 6]);

        // The freed batch makes room for a claim of 6 on the reused handle.
        assert_eq!(tr.prepare(&q, 6), 6);
        assert_eq!(tr.execute(&v), 6);
        assert!(tr.commit());

        let mut counts = [0usize; 5];
        for _ in 0..5 {
            let mut tr = Transaction::<Out, Hard, i32, 31>::new();
            assert_eq!(tr.prepare(&q, 6), 6);
            let mut v = [-1i32; 6];
            assert_eq!(tr.execute(&mut v), 6);
            assert!(tr.commit());
            for x in v {
                counts[x as usize] += 1;
            }
        }
        assert_eq!(counts, [6; 5]);
        assert_eq!(q.size(), 0);
        assert_eq!(tr2.prepare(&q, 6), 0);
    }

    #[test]
    fn test_soft_in_grants_partial() {
        let q: SyncQueue<i32, 7> = SyncQueue::new();

        for k in 0..3 {
            let mut tr = Transaction::<In, Soft, i32, 7>::new();
            assert_eq!(tr.prepare(&q, 2), 2);
            assert_eq!(tr.execute(&[k, k]), 2);
            assert!(tr.commit());
        }
        assert_eq!(q.size(), 6);

        // One slot free: a best-effort claim of 4 grants 1.
        let mut tr = Transaction::<In, Soft, i32, 7>::new();
        assert_eq!(tr.prepare(&q, 4), 1);
        assert_eq!(tr.execute(&[9]), 1);
        assert!(tr.commit());
        assert_eq!(q.size(), 7);

        // Full: even a best-effort claim grants nothing.
        assert_eq!(tr.prepare(&q, 1), 0);

        let mut rd = Transaction::<Out, Soft, i32, 7>::new();
        assert_eq!(rd.prepare(&q, 2), 2);
        let mut v2 = [-1i32; 2];
        rd.execute(&mut v2);
        assert!(rd.commit());
        assert_eq!(v2, [0, 0]);

        assert_eq!(rd.prepare(&q, 4), 4);
        let mut v4 = [-1i32; 4];
        rd.execute(&mut v4);
        assert!(rd.commit());
        assert_eq!(v4, [1, 1, 2, 2]);

        // Best-effort read clamps to the single remaining element.
        assert_eq!(rd.prepare(&q, 4), 1);
        let mut v1 = [-1i32; 1];
        rd.execute(&mut v1);
        assert!(rd.commit());
        assert_eq!(v1, [9]);

        assert_eq!(q.size(), 0);
        assert_eq!(rd.prepare(&q, 1), 0);
    }

    #[test]
    fn test_commits_retire_in_claim_order() {
        let q: SyncQueue<u32, 15> = SyncQueue::new();

        let mut first = Transaction::<In, Hard, u32, 15>::new();
        let mut second = Transaction::<In, Hard, u32, 15>::new();
        assert_eq!(first.prepare(&q, 2), 2);
        assert_eq!(second.prepare(&q, 2), 2);
        first.execute(&[1, 2]);
        second.execute(&[3, 4]);

        // The younger claim cannot publish ahead of the older one.
        assert!(!second.commit());
        assert_eq!(q.size(), 0);
        assert!(first.commit());
        assert!(second.commit());
        assert_eq!(q.size(), 4);

        let mut older = Transaction::<Out, Hard, u32, 15>::new();
        let mut younger = Transaction::<Out, Hard, u32, 15>::new();
        assert_eq!(older.prepare(&q, 2), 2);
        assert_eq!(younger.prepare(&q, 2), 2);
        let mut a = [0u32; 2];
        let mut b = [0u32; 2];
        older.execute(&mut a);
        younger.execute(&mut b);
        assert_eq!(a, [1, 2]);
        assert_eq!(b, [3, 4]);

        assert!(!younger.commit());
        assert!(older.commit());
        assert!(younger.commit());
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_chained_partial_fill() {
        let q: SyncQueue<u32, 7> = SyncQueue::new();

        let mut tr = Transaction::<In, Hard, u32, 7>::new();
        assert_eq!(tr.prepare(&q, 6), 6);
        assert_eq!(tr.execute(&[1, 2]), 2);
        assert_eq!(tr.execute(&[3, 4, 5]), 3);
        assert_eq!(tr.execute(&[6]), 1);
        assert!(tr.commit());

        let mut rd = Transaction::<Out, Hard, u32, 7>::new();
        assert_eq!(rd.prepare(&q, 6), 6);
        let mut out = [0u32; 6];
        assert_eq!(rd.execute(&mut out[..4]), 4);
        assert_eq!(rd.execute(&mut out[4..]), 2);
        assert!(rd.commit());
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_noop_commit_and_refused_prepare() {
        let q: SyncQueue<u32, 3> = SyncQueue::new();

        let mut tr = Transaction::<In, Hard, u32, 3>::new();
        assert!(tr.commit()); // nothing reserved

        assert_eq!(tr.prepare(&q, 4), 0); // larger than capacity
        assert!(tr.commit()); // still nothing reserved
        assert_eq!(tr.reserved(), 0);
    }

    #[test]
    fn test_abort_newest_only() {
        let q: SyncQueue<i32, 7> = SyncQueue::new();

        let mut older = Transaction::<In, Hard, i32, 7>::new();
        let mut newer = Transaction::<In, Hard, i32, 7>::new();
        assert_eq!(older.prepare(&q, 3), 3);
        assert_eq!(newer.prepare(&q, 3), 3);

        assert_eq!(older.abort(), Err(AbortError::NotNewest));
        assert_eq!(newer.abort(), Ok(()));

        // The rollback freed its slots: a claim of 4 now fits.
        assert_eq!(newer.prepare(&q, 4), 4);
        newer.execute(&[0; 4]);

        // `older` is still committable after the failed abort.
        older.execute(&[1, 1, 1]);
        assert!(older.commit());
        assert!(newer.commit());
        assert_eq!(q.size(), 7);
    }

    #[test]
    fn test_abort_refused_after_execute() {
        let q: SyncQueue<i32, 7> = SyncQueue::new();

        let mut tr = Transaction::<In, Hard, i32, 7>::new();
        assert_eq!(tr.prepare(&q, 2), 2);
        tr.execute(&[5, 6]);
        assert_eq!(tr.abort(), Err(AbortError::AlreadyExecuted));
        assert!(tr.commit());

        let mut rd = Transaction::<Out, Hard, i32, 7>::new();
        assert_eq!(rd.prepare(&q, 1), 1);
        let mut v = [0i32];
        rd.execute(&mut v);
        assert_eq!(rd.abort(), Err(AbortError::AlreadyExecuted));
        assert!(rd.commit());
        assert_eq!(v, [5]);
    }

    #[test]
    fn test_abort_read_reservation() {
        let q: SyncQueue<i32, 7> = SyncQueue::new();
        for i in 0..4 {
            assert!(q.enqueue(i).is_ok());
        }

        let mut rd = Transaction::<Out, Hard, i32, 7>::new();
        assert_eq!(rd.prepare(&q, 3), 3);
        assert_eq!(rd.abort(), Ok(()));

        // The elements are still there, in order.
        assert_eq!(q.size(), 4);
        assert_eq!(q.dequeue(), Some(0));

        // A fresh abort is a no-op.
        assert_eq!(Transaction::<Out, Hard, i32, 7>::new().abort(), Ok(()));
    }

    #[test]
    #[should_panic(expected = "commit before the reservation was fully executed")]
    fn test_commit_requires_full_execute() {
        let q: SyncQueue<i32, 7> = SyncQueue::new();
        let mut tr = Transaction::<In, Hard, i32, 7>::new();
        assert_eq!(tr.prepare(&q, 3), 3);
        tr.execute(&[1]);
        tr.commit();
    }
}
