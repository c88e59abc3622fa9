//! ringtx - Bounded MPMC Queue with Batch Transactions
//!
//! A fixed-capacity in-memory queue library built over a single contiguous
//! ring of `N + 1` slots:
//!
//! - [`RingQueue<T, N>`]: the plain single-producer single-consumer ring
//!   queue defining the storage and index model.
//! - [`SyncQueue<T, N>`]: a lock-free multi-producer multi-consumer queue
//!   over the same model, with single-item `enqueue`/`dequeue` and a batch
//!   [`Transaction`] protocol: `prepare` reserves a contiguous slot range,
//!   `execute` copies the payload outside any critical section, `commit`
//!   publishes the range in reservation order.
//!
//! # Key Features
//!
//! - Four word-sized atomic indices, CAS-only writes, no mutexes, no
//!   allocation on the hot path
//! - Producer and consumer index pairs on separate cache lines
//! - All-or-nothing ([`Hard`]) and best-effort partial ([`Soft`]) batch
//!   reservations, in both directions ([`In`], [`Out`])
//! - Strictly non-blocking surface; waiting is the caller's, via [`Backoff`]
//!
//! # Example
//!
//! ```
//! use ringtx_rs::{Hard, In, Out, Soft, SyncQueue, Transaction};
//!
//! let queue = SyncQueue::<u64, 7>::new();
//!
//! // Single items.
//! assert!(queue.enqueue(99).is_ok());
//! assert_eq!(queue.dequeue(), Some(99));
//!
//! // Batched: reserve, fill, publish.
//! let mut write = Transaction::<In, Hard, u64, 7>::new();
//! assert_eq!(write.prepare(&queue, 3), 3);
//! write.execute(&[1, 2, 3]);
//! assert!(write.commit());
//!
//! // Best-effort read takes what is there.
//! let mut read = Transaction::<Out, Soft, u64, 7>::new();
//! let granted = read.prepare(&queue, 8);
//! assert_eq!(granted, 3);
//! let mut out = vec![0; granted];
//! read.execute(&mut out);
//! assert!(read.commit());
//! assert_eq!(out, [1, 2, 3]);
//! ```

mod backoff;
mod invariants;
mod ring;
mod sync_queue;
mod transaction;

pub use backoff::Backoff;
pub use ring::RingQueue;
pub use sync_queue::SyncQueue;
pub use transaction::{AbortError, Direction, Hard, In, Out, Soft, Strictness, Transaction};
