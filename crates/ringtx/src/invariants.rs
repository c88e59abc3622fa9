//! Debug assertion macros for the ring index invariants.
//!
//! Active only in debug builds; release builds compile them away entirely.
//! Used by both `RingQueue<T, N>` and `SyncQueue<T, N>`.

/// Assert that an occupancy count never exceeds the queue capacity.
///
/// Holds at every snapshot: the distance between a trailing and a leading
/// index, measured modulo the slot count, is at most `N`.
macro_rules! debug_assert_occupancy {
    ($used:expr, $cap:expr) => {
        debug_assert!(
            $used <= $cap,
            "occupancy {} exceeds capacity {}",
            $used,
            $cap
        )
    };
}

/// Assert that a reservation grant fits the space it was computed from.
macro_rules! debug_assert_grant {
    ($granted:expr, $avail:expr) => {
        debug_assert!(
            $granted <= $avail,
            "granted {} slots with only {} available",
            $granted,
            $avail
        )
    };
}

/// Assert that a slot index is inside the ring before touching storage.
macro_rules! debug_assert_slot_index {
    ($idx:expr, $slots:expr) => {
        debug_assert!(
            $idx < $slots,
            "slot index {} outside ring of {} slots",
            $idx,
            $slots
        )
    };
}

pub(crate) use debug_assert_grant;
pub(crate) use debug_assert_occupancy;
pub(crate) use debug_assert_slot_index;
