//! Double-buffer ("latest-wins") transports.
//!
//! A double-buffer channel holds exactly two payload slots. At any time
//! one slot is the **front** slot (named by `publish_index`, the slot
//! readers should consume) and the other is the **back** slot (the slot
//! the writer fills next). Publishing a frame is a single release store
//! of `publish_index`; consuming is a single acquire load plus relaxed
//! metadata loads. Neither side ever blocks or takes a lock.
//!
//! Three variants share this protocol and differ only in layout and
//! fast-path strategy:
//!
//! * [`nt`]: non-temporal streaming stores for large payloads, minimum
//!   writer disturbance of the cache.
//! * [`prefetch`]: temporal stores with software prefetch, optional
//!   huge pages and CPU pinning, copying and timed read paths.
//! * [`simple`]: the minimal baseline; plain copies, base pages, no
//!   tuning knobs.
//!
//! # Delivery semantics
//!
//! The contract is **latest-wins**: only the most recently published
//! frame is guaranteed observable. A reader that falls behind observes a
//! gap in sequence numbers and accounts it in its `dropped` counter. A
//! reader racing the writer across **two** publishes of the same slot
//! can observe a torn payload; consumers that care must finish reading
//! well inside two writer periods, which is the intended operating
//! regime for this transport.

pub mod nt;
pub mod prefetch;
pub mod simple;

use crate::topology::CACHE_LINE;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize};

/// One frame as observed by a reader: a borrowed view of the front
/// slot's payload plus its metadata.
///
/// The borrow is a bounded lease into memory the reader does not own: it
/// is valid until the next read call on the same reader (which reborrows
/// the mapping) and must not outlive the reader itself. The borrow
/// checker enforces both bounds.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Payload bytes, `len` long, borrowed straight from shared memory.
    pub data: &'a [u8],
    /// Monotonic per-channel sequence number of this frame.
    pub seq: u64,
    /// Monotonic timestamp taken when the frame was published.
    pub timestamp_ns: i64,
}

impl Frame<'_> {
    /// Payload length in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-slot metadata, one cache line per slot.
///
/// The writer stores all three fields relaxed before the release store
/// of `publish_index`; readers load them relaxed after their acquire of
/// `publish_index`. Grouping the triple on one line is intentional: the
/// three values are always written and read together.
#[repr(C, align(64))]
pub(crate) struct SlotMeta {
    pub(crate) seq: AtomicU64,
    pub(crate) timestamp_ns: AtomicI64,
    pub(crate) len: AtomicUsize,
    _pad: [u8; CACHE_LINE - 24],
}

const_assert_eq!(std::mem::size_of::<SlotMeta>(), CACHE_LINE);
