//! Double-buffer transport with non-temporal stores.
//!
//! The writer's fast path is built to disturb the cache as little as
//! possible: payloads of 4 KiB and more are copied with cache-bypassing
//! 128-bit streaming stores followed by a store fence, so a large frame
//! does not evict the working set of whatever else runs on the core.
//! Publishing remains a single release store per frame.

use crate::dbuf::{Frame, SlotMeta};
use crate::error::{ShmError, ShmResult};
use crate::region::{HUGE_PAGE_SIZE, SharedRegion};
use crate::topology::CACHE_LINE;
use crate::utils::{align_up, mono_time_ns, validate_name};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Header magic, `"SHM2"`.
pub const MAGIC: u32 = 0x53484D32;
/// Header version.
pub const VERSION: u32 = 0x0002_0000;

/// Payloads at least this large are copied with streaming stores.
const NT_THRESHOLD: usize = 4096;

/// Channel header, five cache lines.
///
/// Laid out by offset, not by what the compiler would choose: every
/// writer-hot atomic owns a full cache line, and the layout is pinned by
/// compile-time assertions below.
#[repr(C, align(64))]
struct Header {
    // Cache line 0: static metadata, written once at init.
    magic: u32,
    version: u32,
    capacity: usize,
    buffer_offset: usize,
    flags: u32,
    _reserved: u32,
    _pad0: [u8; CACHE_LINE - 32],

    // Cache line 1: the publish index, stored on every publish.
    publish_index: AtomicU32,
    _pad1: [u8; CACHE_LINE - 4],

    // Cache lines 2-3: per-slot metadata.
    slots: [SlotMeta; 2],

    // Cache line 4: heartbeat and stats.
    heartbeat_ns: AtomicI64,
    total_writes: AtomicU64,
    total_bytes: AtomicU64,
    _pad4: [u8; CACHE_LINE - 24],
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const_assert_eq!(HEADER_SIZE, 5 * CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, publish_index), CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, slots), 2 * CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, heartbeat_ns), 4 * CACHE_LINE);

/// Header flag bit 0: the region is backed by huge pages.
const FLAG_HUGE_PAGES: u32 = 0x1;

/// Copies a payload into a slot, streaming past the cache when it pays.
///
/// # Safety
///
/// `dst` must be valid for `src.len()` bytes and 16-byte aligned (slot
/// bases are 64-byte aligned by construction).
#[inline]
unsafe fn copy_payload(dst: *mut u8, src: &[u8]) {
    #[cfg(target_arch = "x86_64")]
    if src.len() >= NT_THRESHOLD {
        unsafe { nt_copy(dst, src.as_ptr(), src.len()) };
        return;
    }
    unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
}

/// Non-temporal copy: 128-bit streaming stores, store fence at the end.
///
/// SSE2 is part of the x86_64 baseline, so no runtime dispatch is
/// needed. The trailing `sfence` orders the streaming stores before any
/// subsequent release store.
#[cfg(target_arch = "x86_64")]
unsafe fn nt_copy(dst: *mut u8, src: *const u8, len: usize) {
    use std::arch::x86_64::{__m128i, _mm_loadu_si128, _mm_sfence, _mm_stream_si128};

    let chunks = len / 16;
    let remainder = len % 16;

    unsafe {
        let d = dst as *mut __m128i;
        let s = src as *const __m128i;
        for i in 0..chunks {
            _mm_stream_si128(d.add(i), _mm_loadu_si128(s.add(i)));
        }
        if remainder > 0 {
            std::ptr::copy_nonoverlapping(
                src.add(chunks * 16),
                dst.add(chunks * 16),
                remainder,
            );
        }
        _mm_sfence();
    }
}

/// The channel's writing end.
///
/// Exactly one writer may exist per channel name; creating the writer
/// registers the name and destroying it removes the name. The writer is
/// "shoot and forget": a publish is a copy, a handful of relaxed stores
/// and one release store, and never waits for readers.
///
/// # Lifecycle
///
/// [`Writer::new`] only validates the name and records configuration.
/// [`Writer::init`] acquires and lays out the shared region; fast-path
/// calls before a successful `init` fail with
/// [`ShmError::NotInitialized`]. [`Writer::destroy`] (or drop) unmaps
/// the region and unlinks the name.
#[derive(Debug)]
pub struct Writer {
    name: String,
    capacity: usize,
    slot_size: usize,
    prefer_huge: bool,
    region: Option<SharedRegion>,
    frame_count: u64,
}

impl Writer {
    /// Creates an uninitialized writer for `name` with a per-slot
    /// payload capacity of `capacity` bytes.
    ///
    /// `prefer_huge` requests huge-page backing when the region is large
    /// enough; the fallback to base pages is silent.
    pub fn new(name: &str, capacity: usize, prefer_huge: bool) -> ShmResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            capacity,
            slot_size: align_up(capacity, CACHE_LINE),
            prefer_huge,
            region: None,
            frame_count: 0,
        })
    }

    /// Creates the shared region and initializes the channel header.
    ///
    /// Idempotent: calling `init` on an initialized writer is a no-op.
    pub fn init(&mut self) -> ShmResult<()> {
        if self.region.is_some() {
            return Ok(());
        }

        let size = HEADER_SIZE + self.slot_size * 2;
        let prefer_huge = self.prefer_huge && size >= HUGE_PAGE_SIZE;
        let region = SharedRegion::create(&self.name, size, prefer_huge)?;

        let hdr = region.as_mut_ptr() as *mut Header;
        unsafe {
            (*hdr).magic = MAGIC;
            (*hdr).version = VERSION;
            (*hdr).capacity = self.capacity;
            (*hdr).buffer_offset = HEADER_SIZE;
            (*hdr).flags = if region.uses_huge_pages() {
                FLAG_HUGE_PAGES
            } else {
                0
            };
            (*hdr)._reserved = 0;

            (*hdr).publish_index.store(0, Ordering::Relaxed);
            for slot in &(*hdr).slots {
                slot.seq.store(0, Ordering::Relaxed);
                slot.timestamp_ns.store(0, Ordering::Relaxed);
                slot.len.store(0, Ordering::Relaxed);
            }
            (*hdr).heartbeat_ns.store(mono_time_ns(), Ordering::Relaxed);
            (*hdr).total_writes.store(0, Ordering::Relaxed);
            (*hdr).total_bytes.store(0, Ordering::Relaxed);
        }
        // Header contents become visible before any reader can observe
        // a non-zero magic.
        std::sync::atomic::fence(Ordering::Release);

        self.region = Some(region);
        self.frame_count = 0;
        Ok(())
    }

    /// Publishes one frame of `data.len()` bytes.
    ///
    /// Copies into the back slot (streaming stores for payloads of 4 KiB
    /// and more), stores the slot metadata and heartbeat relaxed, then
    /// publishes with a single release store of the publish index. This
    /// release store is the frame's linearization point.
    #[inline(always)]
    pub fn write(&mut self, data: &[u8]) -> ShmResult<()> {
        let region = self.region.as_ref().ok_or(ShmError::NotInitialized)?;
        if data.len() > self.capacity {
            return Err(ShmError::SizeExceeded {
                len: data.len(),
                capacity: self.capacity,
            });
        }

        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let front = hdr.publish_index.load(Ordering::Acquire);
        let back = 1 - front;

        unsafe {
            let dst = region
                .as_mut_ptr()
                .add(HEADER_SIZE + back as usize * self.slot_size);
            copy_payload(dst, data);
        }

        self.publish(hdr, back, data.len());
        Ok(())
    }

    /// Returns the back slot for in-place filling.
    ///
    /// The caller writes up to `capacity` bytes into the returned slice
    /// and then calls [`Writer::commit`] with the number of bytes
    /// actually written. The slice must not be retained past `commit`;
    /// the borrow ends there anyway.
    #[inline(always)]
    pub fn write_buffer(&mut self) -> ShmResult<&mut [u8]> {
        let region = self.region.as_ref().ok_or(ShmError::NotInitialized)?;
        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let back = 1 - hdr.publish_index.load(Ordering::Acquire);
        unsafe {
            let dst = region
                .as_mut_ptr()
                .add(HEADER_SIZE + back as usize * self.slot_size);
            Ok(std::slice::from_raw_parts_mut(dst, self.capacity))
        }
    }

    /// Publishes `len` bytes previously written via [`Writer::write_buffer`].
    #[inline(always)]
    pub fn commit(&mut self, len: usize) -> ShmResult<()> {
        let region = self.region.as_ref().ok_or(ShmError::NotInitialized)?;
        if len > self.capacity {
            return Err(ShmError::SizeExceeded {
                len,
                capacity: self.capacity,
            });
        }
        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let back = 1 - hdr.publish_index.load(Ordering::Acquire);
        self.publish(hdr, back, len);
        Ok(())
    }

    /// Metadata stores and the release publish, shared by both paths.
    #[inline(always)]
    fn publish(&mut self, hdr: &Header, back: u32, len: usize) {
        let now = mono_time_ns();
        self.frame_count += 1;

        let slot = &hdr.slots[back as usize];
        slot.len.store(len, Ordering::Relaxed);
        slot.timestamp_ns.store(now, Ordering::Relaxed);
        slot.seq.store(self.frame_count, Ordering::Relaxed);

        hdr.heartbeat_ns.store(now, Ordering::Relaxed);
        hdr.total_writes.fetch_add(1, Ordering::Relaxed);
        hdr.total_bytes.fetch_add(len as u64, Ordering::Relaxed);

        hdr.publish_index.store(back, Ordering::Release);
    }

    /// Whether `init` has succeeded.
    pub fn is_ready(&self) -> bool {
        self.region.is_some()
    }

    /// Number of frames published by this writer instance.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Per-slot payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the live mapping is backed by huge pages.
    pub fn uses_huge_pages(&self) -> bool {
        self.region
            .as_ref()
            .is_some_and(SharedRegion::uses_huge_pages)
    }

    /// Unmaps the region and unlinks the channel name.
    pub fn destroy(&mut self) {
        self.region = None;
    }
}

/// The channel's reading end.
///
/// Any number of readers may open the same channel; each keeps its own
/// last-observed sequence number and drop counter. Readers never mutate
/// the channel region.
#[derive(Debug)]
pub struct Reader {
    name: String,
    capacity: usize,
    slot_size: usize,
    region: Option<SharedRegion>,
    last_seq: u64,
    dropped: u64,
}

impl Reader {
    /// Creates an unconnected reader. `capacity` must match the writer's.
    pub fn new(name: &str, capacity: usize) -> ShmResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            capacity,
            slot_size: align_up(capacity, CACHE_LINE),
            region: None,
            last_seq: 0,
            dropped: 0,
        })
    }

    /// Connects to the writer's region and validates the header.
    ///
    /// Returns [`ShmError::NotFound`] while the writer has not created
    /// the channel yet; callers typically poll at their own cadence.
    pub fn init(&mut self) -> ShmResult<()> {
        if self.region.is_some() {
            return Ok(());
        }

        let region = SharedRegion::open_ro(&self.name, false)?;

        let corrupt = |reason| ShmError::Corrupt {
            name: self.name.clone(),
            reason,
        };

        if region.len() < HEADER_SIZE + self.slot_size * 2 {
            return Err(corrupt("region too small for header and slots"));
        }

        let hdr = region.as_ptr() as *const Header;
        // One-time validation reads; the writer finished these fields
        // before the release fence that preceded our open.
        let (magic, version, capacity, buffer_offset) = unsafe {
            (
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).magic)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).version)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).capacity)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).buffer_offset)),
            )
        };
        if magic != MAGIC {
            return Err(corrupt("magic mismatch"));
        }
        if version != VERSION {
            return Err(corrupt("version mismatch"));
        }
        if capacity != self.capacity {
            return Err(corrupt("capacity differs from writer"));
        }
        if buffer_offset != HEADER_SIZE {
            return Err(corrupt("buffer offset mismatch"));
        }

        self.region = Some(region);
        Ok(())
    }

    /// Whether the writer mapped the channel with huge pages (header
    /// flag bit 0). The reader's own mapping may still use base pages.
    pub fn writer_uses_huge_pages(&self) -> bool {
        self.region.as_ref().is_some_and(|region| {
            let hdr = unsafe { &*(region.as_ptr() as *const Header) };
            hdr.flags & FLAG_HUGE_PAGES != 0
        })
    }

    /// Fetches the latest frame, or `None` when nothing new was
    /// published since the previous call.
    ///
    /// The returned [`Frame`] borrows the front slot directly from
    /// shared memory (zero-copy); the borrow ends at the next call on
    /// this reader. Frames skipped between two calls are added to
    /// [`Reader::dropped`].
    #[inline(always)]
    pub fn latest(&mut self) -> ShmResult<Option<Frame<'_>>> {
        let base = self
            .region
            .as_ref()
            .ok_or(ShmError::NotInitialized)?
            .as_ptr();
        let hdr = unsafe { &*(base as *const Header) };

        let front = hdr.publish_index.load(Ordering::Acquire);
        let slot = &hdr.slots[front as usize];
        let seq = slot.seq.load(Ordering::Relaxed);
        let len = slot.len.load(Ordering::Relaxed);
        let ts = slot.timestamp_ns.load(Ordering::Relaxed);

        if seq == self.last_seq {
            return Ok(None);
        }
        if self.last_seq > 0 && seq > self.last_seq + 1 {
            self.dropped += seq - self.last_seq - 1;
        }
        self.last_seq = seq;

        // Bound the borrow to the slot even if the region is damaged.
        let len = len.min(self.capacity);
        let data = unsafe {
            std::slice::from_raw_parts(
                base.add(HEADER_SIZE + front as usize * self.slot_size),
                len,
            )
        };

        Ok(Some(Frame {
            data,
            seq,
            timestamp_ns: ts,
        }))
    }

    /// Whether the writer's heartbeat is younger than `timeout_ms`.
    ///
    /// A liveness hint, not a synchronization edge: heartbeat loads are
    /// relaxed, and a writer that merely stopped publishing looks dead.
    pub fn is_writer_alive(&self, timeout_ms: u32) -> bool {
        let Some(region) = self.region.as_ref() else {
            return false;
        };
        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let heartbeat = hdr.heartbeat_ns.load(Ordering::Relaxed);
        let diff_ms = (mono_time_ns() - heartbeat) / 1_000_000;
        diff_ms < timeout_ms as i64
    }

    /// Frames skipped so far because the writer outpaced this reader.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Sequence number of the last frame returned by [`Reader::latest`].
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Whether `init` has succeeded.
    pub fn is_ready(&self) -> bool {
        self.region.is_some()
    }
}
