//! Minimal double-buffer transport.
//!
//! The baseline variant: base pages, plain copies, no tuning knobs and
//! no stats. The header carries only what the protocol itself needs.
//! Useful as the simplest API and as the reference point the tuned
//! variants are measured against.

use crate::dbuf::{Frame, SlotMeta};
use crate::error::{ShmError, ShmResult};
use crate::region::SharedRegion;
use crate::topology::CACHE_LINE;
use crate::utils::{align_up, mono_time_ns, validate_name};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// Header magic, `"SHM1"`.
pub const MAGIC: u32 = 0x53484D31;
/// Header version.
pub const VERSION: u32 = 0x0001_0000;

/// Channel header, five cache lines: static line, publish line, two
/// slot lines, heartbeat line.
#[repr(C, align(64))]
struct Header {
    magic: u32,
    version: u32,
    capacity: usize,
    _pad0: [u8; CACHE_LINE - 16],

    publish_index: AtomicU32,
    _pad1: [u8; CACHE_LINE - 4],

    slots: [SlotMeta; 2],

    heartbeat_ns: AtomicI64,
    _pad4: [u8; CACHE_LINE - 8],
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const_assert_eq!(HEADER_SIZE, 5 * CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, publish_index), CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, slots), 2 * CACHE_LINE);
const_assert_eq!(std::mem::offset_of!(Header, heartbeat_ns), 4 * CACHE_LINE);

/// The channel's writing end. See [`crate::dbuf::nt::Writer`] for the
/// lifecycle contract shared by all double-buffer writers.
#[derive(Debug)]
pub struct Writer {
    name: String,
    capacity: usize,
    slot_size: usize,
    region: Option<SharedRegion>,
    frame_count: u64,
}

impl Writer {
    pub fn new(name: &str, capacity: usize) -> ShmResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            capacity,
            slot_size: align_up(capacity, CACHE_LINE),
            region: None,
            frame_count: 0,
        })
    }

    pub fn init(&mut self) -> ShmResult<()> {
        if self.region.is_some() {
            return Ok(());
        }

        let size = HEADER_SIZE + self.slot_size * 2;
        let region = SharedRegion::create(&self.name, size, false)?;

        let hdr = region.as_mut_ptr() as *mut Header;
        unsafe {
            (*hdr).magic = MAGIC;
            (*hdr).version = VERSION;
            (*hdr).capacity = self.capacity;

            (*hdr).publish_index.store(0, Ordering::Relaxed);
            for slot in &(*hdr).slots {
                slot.seq.store(0, Ordering::Relaxed);
                slot.timestamp_ns.store(0, Ordering::Relaxed);
                slot.len.store(0, Ordering::Relaxed);
            }
            (*hdr).heartbeat_ns.store(mono_time_ns(), Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);

        self.region = Some(region);
        self.frame_count = 0;
        Ok(())
    }

    /// Publishes one frame with a plain copy into the back slot.
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
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        self.publish(hdr, back, data.len());
        Ok(())
    }

    /// Returns the back slot for in-place filling; commit with
    /// [`Writer::commit`].
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

    #[inline(always)]
    fn publish(&mut self, hdr: &Header, back: u32, len: usize) {
        let now = mono_time_ns();
        self.frame_count += 1;

        let slot = &hdr.slots[back as usize];
        slot.len.store(len, Ordering::Relaxed);
        slot.timestamp_ns.store(now, Ordering::Relaxed);
        slot.seq.store(self.frame_count, Ordering::Relaxed);

        hdr.heartbeat_ns.store(now, Ordering::Relaxed);
        hdr.publish_index.store(back, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.region.is_some()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn destroy(&mut self) {
        self.region = None;
    }
}

/// The channel's reading end.
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
        let (magic, version, capacity) = unsafe {
            (
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).magic)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).version)),
                std::ptr::read_volatile(std::ptr::addr_of!((*hdr).capacity)),
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

        self.region = Some(region);
        Ok(())
    }

    /// Fetches the latest frame; see [`crate::dbuf::nt::Reader::latest`].
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
    pub fn is_writer_alive(&self, timeout_ms: u32) -> bool {
        let Some(region) = self.region.as_ref() else {
            return false;
        };
        let hdr = unsafe { &*(region.as_ptr() as *const Header) };
        let heartbeat = hdr.heartbeat_ns.load(Ordering::Relaxed);
        (mono_time_ns() - heartbeat) / 1_000_000 < timeout_ms as i64
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn is_ready(&self) -> bool {
        self.region.is_some()
    }
}
